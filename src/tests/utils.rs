use std::{collections::BTreeMap, sync::Arc};

use tokio::task::JoinHandle;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::{
    comm::{Communicator, LocalNetwork},
    common::ReplicaId,
    server::ServerNode,
    settings::{CipherSettings, RoundSettings, StoreSettings},
    storage::{MetadataStore, MetadataValue, DEFAULT_VIRTUAL_NODES},
};

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

/// Metadata stores of several replicas talking over a local network.
pub struct StoreFleet {
    pub network: LocalNetwork,
    replicas: Vec<ReplicaId>,
    stores: BTreeMap<ReplicaId, Arc<MetadataStore>>,
}

impl StoreFleet {
    pub fn new(replicas: &[&str]) -> Self {
        let network = LocalNetwork::new();
        let mut stores = BTreeMap::new();
        for replica in replicas {
            let communicator: Arc<dyn Communicator> = Arc::new(network.communicator(*replica));
            let store = Arc::new(MetadataStore::new(
                communicator,
                replicas.iter().copied(),
                DEFAULT_VIRTUAL_NODES,
            ));
            network.join(*replica, store.clone());
            stores.insert(replica.to_string(), store);
        }
        Self {
            network,
            replicas: replicas.iter().map(|replica| replica.to_string()).collect(),
            stores,
        }
    }

    pub fn replicas(&self) -> &[ReplicaId] {
        &self.replicas
    }

    pub fn store(&self, replica: &str) -> &MetadataStore {
        &self.stores[replica]
    }

    pub fn register_everywhere(&self, name: &str, initial: MetadataValue) {
        for store in self.stores.values() {
            store.register_metadata(name, initial.clone());
        }
    }
}

/// The settings of a round counting up to `threshold` contributions within a minute.
pub fn round_settings(name: &str, threshold: u64) -> RoundSettings {
    RoundSettings {
        name: name.to_string(),
        check_timeout: true,
        time_window: 60_000,
        check_count: true,
        threshold_count: threshold,
        server_num_as_threshold: false,
    }
}

/// Server replicas talking over a local network.
pub struct ServerFleet {
    pub network: LocalNetwork,
    replicas: Vec<ReplicaId>,
    nodes: BTreeMap<ReplicaId, Arc<ServerNode>>,
}

impl ServerFleet {
    pub fn new(replicas: &[&str], rounds: Vec<RoundSettings>) -> Self {
        let cipher = CipherSettings {
            noise_poll_interval: 10,
            noise_poll_attempts: 5,
        };
        Self::with_settings(replicas, &rounds, StoreSettings::default(), cipher)
    }

    pub fn with_settings(
        replicas: &[&str],
        rounds: &[RoundSettings],
        store: StoreSettings,
        cipher: CipherSettings,
    ) -> Self {
        let network = LocalNetwork::new();
        let replicas: Vec<ReplicaId> = replicas.iter().map(|id| id.to_string()).collect();
        let mut nodes = BTreeMap::new();
        for replica in &replicas {
            let node = ServerNode::new(
                Arc::new(network.communicator(replica.as_str())),
                &replicas,
                store,
                cipher,
                rounds,
            )
            .unwrap();
            network.join(replica.as_str(), node.clone());
            nodes.insert(replica.clone(), node);
        }
        Self {
            network,
            replicas,
            nodes,
        }
    }

    pub fn replicas(&self) -> &[ReplicaId] {
        &self.replicas
    }

    pub fn node(&self, replica: &str) -> &Arc<ServerNode> {
        &self.nodes[replica]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ServerNode>> {
        self.nodes.values()
    }

    pub fn spawn_iteration_drivers(&self) -> Vec<JoinHandle<()>> {
        self.nodes
            .values()
            .map(|node| node.spawn_iteration_driver())
            .collect()
    }
}
