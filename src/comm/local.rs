//! An in-process transport.
//!
//! All the replicas of a [`LocalNetwork`] live in the same process and exchange messages by
//! calling each other's [`MessageHandler`] directly. Replicas can be made unreachable to inject
//! faults.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock, Weak},
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use tracing::debug;

use crate::{
    comm::{CommResult, Communicator, MessageHandler},
    common::ReplicaId,
};

#[derive(Default)]
struct Registry {
    handlers: HashMap<ReplicaId, Weak<dyn MessageHandler>>,
    unreachable: HashSet<ReplicaId>,
}

#[derive(Clone, Default)]
/// A network of replicas living in the same process.
pub struct LocalNetwork {
    registry: Arc<RwLock<Registry>>,
}

impl LocalNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the `handler` of the `replica` to the network.
    ///
    /// The network only keeps a weak reference to the handler: a replica which is dropped simply
    /// becomes unreachable.
    pub fn join(&self, replica: impl Into<ReplicaId>, handler: Arc<dyn MessageHandler>) {
        let replica = replica.into();
        debug!("replica {} joined the local network", replica);
        self.write()
            .handlers
            .insert(replica, Arc::downgrade(&handler));
    }

    /// Detaches the `replica` from the network.
    pub fn leave(&self, replica: &str) {
        let mut registry = self.write();
        registry.handlers.remove(replica);
        registry.unreachable.remove(replica);
    }

    /// Makes the `replica` unreachable (or reachable again) without detaching it.
    pub fn set_reachable(&self, replica: &str, reachable: bool) {
        let mut registry = self.write();
        if reachable {
            registry.unreachable.remove(replica);
        } else {
            registry.unreachable.insert(replica.to_string());
        }
    }

    /// Returns the ids of the replicas attached to the network.
    pub fn replicas(&self) -> Vec<ReplicaId> {
        let mut replicas: Vec<_> = self.read().handlers.keys().cloned().collect();
        replicas.sort();
        replicas
    }

    /// Creates a communicator which sends on behalf of the `replica`.
    pub fn communicator(&self, replica: impl Into<ReplicaId>) -> LocalCommunicator {
        LocalCommunicator {
            local: replica.into(),
            network: self.clone(),
        }
    }

    fn handler(&self, replica: &str) -> Option<Arc<dyn MessageHandler>> {
        let registry = self.read();
        if registry.unreachable.contains(replica) {
            return None;
        }
        registry.handlers.get(replica).and_then(Weak::upgrade)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
/// The [`Communicator`] of one replica of a [`LocalNetwork`].
pub struct LocalCommunicator {
    local: ReplicaId,
    network: LocalNetwork,
}

impl LocalCommunicator {
    /// Returns the network this communicator is attached to.
    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }
}

#[async_trait]
impl Communicator for LocalCommunicator {
    fn local_replica(&self) -> &ReplicaId {
        &self.local
    }

    async fn send_request(
        &self,
        target: &ReplicaId,
        message: &str,
        payload: Bytes,
    ) -> CommResult<Bytes> {
        let handler = self
            .network
            .handler(target)
            .ok_or_else(|| anyhow!("replica {} is unreachable", target))?;
        handler.handle_message(message, payload).await
    }

    async fn broadcast(&self, message: &str, payload: Bytes) {
        let targets: Vec<_> = self
            .network
            .replicas()
            .into_iter()
            .filter(|replica| replica != &self.local)
            .collect();
        let deliveries = targets.iter().map(|target| {
            let payload = payload.clone();
            async move {
                if let Err(err) = self.send_request(target, message, payload).await {
                    debug!("failed to deliver {} to {}: {}", message, target, err);
                }
            }
        });
        join_all(deliveries).await;
    }
}
