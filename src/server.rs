//! A server replica: the metadata store, the protocol rounds and the iteration state of one
//! process, wired together.

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use displaydoc::Display;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error_span, info, warn};
use tracing_futures::Instrument;

use crate::{
    cipher::CipherStore,
    cluster::{
        ClusterState,
        Registered,
        Registration,
        Role,
        ScalingListener,
        TopologySnapshot,
        SCHEDULER,
    },
    comm::{messages, CommResult, Communicator, MessageHandler},
    common::ReplicaId,
    iteration::{Iteration, IterationEvent},
    round::{kernels::handler_for, Round, RoundDescriptor, RoundResponse, SafeMode},
    settings::{CipherSettings, RoundSettings, StoreSettings},
    storage::MetadataStore,
};

/// Errors of a server replica.
#[derive(Debug, Display, Error)]
pub enum ServerError {
    /// unknown round {0}
    UnknownRound(String),
}

/// A server replica.
pub struct ServerNode {
    id: ReplicaId,
    communicator: Arc<dyn Communicator>,
    cipher: CipherStore,
    iteration: Arc<Iteration>,
    safe_mode: SafeMode,
    rounds: BTreeMap<String, Arc<Round>>,
    last_round: Option<String>,
}

impl ServerNode {
    /// Creates the replica behind the `communicator`, with the `servers` of the cluster on the
    /// ring of its store and one round per entry of `rounds`.
    ///
    /// # Errors
    /// Fails if a round has no handler.
    pub fn new(
        communicator: Arc<dyn Communicator>,
        servers: &[ReplicaId],
        store: StoreSettings,
        cipher: CipherSettings,
        rounds: &[RoundSettings],
    ) -> Result<Arc<Self>, ServerError> {
        let id = communicator.local_replica().clone();
        let store = MetadataStore::new(
            communicator.clone(),
            servers.iter().cloned(),
            store.virtual_nodes,
        );
        let cipher = CipherStore::new(store, cipher);
        cipher.register_protocol_state();
        let iteration = Arc::new(Iteration::new(Some(communicator.clone())));
        let safe_mode = SafeMode::default();

        let last_round = rounds.last().map(|settings| settings.name.clone());
        let rounds: BTreeMap<String, Arc<Round>> = rounds
            .iter()
            .map(|settings| {
                let handler = handler_for(&settings.name, cipher.clone())
                    .ok_or_else(|| ServerError::UnknownRound(settings.name.clone()))?;
                let mut descriptor = RoundDescriptor::from(settings);
                if descriptor.server_num_as_threshold {
                    descriptor.threshold_count = servers.len() as u64;
                }
                let round = Round::new(descriptor, handler, iteration.clone(), safe_mode.clone());
                Ok((settings.name.clone(), round))
            })
            .collect::<Result<_, ServerError>>()?;

        info!("server replica {} created", id);
        Ok(Arc::new(Self {
            id,
            communicator,
            cipher,
            iteration,
            safe_mode,
            rounds,
            last_round,
        }))
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    pub fn store(&self) -> &MetadataStore {
        self.cipher.store()
    }

    pub fn cipher(&self) -> &CipherStore {
        &self.cipher
    }

    pub fn iteration(&self) -> &Arc<Iteration> {
        &self.iteration
    }

    pub fn safe_mode(&self) -> &SafeMode {
        &self.safe_mode
    }

    pub fn round(&self, name: &str) -> Option<&Arc<Round>> {
        self.rounds.get(name)
    }

    /// Runs the `request` of a client through the round `name`.
    pub async fn dispatch(&self, name: &str, request: &[u8]) -> Result<RoundResponse, ServerError> {
        let round = self
            .rounds
            .get(name)
            .ok_or_else(|| ServerError::UnknownRound(name.to_string()))?;
        let span = error_span!("round", name = name, replica = %self.id);
        Ok(round.launch_round_kernel(request).instrument(span).await)
    }

    /// Resets all the rounds and the protocol state they own.
    pub async fn reset_rounds(&self) {
        for round in self.rounds.values() {
            round.reset().await;
        }
    }

    /// Prepares the rounds for the iteration announced by the `event`.
    ///
    /// # Behavior
    ///
    /// - Every round still busy with an earlier iteration ends its cycle.
    /// - The protocol state is kept between the rounds of a pass, so that a round can read what
    ///   the previous ones recorded. It is cleared once the last configured round finishes, or
    ///   when a round finishes without reaching its threshold.
    pub async fn on_iteration(&self, event: &IterationEvent) {
        if !event.valid || self.last_round.as_deref() == Some(event.round.as_str()) {
            info!(
                "replica {} clears the protocol state after round {}",
                self.id, event.round
            );
            self.cipher.reset_protocol_state();
        }
        for round in self.rounds.values() {
            if round.end_cycle_before(event.iteration).await {
                debug!("round {} ended its cycle", round.name());
            }
        }
    }

    /// Registers the replica with the membership manager and returns its rank.
    ///
    /// A replica joining a cluster which scales out pauses its rounds and acknowledges the
    /// scaling right away.
    pub async fn register(&self) -> CommResult<u32> {
        let registration = Registration {
            node_id: self.id.clone(),
            role: Role::Server,
        };
        let response = self
            .send_to_scheduler(messages::REGISTER, bincode::serialize(&registration)?)
            .await?;
        let Registered { rank, state } = bincode::deserialize(&response)?;
        info!("replica {} registered with rank {} ({})", self.id, rank, state);
        if state == ClusterState::ScaleOut {
            self.on_scale_begin(state).await;
            self.acknowledge(messages::SCALE_OUT_DONE).await;
        }
        Ok(rank)
    }

    /// Sends a heartbeat to the membership manager and returns the state of the cluster.
    pub async fn heartbeat(&self) -> CommResult<ClusterState> {
        let response = self
            .send_to_scheduler(messages::HEARTBEAT, bincode::serialize(&self.id)?)
            .await?;
        Ok(bincode::deserialize(&response)?)
    }

    /// Tells the membership manager that the replica is done and returns the state of the
    /// cluster.
    pub async fn finish(&self) -> CommResult<ClusterState> {
        let response = self
            .send_to_scheduler(messages::FINISH, bincode::serialize(&self.id)?)
            .await?;
        Ok(bincode::deserialize(&response)?)
    }

    /// Spawns the task preparing the rounds whenever an iteration ends.
    ///
    /// The task stops once the replica is dropped.
    pub fn spawn_iteration_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let mut listener = self.iteration.listener();
        let node: Weak<Self> = Arc::downgrade(self);
        let span = error_span!("iteration_driver", replica = %self.id);
        tokio::spawn(
            async move {
                while let Some(event) = listener.next_event().await {
                    let node = match node.upgrade() {
                        Some(node) => node,
                        None => break,
                    };
                    debug!(
                        "iteration {} started after round {}",
                        event.iteration, event.round
                    );
                    node.on_iteration(&event).await;
                }
                debug!("iteration driver terminated");
            }
            .instrument(span),
        )
    }

    async fn send_to_scheduler(&self, message: &str, payload: Vec<u8>) -> CommResult<Bytes> {
        self.communicator
            .send_request(&SCHEDULER.to_string(), message, Bytes::from(payload))
            .await
    }

    async fn acknowledge(&self, message: &str) {
        let payload = match bincode::serialize(&self.id) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode the acknowledgment: {}", err);
                return;
            }
        };
        if let Err(err) = self.send_to_scheduler(message, payload).await {
            warn!("replica {} failed to send {}: {}", self.id, message, err);
        }
    }

    fn on_topology(&self, message: &str, payload: &[u8]) -> CommResult<TopologySnapshot> {
        let snapshot: TopologySnapshot = bincode::deserialize(payload)?;
        debug!(
            "replica {} received {} with {} nodes ({})",
            self.id,
            message,
            snapshot.nodes.len(),
            snapshot.state
        );
        Ok(snapshot)
    }
}

#[async_trait]
impl MessageHandler for ServerNode {
    async fn handle_message(&self, message: &str, payload: Bytes) -> CommResult<Bytes> {
        match message {
            messages::UPDATE_METADATA | messages::GET_METADATA | messages::REGISTER_METADATA => {
                return self.store().serve(message, payload).await;
            }
            messages::ITERATION_FINISHED => {
                let event: IterationEvent = bincode::deserialize(&payload)?;
                self.iteration.follow(&event);
            }
            messages::SCALE_OUT | messages::SCALE_IN => {
                let snapshot = self.on_topology(message, &payload)?;
                self.on_scale_begin(snapshot.state).await;
                let ack = if message == messages::SCALE_OUT {
                    messages::SCALE_OUT_DONE
                } else {
                    messages::SCALE_IN_DONE
                };
                self.acknowledge(ack).await;
            }
            messages::SCALE_OUT_DONE | messages::SCALE_IN_DONE => {
                let snapshot = self.on_topology(message, &payload)?;
                self.on_scale_done(&snapshot).await;
            }
            messages::CLUSTER_TOPOLOGY | messages::FINISH => {
                self.on_topology(message, &payload)?;
            }
            name if self.rounds.contains_key(name) => {
                let response = self.dispatch(name, &payload).await?;
                return Ok(response.response);
            }
            _ => return Err(anyhow!("unexpected message {}", message)),
        }
        Ok(Bytes::new())
    }
}

#[async_trait]
impl ScalingListener for ServerNode {
    async fn on_scale_begin(&self, state: ClusterState) {
        debug!("replica {} pauses its rounds ({})", self.id, state);
        self.safe_mode.enable();
    }

    async fn on_scale_done(&self, topology: &TopologySnapshot) {
        let servers = topology.servers();
        if !servers.contains(&self.id) {
            warn!("replica {} is no longer part of the cluster", self.id);
        }
        self.store().reinit_for_scaling(servers.iter().cloned());
        for round in self.rounds.values() {
            round.reinit_for_scaling(servers.len() as u64).await;
        }
        self.safe_mode.disable();
    }
}
