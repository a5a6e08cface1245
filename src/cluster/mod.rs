//! Membership of the server and worker processes of the cluster.
//!
//! The [`MembershipManager`] plays the part of the scheduler: processes register with it, keep
//! it posted through heartbeats and acknowledge the scalings it announces. Everything it decides
//! is broadcast to the replicas through a [`Communicator`].

pub mod control;
pub mod liveness;
pub mod topology;

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::watch, time::Instant};
use tracing::{debug, error, info, warn};

pub use self::{
    control::{NodeEntry, NodesInfo, ScaleInRequest, ScaleOutRequest},
    liveness::spawn_liveness_sweep,
    topology::{
        ClusterState,
        ClusterTopology,
        NodeInfo,
        ReplicaInfo,
        ReplicaState,
        Role,
        TopologySnapshot,
    },
};
use crate::{
    comm::{messages, CommResult, Communicator, MessageHandler},
    common::ReplicaId,
    round::{CountOutcome, RoundCounter},
    settings::ClusterSettings,
};

/// Errors of the membership manager.
#[derive(Debug, Display, Error, Clone, PartialEq)]
pub enum ClusterError {
    /// replica {0} registered as {1} but is known as {2}
    RoleMismatch(ReplicaId, Role, Role),
    /// no rank left for another {0} replica
    NoRankLeft(Role),
    /// replica {0} is not registered
    UnknownReplica(ReplicaId),
    /// the cluster is {0}
    InvalidState(ClusterState),
    /// {0} of {1} replicas are stale
    TooManyStale(usize, usize),
    /// the cluster is not available after {0} ms
    Unavailable(u64),
    /// the scaling has already been acknowledged by {0} replicas
    NotCancellable(u64),
    /// the scaling was acknowledged by {0} of {1} replicas within {2} ms
    ScaleIncomplete(u64, u64, u64),
    /// invalid scale in: {0}
    InvalidScaleIn(String),
}

/// The replica id the membership manager answers to.
pub const SCHEDULER: &str = "scheduler";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The payload of a [`messages::REGISTER`] request.
pub struct Registration {
    pub node_id: ReplicaId,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The answer to a [`messages::REGISTER`] request.
pub struct Registered {
    pub rank: u32,
    pub state: ClusterState,
}

/// The callback invoked when the cluster fails.
pub type AbnormalCallback = Arc<dyn Fn(&ClusterError) + Send + Sync>;

#[async_trait]
/// A component which must be told when the cluster scales.
pub trait ScalingListener
where
    Self: Send + Sync + 'static,
{
    /// Called when a scaling begins, with the state the cluster is in for its duration.
    async fn on_scale_begin(&self, state: ClusterState);

    /// Called when a scaling is done or cancelled, with the topology the cluster continues with.
    async fn on_scale_done(&self, topology: &TopologySnapshot);
}

#[derive(Debug)]
struct Scaling {
    acks: RoundCounter,
    started_at: Instant,
    previous_worker_num: u32,
    previous_server_num: u32,
}

#[derive(Debug)]
struct Membership {
    topology: ClusterTopology,
    scaling: Option<Scaling>,
    finished: HashSet<ReplicaId>,
}

/// Keeps track of the processes of the cluster.
pub struct MembershipManager {
    settings: ClusterSettings,
    communicator: Arc<dyn Communicator>,
    membership: Mutex<Membership>,
    listeners: Mutex<Vec<Arc<dyn ScalingListener>>>,
    on_abnormal: Mutex<Option<AbnormalCallback>>,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
}

impl MembershipManager {
    /// Creates a manager waiting for the replicas expected by the `settings`.
    pub fn new(settings: ClusterSettings, communicator: Arc<dyn Communicator>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            communicator,
            membership: Mutex::new(Membership {
                topology: ClusterTopology::new(settings.worker_num, settings.server_num),
                scaling: None,
                finished: HashSet::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            on_abnormal: Mutex::new(None),
            started_at: Instant::now(),
            shutdown,
        })
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// Adds a listener notified about scalings.
    pub fn add_listener(&self, listener: Arc<dyn ScalingListener>) {
        lock(&self.listeners).push(listener);
    }

    /// Sets the callback invoked when the cluster fails.
    pub fn set_abnormal_callback(&self, callback: impl Fn(&ClusterError) + Send + Sync + 'static) {
        *lock(&self.on_abnormal) = Some(Arc::new(callback));
    }

    pub fn state(&self) -> ClusterState {
        self.membership().topology.state
    }

    /// Returns a copy of the current topology.
    pub fn topology(&self) -> ClusterTopology {
        self.membership().topology.clone()
    }

    /// Returns the topology as announced to the cluster.
    pub fn snapshot(&self) -> TopologySnapshot {
        self.membership().topology.snapshot()
    }

    /// Registers a replica and returns its rank.
    ///
    /// # Behavior
    ///
    /// - A known replica gets its rank back, provided it registers with the same role.
    /// - A new replica gets the smallest free rank of its role. Registration fails when all the
    ///   ranks the cluster expects are taken, or once the cluster is finished or failed.
    pub fn register(&self, replica: &str, role: Role) -> Result<u32, ClusterError> {
        let mut membership = self.membership();
        let topology = &mut membership.topology;
        if topology.state.is_terminal() {
            return Err(ClusterError::InvalidState(topology.state));
        }
        if let Some(info) = topology.replicas.get(replica) {
            if info.role != role {
                return Err(ClusterError::RoleMismatch(
                    replica.to_string(),
                    role,
                    info.role,
                ));
            }
            debug!("replica {} registered again with rank {}", replica, info.rank);
            return Ok(info.rank);
        }

        let rank = topology
            .next_rank(role)
            .ok_or(ClusterError::NoRankLeft(role))?;
        topology.replicas.insert(
            replica.to_string(),
            ReplicaInfo {
                id: replica.to_string(),
                role,
                rank,
                state: ReplicaState::Registered,
                last_heartbeat: Instant::now(),
            },
        );
        info!("{} replica {} registered with rank {}", role, replica, rank);
        Ok(rank)
    }

    /// Records a heartbeat of a replica and returns the state of the cluster.
    ///
    /// The heartbeat completing the registration of all the expected replicas makes the cluster
    /// ready and broadcasts its topology.
    pub async fn heartbeat(&self, replica: &str) -> Result<ClusterState, ClusterError> {
        let (state, announce) = {
            let mut membership = self.membership();
            let topology = &mut membership.topology;
            let info = topology
                .replicas
                .get_mut(replica)
                .ok_or_else(|| ClusterError::UnknownReplica(replica.to_string()))?;
            info.last_heartbeat = Instant::now();
            match info.state {
                ReplicaState::Registered => info.state = ReplicaState::Heartbeating,
                ReplicaState::Stale => {
                    info!("replica {} is alive again", replica);
                    info.state = ReplicaState::Heartbeating;
                }
                ReplicaState::Heartbeating | ReplicaState::Deregistered => {}
            }

            let announce =
                if topology.state == ClusterState::Initializing && topology.is_complete() {
                    info!(
                        "all {} replicas registered, the cluster is ready",
                        topology.total_expected()
                    );
                    topology.state = ClusterState::Ready;
                    Some(topology.snapshot())
                } else {
                    None
                };
            (topology.state, announce)
        };

        if let Some(snapshot) = announce {
            self.announce(messages::CLUSTER_TOPOLOGY, &snapshot).await;
        }
        Ok(state)
    }

    /// Marks the replicas which have been silent for too long as stale, as of `now`.
    ///
    /// # Errors
    ///
    /// Fails the cluster if the fraction of stale replicas exceeds the configured bound, or if the
    /// expected replicas did not all register within the availability window, or if a scaling
    /// was not acknowledged within that window. The abnormal callback is invoked and the manager
    /// shuts down.
    pub fn sweep_at(&self, now: Instant) -> Result<(), ClusterError> {
        let failure = {
            let mut membership = self.membership();
            let Membership {
                topology, scaling, ..
            } = &mut *membership;
            if topology.state.is_terminal() {
                return Err(ClusterError::InvalidState(topology.state));
            }

            let timeout = self.settings.heartbeat_timeout();
            for info in topology.replicas.values_mut() {
                let silent = now.saturating_duration_since(info.last_heartbeat);
                if silent > timeout && info.state == ReplicaState::Heartbeating {
                    warn!("replica {} has been silent for {:?}", info.id, silent);
                    info.state = ReplicaState::Stale;
                }
            }

            let total = topology.active().count();
            let stale = topology
                .active()
                .filter(|info| info.state == ReplicaState::Stale)
                .count();
            let available_timeout = self.settings.cluster_available_timeout();
            let overdue = scaling.as_ref().filter(|scaling| {
                now.saturating_duration_since(scaling.started_at) > available_timeout
            });
            let failure =
                if total > 0 && stale as f64 / total as f64 > self.settings.max_stale_ratio {
                    Some(ClusterError::TooManyStale(stale, total))
                } else if topology.state == ClusterState::Initializing
                    && now.saturating_duration_since(self.started_at) > available_timeout
                {
                    Some(ClusterError::Unavailable(
                        self.settings.cluster_available_timeout,
                    ))
                } else if let Some(scaling) = overdue {
                    Some(ClusterError::ScaleIncomplete(
                        scaling.acks.current(),
                        scaling.acks.threshold(),
                        self.settings.cluster_available_timeout,
                    ))
                } else {
                    None
                };
            if failure.is_some() {
                topology.state = ClusterState::Failed;
            }
            failure
        };

        match failure {
            Some(err) => {
                error!("the cluster failed: {}", err);
                let callback = lock(&self.on_abnormal).clone();
                if let Some(callback) = callback {
                    callback(&err);
                }
                self.shutdown();
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Marks the replicas which have been silent for too long as stale.
    pub fn sweep(&self) -> Result<(), ClusterError> {
        self.sweep_at(Instant::now())
    }

    /// Adds workers and servers to a ready cluster.
    ///
    /// The listeners enter safe mode and the replicas are told to scale out. The scaling completes
    /// once every replica of the grown cluster acknowledged it with
    /// [`MembershipManager::scale_out_done`].
    pub async fn scale_out(&self, request: ScaleOutRequest) -> Result<NodesInfo, ClusterError> {
        let snapshot = {
            let mut membership = self.membership();
            let Membership {
                topology, scaling, ..
            } = &mut *membership;
            if topology.state != ClusterState::Ready {
                return Err(ClusterError::InvalidState(topology.state));
            }
            let previous = (topology.worker_num, topology.server_num);
            topology.worker_num += request.worker_num;
            topology.server_num += request.server_num;
            topology.state = ClusterState::ScaleOut;
            *scaling = Some(Scaling {
                acks: RoundCounter::new(u64::from(topology.total_expected())),
                started_at: Instant::now(),
                previous_worker_num: previous.0,
                previous_server_num: previous.1,
            });
            info!(
                "the cluster scales out to {} workers and {} servers",
                topology.worker_num, topology.server_num
            );
            topology.snapshot()
        };

        self.begin_scaling(ClusterState::ScaleOut, messages::SCALE_OUT, &snapshot)
            .await;
        Ok(NodesInfo::message("Cluster begin to scale out."))
    }

    /// Removes replicas from a ready cluster.
    ///
    /// The leaving replicas are deregistered right away. The scaling completes once every
    /// remaining replica acknowledged it with [`MembershipManager::scale_in_done`].
    pub async fn scale_in(&self, request: ScaleInRequest) -> Result<NodesInfo, ClusterError> {
        let snapshot = {
            let mut membership = self.membership();
            let Membership {
                topology, scaling, ..
            } = &mut *membership;
            if topology.state != ClusterState::Ready {
                return Err(ClusterError::InvalidState(topology.state));
            }

            let mut leaving = HashSet::new();
            let (mut workers, mut servers) = (0, 0);
            for id in &request.node_ids {
                let info = topology
                    .replicas
                    .get(id)
                    .ok_or_else(|| ClusterError::InvalidScaleIn(format!("unknown node {}", id)))?;
                if leaving.insert(id.clone()) {
                    match info.role {
                        Role::Worker => workers += 1,
                        Role::Server => servers += 1,
                    }
                }
            }
            if leaving.is_empty() {
                return Err(ClusterError::InvalidScaleIn("no node to remove".to_string()));
            }
            if servers >= topology.server_num {
                return Err(ClusterError::InvalidScaleIn(
                    "at least one server must remain".to_string(),
                ));
            }

            let previous = (topology.worker_num, topology.server_num);
            topology.worker_num = topology.worker_num.saturating_sub(workers);
            topology.server_num -= servers;
            topology.state = ClusterState::ScaleIn;
            for id in &leaving {
                if let Some(info) = topology.replicas.get_mut(id) {
                    info.state = ReplicaState::Deregistered;
                }
            }
            *scaling = Some(Scaling {
                acks: RoundCounter::new(u64::from(topology.total_expected())),
                started_at: Instant::now(),
                previous_worker_num: previous.0,
                previous_server_num: previous.1,
            });
            warn!("the cluster scales in without {:?}", leaving);
            topology.snapshot()
        };

        self.begin_scaling(ClusterState::ScaleIn, messages::SCALE_IN, &snapshot)
            .await;
        Ok(NodesInfo::message("Cluster begin to scale in."))
    }

    /// Acknowledges a scale out on behalf of a replica and returns the state of the cluster.
    pub async fn scale_out_done(&self, replica: &str) -> Result<ClusterState, ClusterError> {
        self.acknowledge(replica, ClusterState::ScaleOut, messages::SCALE_OUT_DONE)
            .await
    }

    /// Acknowledges a scale in on behalf of a replica and returns the state of the cluster.
    pub async fn scale_in_done(&self, replica: &str) -> Result<ClusterState, ClusterError> {
        self.acknowledge(replica, ClusterState::ScaleIn, messages::SCALE_IN_DONE)
            .await
    }

    /// Cancels the ongoing scaling and restores the previous topology.
    ///
    /// # Errors
    ///
    /// Fails if no scaling is ongoing or if a replica already acknowledged it.
    pub async fn cancel_scale(&self) -> Result<(), ClusterError> {
        let snapshot = {
            let mut membership = self.membership();
            let Membership {
                topology, scaling, ..
            } = &mut *membership;
            let acks = match scaling {
                Some(scaling) => scaling.acks.current(),
                None => return Err(ClusterError::InvalidState(topology.state)),
            };
            if acks > 0 {
                return Err(ClusterError::NotCancellable(acks));
            }
            if let Some(scaling) = scaling.take() {
                topology.worker_num = scaling.previous_worker_num;
                topology.server_num = scaling.previous_server_num;
            }
            // replicas which joined for the scale out have no rank left
            let expected = (topology.worker_num, topology.server_num);
            topology.replicas.retain(|_, info| {
                let limit = match info.role {
                    Role::Worker => expected.0,
                    Role::Server => expected.1,
                };
                info.rank < limit
            });
            for info in topology.replicas.values_mut() {
                if info.state == ReplicaState::Deregistered {
                    info.state = ReplicaState::Heartbeating;
                }
            }
            topology.state = ClusterState::Ready;
            warn!("the scaling has been cancelled");
            topology.snapshot()
        };

        self.end_scaling(&snapshot).await;
        self.announce(messages::CLUSTER_TOPOLOGY, &snapshot).await;
        Ok(())
    }

    /// Records that a replica finished its work and returns the state of the cluster.
    ///
    /// Once all the replicas are done, the cluster is finished, the replicas are told so and the
    /// manager shuts down.
    pub async fn finish(&self, replica: &str) -> Result<ClusterState, ClusterError> {
        let announce = {
            let mut membership = self.membership();
            let Membership {
                topology, finished, ..
            } = &mut *membership;
            if topology.state.is_terminal() {
                return Err(ClusterError::InvalidState(topology.state));
            }
            if !topology.replicas.contains_key(replica) {
                return Err(ClusterError::UnknownReplica(replica.to_string()));
            }
            finished.insert(replica.to_string());
            let done = topology
                .active()
                .filter(|info| finished.contains(&info.id))
                .count() as u32;
            if done >= topology.total_expected() {
                info!("all replicas are done, the cluster is finished");
                topology.state = ClusterState::Finished;
                Some(topology.snapshot())
            } else {
                debug!("replica {} is done", replica);
                None
            }
        };

        match announce {
            Some(snapshot) => {
                self.announce(messages::FINISH, &snapshot).await;
                self.shutdown();
                Ok(ClusterState::Finished)
            }
            None => Ok(self.state()),
        }
    }

    /// Returns the replicas of the cluster.
    pub fn nodes_info(&self) -> NodesInfo {
        NodesInfo::nodes("Get nodes info successful.", &self.snapshot())
    }

    /// Stops the background loops of the manager.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Returns a receiver which changes when the manager shuts down.
    pub fn shutdown_listener(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    async fn acknowledge(
        &self,
        replica: &str,
        expected: ClusterState,
        message: &str,
    ) -> Result<ClusterState, ClusterError> {
        let completed = {
            let mut membership = self.membership();
            let Membership {
                topology, scaling, ..
            } = &mut *membership;
            if topology.state != expected {
                return Err(ClusterError::InvalidState(topology.state));
            }
            let info = topology
                .replicas
                .get(replica)
                .ok_or_else(|| ClusterError::UnknownReplica(replica.to_string()))?;
            if info.state == ReplicaState::Deregistered {
                debug!("ignoring the acknowledgment of leaving replica {}", replica);
                return Ok(topology.state);
            }
            let outcome = match scaling {
                Some(scaling) => scaling.acks.count(replica),
                None => return Err(ClusterError::InvalidState(topology.state)),
            };
            match outcome {
                CountOutcome::Counted { is_last: true, .. } => {
                    *scaling = None;
                    topology.replicas.retain(|id, info| {
                        let keep = info.state != ReplicaState::Deregistered;
                        if !keep {
                            info!("replica {} left the cluster", id);
                        }
                        keep
                    });
                    topology.compact_ranks();
                    topology.state = ClusterState::Ready;
                    info!("the scaling is done, the cluster is ready");
                    Some(topology.snapshot())
                }
                CountOutcome::Counted { count, .. } => {
                    debug!("replica {} acknowledged the scaling ({} acks)", replica, count);
                    None
                }
                CountOutcome::Duplicate | CountOutcome::ThresholdReached => None,
            }
        };

        match completed {
            Some(snapshot) => {
                self.end_scaling(&snapshot).await;
                self.announce(message, &snapshot).await;
                Ok(ClusterState::Ready)
            }
            None => Ok(self.state()),
        }
    }

    async fn begin_scaling(&self, state: ClusterState, message: &str, snapshot: &TopologySnapshot) {
        for listener in self.listeners() {
            listener.on_scale_begin(state).await;
        }
        self.announce(message, snapshot).await;
    }

    async fn end_scaling(&self, snapshot: &TopologySnapshot) {
        for listener in self.listeners() {
            listener.on_scale_done(snapshot).await;
        }
    }

    async fn announce(&self, message: &str, snapshot: &TopologySnapshot) {
        match bincode::serialize(snapshot) {
            Ok(payload) => {
                self.communicator
                    .broadcast(message, Bytes::from(payload))
                    .await
            }
            Err(err) => warn!("failed to encode the topology: {}", err),
        }
    }

    fn listeners(&self) -> Vec<Arc<dyn ScalingListener>> {
        lock(&self.listeners).clone()
    }

    fn membership(&self) -> MutexGuard<'_, Membership> {
        lock(&self.membership)
    }
}

#[async_trait]
impl MessageHandler for MembershipManager {
    async fn handle_message(&self, message: &str, payload: Bytes) -> CommResult<Bytes> {
        let response = match message {
            messages::REGISTER => {
                let Registration { node_id, role } = bincode::deserialize(&payload)?;
                let rank = self.register(&node_id, role)?;
                bincode::serialize(&Registered {
                    rank,
                    state: self.state(),
                })?
            }
            messages::HEARTBEAT => {
                let replica: ReplicaId = bincode::deserialize(&payload)?;
                bincode::serialize(&self.heartbeat(&replica).await?)?
            }
            messages::SCALE_OUT_DONE => {
                let replica: ReplicaId = bincode::deserialize(&payload)?;
                bincode::serialize(&self.scale_out_done(&replica).await?)?
            }
            messages::SCALE_IN_DONE => {
                let replica: ReplicaId = bincode::deserialize(&payload)?;
                bincode::serialize(&self.scale_in_done(&replica).await?)?
            }
            messages::FINISH => {
                let replica: ReplicaId = bincode::deserialize(&payload)?;
                bincode::serialize(&self.finish(&replica).await?)?
            }
            // iterations are the business of the servers
            messages::ITERATION_FINISHED => return Ok(Bytes::new()),
            _ => return Err(anyhow!("unexpected message {}", message)),
        };
        Ok(Bytes::from(response))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
