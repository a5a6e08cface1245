//! Communication between replicas.
//!
//! The transport itself is not part of this crate: the components only rely on the
//! [`Communicator`] trait for point-to-point requests and best-effort broadcasts, and they expose
//! their own request handling through the [`MessageHandler`] trait.

pub mod local;

use async_trait::async_trait;
use bytes::Bytes;

pub use self::local::{LocalCommunicator, LocalNetwork};
use crate::common::ReplicaId;

/// The error type of the transport. Its details are of no interest to the components, which only
/// need to know that a message could not be delivered or answered.
pub type CommError = anyhow::Error;

/// The result of a transport operation.
pub type CommResult<T> = Result<T, CommError>;

/// Names of the messages exchanged between replicas.
pub mod messages {
    /// Forwards a metadata update to the owner of the metadata.
    pub const UPDATE_METADATA: &str = "updateMetadata";
    /// Forwards a metadata read to the owner of the metadata.
    pub const GET_METADATA: &str = "getMetadata";
    /// Forwards a metadata registration to the owner of the metadata.
    pub const REGISTER_METADATA: &str = "registerMetadata";
    /// Registers a process with the membership manager.
    pub const REGISTER: &str = "register";
    /// Tells the membership manager that a process is alive.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Announces the topology of the cluster.
    pub const CLUSTER_TOPOLOGY: &str = "clusterTopology";
    /// Announces the beginning of a scale out.
    pub const SCALE_OUT: &str = "scaleOut";
    /// Announces the beginning of a scale in.
    pub const SCALE_IN: &str = "scaleIn";
    /// Acknowledges a scale out to the membership manager, which announces its completion with
    /// the same message.
    pub const SCALE_OUT_DONE: &str = "scaleOutDone";
    /// Acknowledges a scale in to the membership manager, which announces its completion with
    /// the same message.
    pub const SCALE_IN_DONE: &str = "scaleInDone";
    /// Tells the membership manager that a process is done, and announces that the whole cluster
    /// has finished.
    pub const FINISH: &str = "finish";
    /// Announces that an iteration has been finished.
    pub const ITERATION_FINISHED: &str = "iterationFinished";
}

#[async_trait]
/// An abstract transport between the replicas of the cluster.
pub trait Communicator
where
    Self: Send + Sync + 'static,
{
    /// Returns the id of the replica this communicator sends from.
    fn local_replica(&self) -> &ReplicaId;

    /// Sends the `message` with its `payload` to the `target` replica and waits for its response.
    ///
    /// # Behavior
    ///
    /// - If the target answered, return `CommResult::Ok(Bytes)` containing its response.
    /// - If the target is unknown, unreachable after the retry policy of the transport or failed
    ///   to handle the message, return a `CommError`.
    async fn send_request(
        &self,
        target: &ReplicaId,
        message: &str,
        payload: Bytes,
    ) -> CommResult<Bytes>;

    /// Sends the `message` with its `payload` to all the other known replicas.
    ///
    /// # Behavior
    ///
    /// The broadcast is best effort: delivery failures are logged by the transport and never
    /// reported to the caller.
    async fn broadcast(&self, message: &str, payload: Bytes);
}

#[async_trait]
/// The receiving side of the transport.
pub trait MessageHandler
where
    Self: Send + Sync + 'static,
{
    /// Handles the `message` with its `payload` sent by another replica and returns the response.
    async fn handle_message(&self, message: &str, payload: Bytes) -> CommResult<Bytes>;
}
