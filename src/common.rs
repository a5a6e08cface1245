//! Identifiers shared by all the components of the crate.

/// The identifier of a server or worker process, unique for its lifetime.
pub type ReplicaId = String;

/// The identifier of a federated learning client.
pub type ClientId = String;
