#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Xaynet cluster: the coordination core of a multi-server federated learning backend
//!
//! A fleet of server replicas cooperates to run a secure aggregation protocol for a population of
//! clients. This crate provides the pieces the replicas need to agree on the state of the protocol
//! without a single point of failure:
//!
//! - [`cluster`]: membership of server and worker processes, liveness tracking and scaling.
//! - [`storage`]: a replicated metadata store, where every piece of metadata has exactly one owner
//!   replica picked on a consistent hash ring.
//! - [`cipher`]: the bookkeeping of the secure aggregation protocol (keys, secret shares and noise)
//!   on top of the metadata store.
//! - [`round`]: the count/timeout state machine which drives each protocol phase, together with
//!   the handlers of the five protocol rounds.
//! - [`iteration`]: the iteration number the rounds advance, and the events announcing it.
//! - [`server`]: the wiring of all of the above into one replica.
//!
//! Wire transport is not part of this crate. Replicas talk through the [`comm::Communicator`]
//! trait, for which an in-process implementation is provided in [`comm::local`].
//!
//! ## Running a local fleet
//!
//! The `coordinator` binary loads a [`settings::Settings`] file, builds `server_num` replicas on an
//! in-process network together with a membership manager and runs until interrupted:
//!
//! ```text
//! coordinator -c configs/config.toml
//! ```

pub mod cipher;
pub mod cluster;
pub mod comm;
pub mod common;
pub mod iteration;
pub mod round;
pub mod server;
pub mod settings;
pub mod storage;

#[cfg(test)]
pub(crate) mod tests;
