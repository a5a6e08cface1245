//! The values held by the metadata store and their merge rules.

use std::collections::BTreeMap;

use derive_more::Display;
use displaydoc::Display as DisplayDoc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::ClientId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The two public keys a client publishes during the key exchange.
pub struct ClientKeys {
    pub public_key_1: Vec<u8>,
    pub public_key_2: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A secret share published by a client for the client `owner_id`.
pub struct ClientShare {
    pub owner_id: ClientId,
    pub index: u32,
    pub share: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A piece of replicated protocol metadata.
pub enum MetadataValue {
    /// An ordered list of client ids, without duplicates.
    ClientIdList(Vec<ClientId>),
    /// The public keys of the clients.
    ClientKeyMap(BTreeMap<ClientId, ClientKeys>),
    /// The shares published by the clients.
    ClientShareMap(BTreeMap<ClientId, Vec<ClientShare>>),
    /// The noise of the current iteration, once published.
    ClientNoise(Option<Vec<f32>>),
    /// The prime shared by all the clients.
    Prime(Vec<u8>),
    /// A boolean flag.
    GenericFlag(bool),
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
/// The kind of a [`MetadataValue`].
pub enum MetadataKind {
    #[display(fmt = "client id list")]
    ClientIdList,
    #[display(fmt = "client key map")]
    ClientKeyMap,
    #[display(fmt = "client share map")]
    ClientShareMap,
    #[display(fmt = "client noise")]
    ClientNoise,
    #[display(fmt = "prime")]
    Prime,
    #[display(fmt = "flag")]
    GenericFlag,
}

/// Errors which can occur when merging an update into a metadata value.
#[derive(Debug, DisplayDoc, Error, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// cannot merge a {update} update into a {stored}.
    KindMismatch {
        stored: MetadataKind,
        update: MetadataKind,
    },
    /// the noise of this iteration has already been published.
    NoiseAlreadyPublished,
    /// a different prime has already been published.
    PrimeAlreadyPublished,
}

impl MetadataValue {
    /// Returns the kind of the value.
    pub fn kind(&self) -> MetadataKind {
        match self {
            Self::ClientIdList(_) => MetadataKind::ClientIdList,
            Self::ClientKeyMap(_) => MetadataKind::ClientKeyMap,
            Self::ClientShareMap(_) => MetadataKind::ClientShareMap,
            Self::ClientNoise(_) => MetadataKind::ClientNoise,
            Self::Prime(_) => MetadataKind::Prime,
            Self::GenericFlag(_) => MetadataKind::GenericFlag,
        }
    }

    /// Merges the `update` into the value.
    ///
    /// # Behavior
    ///
    /// - Client id lists are appended to, ids already present are skipped.
    /// - Key and share maps are updated per client.
    /// - The noise can be published once: publishing it again fails, publishing nothing is a no-op.
    /// - The prime can be set once: setting a different prime fails.
    /// - Flags are or-ed.
    ///
    /// A failed merge leaves the value untouched.
    pub fn merge(&mut self, update: MetadataValue) -> Result<(), MergeError> {
        match (self, update) {
            (Self::ClientIdList(list), Self::ClientIdList(update)) => {
                for id in update {
                    if !list.contains(&id) {
                        list.push(id);
                    }
                }
            }
            (Self::ClientKeyMap(map), Self::ClientKeyMap(update)) => map.extend(update),
            (Self::ClientShareMap(map), Self::ClientShareMap(update)) => map.extend(update),
            (Self::ClientNoise(noise), Self::ClientNoise(update)) => match (noise.is_some(), update) {
                (_, None) => {}
                (false, Some(update)) => *noise = Some(update),
                (true, Some(_)) => return Err(MergeError::NoiseAlreadyPublished),
            },
            (Self::Prime(prime), Self::Prime(update)) => {
                if prime.is_empty() {
                    *prime = update;
                } else if *prime != update {
                    return Err(MergeError::PrimeAlreadyPublished);
                }
            }
            (Self::GenericFlag(flag), Self::GenericFlag(update)) => *flag |= update,
            (stored, update) => {
                return Err(MergeError::KindMismatch {
                    stored: stored.kind(),
                    update: update.kind(),
                })
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A named piece of metadata.
pub struct MetadataItem {
    pub name: String,
    pub value: MetadataValue,
}
