//! The replicated metadata store.
//!
//! Every piece of metadata is owned by exactly one server replica, picked on a
//! [`ConsistentHashRing`]. The owner holds the value and applies the updates; the other replicas
//! forward their requests to it through the [`Communicator`].
//!
//! There is no consensus between the replicas: a value is lost when its owner leaves the ring.

pub mod metadata;
pub mod ring;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use anyhow::anyhow;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use displaydoc::Display;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use self::{
    metadata::{ClientKeys, ClientShare, MergeError, MetadataItem, MetadataKind, MetadataValue},
    ring::{ConsistentHashRing, DEFAULT_VIRTUAL_NODES},
};
use crate::{
    comm::{messages, CommError, CommResult, Communicator, MessageHandler},
    common::ReplicaId,
};

/// Errors which can occur when reading metadata.
#[derive(Debug, Display, Error)]
pub enum StoreError {
    /// metadata {0} is not registered on its owner.
    NotRegistered(String),
    /// no replica owns metadata {0}.
    NoOwner(String),
    /// failed to reach replica {0}: {1}.
    Transport(ReplicaId, CommError),
    /// malformed metadata message: {0}.
    Codec(#[from] bincode::Error),
}

enum Route {
    Local,
    Remote(ReplicaId),
    Unowned,
}

struct Inner {
    communicator: Arc<dyn Communicator>,
    virtual_nodes: u32,
    ring: ArcSwap<ConsistentHashRing>,
    // initial values of everything registered through this replica, owned or not
    registered: Mutex<HashMap<String, MetadataValue>>,
    entries: RwLock<HashMap<String, Arc<Mutex<MetadataValue>>>>,
}

#[derive(Clone)]
/// The metadata store of one replica.
pub struct MetadataStore {
    inner: Arc<Inner>,
}

impl MetadataStore {
    /// Creates the store of the replica behind the `communicator`, with the `servers` on the ring.
    pub fn new<I, R>(communicator: Arc<dyn Communicator>, servers: I, virtual_nodes: u32) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ReplicaId>,
    {
        let ring = ConsistentHashRing::with_replicas(virtual_nodes, servers);
        Self {
            inner: Arc::new(Inner {
                communicator,
                virtual_nodes,
                ring: ArcSwap::from_pointee(ring),
                registered: Mutex::new(HashMap::new()),
                entries: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Returns the id of the replica this store belongs to.
    pub fn local_replica(&self) -> &ReplicaId {
        self.inner.communicator.local_replica()
    }

    /// Returns the replica owning the metadata `name`.
    pub fn owner_of(&self, name: &str) -> Option<ReplicaId> {
        self.inner.ring.load().owner(name).cloned()
    }

    /// Checks whether this replica owns the metadata `name`.
    pub fn is_owner(&self, name: &str) -> bool {
        matches!(self.route(name), Route::Local)
    }

    fn route(&self, name: &str) -> Route {
        match self.inner.ring.load().owner(name) {
            Some(owner) if owner == self.local_replica() => Route::Local,
            Some(owner) => Route::Remote(owner.clone()),
            None => Route::Unowned,
        }
    }

    /// Registers the metadata `name` with its `initial` value.
    ///
    /// # Behavior
    ///
    /// - The first registration of a name wins: registering it again is a no-op.
    /// - The entry is only created on the owner of the name. The other replicas remember the
    ///   initial value, so that they can take over the entry if the ring changes.
    pub fn register_metadata(&self, name: &str, initial: MetadataValue) {
        {
            let mut registered = lock(&self.inner.registered);
            if registered.contains_key(name) {
                return;
            }
            registered.insert(name.to_string(), initial.clone());
        }
        if self.is_owner(name) {
            debug!("registering metadata {}", name);
            self.write_entries()
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(initial)));
        }
    }

    /// Registers the metadata `name` here and on its owner.
    ///
    /// # Behavior
    ///
    /// - Register the name locally as [`MetadataStore::register_metadata`] does.
    /// - If another replica owns the name, forward the registration to it and return whether it
    ///   answered. Registering on the owner is a no-op if the name is already known there.
    pub async fn register_on_owner(&self, name: &str, initial: MetadataValue) -> bool {
        self.register_metadata(name, initial.clone());
        match self.route(name) {
            Route::Local => true,
            Route::Remote(owner) => {
                let item = MetadataItem {
                    name: name.to_string(),
                    value: initial,
                };
                match self
                    .forward::<_, ()>(&owner, messages::REGISTER_METADATA, &item)
                    .await
                {
                    Ok(()) => true,
                    Err(err) => {
                        warn!("failed to register metadata {} on {}: {}", name, owner, err);
                        false
                    }
                }
            }
            Route::Unowned => false,
        }
    }

    /// Merges the `value` into the metadata `name`.
    ///
    /// # Behavior
    ///
    /// - On the owner, apply the merge and return whether it succeeded.
    /// - Elsewhere, forward the update to the owner and return its answer.
    /// - Return `false` if the name is not registered on its owner, if the merge is rejected or
    ///   if the owner cannot be reached.
    pub async fn update_metadata(&self, name: &str, value: MetadataValue) -> bool {
        match self.route(name) {
            Route::Local => self.update_local(name, value),
            Route::Remote(owner) => {
                let item = MetadataItem {
                    name: name.to_string(),
                    value,
                };
                match self.forward(&owner, messages::UPDATE_METADATA, &item).await {
                    Ok(updated) => updated,
                    Err(err) => {
                        warn!("failed to update metadata {}: {}", name, err);
                        false
                    }
                }
            }
            Route::Unowned => {
                warn!("failed to update metadata {}: the ring is empty", name);
                false
            }
        }
    }

    /// Returns the value of the metadata `name`.
    ///
    /// Reads are only guaranteed to observe the preceding writes on the owner of the name.
    pub async fn get_metadata(&self, name: &str) -> Result<MetadataValue, StoreError> {
        match self.route(name) {
            Route::Local => self
                .get_local(name)
                .ok_or_else(|| StoreError::NotRegistered(name.to_string())),
            Route::Remote(owner) => {
                let value: Option<MetadataValue> = self
                    .forward(&owner, messages::GET_METADATA, &name.to_string())
                    .await?;
                value.ok_or_else(|| StoreError::NotRegistered(name.to_string()))
            }
            Route::Unowned => Err(StoreError::NoOwner(name.to_string())),
        }
    }

    /// Resets the metadata `name` to its registered value. Only the owner holds an entry, so this
    /// is a no-op on the other replicas.
    pub fn reset_metadata(&self, name: &str) {
        let initial = match lock(&self.inner.registered).get(name) {
            Some(initial) => initial.clone(),
            None => return,
        };
        if let Some(entry) = self.entry(name) {
            debug!("resetting metadata {}", name);
            *lock(&entry) = initial;
        }
    }

    /// Replaces the ring with one made of the `servers`.
    ///
    /// Entries this replica no longer owns are dropped, and the registered names it now owns are
    /// created from their initial values.
    pub fn reinit_for_scaling<I, R>(&self, servers: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<ReplicaId>,
    {
        let ring = ConsistentHashRing::with_replicas(self.inner.virtual_nodes, servers);
        info!(
            "replica {} moves to a ring of {} servers",
            self.local_replica(),
            ring.len()
        );
        self.inner.ring.store(Arc::new(ring));

        let registered = lock(&self.inner.registered).clone();
        let mut entries = self.write_entries();
        for (name, initial) in registered {
            if self.is_owner(&name) {
                entries
                    .entry(name)
                    .or_insert_with(|| Arc::new(Mutex::new(initial)));
            } else if entries.remove(&name).is_some() {
                debug!("metadata {} moved to another replica", name);
            }
        }
    }

    /// Serves a metadata request forwarded by another replica.
    pub async fn serve(&self, message: &str, payload: Bytes) -> CommResult<Bytes> {
        let response = match message {
            messages::UPDATE_METADATA => {
                let item: MetadataItem = bincode::deserialize(&payload)?;
                bincode::serialize(&self.update_local(&item.name, item.value))?
            }
            messages::GET_METADATA => {
                let name: String = bincode::deserialize(&payload)?;
                bincode::serialize(&self.get_local(&name))?
            }
            messages::REGISTER_METADATA => {
                let item: MetadataItem = bincode::deserialize(&payload)?;
                self.register_metadata(&item.name, item.value);
                bincode::serialize(&())?
            }
            _ => return Err(anyhow!("unexpected metadata message {}", message)),
        };
        Ok(response.into())
    }

    async fn forward<T, R>(&self, owner: &ReplicaId, message: &str, request: &T) -> Result<R, StoreError>
    where
        T: serde::Serialize,
        R: serde::de::DeserializeOwned,
    {
        let payload = bincode::serialize(request)?;
        let response = self
            .inner
            .communicator
            .send_request(owner, message, payload.into())
            .await
            .map_err(|err| StoreError::Transport(owner.clone(), err))?;
        Ok(bincode::deserialize(&response)?)
    }

    fn update_local(&self, name: &str, value: MetadataValue) -> bool {
        let entry = match self.entry(name) {
            Some(entry) => entry,
            None => {
                warn!("failed to update metadata {}: not registered", name);
                return false;
            }
        };
        let mut stored = lock(&entry);
        match stored.merge(value) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to update metadata {}: {}", name, err);
                false
            }
        }
    }

    fn get_local(&self, name: &str) -> Option<MetadataValue> {
        self.entry(name).map(|entry| lock(&entry).clone())
    }

    fn entry(&self, name: &str) -> Option<Arc<Mutex<MetadataValue>>> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn write_entries(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<MetadataValue>>>> {
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MessageHandler for MetadataStore {
    async fn handle_message(&self, message: &str, payload: Bytes) -> CommResult<Bytes> {
        self.serve(message, payload).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::tests::utils::StoreFleet;

    fn ids(ids: &[&str]) -> MetadataValue {
        MetadataValue::ClientIdList(ids.iter().map(|id| id.to_string()).collect())
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let fleet = StoreFleet::new(&["server-0"]);
        let store = fleet.store("server-0");

        store.register_metadata("roster", ids(&["a"]));
        store.register_metadata("roster", ids(&["b"]));
        assert_eq!(store.get_metadata("roster").await.unwrap(), ids(&["a"]));

        assert!(store.update_metadata("roster", ids(&["c"])).await);
        store.register_metadata("roster", ids(&[]));
        assert_eq!(store.get_metadata("roster").await.unwrap(), ids(&["a", "c"]));
    }

    #[tokio::test]
    async fn test_entries_live_on_the_owner_only() {
        let fleet = StoreFleet::new(&["server-0", "server-1", "server-2"]);
        fleet.register_everywhere("roster", ids(&[]));

        let owner = fleet.store("server-0").owner_of("roster").unwrap();
        for replica in fleet.replicas() {
            let store = fleet.store(replica);
            assert_eq!(store.is_owner("roster"), *replica == owner);
            assert_eq!(store.get_local("roster").is_some(), *replica == owner);
        }
    }

    #[tokio::test]
    async fn test_updates_are_forwarded_to_the_owner() {
        let fleet = StoreFleet::new(&["server-0", "server-1", "server-2"]);
        fleet.register_everywhere("roster", ids(&[]));

        for (replica, client) in fleet.replicas().iter().zip(&["a", "b", "c"]) {
            assert!(fleet.store(replica).update_metadata("roster", ids(&[*client])).await);
        }
        for replica in fleet.replicas() {
            assert_eq!(
                fleet.store(replica).get_metadata("roster").await.unwrap(),
                ids(&["a", "b", "c"])
            );
        }
    }

    #[tokio::test]
    async fn test_register_on_owner() {
        let fleet = StoreFleet::new(&["server-0", "server-1", "server-2"]);
        let owner = fleet.store("server-0").owner_of("late").unwrap();
        let other = fleet
            .replicas()
            .iter()
            .find(|replica| **replica != owner)
            .unwrap()
            .clone();

        assert!(fleet.store(&other).register_on_owner("late", ids(&["seed"])).await);
        assert_eq!(fleet.store(&owner).get_local("late"), Some(ids(&["seed"])));
        assert!(fleet.store(&other).update_metadata("late", ids(&["a"])).await);

        // the owner keeps its entry
        assert!(fleet.store(&other).register_on_owner("late", ids(&[])).await);
        assert_eq!(
            fleet.store(&other).get_metadata("late").await.unwrap(),
            ids(&["seed", "a"])
        );

        fleet.network.set_reachable(&owner, false);
        assert!(!fleet.store(&other).register_on_owner("later", ids(&[])).await);
    }

    #[tokio::test]
    async fn test_unknown_metadata() {
        let fleet = StoreFleet::new(&["server-0", "server-1"]);
        for replica in fleet.replicas() {
            let store = fleet.store(replica);
            assert!(!store.update_metadata("unknown", ids(&["a"])).await);
            assert!(matches!(
                store.get_metadata("unknown").await,
                Err(StoreError::NotRegistered(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_unreachable_owner() {
        let fleet = StoreFleet::new(&["server-0", "server-1", "server-2"]);
        fleet.register_everywhere("roster", ids(&[]));
        let owner = fleet.store("server-0").owner_of("roster").unwrap();
        let other = fleet
            .replicas()
            .iter()
            .find(|replica| **replica != owner)
            .unwrap()
            .clone();

        fleet.network.set_reachable(&owner, false);
        let store = fleet.store(&other);
        assert!(!store.update_metadata("roster", ids(&["a"])).await);
        assert!(matches!(
            store.get_metadata("roster").await,
            Err(StoreError::Transport(replica, _)) if replica == owner
        ));

        fleet.network.set_reachable(&owner, true);
        assert!(store.update_metadata("roster", ids(&["a"])).await);
    }

    #[tokio::test]
    async fn test_rejected_merge_returns_false() {
        let fleet = StoreFleet::new(&["server-0", "server-1"]);
        fleet.register_everywhere("keys", MetadataValue::ClientKeyMap(BTreeMap::new()));
        for replica in fleet.replicas() {
            assert!(
                !fleet
                    .store(replica)
                    .update_metadata("keys", MetadataValue::GenericFlag(true))
                    .await
            );
        }
    }

    #[tokio::test]
    async fn test_reset_restores_the_registered_value() {
        let fleet = StoreFleet::new(&["server-0", "server-1"]);
        fleet.register_everywhere("roster", ids(&["seed"]));
        let owner = fleet.store("server-0").owner_of("roster").unwrap();
        let store = fleet.store(&owner);

        assert!(store.update_metadata("roster", ids(&["a", "b"])).await);
        store.reset_metadata("roster");
        assert_eq!(store.get_metadata("roster").await.unwrap(), ids(&["seed"]));
    }

    #[tokio::test]
    async fn test_reinit_for_scaling_moves_entries() {
        let fleet = StoreFleet::new(&["server-0", "server-1", "server-2"]);
        let names: Vec<_> = (0..20).map(|i| format!("roster-{}", i)).collect();
        for name in &names {
            fleet.register_everywhere(name, ids(&[]));
        }

        // shrink the ring to server-0 only
        for replica in fleet.replicas() {
            fleet.store(replica).reinit_for_scaling(vec!["server-0"]);
        }

        let store = fleet.store("server-0");
        for name in &names {
            assert!(store.is_owner(name));
            assert_eq!(store.get_local(name), Some(ids(&[])));
            assert!(fleet.store("server-1").get_local(name).is_none());
            assert!(fleet.store("server-2").get_local(name).is_none());
            assert!(fleet.store("server-1").update_metadata(name, ids(&["a"])).await);
            assert_eq!(store.get_local(name), Some(ids(&["a"])));
        }
    }
}
