//! The bookkeeping of the secure aggregation protocol.
//!
//! The [`CipherStore`] keeps the rosters, public keys, secret shares, noise and prime of the
//! protocol in the [`MetadataStore`]. The cryptographic material itself is opaque: only lengths and
//! arities are checked.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    common::ClientId,
    settings::CipherSettings,
    storage::{ClientKeys, ClientShare, MetadataKind, MetadataStore, MetadataValue, StoreError},
};

/// The length in bytes of the prime shared by the clients.
pub const PRIME_LEN: usize = 256;

/// The maximal length in bytes of a secret share.
pub const SHARE_MAX_SIZE: usize = 256;

/// The number of public keys a client publishes during the key exchange.
pub const KEYS_PER_CLIENT: usize = 2;

/// Names of the protocol metadata.
pub mod names {
    /// The clients which published their keys.
    pub const EXCHANGE_KEYS_CLIENT_LIST: &str = "exchangeKeysClientList";
    /// The public keys of the clients.
    pub const CLIENTS_KEYS: &str = "clientsKeys";
    /// The clients which fetched the public keys.
    pub const GET_KEYS_CLIENT_LIST: &str = "getKeysClientList";
    /// The clients which published their encrypted shares.
    pub const SHARE_SECRETS_CLIENT_LIST: &str = "shareSecretsClientList";
    /// The encrypted shares of the clients.
    pub const CLIENTS_ENCRYPTED_SHARES: &str = "clientsEncryptedShares";
    /// The clients which uploaded their model update.
    pub const UPDATE_MODEL_CLIENT_LIST: &str = "updateModelClientList";
    /// The clients which published their reconstruction shares.
    pub const RECONSTRUCT_CLIENT_LIST: &str = "reconstructClientList";
    /// The reconstruction shares of the clients.
    pub const CLIENTS_RECONSTRUCT_SHARES: &str = "clientsReconstructShares";
    /// The noise of the current iteration.
    pub const CLIENT_NOISES: &str = "clientNoises";
    /// The prime shared by the clients.
    pub const PRIME: &str = "prime";
}

/// Errors which can occur when reading protocol metadata.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("the noise {0} was not published after {1} attempts")]
    NoiseNotPublished(String, u32),
    #[error("metadata {name} holds a {found} instead of a {expected}")]
    UnexpectedKind {
        name: String,
        expected: MetadataKind,
        found: MetadataKind,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
/// The secure aggregation view of the metadata store.
pub struct CipherStore {
    store: MetadataStore,
    settings: CipherSettings,
}

impl CipherStore {
    /// Creates the view on top of the `store`.
    pub fn new(store: MetadataStore, settings: CipherSettings) -> Self {
        Self { store, settings }
    }

    /// Returns the underlying metadata store.
    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Registers all the protocol metadata. Registering again is a no-op.
    pub fn register_protocol_state(&self) {
        for roster in &[
            names::EXCHANGE_KEYS_CLIENT_LIST,
            names::GET_KEYS_CLIENT_LIST,
            names::SHARE_SECRETS_CLIENT_LIST,
            names::UPDATE_MODEL_CLIENT_LIST,
            names::RECONSTRUCT_CLIENT_LIST,
        ] {
            self.store
                .register_metadata(roster, MetadataValue::ClientIdList(Vec::new()));
        }
        self.store.register_metadata(
            names::CLIENTS_KEYS,
            MetadataValue::ClientKeyMap(BTreeMap::new()),
        );
        for shares in &[
            names::CLIENTS_ENCRYPTED_SHARES,
            names::CLIENTS_RECONSTRUCT_SHARES,
        ] {
            self.store
                .register_metadata(shares, MetadataValue::ClientShareMap(BTreeMap::new()));
        }
        self.store
            .register_metadata(names::CLIENT_NOISES, MetadataValue::ClientNoise(None));
        self.store
            .register_metadata(names::PRIME, MetadataValue::Prime(Vec::new()));
    }

    /// Resets the protocol metadata of an iteration. The prime is kept.
    pub fn reset_protocol_state(&self) {
        for name in &[
            names::EXCHANGE_KEYS_CLIENT_LIST,
            names::GET_KEYS_CLIENT_LIST,
            names::SHARE_SECRETS_CLIENT_LIST,
            names::UPDATE_MODEL_CLIENT_LIST,
            names::RECONSTRUCT_CLIENT_LIST,
            names::CLIENTS_KEYS,
            names::CLIENTS_ENCRYPTED_SHARES,
            names::CLIENTS_RECONSTRUCT_SHARES,
            names::CLIENT_NOISES,
        ] {
            self.store.reset_metadata(name);
        }
    }

    /// Adds the `client` to the roster `list`. Adding a client twice is a no-op.
    pub async fn update_client_roster(&self, list: &str, client: &str) -> bool {
        self.store
            .update_metadata(list, MetadataValue::ClientIdList(vec![client.to_string()]))
            .await
    }

    /// Stores the public `keys` of the `client` in the key map `list`.
    ///
    /// # Behavior
    ///
    /// Return `false` without touching the key map unless exactly two keys are given.
    pub async fn update_client_keys(&self, list: &str, client: &str, keys: &[Vec<u8>]) -> bool {
        let (public_key_1, public_key_2) = match keys {
            [first, second] => (first.clone(), second.clone()),
            _ => {
                warn!(
                    "client {} published {} keys instead of {}",
                    client,
                    keys.len(),
                    KEYS_PER_CLIENT
                );
                return false;
            }
        };
        let mut map = BTreeMap::new();
        map.insert(
            client.to_string(),
            ClientKeys {
                public_key_1,
                public_key_2,
            },
        );
        self.store
            .update_metadata(list, MetadataValue::ClientKeyMap(map))
            .await
    }

    /// Stores the `shares` of the `client` in the share map `list`.
    ///
    /// # Behavior
    ///
    /// Every share is checked before anything is written: a share without owner, an empty share
    /// or a share longer than [`SHARE_MAX_SIZE`] rejects the whole update with `false`.
    pub async fn update_client_shares(
        &self,
        list: &str,
        client: &str,
        shares: &[ClientShare],
    ) -> bool {
        if let Some(share) = shares.iter().find(|share| !is_valid_share(share)) {
            warn!(
                "client {} published an invalid share for {:?} of {} bytes",
                client,
                share.owner_id,
                share.share.len()
            );
            return false;
        }
        let mut map = BTreeMap::new();
        map.insert(client.to_string(), shares.to_vec());
        self.store
            .update_metadata(list, MetadataValue::ClientShareMap(map))
            .await
    }

    /// Publishes the `noise` of the iteration in `list`. Only the first publication is accepted.
    pub async fn update_client_noise(&self, list: &str, noise: Vec<f32>) -> bool {
        self.store
            .update_metadata(list, MetadataValue::ClientNoise(Some(noise)))
            .await
    }

    /// Publishes the `prime` shared by the clients in `list`. Only the first prime is accepted.
    ///
    /// The name is registered on its owner first, so any replica can publish a new prime.
    pub async fn register_shared_prime(&self, list: &str, prime: Vec<u8>) -> bool {
        if !self
            .store
            .register_on_owner(list, MetadataValue::Prime(Vec::new()))
            .await
        {
            return false;
        }
        self.store
            .update_metadata(list, MetadataValue::Prime(prime))
            .await
    }

    /// Returns the roster `list`.
    pub async fn client_roster(&self, list: &str) -> Result<Vec<ClientId>, CipherError> {
        match self.store.get_metadata(list).await? {
            MetadataValue::ClientIdList(roster) => Ok(roster),
            other => Err(unexpected(list, MetadataKind::ClientIdList, &other)),
        }
    }

    /// Returns the key map `list`.
    pub async fn client_keys(
        &self,
        list: &str,
    ) -> Result<BTreeMap<ClientId, ClientKeys>, CipherError> {
        match self.store.get_metadata(list).await? {
            MetadataValue::ClientKeyMap(keys) => Ok(keys),
            other => Err(unexpected(list, MetadataKind::ClientKeyMap, &other)),
        }
    }

    /// Returns the share map `list`.
    pub async fn client_shares(
        &self,
        list: &str,
    ) -> Result<BTreeMap<ClientId, Vec<ClientShare>>, CipherError> {
        match self.store.get_metadata(list).await? {
            MetadataValue::ClientShareMap(shares) => Ok(shares),
            other => Err(unexpected(list, MetadataKind::ClientShareMap, &other)),
        }
    }

    /// Waits for the noise of the iteration to be published in `list`.
    ///
    /// # Behavior
    ///
    /// - Read the noise every `noise_poll_interval` milliseconds, at most `noise_poll_attempts`
    ///   times, and return it as soon as it is published.
    /// - If it is still missing after the last attempt, return `CipherError::NoiseNotPublished`.
    /// - Store errors are returned immediately.
    ///
    /// Dropping the future stops the polling.
    pub async fn client_noise(&self, list: &str) -> Result<Vec<f32>, CipherError> {
        let attempts = self.settings.noise_poll_attempts;
        for attempt in 1..=attempts {
            match self.store.get_metadata(list).await? {
                MetadataValue::ClientNoise(Some(noise)) => return Ok(noise),
                MetadataValue::ClientNoise(None) => {
                    debug!("noise {} not published yet, attempt {}", list, attempt);
                }
                other => return Err(unexpected(list, MetadataKind::ClientNoise, &other)),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.noise_poll_interval()).await;
            }
        }
        Err(CipherError::NoiseNotPublished(list.to_string(), attempts))
    }

    /// Returns the prime published in `list`.
    ///
    /// # Behavior
    ///
    /// Return `None` if no prime of at least [`PRIME_LEN`] bytes has been published, otherwise its
    /// first [`PRIME_LEN`] bytes.
    pub async fn shared_prime(&self, list: &str) -> Result<Option<Vec<u8>>, CipherError> {
        match self.store.get_metadata(list).await? {
            MetadataValue::Prime(prime) if prime.len() >= PRIME_LEN => {
                Ok(Some(prime[..PRIME_LEN].to_vec()))
            }
            MetadataValue::Prime(prime) => {
                warn!(
                    "the prime {} has {} bytes instead of {}",
                    list,
                    prime.len(),
                    PRIME_LEN
                );
                Ok(None)
            }
            other => Err(unexpected(list, MetadataKind::Prime, &other)),
        }
    }
}

fn is_valid_share(share: &ClientShare) -> bool {
    !share.owner_id.is_empty() && !share.share.is_empty() && share.share.len() <= SHARE_MAX_SIZE
}

fn unexpected(name: &str, expected: MetadataKind, found: &MetadataValue) -> CipherError {
    CipherError::UnexpectedKind {
        name: name.to_string(),
        expected,
        found: found.kind(),
    }
}
