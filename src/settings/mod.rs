//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables. An example
//! of a configuration file can be found in the `configs/` directory located in the repository root.

use std::{collections::HashSet, fmt, path::Path, time::Duration};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::round::{kernels::ROUND_NAMES, RoundDescriptor};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
#[validate(schema(function = "validate_rounds"))]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    #[validate]
    pub cluster: ClusterSettings,
    #[validate]
    pub store: StoreSettings,
    #[validate]
    pub cipher: CipherSettings,
    pub rounds: Vec<RoundSettings>,
    pub log: LoggingSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("xaynet")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }

    /// Checks the round settings: names must be known and unique, counted rounds need a threshold
    /// and timed rounds need a time window.
    fn validate_rounds(&self) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        for round in &self.rounds {
            if !ROUND_NAMES.contains(&round.name.as_str()) {
                return Err(ValidationError::new("unknown round"));
            }
            if !names.insert(round.name.as_str()) {
                return Err(ValidationError::new("duplicate round"));
            }
            if round.check_count && round.threshold_count == 0 && !round.server_num_as_threshold {
                return Err(ValidationError::new("invalid round threshold"));
            }
            if round.check_timeout && round.time_window == 0 {
                return Err(ValidationError::new("invalid round time window"));
            }
        }
        Ok(())
    }
}

/// A wrapper for validate derive.
fn validate_rounds(s: &Settings) -> Result<(), ValidationError> {
    s.validate_rounds()
}

/// The cluster membership settings.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_cluster"))]
pub struct ClusterSettings {
    /// The number of worker processes expected to register.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cluster]
    /// worker_num = 2
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_CLUSTER__WORKER_NUM=2
    /// ```
    pub worker_num: u32,

    /// The number of server replicas expected to register. It must be at least `1`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cluster]
    /// server_num = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_CLUSTER__SERVER_NUM=3
    /// ```
    #[validate(range(min = 1))]
    pub server_num: u32,

    /// The interval of the liveness sweep, in milliseconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cluster]
    /// heartbeat_interval = 3000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_CLUSTER__HEARTBEAT_INTERVAL=3000
    /// ```
    pub heartbeat_interval: u64,

    /// The time after which a silent replica is considered stale, in milliseconds. It must be
    /// greater than the heartbeat interval.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cluster]
    /// heartbeat_timeout = 30000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_CLUSTER__HEARTBEAT_TIMEOUT=30000
    /// ```
    pub heartbeat_timeout: u64,

    /// The fraction of stale replicas above which the cluster fails. The value must be between
    /// `0` and `1` (i.e. `0 <= max_stale_ratio < 1`).
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cluster]
    /// max_stale_ratio = 0.3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_CLUSTER__MAX_STALE_RATIO=0.3
    /// ```
    pub max_stale_ratio: f64,

    /// The time the expected replicas have to register, in milliseconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cluster]
    /// cluster_available_timeout = 60000
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_CLUSTER__CLUSTER_AVAILABLE_TIMEOUT=60000
    /// ```
    pub cluster_available_timeout: u64,
}

impl ClusterSettings {
    /// Checks the cluster settings.
    fn validate_cluster(&self) -> Result<(), ValidationError> {
        if self.heartbeat_interval == 0 || self.heartbeat_interval >= self.heartbeat_timeout {
            return Err(ValidationError::new("invalid heartbeat timing"));
        }
        if !(0. ..1.).contains(&self.max_stale_ratio) {
            return Err(ValidationError::new("invalid stale ratio"));
        }
        if self.cluster_available_timeout == 0 {
            return Err(ValidationError::new("invalid availability timeout"));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout)
    }

    pub fn cluster_available_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster_available_timeout)
    }
}

/// A wrapper for validate derive.
fn validate_cluster(s: &ClusterSettings) -> Result<(), ValidationError> {
    s.validate_cluster()
}

/// The metadata store settings.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
pub struct StoreSettings {
    /// The number of virtual nodes each server replica places on the hash ring.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [store]
    /// virtual_nodes = 100
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_STORE__VIRTUAL_NODES=100
    /// ```
    #[validate(range(min = 1))]
    pub virtual_nodes: u32,
}

/// The secure aggregation settings.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
pub struct CipherSettings {
    /// The interval between two reads of the published noise, in milliseconds.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cipher]
    /// noise_poll_interval = 50
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_CIPHER__NOISE_POLL_INTERVAL=50
    /// ```
    #[validate(range(min = 1))]
    pub noise_poll_interval: u64,

    /// The number of reads of the published noise before giving up.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [cipher]
    /// noise_poll_attempts = 600
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_CIPHER__NOISE_POLL_ATTEMPTS=600
    /// ```
    #[validate(range(min = 1))]
    pub noise_poll_attempts: u32,
}

impl CipherSettings {
    pub fn noise_poll_interval(&self) -> Duration {
        Duration::from_millis(self.noise_poll_interval)
    }
}

/// The settings of one round.
///
/// # Examples
///
/// **TOML**
/// ```text
/// [[rounds]]
/// name = "exchangeKeys"
/// check_timeout = true
/// time_window = 60000
/// check_count = true
/// threshold_count = 8
/// ```
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RoundSettings {
    /// The name of the round, one of `getKeys`, `exchangeKeys`, `shareSecrets`,
    /// `reconstructSecrets` and `updateModel`.
    pub name: String,
    /// Whether the round times out.
    #[serde(default)]
    pub check_timeout: bool,
    /// The time window of the round, in milliseconds, starting at its first contribution.
    #[serde(default)]
    pub time_window: u64,
    /// Whether the round completes when enough contributions have been counted.
    #[serde(default)]
    pub check_count: bool,
    /// The number of distinct contributions which completes the round.
    #[serde(default)]
    pub threshold_count: u64,
    /// Whether the threshold follows the number of server replicas when the cluster scales.
    #[serde(default)]
    pub server_num_as_threshold: bool,
}

impl From<&RoundSettings> for RoundDescriptor {
    fn from(settings: &RoundSettings) -> Self {
        Self {
            name: settings.name.clone(),
            check_timeout: settings.check_timeout,
            time_window: Duration::from_millis(settings.time_window),
            check_count: settings.check_count,
            threshold_count: settings.threshold_count,
            server_num_as_threshold: settings.server_num_as_threshold,
        }
    }
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// XAYNET_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3.17/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3.17/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(serde::de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
