//! The requests and responses of the protocol rounds.
//!
//! Messages are encoded with `bincode`. Every response carries a [`ResponseCode`], a reason for
//! failures and the iteration of the replica which answered.

use std::collections::BTreeMap;

use bytes::Bytes;
use derive_more::Display;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::error;

use crate::{
    common::ClientId,
    storage::{ClientKeys, ClientShare},
};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// The outcome of a request.
pub enum ResponseCode {
    /// The request has been accepted.
    Succeed,
    /// The request is malformed or has been rejected.
    RequestError,
    /// The request arrived for another iteration or after the round finished.
    OutOfTime,
    /// The replica could not serve the request.
    SystemError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The response to a round request.
pub struct Response<T> {
    pub code: ResponseCode,
    pub reason: String,
    pub iteration: u64,
    pub body: Option<T>,
}

impl<T> Response<T>
where
    T: Serialize,
{
    /// Creates a successful response.
    pub fn succeed(iteration: u64, body: T) -> Self {
        Self {
            code: ResponseCode::Succeed,
            reason: String::new(),
            iteration,
            body: Some(body),
        }
    }

    /// Creates a failed response.
    pub fn error(code: ResponseCode, reason: impl Into<String>, iteration: u64) -> Self {
        Self {
            code,
            reason: reason.into(),
            iteration,
            body: None,
        }
    }

    /// Encodes the response.
    pub fn encode(&self) -> Bytes {
        match bincode::serialize(self) {
            Ok(bytes) => bytes.into(),
            Err(err) => {
                error!("failed to encode a response: {}", err);
                Bytes::new()
            }
        }
    }
}

impl<T> Response<T>
where
    T: DeserializeOwned,
{
    /// Decodes a response.
    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Decodes a request.
pub fn decode_request<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode::deserialize(bytes)
}

/// Encodes a request.
pub fn encode_request<T: Serialize>(request: &T) -> Result<Bytes, bincode::Error> {
    bincode::serialize(request).map(Bytes::from)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A client publishes its public keys.
pub struct ExchangeKeysRequest {
    pub fl_id: ClientId,
    pub iteration: u64,
    pub keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A client fetches the public keys of the other clients.
pub struct GetKeysRequest {
    pub fl_id: ClientId,
    pub iteration: u64,
}

/// The public keys of the clients which took part in the key exchange.
pub type ClientKeysList = BTreeMap<ClientId, ClientKeys>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A client publishes secret shares, encrypted for their owners during the share exchange and in
/// clear during the reconstruction.
pub struct SharesRequest {
    pub fl_id: ClientId,
    pub iteration: u64,
    pub shares: Vec<ClientShare>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A client uploads its masked model update.
pub struct UpdateModelRequest {
    pub fl_id: ClientId,
    pub iteration: u64,
    pub model: Vec<u8>,
}
