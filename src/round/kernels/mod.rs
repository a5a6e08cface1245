//! The handlers of the protocol rounds.
//!
//! Each round of the secure aggregation protocol has its own [`RoundHandler`]. Handlers decode
//! the request, check that it targets the current iteration and record it through the
//! [`CipherStore`].
//!
//! A handler writes the payload of a client before adding the client to the roster of the round.
//! The roster is the record of the accepted clients: payloads of clients missing from it are
//! ignored by the readers.

pub mod exchange_keys;
pub mod get_keys;
pub mod messages;
pub mod reconstruct_secrets;
pub mod share_secrets;
pub mod update_model;

use std::sync::Arc;

use serde::de::DeserializeOwned;

pub use self::{
    exchange_keys::ExchangeKeysHandler,
    get_keys::GetKeysHandler,
    reconstruct_secrets::ReconstructSecretsHandler,
    share_secrets::ShareSecretsHandler,
    update_model::UpdateModelHandler,
};
use self::messages::{decode_request, Response, ResponseCode};
use crate::{
    cipher::CipherStore,
    round::{KernelOutput, RoundContext, RoundHandler},
};

pub const EXCHANGE_KEYS: &str = "exchangeKeys";
pub const GET_KEYS: &str = "getKeys";
pub const SHARE_SECRETS: &str = "shareSecrets";
pub const RECONSTRUCT_SECRETS: &str = "reconstructSecrets";
pub const UPDATE_MODEL: &str = "updateModel";

/// The names of the rounds which have a handler.
pub const ROUND_NAMES: [&str; 5] = [
    EXCHANGE_KEYS,
    GET_KEYS,
    SHARE_SECRETS,
    RECONSTRUCT_SECRETS,
    UPDATE_MODEL,
];

/// Creates the handler of the round `name`, or `None` if there is no such round.
pub fn handler_for(name: &str, cipher: CipherStore) -> Option<Arc<dyn RoundHandler>> {
    let handler: Arc<dyn RoundHandler> = match name {
        EXCHANGE_KEYS => Arc::new(ExchangeKeysHandler::new(cipher)),
        GET_KEYS => Arc::new(GetKeysHandler::new(cipher)),
        SHARE_SECRETS => Arc::new(ShareSecretsHandler::new(cipher)),
        RECONSTRUCT_SECRETS => Arc::new(ReconstructSecretsHandler::new(cipher)),
        UPDATE_MODEL => Arc::new(UpdateModelHandler::new(cipher)),
        _ => return None,
    };
    Some(handler)
}

/// A request which is answered with an error and not counted.
pub(crate) fn failure(ctx: &RoundContext, code: ResponseCode, reason: String) -> KernelOutput {
    KernelOutput::rejected(Response::<()>::error(code, reason, ctx.iteration).encode())
}

/// Decodes a request of the round.
pub(crate) fn decode<T: DeserializeOwned>(
    ctx: &RoundContext,
    request: &[u8],
) -> Result<T, KernelOutput> {
    decode_request(request).map_err(|err| {
        failure(
            ctx,
            ResponseCode::RequestError,
            format!("malformed {} request: {}", ctx.round, err),
        )
    })
}

/// Checks that a request targets the current iteration.
pub(crate) fn check_iteration(ctx: &RoundContext, requested: u64) -> Result<(), KernelOutput> {
    if requested == ctx.iteration {
        Ok(())
    } else {
        Err(failure(
            ctx,
            ResponseCode::OutOfTime,
            format!(
                "the request targets iteration {} but the current iteration is {}",
                requested, ctx.iteration
            ),
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{settings::CipherSettings, tests::utils::StoreFleet};

    /// A cipher store on each of three replicas, with the protocol state registered.
    pub fn ciphers() -> (StoreFleet, Vec<CipherStore>) {
        let fleet = StoreFleet::new(&["server-0", "server-1", "server-2"]);
        let settings = CipherSettings {
            noise_poll_interval: 10,
            noise_poll_attempts: 5,
        };
        let ciphers: Vec<_> = fleet
            .replicas()
            .iter()
            .map(|replica| CipherStore::new(fleet.store(replica).clone(), settings))
            .collect();
        for cipher in &ciphers {
            cipher.register_protocol_state();
        }
        (fleet, ciphers)
    }

    pub fn ctx(round: &str, iteration: u64) -> RoundContext {
        RoundContext {
            round: round.to_string(),
            iteration,
        }
    }

    pub fn code(output: &KernelOutput) -> ResponseCode {
        Response::<()>::decode(&output.response).unwrap().code
    }

    #[test]
    fn test_handler_for() {
        let (_fleet, ciphers) = ciphers();
        for name in &ROUND_NAMES {
            assert!(handler_for(name, ciphers[0].clone()).is_some());
        }
        assert!(handler_for("pushMetrics", ciphers[0].clone()).is_none());
    }

    #[test]
    fn test_check_iteration() {
        assert!(check_iteration(&ctx(GET_KEYS, 3), 3).is_ok());
        let output = check_iteration(&ctx(GET_KEYS, 3), 2).unwrap_err();
        assert!(!output.valid);
        assert_eq!(code(&output), ResponseCode::OutOfTime);
    }

    #[test]
    fn test_decode_malformed_request() {
        let output =
            decode::<messages::GetKeysRequest>(&ctx(GET_KEYS, 0), &[0xff]).unwrap_err();
        assert_eq!(code(&output), ResponseCode::RequestError);
    }
}
