use async_trait::async_trait;
use tracing::debug;

use crate::{
    cipher::{names, CipherStore},
    round::{
        kernels::{
            check_iteration,
            decode,
            failure,
            messages::{ExchangeKeysRequest, Response, ResponseCode},
        },
        KernelOutput,
        RoundContext,
        RoundHandler,
    },
};

/// Clients publish their two public keys.
pub struct ExchangeKeysHandler {
    cipher: CipherStore,
}

impl ExchangeKeysHandler {
    pub fn new(cipher: CipherStore) -> Self {
        Self { cipher }
    }

    async fn try_handle(
        &self,
        ctx: &RoundContext,
        request: &[u8],
    ) -> Result<KernelOutput, KernelOutput> {
        let request: ExchangeKeysRequest = decode(ctx, request)?;
        check_iteration(ctx, request.iteration)?;

        if !self
            .cipher
            .update_client_keys(names::CLIENTS_KEYS, &request.fl_id, &request.keys)
            .await
        {
            return Err(failure(
                ctx,
                ResponseCode::RequestError,
                format!("the keys of client {} have been rejected", request.fl_id),
            ));
        }
        if !self
            .cipher
            .update_client_roster(names::EXCHANGE_KEYS_CLIENT_LIST, &request.fl_id)
            .await
        {
            return Err(failure(
                ctx,
                ResponseCode::SystemError,
                format!("failed to record client {}", request.fl_id),
            ));
        }
        debug!(
            "client {} exchanged its keys {}",
            request.fl_id,
            fingerprint(&request.keys)
        );
        Ok(KernelOutput::accepted(
            Response::succeed(ctx.iteration, ()).encode(),
            request.fl_id,
        ))
    }
}

#[async_trait]
impl RoundHandler for ExchangeKeysHandler {
    async fn handle(&self, ctx: &RoundContext, request: &[u8]) -> KernelOutput {
        self.try_handle(ctx, request)
            .await
            .unwrap_or_else(|output| output)
    }

    async fn reset(&self) {
        let store = self.cipher.store();
        store.reset_metadata(names::EXCHANGE_KEYS_CLIENT_LIST);
        store.reset_metadata(names::CLIENTS_KEYS);
    }
}

/// Hex encoded prefixes of the keys, for the logs.
fn fingerprint(keys: &[Vec<u8>]) -> String {
    keys.iter()
        .map(|key| hex::encode(&key[..key.len().min(4)]))
        .collect::<Vec<_>>()
        .join("/")
}
