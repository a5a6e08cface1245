use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    cipher::{names, CipherStore},
    round::{
        kernels::{
            check_iteration,
            decode,
            failure,
            messages::{Response, ResponseCode, SharesRequest},
        },
        KernelOutput,
        RoundContext,
        RoundHandler,
    },
};

/// Clients which exchanged their keys publish the shares of their secrets, encrypted for the
/// clients owning them.
pub struct ShareSecretsHandler {
    cipher: CipherStore,
}

impl ShareSecretsHandler {
    pub fn new(cipher: CipherStore) -> Self {
        Self { cipher }
    }

    async fn try_handle(
        &self,
        ctx: &RoundContext,
        request: &[u8],
    ) -> Result<KernelOutput, KernelOutput> {
        let request: SharesRequest = decode(ctx, request)?;
        check_iteration(ctx, request.iteration)?;

        let exchanged = self
            .cipher
            .client_roster(names::EXCHANGE_KEYS_CLIENT_LIST)
            .await
            .map_err(|err| {
                warn!("failed to read the key exchange roster: {}", err);
                failure(ctx, ResponseCode::SystemError, err.to_string())
            })?;
        if !exchanged.contains(&request.fl_id) {
            return Err(failure(
                ctx,
                ResponseCode::RequestError,
                format!("client {} did not exchange its keys", request.fl_id),
            ));
        }

        if !self
            .cipher
            .update_client_shares(
                names::CLIENTS_ENCRYPTED_SHARES,
                &request.fl_id,
                &request.shares,
            )
            .await
        {
            return Err(failure(
                ctx,
                ResponseCode::RequestError,
                format!("the shares of client {} have been rejected", request.fl_id),
            ));
        }
        if !self
            .cipher
            .update_client_roster(names::SHARE_SECRETS_CLIENT_LIST, &request.fl_id)
            .await
        {
            return Err(failure(
                ctx,
                ResponseCode::SystemError,
                format!("failed to record client {}", request.fl_id),
            ));
        }
        debug!(
            "client {} shared {} secrets",
            request.fl_id,
            request.shares.len()
        );
        Ok(KernelOutput::accepted(
            Response::succeed(ctx.iteration, ()).encode(),
            request.fl_id,
        ))
    }
}

#[async_trait]
impl RoundHandler for ShareSecretsHandler {
    async fn handle(&self, ctx: &RoundContext, request: &[u8]) -> KernelOutput {
        self.try_handle(ctx, request)
            .await
            .unwrap_or_else(|output| output)
    }

    async fn reset(&self) {
        let store = self.cipher.store();
        store.reset_metadata(names::SHARE_SECRETS_CLIENT_LIST);
        store.reset_metadata(names::CLIENTS_ENCRYPTED_SHARES);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        round::kernels::{
            messages::encode_request,
            tests::{ciphers, code, ctx},
            SHARE_SECRETS,
        },
        storage::ClientShare,
    };

    fn request(fl_id: &str, shares: Vec<ClientShare>) -> Vec<u8> {
        encode_request(&SharesRequest {
            fl_id: fl_id.to_string(),
            iteration: 0,
            shares,
        })
        .unwrap()
        .to_vec()
    }

    fn share(owner: &str, len: usize) -> ClientShare {
        ClientShare {
            owner_id: owner.to_string(),
            index: 0,
            share: vec![5; len],
        }
    }

    #[tokio::test]
    async fn test_share_secrets() {
        let (_fleet, ciphers) = ciphers();
        assert!(
            ciphers[0]
                .update_client_roster(names::EXCHANGE_KEYS_CLIENT_LIST, "a")
                .await
        );
        let handler = ShareSecretsHandler::new(ciphers[1].clone());

        let shares = vec![share("b", 32), share("c", 32)];
        let output = handler
            .handle(&ctx(SHARE_SECRETS, 0), &request("a", shares.clone()))
            .await;
        assert!(output.valid);
        assert_eq!(
            ciphers[2]
                .client_shares(names::CLIENTS_ENCRYPTED_SHARES)
                .await
                .unwrap()["a"],
            shares
        );
        assert_eq!(
            ciphers[2]
                .client_roster(names::SHARE_SECRETS_CLIENT_LIST)
                .await
                .unwrap(),
            vec!["a"]
        );
    }

    #[tokio::test]
    async fn test_invalid_share() {
        let (_fleet, ciphers) = ciphers();
        assert!(
            ciphers[0]
                .update_client_roster(names::EXCHANGE_KEYS_CLIENT_LIST, "a")
                .await
        );
        let handler = ShareSecretsHandler::new(ciphers[0].clone());

        let output = handler
            .handle(
                &ctx(SHARE_SECRETS, 0),
                &request("a", vec![share("b", 32), share("c", 0)]),
            )
            .await;
        assert!(!output.valid);
        assert_eq!(code(&output), ResponseCode::RequestError);
        assert!(ciphers[0]
            .client_roster(names::SHARE_SECRETS_CLIENT_LIST)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_client_without_keys() {
        let (_fleet, ciphers) = ciphers();
        let handler = ShareSecretsHandler::new(ciphers[0].clone());

        let output = handler
            .handle(&ctx(SHARE_SECRETS, 0), &request("a", vec![share("b", 32)]))
            .await;
        assert!(!output.valid);
        assert_eq!(code(&output), ResponseCode::RequestError);
    }
}
