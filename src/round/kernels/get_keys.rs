use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{
    cipher::{names, CipherStore},
    round::{
        kernels::{
            check_iteration,
            decode,
            failure,
            messages::{ClientKeysList, GetKeysRequest, Response, ResponseCode},
        },
        KernelOutput,
        RoundContext,
        RoundHandler,
    },
};

/// Clients which exchanged their keys fetch the public keys of all the clients.
pub struct GetKeysHandler {
    cipher: CipherStore,
}

impl GetKeysHandler {
    pub fn new(cipher: CipherStore) -> Self {
        Self { cipher }
    }

    async fn try_handle(
        &self,
        ctx: &RoundContext,
        request: &[u8],
    ) -> Result<KernelOutput, KernelOutput> {
        let request: GetKeysRequest = decode(ctx, request)?;
        check_iteration(ctx, request.iteration)?;

        let system_error = |err: crate::cipher::CipherError| {
            warn!("failed to read the exchanged keys: {}", err);
            failure(ctx, ResponseCode::SystemError, err.to_string())
        };
        let exchanged = self
            .cipher
            .client_roster(names::EXCHANGE_KEYS_CLIENT_LIST)
            .await
            .map_err(system_error)?;
        if !exchanged.contains(&request.fl_id) {
            return Err(failure(
                ctx,
                ResponseCode::RequestError,
                format!("client {} did not exchange its keys", request.fl_id),
            ));
        }
        let mut keys: ClientKeysList = self
            .cipher
            .client_keys(names::CLIENTS_KEYS)
            .await
            .map_err(system_error)?;
        keys.retain(|client, _| exchanged.contains(client));

        if !self
            .cipher
            .update_client_roster(names::GET_KEYS_CLIENT_LIST, &request.fl_id)
            .await
        {
            return Err(failure(
                ctx,
                ResponseCode::SystemError,
                format!("failed to record client {}", request.fl_id),
            ));
        }
        debug!("client {} fetched {} keys", request.fl_id, keys.len());
        Ok(KernelOutput::accepted(
            Response::succeed(ctx.iteration, keys).encode(),
            request.fl_id,
        ))
    }
}

#[async_trait]
impl RoundHandler for GetKeysHandler {
    async fn handle(&self, ctx: &RoundContext, request: &[u8]) -> KernelOutput {
        self.try_handle(ctx, request)
            .await
            .unwrap_or_else(|output| output)
    }

    async fn reset(&self) {
        self.cipher
            .store()
            .reset_metadata(names::GET_KEYS_CLIENT_LIST);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::kernels::{
        messages::encode_request,
        tests::{ciphers, code, ctx},
        GET_KEYS,
    };

    fn request(fl_id: &str, iteration: u64) -> Vec<u8> {
        encode_request(&GetKeysRequest {
            fl_id: fl_id.to_string(),
            iteration,
        })
        .unwrap()
        .to_vec()
    }

    #[tokio::test]
    async fn test_get_keys() {
        let (_fleet, ciphers) = ciphers();
        for (cipher, client) in ciphers.iter().zip(&["a", "b"]) {
            assert!(
                cipher
                    .update_client_keys(names::CLIENTS_KEYS, client, &[vec![1], vec![2]])
                    .await
            );
            assert!(
                cipher
                    .update_client_roster(names::EXCHANGE_KEYS_CLIENT_LIST, client)
                    .await
            );
        }
        let handler = GetKeysHandler::new(ciphers[2].clone());

        let output = handler.handle(&ctx(GET_KEYS, 0), &request("a", 0)).await;
        assert!(output.valid);
        let response = Response::<ClientKeysList>::decode(&output.response).unwrap();
        assert_eq!(response.code, ResponseCode::Succeed);
        let keys = response.body.unwrap();
        assert_eq!(keys.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(
            ciphers[0]
                .client_roster(names::GET_KEYS_CLIENT_LIST)
                .await
                .unwrap(),
            vec!["a"]
        );
    }

    #[tokio::test]
    async fn test_unknown_client() {
        let (_fleet, ciphers) = ciphers();
        let handler = GetKeysHandler::new(ciphers[0].clone());

        let output = handler.handle(&ctx(GET_KEYS, 0), &request("z", 0)).await;
        assert!(!output.valid);
        assert_eq!(code(&output), ResponseCode::RequestError);
    }

    #[tokio::test]
    async fn test_wrong_iteration() {
        let (_fleet, ciphers) = ciphers();
        let handler = GetKeysHandler::new(ciphers[0].clone());

        let output = handler.handle(&ctx(GET_KEYS, 2), &request("a", 1)).await;
        assert!(!output.valid);
        assert_eq!(code(&output), ResponseCode::OutOfTime);
    }

    #[tokio::test]
    async fn test_keys_of_unrecorded_clients_are_hidden() {
        let (_fleet, ciphers) = ciphers();
        for client in &["a", "c"] {
            assert!(
                ciphers[0]
                    .update_client_keys(names::CLIENTS_KEYS, client, &[vec![1], vec![2]])
                    .await
            );
        }
        // the key exchange of c failed before it was recorded
        assert!(
            ciphers[0]
                .update_client_roster(names::EXCHANGE_KEYS_CLIENT_LIST, "a")
                .await
        );
        let handler = GetKeysHandler::new(ciphers[1].clone());

        let output = handler.handle(&ctx(GET_KEYS, 0), &request("a", 0)).await;
        assert!(output.valid);
        let keys = Response::<ClientKeysList>::decode(&output.response)
            .unwrap()
            .body
            .unwrap();
        assert_eq!(keys.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_reset_keeps_the_exchanged_keys() {
        let (_fleet, ciphers) = ciphers();
        assert!(
            ciphers[0]
                .update_client_keys(names::CLIENTS_KEYS, "a", &[vec![1], vec![2]])
                .await
        );
        for cipher in &ciphers {
            GetKeysHandler::new(cipher.clone()).reset().await;
        }
        assert_eq!(
            ciphers[1].client_keys(names::CLIENTS_KEYS).await.unwrap().len(),
            1
        );
    }
}
