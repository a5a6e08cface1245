use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    cipher::{names, CipherStore},
    round::{
        kernels::{
            check_iteration,
            decode,
            failure,
            messages::{Response, ResponseCode, UpdateModelRequest},
        },
        KernelOutput,
        RoundContext,
        RoundHandler,
    },
};

/// Clients which shared their secrets upload their masked model update. The update itself is
/// opaque and handed over to the aggregation, only the clients are recorded here.
pub struct UpdateModelHandler {
    cipher: CipherStore,
}

impl UpdateModelHandler {
    pub fn new(cipher: CipherStore) -> Self {
        Self { cipher }
    }

    async fn try_handle(
        &self,
        ctx: &RoundContext,
        request: &[u8],
    ) -> Result<KernelOutput, KernelOutput> {
        let request: UpdateModelRequest = decode(ctx, request)?;
        check_iteration(ctx, request.iteration)?;

        if request.model.is_empty() {
            return Err(failure(
                ctx,
                ResponseCode::RequestError,
                format!("client {} uploaded an empty model", request.fl_id),
            ));
        }
        let shared = self
            .cipher
            .client_roster(names::SHARE_SECRETS_CLIENT_LIST)
            .await
            .map_err(|err| {
                warn!("failed to read the share roster: {}", err);
                failure(ctx, ResponseCode::SystemError, err.to_string())
            })?;
        if !shared.contains(&request.fl_id) {
            return Err(failure(
                ctx,
                ResponseCode::RequestError,
                format!("client {} did not share its secrets", request.fl_id),
            ));
        }

        if !self
            .cipher
            .update_client_roster(names::UPDATE_MODEL_CLIENT_LIST, &request.fl_id)
            .await
        {
            return Err(failure(
                ctx,
                ResponseCode::SystemError,
                format!("failed to record client {}", request.fl_id),
            ));
        }
        debug!(
            "client {} uploaded a model of {} bytes",
            request.fl_id,
            request.model.len()
        );
        Ok(KernelOutput::accepted(
            Response::succeed(ctx.iteration, ()).encode(),
            request.fl_id,
        ))
    }
}

#[async_trait]
impl RoundHandler for UpdateModelHandler {
    async fn handle(&self, ctx: &RoundContext, request: &[u8]) -> KernelOutput {
        self.try_handle(ctx, request)
            .await
            .unwrap_or_else(|output| output)
    }

    async fn on_first_count(&self, ctx: &RoundContext) {
        info!("iteration {}: first model update received", ctx.iteration);
    }

    async fn reset(&self) {
        self.cipher
            .store()
            .reset_metadata(names::UPDATE_MODEL_CLIENT_LIST);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::kernels::{
        messages::encode_request,
        tests::{ciphers, code, ctx},
        UPDATE_MODEL,
    };

    fn request(fl_id: &str, model: Vec<u8>) -> Vec<u8> {
        encode_request(&UpdateModelRequest {
            fl_id: fl_id.to_string(),
            iteration: 0,
            model,
        })
        .unwrap()
        .to_vec()
    }

    #[tokio::test]
    async fn test_update_model() {
        let (_fleet, ciphers) = ciphers();
        assert!(
            ciphers[2]
                .update_client_roster(names::SHARE_SECRETS_CLIENT_LIST, "a")
                .await
        );
        let handler = UpdateModelHandler::new(ciphers[0].clone());

        let output = handler
            .handle(&ctx(UPDATE_MODEL, 0), &request("a", vec![1, 2, 3]))
            .await;
        assert!(output.valid);
        assert_eq!(code(&output), ResponseCode::Succeed);
        assert_eq!(
            ciphers[1]
                .client_roster(names::UPDATE_MODEL_CLIENT_LIST)
                .await
                .unwrap(),
            vec!["a"]
        );
    }

    #[tokio::test]
    async fn test_empty_model() {
        let (_fleet, ciphers) = ciphers();
        assert!(
            ciphers[2]
                .update_client_roster(names::SHARE_SECRETS_CLIENT_LIST, "a")
                .await
        );
        let handler = UpdateModelHandler::new(ciphers[0].clone());

        let output = handler
            .handle(&ctx(UPDATE_MODEL, 0), &request("a", Vec::new()))
            .await;
        assert!(!output.valid);
        assert_eq!(code(&output), ResponseCode::RequestError);
    }

    #[tokio::test]
    async fn test_client_without_shared_secrets() {
        let (_fleet, ciphers) = ciphers();
        let handler = UpdateModelHandler::new(ciphers[0].clone());

        let output = handler
            .handle(&ctx(UPDATE_MODEL, 0), &request("b", vec![1]))
            .await;
        assert!(!output.valid);
        assert_eq!(code(&output), ResponseCode::RequestError);
    }
}
