use async_trait::async_trait;
use tracing::{debug, info, warn};

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

/// Clients which shared their secrets publish the shares they hold, so that the secrets of the
/// clients which dropped out can be reconstructed.
pub struct ReconstructSecretsHandler {
    cipher: CipherStore,
}

impl ReconstructSecretsHandler {
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
            .update_client_shares(
                names::CLIENTS_RECONSTRUCT_SHARES,
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
            .update_client_roster(names::RECONSTRUCT_CLIENT_LIST, &request.fl_id)
            .await
        {
            return Err(failure(
                ctx,
                ResponseCode::SystemError,
                format!("failed to record client {}", request.fl_id),
            ));
        }
        debug!(
            "client {} published {} reconstruction shares",
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
impl RoundHandler for ReconstructSecretsHandler {
    async fn handle(&self, ctx: &RoundContext, request: &[u8]) -> KernelOutput {
        self.try_handle(ctx, request)
            .await
            .unwrap_or_else(|output| output)
    }

    async fn on_last_count(&self, ctx: &RoundContext) {
        let recorded = self.cipher.client_roster(names::RECONSTRUCT_CLIENT_LIST).await;
        let shares = self
            .cipher
            .client_shares(names::CLIENTS_RECONSTRUCT_SHARES)
            .await;
        match (recorded, shares) {
            (Ok(recorded), Ok(shares)) => info!(
                "iteration {}: reconstruction shares of {} clients collected",
                ctx.iteration,
                shares
                    .keys()
                    .filter(|client| recorded.contains(client))
                    .count()
            ),
            (Err(err), _) | (_, Err(err)) => {
                warn!("failed to read the reconstruction shares: {}", err)
            }
        }
    }

    async fn reset(&self) {
        let store = self.cipher.store();
        store.reset_metadata(names::RECONSTRUCT_CLIENT_LIST);
        store.reset_metadata(names::CLIENTS_RECONSTRUCT_SHARES);
        store.reset_metadata(names::CLIENT_NOISES);
    }
}
