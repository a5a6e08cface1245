//! The background liveness sweep of the membership manager.

use std::sync::Arc;

use tokio::{task::JoinHandle, time};
use tracing::{debug, error_span, warn};
use tracing_futures::Instrument;

use crate::cluster::MembershipManager;

/// Spawns the loop sweeping the replicas every heartbeat interval.
///
/// The loop stops when the manager shuts down or when a sweep fails the cluster.
pub fn spawn_liveness_sweep(manager: Arc<MembershipManager>) -> JoinHandle<()> {
    let mut shutdown = manager.shutdown_listener();
    let mut interval = time::interval(manager.settings().heartbeat_interval());
    let span = error_span!("liveness_sweep");

    tokio::spawn(
        async move {
            loop {
                if manager.is_shut_down() {
                    break;
                }
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = manager.sweep() {
                            warn!("stopping the liveness sweep: {}", err);
                            break;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("liveness sweep terminated");
        }
        .instrument(span),
    )
}
