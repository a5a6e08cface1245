//! The iteration state of a replica.
//!
//! Iterations are numbered from `0` at process start. A round advances the iteration it started
//! in exactly once, when it reaches its threshold or times out. Every advance is published as an
//! [`IterationEvent`] to the local listeners and broadcast to the other replicas.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::comm::{messages, Communicator};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// The end of an iteration.
pub struct IterationEvent {
    /// The iteration which has been finished.
    pub finished: u64,
    /// The iteration which starts.
    pub iteration: u64,
    /// The round which finished the iteration.
    pub round: String,
    /// Whether the round reached its threshold, as opposed to timing out.
    pub valid: bool,
    /// Why the iteration has been finished.
    pub reason: String,
}

impl IterationEvent {
    fn start() -> Self {
        Self {
            finished: 0,
            iteration: 0,
            round: String::new(),
            valid: true,
            reason: "process start".to_string(),
        }
    }
}

/// A listener for iteration events. It can be used to either retrieve the latest event with
/// [`IterationListener::get_latest`] or to wait for the next one with
/// [`IterationListener::next_event`].
#[derive(Debug, Clone)]
pub struct IterationListener(watch::Receiver<IterationEvent>);

impl IterationListener {
    pub fn get_latest(&self) -> IterationEvent {
        self.0.borrow().clone()
    }

    /// Waits for the next event. Returns `None` once the iteration state has been dropped.
    pub async fn next_event(&mut self) -> Option<IterationEvent> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow().clone())
    }
}

/// The iteration counter of a replica.
pub struct Iteration {
    number: AtomicU64,
    events: watch::Sender<IterationEvent>,
    communicator: Option<Arc<dyn Communicator>>,
}

impl Iteration {
    /// Creates the iteration state at iteration `0`. Finished iterations are broadcast through the
    /// `communicator`, if any.
    pub fn new(communicator: Option<Arc<dyn Communicator>>) -> Self {
        let (events, _) = watch::channel(IterationEvent::start());
        Self {
            number: AtomicU64::new(0),
            events,
            communicator,
        }
    }

    /// Returns the current iteration.
    pub fn current(&self) -> u64 {
        self.number.load(Ordering::Acquire)
    }

    /// Returns a listener for the iteration events.
    pub fn listener(&self) -> IterationListener {
        IterationListener(self.events.subscribe())
    }

    /// Finishes the `iteration` on behalf of the `round`.
    ///
    /// # Behavior
    ///
    /// - If `iteration` is the current iteration, advance to the next one, publish the event and
    ///   broadcast it to the other replicas, then return `true`.
    /// - Otherwise the iteration has already been finished: return `false` and leave the state
    ///   untouched. Concurrent calls for the same iteration advance it exactly once.
    pub fn finish_iteration(
        &self,
        iteration: u64,
        round: &str,
        valid: bool,
        reason: impl Into<String>,
    ) -> bool {
        match self.advance(iteration, round, valid, reason.into()) {
            Some(event) => {
                self.broadcast(event);
                true
            }
            None => false,
        }
    }

    /// Follows an iteration finished by another replica, without broadcasting it again.
    ///
    /// # Behavior
    ///
    /// - If the event starts an iteration ahead of the current one, move to it and publish the
    ///   event, then return `true`. Iterations whose events were lost are skipped.
    /// - Otherwise the event is stale: return `false` and leave the state untouched.
    pub fn follow(&self, event: &IterationEvent) -> bool {
        let previous = self.number.fetch_max(event.iteration, Ordering::AcqRel);
        if previous >= event.iteration {
            debug!(
                "ignoring the end of iteration {}: the current iteration is {}",
                event.finished, previous
            );
            return false;
        }
        if previous < event.finished {
            warn!(
                "catching up from iteration {} to iteration {}",
                previous, event.iteration
            );
        }
        info!(
            "round {} of another replica finished iteration {}: {}",
            event.round, event.finished, event.reason
        );
        self.events.send_if_modified(|latest| {
            if latest.iteration < event.iteration {
                *latest = event.clone();
                true
            } else {
                false
            }
        });
        true
    }

    fn advance(
        &self,
        iteration: u64,
        round: &str,
        valid: bool,
        reason: String,
    ) -> Option<IterationEvent> {
        if let Err(current) = self.number.compare_exchange(
            iteration,
            iteration + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            warn!(
                "round {} cannot finish iteration {}: the current iteration is {}",
                round, iteration, current
            );
            return None;
        }
        if valid {
            info!("round {} finished iteration {}: {}", round, iteration, reason);
        } else {
            warn!("round {} aborted iteration {}: {}", round, iteration, reason);
        }
        let event = IterationEvent {
            finished: iteration,
            iteration: iteration + 1,
            round: round.to_string(),
            valid,
            reason,
        };
        self.events.send_replace(event.clone());
        Some(event)
    }

    fn broadcast(&self, event: IterationEvent) {
        let communicator = match &self.communicator {
            Some(communicator) => communicator.clone(),
            None => return,
        };
        let payload = match bincode::serialize(&event) {
            Ok(payload) => Bytes::from(payload),
            Err(err) => {
                warn!("failed to encode the end of iteration {}: {}", event.finished, err);
                return;
            }
        };
        tokio::spawn(async move {
            communicator
                .broadcast(messages::ITERATION_FINISHED, payload)
                .await;
        });
    }
}
