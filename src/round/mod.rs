//! The count/timeout state machine driving each protocol round.
//!
//! A [`Round`] goes through the phases `Idle -> Counting -> {ThresholdReached | TimedOut}` and
//! back to `Idle` when it is reset at the iteration boundary. The work of the round is done by its
//! [`RoundHandler`]; the round only decides which requests are handled and counted, and when the
//! iteration ends.

pub mod counter;
pub mod kernels;
pub mod timer;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::Display;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub use self::{
    counter::{CountOutcome, RoundCounter},
    timer::RoundTimer,
};
use self::kernels::messages::{Response, ResponseCode};
use crate::{common::ClientId, iteration::Iteration};

/// The reason given to requests refused while the cluster scales.
pub const SAFE_MODE_REASON: &str = "The cluster is in safemode.";

#[derive(Debug, Clone, PartialEq, Eq)]
/// The static description of a round.
pub struct RoundDescriptor {
    pub name: String,
    /// Whether the round times out `time_window` after its first contribution.
    pub check_timeout: bool,
    pub time_window: Duration,
    /// Whether the round completes after `threshold_count` distinct contributions.
    pub check_count: bool,
    pub threshold_count: u64,
    /// Whether the threshold follows the number of server replicas.
    pub server_num_as_threshold: bool,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
/// The phase of a round.
pub enum RoundPhase {
    Idle,
    Counting,
    ThresholdReached,
    TimedOut,
}

impl RoundPhase {
    /// Checks whether the round has finished its cycle and waits for a reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::ThresholdReached | Self::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What a handler knows about the round it handles a request for.
pub struct RoundContext {
    pub round: String,
    pub iteration: u64,
}

#[derive(Debug, Clone)]
/// The outcome of a handled request.
pub struct KernelOutput {
    /// The response sent back to the client.
    pub response: Bytes,
    /// Whether the request is counted.
    pub valid: bool,
    /// The client the request is counted for. Anonymous requests always count.
    pub contributor: Option<ClientId>,
}

impl KernelOutput {
    /// A request which counts for the `contributor`.
    pub fn accepted(response: Bytes, contributor: impl Into<ClientId>) -> Self {
        Self {
            response,
            valid: true,
            contributor: Some(contributor.into()),
        }
    }

    /// A request which is answered but not counted.
    pub fn rejected(response: Bytes) -> Self {
        Self {
            response,
            valid: false,
            contributor: None,
        }
    }
}

#[async_trait]
/// The work of a round.
pub trait RoundHandler
where
    Self: Send + Sync + 'static,
{
    /// Handles a request.
    ///
    /// # Behavior
    ///
    /// Return a valid output only if the request has been applied. Invalid outputs must leave the
    /// protocol state untouched.
    async fn handle(&self, ctx: &RoundContext, request: &[u8]) -> KernelOutput;

    /// Called when the first contribution of a cycle has been counted.
    async fn on_first_count(&self, _ctx: &RoundContext) {}

    /// Called when the last contribution of a cycle has been counted.
    async fn on_last_count(&self, _ctx: &RoundContext) {}

    /// Resets the protocol state of the round at the end of a cycle.
    async fn reset(&self) {}
}

#[derive(Debug, Clone, Default)]
/// A flag refusing all the round requests of a replica while it is set.
pub struct SafeMode(Arc<AtomicBool>);

impl SafeMode {
    pub fn enable(&self) {
        if !self.0.swap(true, Ordering::AcqRel) {
            info!("entering safe mode");
        }
    }

    pub fn disable(&self) {
        if self.0.swap(false, Ordering::AcqRel) {
            info!("leaving safe mode");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The answer of a round to a request.
pub struct RoundResponse {
    pub response: Bytes,
    pub valid: bool,
}

#[derive(Debug)]
struct RoundState {
    phase: RoundPhase,
    counter: RoundCounter,
    timer: RoundTimer,
    // bumped on every reset, so that a timer of a previous cycle never fires into this one
    generation: u64,
    // the iteration the current cycle started in
    iteration: u64,
    pending_threshold: Option<u64>,
    anonymous: u64,
}

/// A protocol round.
pub struct Round {
    descriptor: RoundDescriptor,
    handler: Arc<dyn RoundHandler>,
    iteration: Arc<Iteration>,
    safe_mode: SafeMode,
    state: Mutex<RoundState>,
}

impl Round {
    /// Creates an idle round.
    pub fn new(
        descriptor: RoundDescriptor,
        handler: Arc<dyn RoundHandler>,
        iteration: Arc<Iteration>,
        safe_mode: SafeMode,
    ) -> Arc<Self> {
        let threshold = if descriptor.check_count {
            descriptor.threshold_count
        } else {
            u64::MAX
        };
        Arc::new(Self {
            descriptor,
            handler,
            iteration,
            safe_mode,
            state: Mutex::new(RoundState {
                phase: RoundPhase::Idle,
                counter: RoundCounter::new(threshold),
                timer: RoundTimer::new(),
                generation: 0,
                iteration: 0,
                pending_threshold: None,
                anonymous: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &RoundDescriptor {
        &self.descriptor
    }

    pub async fn phase(&self) -> RoundPhase {
        self.state.lock().await.phase
    }

    /// Returns the number of contributions counted in the current cycle.
    pub async fn count(&self) -> u64 {
        self.state.lock().await.counter.current()
    }

    pub async fn threshold(&self) -> u64 {
        self.state.lock().await.counter.threshold()
    }

    /// Runs the handler of the round on a request and counts it.
    ///
    /// # Behavior
    ///
    /// - In safe mode, refuse the request without handling it.
    /// - Once the round has finished its cycle, answer `OutOfTime` without handling the request.
    /// - Otherwise handle the request and count it if the handler accepted it. The first counted
    ///   contribution arms the timer, the contribution reaching the threshold finishes the
    ///   iteration.
    ///
    /// The requests of a round are handled one at a time, so a valid response always means that
    /// the request has been counted.
    pub async fn launch_round_kernel(self: &Arc<Self>, request: &[u8]) -> RoundResponse {
        if self.safe_mode.is_enabled() {
            debug!("round {} refuses a request in safe mode", self.name());
            return self.refuse(ResponseCode::SystemError, SAFE_MODE_REASON);
        }

        let mut state = self.state.lock().await;
        if self.is_over(&state) {
            return self.refuse(
                ResponseCode::OutOfTime,
                format!("round {} is over for this iteration", self.name()),
            );
        }
        let ctx = RoundContext {
            round: self.descriptor.name.clone(),
            iteration: self.iteration.current(),
        };
        let output = self.handler.handle(&ctx, request).await;
        if output.valid && !self.count_contribution(&mut state, &ctx, output.contributor).await {
            return self.refuse(
                ResponseCode::OutOfTime,
                format!("round {} did not count the request", self.name()),
            );
        }
        RoundResponse {
            response: output.response,
            valid: output.valid,
        }
    }

    fn is_over(&self, state: &RoundState) -> bool {
        state.phase.is_terminal() || (self.descriptor.check_count && state.counter.is_reached())
    }

    fn refuse(&self, code: ResponseCode, reason: impl Into<String>) -> RoundResponse {
        RoundResponse {
            response: Response::<()>::error(code, reason, self.iteration.current()).encode(),
            valid: false,
        }
    }

    /// Counts an accepted request and returns whether it counts for the cycle.
    async fn count_contribution(
        self: &Arc<Self>,
        state: &mut RoundState,
        ctx: &RoundContext,
        contributor: Option<ClientId>,
    ) -> bool {
        if state.phase.is_terminal() {
            debug!("round {} is over, contribution not counted", self.name());
            return false;
        }
        let contributor = match contributor {
            Some(contributor) => contributor,
            None => {
                state.anonymous += 1;
                format!("anonymous#{}", state.anonymous)
            }
        };
        match state.counter.count(contributor) {
            CountOutcome::Counted {
                count,
                is_first,
                is_last,
            } => {
                debug!(
                    "round {} counted {} of {}",
                    self.name(),
                    count,
                    state.counter.threshold()
                );
                if is_first {
                    state.phase = RoundPhase::Counting;
                    state.iteration = ctx.iteration;
                    if self.descriptor.check_timeout {
                        self.arm_timer(state);
                    }
                    self.handler.on_first_count(ctx).await;
                }
                if is_last && self.descriptor.check_count {
                    state.phase = RoundPhase::ThresholdReached;
                    state.timer.stop();
                    self.handler.on_last_count(ctx).await;
                    let reason = format!("reached the threshold of {}", count);
                    self.iteration
                        .finish_iteration(state.iteration, self.name(), true, reason);
                }
                true
            }
            CountOutcome::Duplicate => {
                debug!("round {} already counted this contributor", self.name());
                true
            }
            CountOutcome::ThresholdReached => {
                debug!("round {} is full, contribution not counted", self.name());
                false
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, state: &mut RoundState) {
        let round = Arc::downgrade(self);
        let generation = state.generation;
        state.timer.start(self.descriptor.time_window, async move {
            if let Some(round) = round.upgrade() {
                round.on_timeout(generation).await;
            }
        });
    }

    async fn on_timeout(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.phase != RoundPhase::Counting {
            return;
        }
        state.timer.fired();
        state.phase = RoundPhase::TimedOut;
        let reason = format!(
            "timed out after {} ms with {} of {} contributions",
            self.descriptor.time_window.as_millis(),
            state.counter.current(),
            state.counter.threshold()
        );
        self.iteration
            .finish_iteration(state.iteration, self.name(), false, reason);
    }

    /// Ends the cycle of the round and resets the protocol state of the round.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        self.clear_cycle(&mut state);
        self.handler.reset().await;
    }

    /// Ends the cycle of the round if it started before `iteration`. The protocol state is kept.
    ///
    /// Returns whether the cycle has been ended.
    pub async fn end_cycle_before(&self, iteration: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.phase == RoundPhase::Idle || state.iteration >= iteration {
            return false;
        }
        self.clear_cycle(&mut state);
        true
    }

    // the timer is stopped, the counter cleared and a pending threshold applied
    fn clear_cycle(&self, state: &mut RoundState) {
        state.timer.stop();
        state.counter.reset();
        if let Some(threshold) = state.pending_threshold.take() {
            info!("round {} applies its new threshold {}", self.name(), threshold);
            state.counter.set_threshold(threshold);
        }
        state.phase = RoundPhase::Idle;
        state.generation += 1;
    }

    /// Makes the threshold follow the number of server replicas, if the round tracks it.
    ///
    /// # Behavior
    ///
    /// - Outside of a cycle the new threshold applies immediately.
    /// - During a cycle it is held back until the next reset, so that the cycle completes under
    ///   the threshold it started with.
    pub async fn reinit_for_scaling(&self, server_num: u64) {
        if !self.descriptor.server_num_as_threshold || !self.descriptor.check_count {
            return;
        }
        let mut state = self.state.lock().await;
        if state.phase == RoundPhase::Counting {
            info!(
                "round {} holds back its new threshold {} until the next reset",
                self.name(),
                server_num
            );
            state.pending_threshold = Some(server_num);
        } else {
            info!("round {} applies its new threshold {}", self.name(), server_num);
            state.pending_threshold = None;
            state.counter.set_threshold(server_num);
        }
    }
}
