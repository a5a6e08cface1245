//! The timer bounding the time window of a round.

use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
/// A one-shot timer which runs a future when its window elapses, unless stopped before.
pub struct RoundTimer {
    handle: Option<JoinHandle<()>>,
}

impl RoundTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms the timer: `on_timeout` runs once `window` has elapsed. A timer which is already
    /// armed is stopped first.
    pub fn start<F>(&mut self, window: Duration, on_timeout: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.stop();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            on_timeout.await;
        }));
    }

    /// Disarms the timer. Returns whether it was armed.
    ///
    /// Stopping a timer which is not armed, or which has already fired, is a no-op.
    pub fn stop(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Forgets the armed timer without aborting it. Used by the timeout itself, which must not
    /// abort its own task.
    pub(crate) fn fired(&mut self) {
        self.handle = None;
    }

    /// Checks whether the timer is armed.
    pub fn is_armed(&self) -> bool {
        self.handle
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }
}

impl Drop for RoundTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn counting_timeout(fired: &Arc<AtomicUsize>) -> impl Future<Output = ()> + Send + 'static {
        let fired = fired.clone();
        async move {
            fired.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_timer_fires_after_the_window() {
        tokio::time::pause();
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = RoundTimer::new();
        timer.start(Duration::from_millis(100), counting_timeout(&fired));
        assert!(timer.is_armed());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_armed());
        assert!(!timer.stop());
    }

    #[tokio::test]
    async fn test_stopped_timer_never_fires() {
        tokio::time::pause();
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = RoundTimer::new();
        timer.start(Duration::from_millis(100), counting_timeout(&fired));

        assert!(timer.stop());
        assert!(!timer.stop());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_restart_replaces_the_armed_timer() {
        tokio::time::pause();
        let fired = Arc::new(AtomicUsize::new(0));
        let mut timer = RoundTimer::new();
        timer.start(Duration::from_millis(100), counting_timeout(&fired));
        timer.start(Duration::from_millis(300), counting_timeout(&fired));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
