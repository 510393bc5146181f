// Time source for every bounded wait in the harness.
//
// Waits never call tokio::time directly: they go through a Clock so tests of
// the wait machinery itself can run on paused tokio time.

use std::future::Future;
use std::pin::Pin;
use tokio::time::{self, Duration, Instant};

/// Time source used by the polling primitive and everything built on it.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use tokio::time::Duration;
/// use regtest_testing_framework::orchestrator::clock::{Clock, SystemClock};
///
/// #[tokio::main]
/// async fn main() {
///     let clock: Arc<dyn Clock> = Arc::new(SystemClock);
///     let start = clock.now();
///     clock.sleep(Duration::from_millis(10)).await;
///     assert!(clock.now() - start >= Duration::from_millis(10));
/// }
/// ```
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspend the calling task for `d`.
    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Wall-clock time. The default for anything that talks to a real node.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        time::Instant::now()
    }

    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(time::sleep(d))
    }
}

/// Clock over paused tokio time.
///
/// Use it under `#[tokio::test(start_paused = true)]`, or build it with
/// [`PausedClock::pause`] inside a current-thread runtime whose time is not
/// frozen yet. While paused, the runtime jumps straight to the next timer
/// whenever every task is idle, so a 60 second timeout costs no real time.
///
/// Never combine it with real sockets: the auto-advance fires timeouts while
/// a task is waiting on I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct PausedClock;

impl PausedClock {
    pub fn new() -> Self {
        Self
    }

    /// Freeze tokio time and return the clock.
    ///
    /// # Panics
    ///
    /// Panics if time is already frozen or the runtime is multi-threaded.
    pub fn pause() -> Self {
        time::pause();
        Self
    }

    /// Move paused time forward, waking any expired sleeps.
    pub async fn advance(&self, d: Duration) {
        time::advance(d).await
    }
}

impl Clock for PausedClock {
    fn now(&self) -> Instant {
        time::Instant::now()
    }

    fn sleep(&self, d: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(time::sleep(d))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_paused_clock_advancement() {
        let clock = PausedClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(1)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(1));

        clock.advance(Duration::from_secs(2)).await;
        assert_eq!(clock.now() - start, Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_sleep_costs_no_real_time() {
        let clock: Arc<dyn Clock> = Arc::new(PausedClock::new());
        let wall = std::time::Instant::now();
        let start = clock.now();

        clock.sleep(Duration::from_secs(3600)).await;

        assert_eq!(clock.now() - start, Duration::from_secs(3600));
        assert!(wall.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pause_constructor() {
        let clock = PausedClock::pause();
        let start = clock.now();
        clock.advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now() - start, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_system_clock() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let start = clock.now();
        clock.sleep(Duration::from_millis(10)).await;
        assert!(clock.now() - start >= Duration::from_millis(10));
    }
}
