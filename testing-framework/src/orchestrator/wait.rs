//! Bounded polling primitive.
//!
//! Every blocking wait in the harness (peer messages, chain tips, mempools,
//! node start-up) is a call to [`poll_until`]: evaluate a probe, sleep for
//! the poll interval through the injected [`Clock`], and give up once the
//! timeout has elapsed. A timeout always reports the label, the number of
//! attempts and the last state the probe described.

use std::convert::Infallible;
use std::future::Future;

use thiserror::Error;
use tokio::time::Duration;

use super::clock::Clock;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Deadline and interval of one bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitConfig {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Stretch the timeout for slow environments. The interval is unchanged.
    pub fn scaled(mut self, factor: f64) -> Self {
        if factor.is_finite() && factor > 0.0 {
            self.timeout = self.timeout.mul_f64(factor);
        }
        self
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// Result of one probe evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    /// Condition met, carrying whatever the probe observed.
    Ready(T),
    /// Not yet; the string describes the observed state for diagnostics.
    Pending(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("timed out after {elapsed:?} and {attempts} attempts waiting for {label}; last state: {last_state}")]
pub struct TimeoutError {
    pub label: String,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_state: String,
}

#[derive(Debug, Error)]
pub enum WaitError<E> {
    #[error(transparent)]
    Timeout(TimeoutError),
    /// The probe itself failed; polling stops immediately.
    #[error("{0}")]
    Probe(E),
}

impl WaitError<Infallible> {
    pub fn into_timeout(self) -> TimeoutError {
        match self {
            WaitError::Timeout(timeout) => timeout,
            WaitError::Probe(never) => match never {},
        }
    }
}

/// Poll `probe` until it reports [`Probe::Ready`] or `config.timeout` elapses.
///
/// The probe runs at least once, and once more at the deadline, so a
/// condition that becomes true just before the timeout is still observed.
/// A probe error aborts the wait and is returned as [`WaitError::Probe`].
///
/// # Example
///
/// ```rust
/// use regtest_testing_framework::orchestrator::{poll_until, Probe, SystemClock, WaitConfig};
/// use std::convert::Infallible;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut calls = 0;
/// let value = poll_until("third call", &WaitConfig::default(), &SystemClock, || {
///     calls += 1;
///     let ready = calls >= 3;
///     async move {
///         Ok::<_, Infallible>(if ready { Probe::Ready(calls) } else { Probe::Pending(format!("calls={}", calls)) })
///     }
/// })
/// .await
/// .unwrap();
/// assert_eq!(value, 3);
/// # }
/// ```
pub async fn poll_until<T, E, F, Fut>(
    label: &str,
    config: &WaitConfig,
    clock: &dyn Clock,
    mut probe: F,
) -> Result<T, WaitError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Probe<T>, E>>,
{
    let start = clock.now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let last_state = match probe().await.map_err(WaitError::Probe)? {
            Probe::Ready(value) => {
                if log::log_enabled!(log::Level::Trace) {
                    log::trace!("'{}' ready after {} attempts", label, attempts);
                }
                return Ok(value);
            }
            Probe::Pending(state) => state,
        };

        let elapsed = clock.now().saturating_duration_since(start);
        if elapsed >= config.timeout {
            log::debug!(
                "'{}' timed out after {:?} ({} attempts): {}",
                label,
                elapsed,
                attempts,
                last_state
            );
            return Err(WaitError::Timeout(TimeoutError {
                label: label.to_string(),
                attempts,
                elapsed,
                last_state,
            }));
        }

        let remaining = config.timeout - elapsed;
        clock.sleep(config.poll_interval.min(remaining)).await;
    }
}

/// Boolean convenience over [`poll_until`].
pub async fn wait_until<F>(
    label: &str,
    config: &WaitConfig,
    clock: &dyn Clock,
    mut predicate: F,
) -> Result<(), TimeoutError>
where
    F: FnMut() -> bool,
{
    poll_until(label, config, clock, || {
        let ready = predicate();
        async move {
            Ok::<_, Infallible>(if ready {
                Probe::Ready(())
            } else {
                Probe::Pending("predicate returned false".to_string())
            })
        }
    })
    .await
    .map_err(WaitError::into_timeout)
}
