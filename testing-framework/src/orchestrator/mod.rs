// Shared orchestration infrastructure: time source, bounded waits and the
// harness configuration every tier reads its timeouts from.

/// Clock abstraction used by every wait
pub mod clock;
/// Harness configuration (YAML + environment)
pub mod config;
/// Bounded polling primitive
pub mod wait;

pub use clock::{Clock, PausedClock, SystemClock};
pub use config::{DaemonSettings, HarnessConfig, WaitSettings};
pub use wait::{poll_until, wait_until, Probe, TimeoutError, WaitConfig, WaitError};
