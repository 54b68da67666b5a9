//! Process-group configuration.
//!
//! Policy knobs come from the environment the way the vendor library's own
//! users expect, with programmatic overrides on [`ProcessGroupOptions`].

use std::time::Duration;

use crate::error::{MusterError, Result};

/// Environment variable that turns `wait`/`synchronize` into a bounded
/// host-side busy loop with abort-on-timeout.
pub const NCCL_BLOCKING_WAIT: &str = "NCCL_BLOCKING_WAIT";

/// Default per-operation timeout, only enforced in blocking-wait mode.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between watchdog scans of the communicator cache.
pub const DEFAULT_WATCHDOG_TICK: Duration = Duration::from_secs(10);

/// Policy configuration for one process group instance.
#[derive(Debug, Clone)]
pub struct ProcessGroupOptions {
    /// Wall-clock budget for a single collective in blocking-wait mode.
    pub op_timeout: Duration,
    /// Busy-wait in `synchronize` and abort communicators on timeout.
    pub blocking_wait: bool,
    /// Interval between watchdog scans for asynchronous errors and abort
    /// markers.
    pub watchdog_tick: Duration,
}

impl Default for ProcessGroupOptions {
    fn default() -> Self {
        Self {
            op_timeout: DEFAULT_OP_TIMEOUT,
            blocking_wait: false,
            watchdog_tick: DEFAULT_WATCHDOG_TICK,
        }
    }
}

impl ProcessGroupOptions {
    /// Load options from the environment, falling back to defaults.
    ///
    /// `NCCL_BLOCKING_WAIT=1` enables blocking wait, `0` or unset disables
    /// it. Any other value is a configuration error.
    pub fn from_env() -> Result<Self> {
        let blocking_wait = parse_blocking_wait(std::env::var(NCCL_BLOCKING_WAIT).ok().as_deref())?;
        Ok(Self {
            blocking_wait,
            ..Self::default()
        })
    }

    /// Override the per-operation timeout.
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Override blocking-wait regardless of the environment.
    pub fn with_blocking_wait(mut self, blocking: bool) -> Self {
        self.blocking_wait = blocking;
        self
    }

    /// Override the watchdog scan interval.
    pub fn with_watchdog_tick(mut self, tick: Duration) -> Self {
        self.watchdog_tick = tick;
        self
    }
}

fn parse_blocking_wait(value: Option<&str>) -> Result<bool> {
    match value {
        None | Some("0") => Ok(false),
        Some("1") => Ok(true),
        Some(other) => Err(MusterError::Config {
            var: NCCL_BLOCKING_WAIT,
            value: other.to_string(),
        }),
    }
}
