//! Per-call flags.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Call flags. Every field is optional on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CallSettings {
    /// Caller waits for the reply.
    #[serde(default)]
    pub blocking: bool,
    /// Route over the priority lane instead of queueing behind default traffic.
    #[serde(default)]
    pub interrupt: bool,
    /// Seconds to wait for a blocking reply. `None` uses the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// Relay a remote failure locally in addition to returning it.
    #[serde(default)]
    pub display_error: bool,
}

impl CallSettings {
    pub fn blocking() -> Self {
        Self {
            blocking: true,
            ..Self::default()
        }
    }

    pub fn interrupt() -> Self {
        Self {
            interrupt: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    pub fn with_interrupt(mut self, interrupt: bool) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_display_error(mut self, display_error: bool) -> Self {
        self.display_error = display_error;
        self
    }

    /// A blocking call always wants the priority lane.
    pub fn wants_interrupt(&self) -> bool {
        self.interrupt || self.blocking
    }

    /// Timeout as a duration. Negative or non-finite values are ignored.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }
}
