//! Local display of errors raised on the other side.

use super::protocol::ErrorWrapper;
use crate::signal::Signal;

/// One line of a relayed remote error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionNotice {
    pub text: String,
    pub is_traceback: bool,
}

/// Turns a remote error into ordered notifications for the UI.
#[derive(Debug, Default)]
pub struct ErrorRelay {
    exception_occurred: Signal<ExceptionNotice>,
}

impl ErrorRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exception_occurred(&self) -> &Signal<ExceptionNotice> {
        &self.exception_occurred
    }

    /// Emit one notice per formatted line, in order. Never fails.
    pub fn relay(&self, error: &ErrorWrapper) {
        tracing::debug!(kind = %error.kind, lines = error.lines.len(), "relaying remote error");
        for line in error.format_error() {
            self.exception_occurred.emit(&ExceptionNotice {
                text: line.clone(),
                is_traceback: true,
            });
        }
    }
}
