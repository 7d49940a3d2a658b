//! Span utilities and extension traits for call tracing.

use tracing::{info_span, Span};

use crate::comm::CallId;

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Which side of the conversation a call span describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

impl CallDirection {
    fn as_str(self) -> &'static str {
        match self {
            CallDirection::Outgoing => "outgoing",
            CallDirection::Incoming => "incoming",
        }
    }
}

/// Factory for standard call spans.
pub struct CallSpan;

impl CallSpan {
    /// Fields `status` and `error.message` are filled in by
    /// `SpanExt::record_result`.
    pub fn new(call_id: &CallId, method: &str, direction: CallDirection, blocking: bool) -> Span {
        info_span!(
            "remote_call",
            call_id = %call_id,
            method = %method,
            direction = direction.as_str(),
            blocking,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
