//! Telemetry for the comm layer.
//!
//! Structured logging, per-call spans, and counters through the `metrics`
//! facade. Exporting the counters is left to whichever recorder the host
//! process installs.

mod logging;
mod counters;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use counters::{
    record_call_dispatched, record_call_dropped, record_call_sent, record_call_timeout,
    record_priority_lane_built, record_renegotiation_requested, DropReason,
};
pub use spans::{CallDirection, CallSpan, SpanExt};
