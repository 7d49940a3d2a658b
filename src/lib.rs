//! Kernel comm runtime
//!
//! Remote-procedure calls between a frontend process and a worker ("kernel")
//! process over one logical duplex channel, split into a default lane and a
//! negotiated priority lane.
//!
//! # Call model
//!
//! - **Fire-and-forget**: queued behind default traffic, never replied to
//! - **Blocking**: the caller awaits the reply with a timeout
//! - **Interrupting**: routed over the priority lane, overtaking default traffic
//!
//! # Failure model
//!
//! - Dead kernel: blocking calls fail fast, other calls are dropped
//! - Missing priority lane: renegotiated on demand, calls degrade to the
//!   default lane where they can
//! - Remote errors: returned to the caller and relayed as notifications

pub mod cli;
pub mod comm;
pub mod config;
pub mod signal;
pub mod telemetry;

pub use comm::{CallError, CallSettings, CommTarget, KernelComm, KernelConnection};
pub use config::CommConfig;
pub use signal::{Signal, Subscription};
