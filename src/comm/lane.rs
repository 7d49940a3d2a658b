//! Transport lanes.
//!
//! A lane is one underlying channel a comm's traffic can be bound to. Its
//! kind is declared when the lane is constructed.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Lane closed")]
    Closed,

    #[error("Failed to connect {kind} lane on port {port}: {reason}")]
    Connect {
        kind: LaneKind,
        port: u16,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Declared channel kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneKind {
    /// Default lane, shared with ordinary traffic.
    Shell,
    /// Negotiated priority lane.
    Comm,
}

impl fmt::Display for LaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaneKind::Shell => f.write_str("shell"),
            LaneKind::Comm => f.write_str("comm"),
        }
    }
}

/// Outgoing half of a transport channel.
///
/// `send` must not suspend: it hands the frame to the transport and returns.
pub trait Lane: Send + Sync + fmt::Debug {
    fn kind(&self) -> LaneKind;

    /// Port the lane is bound to, if it is port based.
    fn port(&self) -> Option<u16>;

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Shared lane handle.
pub type LaneHandle = Arc<dyn Lane>;

/// True when both handles point at the same lane.
pub fn same_lane(a: &LaneHandle, b: &LaneHandle) -> bool {
    Arc::ptr_eq(a, b)
}

/// In-process lane backed by an unbounded tokio channel.
#[derive(Debug, Clone)]
pub struct MemoryLane {
    kind: LaneKind,
    port: Option<u16>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MemoryLane {
    /// Create a lane and the receiver the peer reads frames from.
    pub fn pair(kind: LaneKind, port: Option<u16>) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { kind, port, tx }, rx)
    }

    /// Lane writing into an existing channel.
    pub fn from_sender(kind: LaneKind, port: Option<u16>, tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { kind, port, tx }
    }
}

impl Lane for MemoryLane {
    fn kind(&self) -> LaneKind {
        self.kind
    }

    fn port(&self) -> Option<u16> {
        self.port
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}
