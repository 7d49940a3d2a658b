//! Call error taxonomy.

use thiserror::Error;

use super::lane::TransportError;
use super::protocol::{CallId, CommId, ErrorWrapper, ProtocolError};
use super::tunnel::TunnelError;

#[derive(Error, Debug)]
pub enum CallError {
    /// Peer unreachable.
    #[error("Kernel is dead")]
    KernelDead,

    /// Blocking wait exceeded its deadline.
    #[error("Timeout while waiting for {}", format_ids(.outstanding))]
    Timeout { outstanding: Vec<CallId> },

    /// Priority lane required but not connected. Renegotiation was requested.
    #[error("Priority lane not connected")]
    ChannelNotReady,

    /// Protocol-level violation.
    #[error("Comm error: {0}")]
    Comm(String),

    /// Failure raised inside the peer's handler.
    #[error("Remote exception: {0}")]
    Remote(ErrorWrapper),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Unknown comm: {0}")]
    UnknownComm(CommId),

    #[error("No comm is open")]
    NotOpen,
}

impl CallError {
    /// Errors that end any wait on the peer.
    pub fn is_kernel_dead(&self) -> bool {
        matches!(self, CallError::KernelDead)
    }

    /// Convert to the envelope sent back to a blocking caller.
    pub fn to_wrapper(&self) -> ErrorWrapper {
        match self {
            CallError::Remote(wrapper) => wrapper.clone(),
            other => ErrorWrapper::from_message(other.kind(), &other.to_string()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            CallError::KernelDead => "KernelDead",
            CallError::Timeout { .. } => "Timeout",
            CallError::ChannelNotReady => "ChannelNotReady",
            CallError::Comm(_) => "CommError",
            CallError::Remote(_) => "RemoteException",
            CallError::Protocol(_) => "ProtocolError",
            CallError::Transport(_) => "TransportError",
            CallError::Tunnel(_) => "TunnelError",
            CallError::UnknownComm(_) => "UnknownComm",
            CallError::NotOpen => "NotOpen",
        }
    }
}

fn format_ids(ids: &[CallId]) -> String {
    let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
    format!("[{}]", ids.join(", "))
}
