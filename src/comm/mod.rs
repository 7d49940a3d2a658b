//! Frontend/kernel remote-call channel.
//!
//! A comm carries calls and replies between the two processes over a default
//! lane. Interrupting and blocking calls are routed over a separately
//! negotiated priority lane, tunneled through SSH when the kernel is remote.
//!
//! # Layout
//!
//! - `protocol`: frame types and codec
//! - `lane`, `connection`, `tunnel`: transport collaborators
//! - `negotiator`, `router`: priority-lane state and routing
//! - `dispatcher`, `waiter`, `relay`: per-call pipeline
//! - `kernel_comm`: the endpoint tying it together

pub mod comms;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod inbox;
pub mod kernel_comm;
pub mod lane;
pub mod negotiator;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
pub mod settings;
pub mod tunnel;
pub mod waiter;

pub use comms::{CommTable, CommTarget};
pub use connection::{KernelClient, KernelConnection, SshParameters};
pub use dispatcher::{DispatchOutcome, IncomingCallDispatcher};
pub use error::CallError;
pub use inbox::{CallState, PendingCall, ReplyInbox};
pub use kernel_comm::{spawn_reader, KernelComm};
pub use lane::{same_lane, Lane, LaneHandle, LaneKind, MemoryLane, TransportError};
pub use negotiator::PriorityChannelNegotiator;
pub use protocol::{
    decode_frame, encode_frame, CallId, CallReply, CallRequest, CommId, ErrorWrapper, Frame,
    FrameBody, ProtocolError, ReplyResult, ASYNC_ERROR, COMM_TARGET_NAME,
    CURRENT_PROTOCOL_VERSION, MAX_FRAME_SIZE, SEND_COMM_CONFIG, SET_COMM_PORT,
};
pub use registry::{CallArgs, CallHandler, HandlerError, HandlerRegistry};
pub use relay::{ErrorRelay, ExceptionNotice};
pub use router::PriorityChannelRouter;
pub use session::SessionIdentity;
pub use settings::CallSettings;
pub use tunnel::{select_random_port, OpenSshTunnel, TunnelError, TunnelSpec, Tunneler};
pub use waiter::BlockingCallWaiter;
