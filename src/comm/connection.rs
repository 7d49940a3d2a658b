//! The peer process as seen by the comm layer.

use std::sync::Arc;

use parking_lot::Mutex;

use super::lane::{LaneHandle, LaneKind, TransportError};
use super::session::SessionIdentity;
use crate::signal::Signal;

/// SSH parameters for a peer that is not local.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshParameters {
    /// `host` or `host:port`.
    pub hostname: String,
    pub key_file: Option<String>,
    pub password: Option<String>,
}

/// Worker-connection collaborator.
///
/// Implemented by whatever owns the kernel process and its sockets. The comm
/// layer only asks it for liveness, identity and new lanes.
pub trait KernelClient: Send + Sync {
    fn is_alive(&self) -> bool;

    fn session_identity(&self) -> &SessionIdentity;

    /// Address of the kernel as seen from the SSH host.
    fn ip(&self) -> &str;

    /// Present when the kernel is remote and ports must be tunneled.
    fn ssh_parameters(&self) -> Option<&SshParameters>;

    /// Construct a lane of the declared kind connected to `port`.
    fn create_lane(
        &self,
        kind: LaneKind,
        port: u16,
        identity: &SessionIdentity,
    ) -> Result<LaneHandle, TransportError>;
}

#[derive(Default)]
struct PriorityLaneState {
    lane: Option<LaneHandle>,
    /// Local port the current lane is bound to.
    bound_port: Option<u16>,
    /// Last port the peer advertised that was applied successfully.
    advertised_port: Option<u16>,
}

/// Peer connection: default lane, priority-lane slot, and death event.
///
/// The priority-lane slot is shared by every comm on the connection and is
/// written only by the negotiator and the comm lifecycle.
pub struct KernelConnection {
    client: Arc<dyn KernelClient>,
    default_lane: LaneHandle,
    priority: Mutex<PriorityLaneState>,
    kernel_died: Signal<()>,
}

impl KernelConnection {
    pub fn new(client: Arc<dyn KernelClient>, default_lane: LaneHandle) -> Self {
        Self {
            client,
            default_lane,
            priority: Mutex::new(PriorityLaneState::default()),
            kernel_died: Signal::new(),
        }
    }

    pub fn client(&self) -> &Arc<dyn KernelClient> {
        &self.client
    }

    pub fn is_alive(&self) -> bool {
        self.client.is_alive()
    }

    pub fn default_lane(&self) -> &LaneHandle {
        &self.default_lane
    }

    pub fn priority_lane(&self) -> Option<LaneHandle> {
        self.priority.lock().lane.clone()
    }

    pub fn priority_connected(&self) -> bool {
        self.priority.lock().lane.is_some()
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.priority.lock().bound_port
    }

    pub fn advertised_port(&self) -> Option<u16> {
        self.priority.lock().advertised_port
    }

    /// Fired by the liveness check when the kernel stops responding.
    pub fn kernel_died(&self) -> &Signal<()> {
        &self.kernel_died
    }

    /// Entry point for the liveness check.
    pub fn notify_kernel_died(&self) {
        tracing::warn!("kernel reported dead");
        self.kernel_died.emit(&());
    }

    /// Forget the priority lane and everything negotiated for it.
    pub(crate) fn clear_priority_lane(&self) {
        *self.priority.lock() = PriorityLaneState::default();
    }

    /// Detach the priority lane, keeping the negotiated ports.
    pub(crate) fn take_priority_lane(&self) -> Option<LaneHandle> {
        self.priority.lock().lane.take()
    }

    pub(crate) fn install_priority_lane(&self, lane: LaneHandle, port: u16) {
        let mut priority = self.priority.lock();
        priority.lane = Some(lane);
        priority.bound_port = Some(port);
    }

    pub(crate) fn record_advertised_port(&self, port: u16) {
        self.priority.lock().advertised_port = Some(port);
    }
}

impl std::fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let priority = self.priority.lock();
        f.debug_struct("KernelConnection")
            .field("alive", &self.client.is_alive())
            .field("priority_connected", &priority.lane.is_some())
            .field("bound_port", &priority.bound_port)
            .field("advertised_port", &priority.advertised_port)
            .finish()
    }
}
