//! Lane selection for outgoing frames.
//!
//! A comm normally sends on the connection's default lane. For the duration of
//! one send it can be rebound to the priority lane; the binding is restored by
//! a guard, so every exit path (including unwinding) leaves the comm on the
//! default lane.
//!
//! Bindings are shared by every sender on the endpoint, so each send holds
//! the routing lock while it reads or rebinds them. The lock is reentrant: a
//! reply sent from inside a dispatched handler routes again on the same
//! thread.

use std::sync::Arc;

use parking_lot::ReentrantMutex;

use super::comms::{CommTable, CommTarget};
use super::connection::KernelConnection;
use super::error::CallError;
use super::lane::LaneHandle;
use super::protocol::{CallReply, CallRequest, CommId, FrameBody, SEND_COMM_CONFIG};
use super::settings::CallSettings;
use crate::telemetry;

#[derive(Clone)]
pub struct PriorityChannelRouter {
    comms: Arc<CommTable>,
    routing: Arc<ReentrantMutex<()>>,
}

impl PriorityChannelRouter {
    pub fn new(comms: Arc<CommTable>) -> Self {
        Self {
            comms,
            routing: Arc::new(ReentrantMutex::new(())),
        }
    }

    /// Run `body` with the outgoing lane chosen for `target`.
    ///
    /// `queued` leaves the bindings untouched. Otherwise the priority lane must
    /// be connected: if it is not, renegotiation is requested and the call
    /// fails with `ChannelNotReady` without running `body`.
    ///
    /// `body` runs under the routing lock in both cases.
    pub fn with_routing_for<T, F>(
        &self,
        connection: &KernelConnection,
        target: CommTarget,
        queued: bool,
        body: F,
    ) -> Result<T, CallError>
    where
        F: FnOnce() -> Result<T, CallError>,
    {
        let _routing = self.routing.lock();
        if queued {
            return body();
        }

        let Some(priority) = connection.priority_lane() else {
            self.request_renegotiation(target);
            return Err(CallError::ChannelNotReady);
        };

        let ids = self.comms.ids(target)?;
        let _binding = LaneBinding::rebind(
            &self.comms,
            ids,
            priority,
            connection.default_lane().clone(),
        );
        body()
    }

    /// Ask the peer to re-advertise its priority port.
    ///
    /// Best effort: failures are logged, never returned.
    pub fn request_renegotiation(&self, target: CommTarget) {
        telemetry::record_renegotiation_requested();
        let request = CallRequest::new(SEND_COMM_CONFIG, Vec::new(), CallSettings::default());
        tracing::debug!(call_id = %request.call_id, "requesting priority port");
        let _routing = self.routing.lock();
        if let Err(e) = self.comms.send(target, FrameBody::RemoteCall(request)) {
            tracing::warn!(error = %e, "failed to request priority port");
        }
    }

    /// Send a reply to `comm_id`.
    ///
    /// Uses the priority lane when it is connected and degrades to the
    /// default lane otherwise. A reply is never failed for lack of a priority
    /// lane, since that would strand the caller waiting on it.
    pub fn send_reply(
        &self,
        connection: &KernelConnection,
        comm_id: CommId,
        reply: CallReply,
    ) -> Result<(), CallError> {
        let queued = !connection.priority_connected();
        let body = FrameBody::CallReply(reply);
        let routed = self.with_routing_for(connection, comm_id.into(), queued, || {
            self.comms.send(comm_id.into(), body.clone())
        });
        match routed {
            // The lane went away between the check and the send.
            Err(CallError::ChannelNotReady) => {
                self.with_routing_for(connection, comm_id.into(), true, || {
                    self.comms.send(comm_id.into(), body)
                })
            }
            other => other,
        }
    }
}

/// Restores the default lane for every rebound comm on drop.
struct LaneBinding<'a> {
    comms: &'a CommTable,
    ids: Vec<CommId>,
    default_lane: LaneHandle,
}

impl<'a> LaneBinding<'a> {
    fn rebind(
        comms: &'a CommTable,
        ids: Vec<CommId>,
        priority: LaneHandle,
        default_lane: LaneHandle,
    ) -> Self {
        for id in &ids {
            comms.bind_lane(id, priority.clone());
        }
        Self {
            comms,
            ids,
            default_lane,
        }
    }
}

impl Drop for LaneBinding<'_> {
    fn drop(&mut self) {
        for id in &self.ids {
            self.comms.bind_lane(id, self.default_lane.clone());
        }
    }
}
