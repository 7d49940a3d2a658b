//! The comm endpoint: lifecycle, outgoing calls and incoming frames.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::Instrument;

use super::comms::{CommTable, CommTarget};
use super::connection::KernelConnection;
use super::dispatcher::{admit, Admission, IncomingCallDispatcher};
use super::error::CallError;
use super::inbox::{CallState, PendingCall, ReplyInbox};
use super::negotiator::PriorityChannelNegotiator;
use super::protocol::{
    decode_frame, negotiate_version, CallId, CallReply, CallRequest, CommId, FrameBody,
    COMM_TARGET_NAME, CURRENT_PROTOCOL_VERSION,
};
use super::registry::{CallArgs, HandlerError, HandlerRegistry};
use super::relay::{ErrorRelay, ExceptionNotice};
use super::router::PriorityChannelRouter;
use super::settings::CallSettings;
use super::tunnel::Tunneler;
use super::waiter::BlockingCallWaiter;
use crate::config::CommConfig;
use crate::signal::Signal;
use crate::telemetry::{self, CallDirection, CallSpan, SpanExt};

/// One end of the frontend/kernel call channel.
///
/// Both sides use the same type: the frontend `open`s comms, the kernel side
/// `listen`s and accepts them from incoming `comm_open` frames.
pub struct KernelComm {
    config: CommConfig,
    connection: RwLock<Option<Arc<KernelConnection>>>,
    comms: Arc<CommTable>,
    registry: Arc<HandlerRegistry>,
    inbox: Arc<ReplyInbox>,
    negotiator: Arc<PriorityChannelNegotiator>,
    router: PriorityChannelRouter,
    relay: Arc<ErrorRelay>,
    reply_arrived: Arc<Signal<CallId>>,
    dispatcher: IncomingCallDispatcher,
    waiter: BlockingCallWaiter,
}

impl KernelComm {
    pub fn new(config: CommConfig, tunneler: Arc<dyn Tunneler>) -> Self {
        let comms = Arc::new(CommTable::new());
        let registry = Arc::new(HandlerRegistry::new());
        let inbox = Arc::new(ReplyInbox::new(config.reply_ttl));
        let negotiator = Arc::new(PriorityChannelNegotiator::new(
            tunneler,
            config.tunnel_timeout,
        ));
        let router = PriorityChannelRouter::new(comms.clone());
        let relay = Arc::new(ErrorRelay::new());
        let reply_arrived = Arc::new(Signal::new());

        let dispatcher = IncomingCallDispatcher::new(
            router.clone(),
            comms.clone(),
            registry.clone(),
            negotiator.clone(),
            relay.clone(),
        );
        let waiter = BlockingCallWaiter::new(inbox.clone(), reply_arrived.clone(), negotiator.clone());

        Self {
            config,
            connection: RwLock::new(None),
            comms,
            registry,
            inbox,
            negotiator,
            router,
            relay,
            reply_arrived,
            dispatcher,
            waiter,
        }
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// Current connection, if the endpoint is attached to one.
    pub fn connection(&self) -> Option<Arc<KernelConnection>> {
        self.connection.read().clone()
    }

    fn require_connection(&self) -> Result<Arc<KernelConnection>, CallError> {
        self.connection().ok_or(CallError::NotOpen)
    }

    /// Open a new comm on `connection` and announce it to the peer.
    ///
    /// Any priority lane left on the connection is discarded; the peer will
    /// advertise its port again on its first call.
    pub fn open(&self, connection: Arc<KernelConnection>) -> Result<CommId, CallError> {
        connection.clear_priority_lane();
        *self.connection.write() = Some(connection.clone());

        let id = CommId::new();
        self.comms
            .insert(id, connection.default_lane().clone(), CURRENT_PROTOCOL_VERSION);
        self.comms.send_on(
            connection.default_lane(),
            id,
            FrameBody::CommOpen {
                target_name: COMM_TARGET_NAME.to_string(),
                protocol_version: CURRENT_PROTOCOL_VERSION,
            },
        )?;
        tracing::info!(comm_id = %id, "comm opened");
        Ok(id)
    }

    /// Attach to `connection` and wait for the peer to open comms.
    pub fn listen(&self, connection: Arc<KernelConnection>) {
        *self.connection.write() = Some(connection);
    }

    /// Close comms: shut down the priority lane, then send close notices.
    ///
    /// Best effort. Nothing is awaited and transport failures are only
    /// logged. The closed comms are removed locally.
    pub fn close(&self, target: impl Into<CommTarget>) -> Result<Vec<CommId>, CallError> {
        let target = target.into();
        let ids = self.comms.ids(target)?;

        if let Some(connection) = self.connection() {
            if let Some(lane) = connection.take_priority_lane() {
                for id in self.comms.ids(CommTarget::All)? {
                    if let Err(e) = self.comms.send_on(&lane, id, FrameBody::ShutdownRequest) {
                        tracing::warn!(comm_id = %id, error = %e, "failed to send shutdown request");
                    }
                }
            }
            for id in &ids {
                if let Err(e) =
                    self.comms
                        .send_on(connection.default_lane(), *id, FrameBody::CommClose)
                {
                    tracing::warn!(comm_id = %id, error = %e, "failed to send close notice");
                }
            }
        }

        let removed = self.comms.remove(target);
        tracing::info!(count = removed.len(), "comms closed");
        Ok(removed)
    }

    /// Drop comms locally without telling the peer.
    pub fn remove(&self, target: impl Into<CommTarget>) -> Vec<CommId> {
        let removed = self.comms.remove(target.into());
        tracing::debug!(count = removed.len(), "comms removed");
        removed
    }

    pub fn register_call_handler<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(CallArgs) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.registry.register(name, handler);
    }

    pub fn unregister_call_handler(&self, name: &str) -> bool {
        self.registry.unregister(name)
    }

    /// Port this side's priority lane listens on, stamped on every call.
    pub fn set_advertised_port(&self, port: Option<u16>) {
        self.comms.set_advertised_port(port);
    }

    pub fn exception_occurred(&self) -> &Signal<ExceptionNotice> {
        self.relay.exception_occurred()
    }

    pub fn priority_lane_changed(&self) -> &Signal<()> {
        self.negotiator.lane_changed()
    }

    pub fn comm_ids(&self) -> Vec<CommId> {
        self.comms.ids(CommTarget::All).unwrap_or_default()
    }

    pub fn protocol_version(&self, id: &CommId) -> Option<u32> {
        self.comms.protocol_version(id)
    }

    /// Blocking calls still waiting for a reply.
    pub fn outstanding_calls(&self) -> Vec<CallId> {
        self.inbox.outstanding()
    }

    /// Call `method` on the peer.
    ///
    /// Returns `Ok(None)` for non-blocking calls (including ones dropped
    /// because the kernel is dead) and `Ok(Some(value))` for a successful
    /// blocking call.
    pub async fn remote_call(
        &self,
        method: &str,
        args: Vec<Value>,
        settings: CallSettings,
        target: impl Into<CommTarget>,
    ) -> Result<Option<Value>, CallError> {
        self.call(CallRequest::new(method, args, settings), target)
            .await
    }

    /// Send a prepared request, e.g. one carrying keyword arguments.
    pub async fn call(
        &self,
        request: CallRequest,
        target: impl Into<CommTarget>,
    ) -> Result<Option<Value>, CallError> {
        let span = CallSpan::new(
            &request.call_id,
            &request.method,
            CallDirection::Outgoing,
            request.settings.blocking,
        );
        let target = target.into();
        let result = self.call_inner(request, target).instrument(span.clone()).await;
        span.record_result(&result);
        result
    }

    async fn call_inner(
        &self,
        request: CallRequest,
        target: CommTarget,
    ) -> Result<Option<Value>, CallError> {
        let connection = self.require_connection()?;
        let settings = request.settings;
        let call_id = request.call_id;

        let queued = match admit(&connection, &self.router, target, &settings, &request.method)? {
            Admission::Dispatch { queued } => queued,
            Admission::Drop => return Ok(None),
        };

        if settings.blocking {
            self.inbox
                .register(PendingCall::new(call_id, request.method.clone(), settings));
        }

        let sent = self.router.with_routing_for(&connection, target, queued, || {
            self.comms.send(target, FrameBody::RemoteCall(request))
        });
        if let Err(e) = sent {
            self.inbox.finish(&call_id, CallState::SendFailed);
            return Err(e);
        }
        telemetry::record_call_sent(settings.blocking, queued);

        if !settings.blocking {
            return Ok(None);
        }

        let timeout = settings.timeout().unwrap_or(self.config.default_timeout);
        match self.waiter.wait_for_reply(&connection, call_id, timeout).await {
            Ok(result) => {
                self.inbox.finish(&call_id, CallState::Replied);
                match result.into_result() {
                    Ok(value) => Ok(Some(value)),
                    Err(wrapper) => {
                        if settings.display_error {
                            self.relay.relay(&wrapper);
                        }
                        Err(CallError::Remote(wrapper))
                    }
                }
            }
            Err(e) => {
                let state = if e.is_kernel_dead() {
                    CallState::KernelDead
                } else {
                    CallState::TimedOut
                };
                self.inbox.finish(&call_id, state);
                Err(e)
            }
        }
    }

    /// Decode one frame from the peer and act on it.
    pub fn handle_frame(&self, bytes: &[u8]) -> Result<(), CallError> {
        let frame = decode_frame(bytes)?;
        let comm_id = frame.comm_id;

        match frame.body {
            FrameBody::CommOpen {
                target_name,
                protocol_version,
            } => {
                if target_name != COMM_TARGET_NAME {
                    return Err(CallError::Comm(format!(
                        "unexpected comm target {target_name:?}"
                    )));
                }
                let connection = self.require_connection()?;
                let version = negotiate_version(protocol_version);
                self.comms
                    .insert(comm_id, connection.default_lane().clone(), version);
                tracing::info!(comm_id = %comm_id, protocol_version = version, "comm accepted");
            }
            FrameBody::RemoteCall(request) => {
                let connection = self.require_connection()?;
                let blocking = request.settings.blocking;
                let call_id = request.call_id;
                if self.comms.protocol_version(&comm_id).is_none() {
                    let e = CallError::UnknownComm(comm_id);
                    if blocking {
                        self.reply_with_error(&connection, comm_id, call_id, &e);
                    }
                    return Err(e);
                }
                match self.dispatcher.dispatch(&connection, comm_id, request) {
                    Ok(outcome) => {
                        tracing::debug!(call_id = %call_id, outcome = ?outcome, "call dispatched");
                    }
                    Err(e) if blocking && !e.is_kernel_dead() => {
                        self.reply_with_error(&connection, comm_id, call_id, &e);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }
            FrameBody::CallReply(reply) => {
                let call_id = reply.call_id;
                self.inbox.deliver(reply);
                self.reply_arrived.emit(&call_id);
            }
            FrameBody::CommClose => {
                self.comms.remove(comm_id.into());
                tracing::info!(comm_id = %comm_id, "comm closed by peer");
            }
            FrameBody::ShutdownRequest => {
                if let Some(connection) = self.connection() {
                    connection.take_priority_lane();
                }
                tracing::debug!(comm_id = %comm_id, "priority lane shut down by peer");
            }
        }
        Ok(())
    }
}

impl KernelComm {
    /// Answer a blocking call that was never dispatched, on the default lane,
    /// so the caller's wait ends.
    fn reply_with_error(
        &self,
        connection: &KernelConnection,
        comm_id: CommId,
        call_id: CallId,
        error: &CallError,
    ) {
        let reply = CallReply::error(call_id, error.to_wrapper());
        if let Err(e) = self
            .comms
            .send_on(connection.default_lane(), comm_id, FrameBody::CallReply(reply))
        {
            tracing::warn!(call_id = %call_id, error = %e, "failed to send error reply");
        }
    }
}

impl std::fmt::Debug for KernelComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelComm")
            .field("config", &self.config)
            .field("comms", &self.comms.len())
            .field("outstanding", &self.inbox.outstanding().len())
            .finish()
    }
}

/// Feed every frame arriving on `frames` into `comm`.
///
/// Runs until the sending half of the lane is dropped.
pub fn spawn_reader(comm: Arc<KernelComm>, mut frames: UnboundedReceiver<Vec<u8>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = frames.recv().await {
            if let Err(e) = comm.handle_frame(&bytes) {
                tracing::warn!(error = %e, "failed to handle frame");
            }
        }
        tracing::debug!("lane reader finished");
    })
}
