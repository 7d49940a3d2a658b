//! Call admission and incoming-call dispatch.
//!
//! Admission (liveness, then interrupt resolution) is shared by both
//! directions: outgoing calls go through it before anything is sent, incoming
//! calls before their handler runs.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{json, Value};

use super::comms::{CommTable, CommTarget};
use super::connection::KernelConnection;
use super::error::CallError;
use super::negotiator::PriorityChannelNegotiator;
use super::protocol::{
    CallReply, CallRequest, CommId, ErrorWrapper, FrameBody, ASYNC_ERROR, SEND_COMM_CONFIG,
    SET_COMM_PORT,
};
use super::registry::{CallArgs, HandlerError, HandlerRegistry};
use super::relay::ErrorRelay;
use super::router::PriorityChannelRouter;
use super::settings::CallSettings;
use crate::telemetry::{self, CallDirection, CallSpan, DropReason, SpanExt};

/// Outcome of admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Go ahead. `queued` means the default lane.
    Dispatch { queued: bool },
    /// Non-blocking call to a dead peer.
    Drop,
}

/// Liveness check and interrupt resolution.
///
/// A blocking call always wants the priority lane. If the lane is not
/// connected, renegotiation is requested once and the call degrades to the
/// default lane, unless it is blocking, in which case it fails.
pub(crate) fn admit(
    connection: &KernelConnection,
    router: &PriorityChannelRouter,
    target: CommTarget,
    settings: &CallSettings,
    method: &str,
) -> Result<Admission, CallError> {
    if !connection.is_alive() {
        if settings.blocking {
            return Err(CallError::KernelDead);
        }
        tracing::info!(method, "dropping call because kernel is dead");
        telemetry::record_call_dropped(DropReason::KernelDead);
        return Ok(Admission::Drop);
    }

    let mut interrupt = settings.wants_interrupt();
    if interrupt && !connection.priority_connected() {
        router.request_renegotiation(target);
        interrupt = false;
        tracing::debug!(method, "dropping interrupt because priority lane is disconnected");
        if settings.blocking {
            return Err(CallError::Comm(
                "cannot block on a disconnected priority lane".into(),
            ));
        }
    }
    Ok(Admission::Dispatch { queued: !interrupt })
}

/// What happened to an incoming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Blocking call; a reply (value or error) was sent.
    Replied,
    /// Non-blocking call ran to completion.
    Completed,
    /// Not dispatched (dead peer, or priority lane vanished).
    Dropped,
    /// Non-blocking call whose handler failed; logged and swallowed.
    HandlerFailed(HandlerError),
}

pub struct IncomingCallDispatcher {
    router: PriorityChannelRouter,
    comms: Arc<CommTable>,
    registry: Arc<HandlerRegistry>,
    negotiator: Arc<PriorityChannelNegotiator>,
    relay: Arc<ErrorRelay>,
}

impl IncomingCallDispatcher {
    pub fn new(
        router: PriorityChannelRouter,
        comms: Arc<CommTable>,
        registry: Arc<HandlerRegistry>,
        negotiator: Arc<PriorityChannelNegotiator>,
        relay: Arc<ErrorRelay>,
    ) -> Self {
        Self {
            router,
            comms,
            registry,
            negotiator,
            relay,
        }
    }

    /// Run the per-call pipeline: port update, admission, routed dispatch.
    pub fn dispatch(
        &self,
        connection: &KernelConnection,
        comm_id: CommId,
        request: CallRequest,
    ) -> Result<DispatchOutcome, CallError> {
        let blocking = request.settings.blocking;
        let span = CallSpan::new(
            &request.call_id,
            &request.method,
            CallDirection::Incoming,
            blocking,
        );
        let _enter = span.enter();

        if request.priority_port.is_some() {
            if let Err(e) = self
                .negotiator
                .apply_port_advertisement(connection, request.priority_port)
            {
                tracing::warn!(error = %e, "failed to apply advertised priority port");
            }
        }

        let queued = match admit(
            connection,
            &self.router,
            comm_id.into(),
            &request.settings,
            &request.method,
        ) {
            Ok(Admission::Dispatch { queued }) => queued,
            Ok(Admission::Drop) => return Ok(DispatchOutcome::Dropped),
            Err(e) => {
                span.record_result::<(), _>(&Err(&e));
                return Err(e);
            }
        };

        let result = self
            .router
            .with_routing_for(connection, comm_id.into(), queued, || {
                self.run_handler(connection, comm_id, &request)
            });
        telemetry::record_call_dispatched(queued);

        let result = match result {
            Err(CallError::ChannelNotReady) if !blocking => {
                tracing::info!("dropping call because priority lane is disconnected");
                telemetry::record_call_dropped(DropReason::ChannelNotReady);
                Ok(DispatchOutcome::Dropped)
            }
            other => other,
        };
        span.record_result(&result);
        result
    }

    fn run_handler(
        &self,
        connection: &KernelConnection,
        comm_id: CommId,
        request: &CallRequest,
    ) -> Result<DispatchOutcome, CallError> {
        let outcome = self.invoke(connection, comm_id, request);

        if request.settings.blocking {
            let reply = match outcome {
                Ok(value) => CallReply::success(request.call_id, value),
                Err(e) => CallReply::error(request.call_id, e.to_wrapper()),
            };
            self.router.send_reply(connection, comm_id, reply)?;
            return Ok(DispatchOutcome::Replied);
        }

        match outcome {
            Ok(_) => Ok(DispatchOutcome::Completed),
            Err(e) => {
                tracing::info!(error = %e, "dropping call because of handler failure");
                telemetry::record_call_dropped(DropReason::HandlerFailed);
                Ok(DispatchOutcome::HandlerFailed(e))
            }
        }
    }

    fn invoke(
        &self,
        connection: &KernelConnection,
        comm_id: CommId,
        request: &CallRequest,
    ) -> Result<Value, HandlerError> {
        let args = CallArgs::from(request);
        match request.method.as_str() {
            SET_COMM_PORT => {
                let port: Option<u16> = args.arg(0)?;
                self.negotiator
                    .apply_port_advertisement(connection, port)
                    .map(|_| Value::Null)
                    .map_err(|e| HandlerError::failed(e.to_string()))
            }
            ASYNC_ERROR => {
                let error: ErrorWrapper = args.arg(0)?;
                self.relay.relay(&error);
                Ok(Value::Null)
            }
            SEND_COMM_CONFIG => {
                let port = self.comms.advertised_port();
                let answer = CallRequest::new(SET_COMM_PORT, vec![json!(port)], CallSettings::default());
                self.comms
                    .send(comm_id.into(), FrameBody::RemoteCall(answer))
                    .map(|_| Value::Null)
                    .map_err(|e| HandlerError::failed(e.to_string()))
            }
            method => {
                let handler = self
                    .registry
                    .get(method)
                    .ok_or_else(|| HandlerError::UnknownMethod(method.to_string()))?;
                catch_unwind(AssertUnwindSafe(|| handler(args)))
                    .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(&*panic))))
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
