//! Blocking wait for a call reply.
//!
//! The wait ends on the first of: reply for the call id, kernel death, or the
//! deadline. A new priority lane only wakes the loop so it re-checks; it does
//! not end the wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use super::connection::KernelConnection;
use super::error::CallError;
use super::inbox::ReplyInbox;
use super::negotiator::PriorityChannelNegotiator;
use super::protocol::{CallId, ReplyResult};
use crate::signal::Signal;
use crate::telemetry;

pub struct BlockingCallWaiter {
    inbox: Arc<ReplyInbox>,
    reply_arrived: Arc<Signal<CallId>>,
    negotiator: Arc<PriorityChannelNegotiator>,
}

impl BlockingCallWaiter {
    pub fn new(
        inbox: Arc<ReplyInbox>,
        reply_arrived: Arc<Signal<CallId>>,
        negotiator: Arc<PriorityChannelNegotiator>,
    ) -> Self {
        Self {
            inbox,
            reply_arrived,
            negotiator,
        }
    }

    /// Wait until the reply for `call_id` is in the inbox.
    ///
    /// A reply that already arrived is returned without waiting. A dead
    /// kernel is reported before any wait begins.
    pub async fn wait_for_reply(
        &self,
        connection: &KernelConnection,
        call_id: CallId,
        timeout: Duration,
    ) -> Result<ReplyResult, CallError> {
        if let Some(result) = self.inbox.take(&call_id) {
            return Ok(result);
        }
        if !connection.is_alive() {
            return Err(CallError::KernelDead);
        }

        let wake = Arc::new(Notify::new());
        let died = Arc::new(AtomicBool::new(false));

        // Subscriptions are connected only for the duration of this wait.
        let subscriptions = {
            let on_reply = wake.clone();
            let on_death = wake.clone();
            let death_flag = died.clone();
            let on_lane = wake.clone();
            [
                self.reply_arrived.subscribe(move |id: &CallId| {
                    if *id == call_id {
                        on_reply.notify_one();
                    }
                }),
                connection.kernel_died().subscribe(move |_| {
                    death_flag.store(true, Ordering::SeqCst);
                    on_death.notify_one();
                }),
                self.negotiator
                    .lane_changed()
                    .subscribe(move |_| on_lane.notify_one()),
            ]
        };

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            if let Some(result) = self.inbox.take(&call_id) {
                return Ok(result);
            }
            if died.load(Ordering::SeqCst) || !connection.is_alive() {
                return Err(CallError::KernelDead);
            }
            tokio::select! {
                _ = wake.notified() => {}
                _ = &mut deadline => break,
            }
        }
        drop(subscriptions);

        // Last look: the reply may have landed right at the deadline.
        if let Some(result) = self.inbox.take(&call_id) {
            return Ok(result);
        }
        if !connection.is_alive() {
            return Err(CallError::KernelDead);
        }

        telemetry::record_call_timeout();
        let outstanding = self.inbox.outstanding();
        tracing::warn!(call_id = %call_id, outstanding = outstanding.len(), "timed out waiting for reply");
        Err(CallError::Timeout { outstanding })
    }
}
