//! Outstanding-call table and reply inbox.
//!
//! Replies are kept until taken by their waiter or until they are older than
//! the configured TTL. The TTL bounds the inbox for replies that arrive after
//! their waiter already timed out.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::protocol::{CallId, CallReply, ReplyResult};
use super::settings::CallSettings;

/// Lifecycle of a blocking call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Sent,
    Replied,
    TimedOut,
    KernelDead,
    /// The request never made it onto a lane.
    SendFailed,
}

/// A blocking call waiting for its reply.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub call_id: CallId,
    pub method: String,
    pub settings: CallSettings,
    pub created_at: Instant,
    pub state: CallState,
}

impl PendingCall {
    pub fn new(call_id: CallId, method: impl Into<String>, settings: CallSettings) -> Self {
        Self {
            call_id,
            method: method.into(),
            settings,
            created_at: Instant::now(),
            state: CallState::Sent,
        }
    }
}

struct StoredReply {
    result: ReplyResult,
    received_at: Instant,
}

/// Reply records plus the pending-call table.
pub struct ReplyInbox {
    replies: Mutex<HashMap<CallId, StoredReply>>,
    pending: Mutex<BTreeMap<CallId, PendingCall>>,
    ttl: Duration,
}

impl ReplyInbox {
    pub fn new(ttl: Duration) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            ttl,
        }
    }

    pub fn register(&self, call: PendingCall) {
        self.pending.lock().insert(call.call_id, call);
    }

    /// Remove a pending call, stamping its terminal state.
    pub fn finish(&self, call_id: &CallId, state: CallState) -> Option<PendingCall> {
        let mut call = self.pending.lock().remove(call_id)?;
        call.state = state;
        tracing::debug!(
            call_id = %call.call_id,
            method = %call.method,
            state = ?state,
            elapsed_ms = call.created_at.elapsed().as_millis() as u64,
            "call finished"
        );
        Some(call)
    }

    /// Ids of every call still waiting, in id order.
    pub fn outstanding(&self) -> Vec<CallId> {
        self.pending.lock().keys().copied().collect()
    }

    pub fn is_pending(&self, call_id: &CallId) -> bool {
        self.pending.lock().contains_key(call_id)
    }

    /// Store a reply. Later writes for the same id overwrite earlier ones.
    pub fn deliver(&self, reply: CallReply) {
        let now = Instant::now();
        let mut replies = self.replies.lock();
        let ttl = self.ttl;
        replies.retain(|_, stored| now.duration_since(stored.received_at) <= ttl);
        replies.insert(
            reply.call_id,
            StoredReply {
                result: reply.result,
                received_at: now,
            },
        );
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.replies.lock().contains_key(call_id)
    }

    /// Take the reply for `call_id`, if it arrived.
    pub fn take(&self, call_id: &CallId) -> Option<ReplyResult> {
        self.replies.lock().remove(call_id).map(|stored| stored.result)
    }

    /// Number of stored replies.
    pub fn len(&self) -> usize {
        self.replies.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
