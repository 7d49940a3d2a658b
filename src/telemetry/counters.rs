//! Comm counters.

use metrics::counter;

/// Why a call was dropped instead of dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    KernelDead,
    HandlerFailed,
    ChannelNotReady,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::KernelDead => "kernel_dead",
            DropReason::HandlerFailed => "handler_failed",
            DropReason::ChannelNotReady => "channel_not_ready",
        }
    }
}

fn lane_label(queued: bool) -> &'static str {
    if queued {
        "default"
    } else {
        "priority"
    }
}

pub fn record_call_sent(blocking: bool, queued: bool) {
    counter!(
        "kernel_comm_calls_sent_total",
        "blocking" => if blocking { "true" } else { "false" },
        "lane" => lane_label(queued)
    )
    .increment(1);
}

pub fn record_call_dispatched(queued: bool) {
    counter!("kernel_comm_calls_dispatched_total", "lane" => lane_label(queued)).increment(1);
}

pub fn record_call_dropped(reason: DropReason) {
    counter!("kernel_comm_calls_dropped_total", "reason" => reason.as_str()).increment(1);
}

pub fn record_call_timeout() {
    counter!("kernel_comm_call_timeouts_total").increment(1);
}

pub fn record_priority_lane_built(tunneled: bool) {
    counter!(
        "kernel_comm_priority_lanes_built_total",
        "tunneled" => if tunneled { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_renegotiation_requested() {
    counter!("kernel_comm_renegotiations_total").increment(1);
}
