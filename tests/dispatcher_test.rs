//! Tests for the incoming-call pipeline.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{call_frame, capture_logs, request, three_line_error, FakeKernel, FakeTunneler, Harness, RecordingLane};
use kernel_comm::comm::{
    CallError, CommId, CommTable, DispatchOutcome, ErrorRelay, HandlerError, HandlerRegistry,
    IncomingCallDispatcher, KernelConnection, LaneKind, PriorityChannelNegotiator,
    PriorityChannelRouter, ReplyResult, ASYNC_ERROR, SEND_COMM_CONFIG, SET_COMM_PORT,
};
use kernel_comm::CallSettings;

fn counting_handler(harness: &Harness, name: &str) -> Arc<AtomicUsize> {
    let hits = Arc::new(AtomicUsize::new(0));
    let sink = hits.clone();
    harness.comm.register_call_handler(name, move |args| {
        sink.fetch_add(1, Ordering::SeqCst);
        let x: i64 = args.arg(0).unwrap_or(0);
        Ok(json!(x * 2))
    });
    hits
}

#[test]
fn test_nonblocking_failure_is_swallowed() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    harness
        .comm
        .register_call_handler("explode", |_| Err(HandlerError::failed("bad input")));

    let call = request("explode", vec![], CallSettings::default(), None);
    let (result, logs) = capture_logs(|| harness.comm.handle_frame(&call_frame(comm_id, call)));

    assert!(result.is_ok());
    assert!(harness.default_lane.replies().is_empty());
    assert_eq!(harness.default_lane.len(), 0);
    assert_eq!(
        logs.matches("dropping call because of handler failure").count(),
        1,
        "logs were: {logs}"
    );
}

#[test]
fn test_nonblocking_panic_is_swallowed() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    harness
        .comm
        .register_call_handler("panics", |_| panic!("handler bug"));

    let call = request("panics", vec![], CallSettings::default(), None);
    assert!(harness.comm.handle_frame(&call_frame(comm_id, call)).is_ok());
    assert_eq!(harness.default_lane.len(), 0);
}

#[test]
fn test_blocking_call_replies_on_priority_lane() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    let priority = harness.install_priority_lane(comm_id, 5555);
    let hits = counting_handler(&harness, "double");

    let call = request("double", vec![json!(21)], CallSettings::blocking(), None);
    let call_id = call.call_id;
    harness.comm.handle_frame(&call_frame(comm_id, call)).unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    let replies = priority.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].call_id, call_id);
    assert_eq!(replies[0].result, ReplyResult::Ok(json!(42)));
    assert!(harness.default_lane.replies().is_empty());
}

#[test]
fn test_blocking_failure_replies_with_error() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    let priority = harness.install_priority_lane(comm_id, 5555);
    harness
        .comm
        .register_call_handler("explode", |_| Err(HandlerError::failed("bad input")));

    let call = request("explode", vec![], CallSettings::blocking(), None);
    harness.comm.handle_frame(&call_frame(comm_id, call)).unwrap();

    let replies = priority.replies();
    assert_eq!(replies.len(), 1);
    match &replies[0].result {
        ReplyResult::Err(wrapper) => {
            assert_eq!(wrapper.kind, "HandlerError");
            assert_eq!(wrapper.lines, vec!["bad input".to_string()]);
        }
        other => panic!("Expected error reply, got {:?}", other),
    }
}

#[test]
fn test_blocking_panic_replies_with_error() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    let priority = harness.install_priority_lane(comm_id, 5555);
    harness
        .comm
        .register_call_handler("panics", |_| panic!("handler bug"));

    let call = request("panics", vec![], CallSettings::blocking(), None);
    harness.comm.handle_frame(&call_frame(comm_id, call)).unwrap();

    match &priority.replies()[0].result {
        ReplyResult::Err(wrapper) => {
            assert_eq!(wrapper.kind, "Panic");
            assert!(wrapper.lines[0].contains("handler bug"));
        }
        other => panic!("Expected error reply, got {:?}", other),
    }
}

#[test]
fn test_unknown_method_blocking() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    let priority = harness.install_priority_lane(comm_id, 5555);

    let call = request("missing", vec![], CallSettings::blocking(), None);
    harness.comm.handle_frame(&call_frame(comm_id, call)).unwrap();

    match &priority.replies()[0].result {
        ReplyResult::Err(wrapper) => assert_eq!(wrapper.kind, "UnknownMethod"),
        other => panic!("Expected error reply, got {:?}", other),
    }
}

#[test]
fn test_blocking_without_priority_lane() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    let hits = counting_handler(&harness, "double");

    let call = request("double", vec![json!(1)], CallSettings::blocking(), None);
    let call_id = call.call_id;
    let result = harness.comm.handle_frame(&call_frame(comm_id, call));

    assert!(matches!(result, Err(CallError::Comm(_))));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(harness.default_lane.calls_to(SEND_COMM_CONFIG).len(), 1);

    // The waiting peer still gets an answer.
    let replies = harness.default_lane.replies();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].call_id, call_id);
    match &replies[0].result {
        ReplyResult::Err(wrapper) => {
            assert_eq!(wrapper.kind, "CommError");
            assert!(wrapper.lines[0].contains("cannot block on a disconnected priority lane"));
        }
        other => panic!("Expected error reply, got {:?}", other),
    }
}

#[test]
fn test_interrupt_without_priority_lane_runs_queued() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    let hits = counting_handler(&harness, "double");

    let call = request("double", vec![json!(1)], CallSettings::interrupt(), None);
    harness.comm.handle_frame(&call_frame(comm_id, call)).unwrap();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(harness.default_lane.calls_to(SEND_COMM_CONFIG).len(), 1);
    assert!(harness.default_lane.replies().is_empty());
}

#[test]
fn test_dead_peer_drops_nonblocking() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    let hits = counting_handler(&harness, "double");
    harness.kernel.set_alive(false);

    let call = request("double", vec![json!(1)], CallSettings::default(), None);
    let (result, logs) = capture_logs(|| harness.comm.handle_frame(&call_frame(comm_id, call)));

    assert!(result.is_ok());
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(logs.contains("dropping call because kernel is dead"));
}

#[test]
fn test_dead_peer_fails_blocking_without_reply() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    let hits = counting_handler(&harness, "double");
    harness.kernel.set_alive(false);

    let call = request("double", vec![json!(1)], CallSettings::blocking(), None);
    let result = harness.comm.handle_frame(&call_frame(comm_id, call));

    assert!(matches!(result, Err(CallError::KernelDead)));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(harness.default_lane.len(), 0);
}

#[test]
fn test_port_update_happens_before_liveness() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    harness.kernel.set_alive(false);

    let call = request("anything", vec![], CallSettings::default(), Some(5555));
    harness.comm.handle_frame(&call_frame(comm_id, call)).unwrap();

    assert!(harness.connection.priority_connected());
    assert_eq!(harness.connection.bound_port(), Some(5555));
}

#[test]
fn test_async_error_is_relayed() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _sub = harness
        .comm
        .exception_occurred()
        .subscribe(move |notice| sink.lock().push(notice.clone()));

    let call = request(ASYNC_ERROR, vec![three_line_error()], CallSettings::default(), None);
    harness.comm.handle_frame(&call_frame(comm_id, call)).unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2].text, "ZeroDivisionError: division by zero");
}

#[test]
fn test_send_comm_config_is_answered() {
    let harness = Harness::new();
    let comm_id = harness.accept();
    harness.comm.set_advertised_port(Some(7100));

    let call = request(SEND_COMM_CONFIG, vec![], CallSettings::default(), None);
    harness.comm.handle_frame(&call_frame(comm_id, call)).unwrap();

    let answers = harness.default_lane.calls_to(SET_COMM_PORT);
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].args, vec![json!(7100)]);
    assert_eq!(answers[0].priority_port, Some(7100));
    assert!(!answers[0].settings.blocking);
}

#[test]
fn test_call_on_unknown_comm_rejected() {
    let harness = Harness::new();
    harness.accept();
    let call = request("double", vec![], CallSettings::default(), None);
    let stranger = CommId::new();
    let result = harness.comm.handle_frame(&call_frame(stranger, call));
    assert!(matches!(result, Err(CallError::UnknownComm(id)) if id == stranger));
}

#[test]
fn test_blocking_call_on_unknown_comm_gets_error_reply() {
    let harness = Harness::new();
    harness.accept();
    let hits = counting_handler(&harness, "double");
    let stranger = CommId::new();

    let call = request("double", vec![json!(1)], CallSettings::blocking(), None);
    let call_id = call.call_id;
    let result = harness.comm.handle_frame(&call_frame(stranger, call));

    assert!(matches!(result, Err(CallError::UnknownComm(id)) if id == stranger));
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // The caller would otherwise wait out its full timeout.
    let frames = harness.default_lane.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].comm_id, stranger);
    let replies = harness.default_lane.replies();
    assert_eq!(replies[0].call_id, call_id);
    match &replies[0].result {
        ReplyResult::Err(wrapper) => assert_eq!(wrapper.kind, "UnknownComm"),
        other => panic!("Expected error reply, got {:?}", other),
    }
}

#[test]
fn test_dispatch_outcomes() {
    let kernel = Arc::new(FakeKernel::local());
    let default_lane = Arc::new(RecordingLane::new(LaneKind::Shell, None));
    let connection = KernelConnection::new(kernel.clone(), default_lane.clone());
    let comms = Arc::new(CommTable::new());
    let comm_id = CommId::new();
    comms.insert(comm_id, connection.default_lane().clone(), 1);

    let registry = Arc::new(HandlerRegistry::new());
    registry.register("ok", |_| Ok(json!(true)));
    registry.register("fails", |_| Err(HandlerError::failed("nope")));

    let dispatcher = IncomingCallDispatcher::new(
        PriorityChannelRouter::new(comms.clone()),
        comms,
        registry,
        Arc::new(PriorityChannelNegotiator::new(
            Arc::new(FakeTunneler::new()),
            Duration::from_secs(10),
        )),
        Arc::new(ErrorRelay::new()),
    );

    let ok = request("ok", vec![], CallSettings::default(), None);
    assert_eq!(
        dispatcher.dispatch(&connection, comm_id, ok).unwrap(),
        DispatchOutcome::Completed
    );

    let fails = request("fails", vec![], CallSettings::default(), None);
    assert_eq!(
        dispatcher.dispatch(&connection, comm_id, fails).unwrap(),
        DispatchOutcome::HandlerFailed(HandlerError::failed("nope"))
    );

    let blocking = request("ok", vec![], CallSettings::blocking(), Some(5555));
    assert_eq!(
        dispatcher.dispatch(&connection, comm_id, blocking).unwrap(),
        DispatchOutcome::Replied
    );
    assert_eq!(kernel.last_lane().unwrap().replies().len(), 1);

    kernel.set_alive(false);
    let dropped = request("ok", vec![], CallSettings::default(), None);
    assert_eq!(
        dispatcher.dispatch(&connection, comm_id, dropped).unwrap(),
        DispatchOutcome::Dropped
    );
}
