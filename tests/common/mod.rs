//! Shared fakes for comm integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use kernel_comm::comm::{
    decode_frame, encode_frame, CallReply, CallRequest, CommId, Frame, FrameBody,
    KernelClient, KernelComm, KernelConnection, Lane, LaneHandle, LaneKind, SessionIdentity,
    SshParameters, TransportError, TunnelError, TunnelSpec, Tunneler, COMM_TARGET_NAME,
};
use kernel_comm::{CallSettings, CommConfig};

/// Lane that keeps every frame sent on it.
#[derive(Debug)]
pub struct RecordingLane {
    kind: LaneKind,
    port: Option<u16>,
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl RecordingLane {
    pub fn new(kind: LaneKind, port: Option<u16>) -> Self {
        Self {
            kind,
            port,
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .iter()
            .map(|bytes| decode_frame(bytes).expect("lane carried an invalid frame"))
            .collect()
    }

    pub fn calls(&self) -> Vec<CallRequest> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame.body {
                FrameBody::RemoteCall(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn calls_to(&self, method: &str) -> Vec<CallRequest> {
        self.calls()
            .into_iter()
            .filter(|request| request.method == method)
            .collect()
    }

    pub fn replies(&self) -> Vec<CallReply> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame.body {
                FrameBody::CallReply(reply) => Some(reply),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Make every later send fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl Lane for RecordingLane {
    fn kind(&self) -> LaneKind {
        self.kind
    }

    fn port(&self) -> Option<u16> {
        self.port
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(frame);
        Ok(())
    }
}

/// Kernel whose lanes are `RecordingLane`s.
pub struct FakeKernel {
    alive: AtomicBool,
    identity: SessionIdentity,
    ip: String,
    ssh: Option<SshParameters>,
    refuse_lanes: AtomicBool,
    lanes: Mutex<Vec<Arc<RecordingLane>>>,
    identities: Mutex<Vec<SessionIdentity>>,
}

impl FakeKernel {
    pub fn local() -> Self {
        Self {
            alive: AtomicBool::new(true),
            identity: SessionIdentity::new("session-under-test"),
            ip: "127.0.0.1".to_string(),
            ssh: None,
            refuse_lanes: AtomicBool::new(false),
            lanes: Mutex::new(Vec::new()),
            identities: Mutex::new(Vec::new()),
        }
    }

    pub fn remote(hostname: &str) -> Self {
        Self {
            ip: "10.0.0.5".to_string(),
            ssh: Some(SshParameters {
                hostname: hostname.to_string(),
                key_file: Some("/keys/id_ed25519".to_string()),
                password: None,
            }),
            ..Self::local()
        }
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn refuse_lanes(&self, refuse: bool) {
        self.refuse_lanes.store(refuse, Ordering::SeqCst);
    }

    pub fn lanes_built(&self) -> usize {
        self.lanes.lock().len()
    }

    pub fn lane_ports(&self) -> Vec<u16> {
        self.lanes.lock().iter().filter_map(|lane| lane.port()).collect()
    }

    pub fn last_lane(&self) -> Option<Arc<RecordingLane>> {
        self.lanes.lock().last().cloned()
    }

    /// Identities the lanes were built with.
    pub fn identities(&self) -> Vec<SessionIdentity> {
        self.identities.lock().clone()
    }
}

impl KernelClient for FakeKernel {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn session_identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn ip(&self) -> &str {
        &self.ip
    }

    fn ssh_parameters(&self) -> Option<&SshParameters> {
        self.ssh.as_ref()
    }

    fn create_lane(
        &self,
        kind: LaneKind,
        port: u16,
        identity: &SessionIdentity,
    ) -> Result<LaneHandle, TransportError> {
        if self.refuse_lanes.load(Ordering::SeqCst) {
            return Err(TransportError::Connect {
                kind,
                port,
                reason: "connection refused".to_string(),
            });
        }
        let lane = Arc::new(RecordingLane::new(kind, Some(port)));
        self.lanes.lock().push(lane.clone());
        self.identities.lock().push(identity.clone());
        Ok(lane)
    }
}

/// Tunneler that records requests instead of running ssh.
#[derive(Default)]
pub struct FakeTunneler {
    opened: Mutex<Vec<(TunnelSpec, Duration)>>,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl FakeTunneler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make every tunnel take `delay` of wall-clock time, like a slow ssh.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn opened(&self) -> Vec<(TunnelSpec, Duration)> {
        self.opened.lock().clone()
    }
}

impl Tunneler for FakeTunneler {
    fn open_tunnel(&self, spec: &TunnelSpec, timeout: Duration) -> Result<(), TunnelError> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(TunnelError::Failed {
                host: spec.host.clone(),
                reason: "permission denied".to_string(),
            });
        }
        self.opened.lock().push((spec.clone(), timeout));
        Ok(())
    }
}

/// A `KernelComm` wired to fakes.
pub struct Harness {
    pub comm: Arc<KernelComm>,
    pub kernel: Arc<FakeKernel>,
    pub tunneler: Arc<FakeTunneler>,
    pub connection: Arc<KernelConnection>,
    pub default_lane: Arc<RecordingLane>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_kernel(FakeKernel::local())
    }

    pub fn with_kernel(kernel: FakeKernel) -> Self {
        Self::with_config(kernel, CommConfig::default())
    }

    pub fn with_config(kernel: FakeKernel, config: CommConfig) -> Self {
        let kernel = Arc::new(kernel);
        let tunneler = Arc::new(FakeTunneler::new());
        let default_lane = Arc::new(RecordingLane::new(LaneKind::Shell, None));
        let connection = Arc::new(KernelConnection::new(kernel.clone(), default_lane.clone()));
        let comm = Arc::new(KernelComm::new(config, tunneler.clone()));
        Self {
            comm,
            kernel,
            tunneler,
            connection,
            default_lane,
        }
    }

    /// Open a comm and forget the handshake frame.
    pub fn open(&self) -> CommId {
        let id = self.comm.open(self.connection.clone()).expect("open failed");
        self.default_lane.clear();
        id
    }

    /// Listen and accept a comm opened by the peer.
    pub fn accept(&self) -> CommId {
        self.comm.listen(self.connection.clone());
        let id = CommId::new();
        self.comm
            .handle_frame(&open_frame(id, 1))
            .expect("comm_open rejected");
        id
    }

    /// Install a priority lane by delivering a call that advertises `port`.
    pub fn install_priority_lane(&self, comm_id: CommId, port: u16) -> Arc<RecordingLane> {
        self.comm.register_call_handler("noop", |_| Ok(Value::Null));
        let request = request("noop", vec![], CallSettings::default(), Some(port));
        self.comm
            .handle_frame(&call_frame(comm_id, request))
            .expect("advertisement rejected");
        self.default_lane.clear();
        self.kernel.last_lane().expect("no priority lane built")
    }
}

pub fn request(
    method: &str,
    args: Vec<Value>,
    settings: CallSettings,
    priority_port: Option<u16>,
) -> CallRequest {
    let mut request = CallRequest::new(method, args, settings);
    request.priority_port = priority_port;
    request
}

pub fn call_frame(comm_id: CommId, request: CallRequest) -> Vec<u8> {
    encode_frame(&Frame::new(comm_id, FrameBody::RemoteCall(request))).expect("encode failed")
}

pub fn reply_frame(comm_id: CommId, reply: CallReply) -> Vec<u8> {
    encode_frame(&Frame::new(comm_id, FrameBody::CallReply(reply))).expect("encode failed")
}

pub fn open_frame(comm_id: CommId, protocol_version: u32) -> Vec<u8> {
    encode_frame(&Frame::new(
        comm_id,
        FrameBody::CommOpen {
            target_name: COMM_TARGET_NAME.to_string(),
            protocol_version,
        },
    ))
    .expect("encode failed")
}

pub fn three_line_error() -> Value {
    json!({
        "kind": "ZeroDivisionError",
        "lines": [
            "Traceback (most recent call last):",
            "  File \"<cell 3>\", line 1, in <module>",
            "ZeroDivisionError: division by zero"
        ]
    })
}

#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a thread-local subscriber and return what it logged at
/// info level and above.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    let text = String::from_utf8_lossy(&buffer.0.lock()).into_owned();
    (result, text)
}
