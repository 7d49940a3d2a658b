//! In-process frontend/kernel pair over memory lanes.
//!
//! Both ends run on the current runtime. Each side listens for its priority
//! lane on a fixed fake port; `create_lane` connects to whatever the other
//! side registered for that port.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::comm::{
    spawn_reader, CallError, CallSettings, CommId, CommTarget, ErrorWrapper, HandlerError,
    KernelClient, KernelComm, KernelConnection, LaneHandle, LaneKind, MemoryLane,
    OpenSshTunnel, SessionIdentity, SshParameters, TransportError, Tunneler, ASYNC_ERROR,
};
use crate::config::CommConfig;

/// Port the frontend's priority lane listens on.
pub const FRONTEND_PRIORITY_PORT: u16 = 7001;
/// Port the kernel's priority lane listens on.
pub const KERNEL_PRIORITY_PORT: u16 = 7002;

/// The other side of a loopback pair, as one side sees it.
pub struct LoopbackClient {
    identity: SessionIdentity,
    alive: AtomicBool,
    listeners: Mutex<HashMap<u16, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl LoopbackClient {
    pub fn new() -> Self {
        Self {
            identity: SessionIdentity::generate(),
            alive: AtomicBool::new(true),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Make `port` connectable; frames sent to it go to `tx`.
    pub fn listen(&self, port: u16, tx: mpsc::UnboundedSender<Vec<u8>>) {
        self.listeners.lock().insert(port, tx);
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }
}

impl Default for LoopbackClient {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelClient for LoopbackClient {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn session_identity(&self) -> &SessionIdentity {
        &self.identity
    }

    fn ip(&self) -> &str {
        "127.0.0.1"
    }

    fn ssh_parameters(&self) -> Option<&SshParameters> {
        None
    }

    fn create_lane(
        &self,
        kind: LaneKind,
        port: u16,
        _identity: &SessionIdentity,
    ) -> Result<LaneHandle, TransportError> {
        let tx = self
            .listeners
            .lock()
            .get(&port)
            .cloned()
            .ok_or_else(|| TransportError::Connect {
                kind,
                port,
                reason: "nothing listening".to_string(),
            })?;
        Ok(Arc::new(MemoryLane::from_sender(kind, Some(port), tx)))
    }
}

/// A wired frontend/kernel pair with one open comm.
pub struct Loopback {
    pub frontend: Arc<KernelComm>,
    pub kernel: Arc<KernelComm>,
    /// The kernel as the frontend sees it.
    pub kernel_peer: Arc<LoopbackClient>,
    /// The frontend as the kernel sees it.
    pub frontend_peer: Arc<LoopbackClient>,
    pub frontend_connection: Arc<KernelConnection>,
    pub kernel_connection: Arc<KernelConnection>,
    pub comm_id: CommId,
    readers: Vec<JoinHandle<()>>,
}

impl Loopback {
    /// Wire both ends and open a comm from the frontend.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: CommConfig) -> Result<Self, CallError> {
        let tunneler: Arc<dyn Tunneler> = Arc::new(OpenSshTunnel::new());

        let (to_kernel, to_kernel_rx) = MemoryLane::pair(LaneKind::Shell, None);
        let (to_frontend, to_frontend_rx) = MemoryLane::pair(LaneKind::Shell, None);
        let (frontend_priority_tx, frontend_priority_rx) = mpsc::unbounded_channel();
        let (kernel_priority_tx, kernel_priority_rx) = mpsc::unbounded_channel();

        let kernel_peer = Arc::new(LoopbackClient::new());
        kernel_peer.listen(KERNEL_PRIORITY_PORT, kernel_priority_tx);
        let frontend_peer = Arc::new(LoopbackClient::new());
        frontend_peer.listen(FRONTEND_PRIORITY_PORT, frontend_priority_tx);

        let frontend_connection = Arc::new(KernelConnection::new(
            kernel_peer.clone(),
            Arc::new(to_kernel),
        ));
        let kernel_connection = Arc::new(KernelConnection::new(
            frontend_peer.clone(),
            Arc::new(to_frontend),
        ));

        let frontend = Arc::new(KernelComm::new(config.clone(), tunneler.clone()));
        frontend.set_advertised_port(Some(FRONTEND_PRIORITY_PORT));
        let kernel = Arc::new(KernelComm::new(config, tunneler));
        kernel.set_advertised_port(Some(KERNEL_PRIORITY_PORT));
        kernel.listen(kernel_connection.clone());

        let readers = vec![
            spawn_reader(kernel.clone(), to_kernel_rx),
            spawn_reader(kernel.clone(), kernel_priority_rx),
            spawn_reader(frontend.clone(), to_frontend_rx),
            spawn_reader(frontend.clone(), frontend_priority_rx),
        ];

        let comm_id = frontend.open(frontend_connection.clone())?;
        Ok(Self {
            frontend,
            kernel,
            kernel_peer,
            frontend_peer,
            frontend_connection,
            kernel_connection,
            comm_id,
            readers,
        })
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// Wait until `connection` has a priority lane, or `timeout` passes.
pub async fn wait_for_priority_lane(
    comm: &KernelComm,
    connection: &KernelConnection,
    timeout: Duration,
) -> bool {
    let changed = Arc::new(Notify::new());
    let notify = changed.clone();
    let _subscription = comm
        .priority_lane_changed()
        .subscribe(move |_| notify.notify_one());
    if connection.priority_connected() {
        return true;
    }
    tokio::time::timeout(timeout, changed.notified()).await.is_ok()
        || connection.priority_connected()
}

fn register_demo_handlers(kernel: &KernelComm) {
    kernel.register_call_handler("hello", |_| Ok(Value::Null));
    kernel.register_call_handler("add", |args| {
        let a: i64 = args.arg(0)?;
        let b: i64 = args.arg(1)?;
        Ok(json!(a + b))
    });
    kernel.register_call_handler("divide", |args| {
        let a: f64 = args.arg(0)?;
        let b: f64 = args.arg(1)?;
        if b == 0.0 {
            return Err(HandlerError::failed("division by zero"));
        }
        Ok(json!(a / b))
    });
}

async fn drive(loopback: &Loopback) -> Result<(), CallError> {
    let frontend = &loopback.frontend;
    let target = CommTarget::One(loopback.comm_id);
    register_demo_handlers(&loopback.kernel);

    let _printer = frontend.exception_occurred().subscribe(|notice| {
        println!("  relayed: {}", notice.text);
    });

    // First call carries the frontend's priority port to the kernel.
    frontend
        .remote_call("hello", Vec::new(), CallSettings::default(), target)
        .await?;

    match frontend
        .remote_call("add", vec![json!(2), json!(3)], CallSettings::blocking(), target)
        .await
    {
        Err(CallError::Comm(reason)) => println!("blocking call refused: {reason}"),
        other => println!("unexpected result before negotiation: {other:?}"),
    }

    if !wait_for_priority_lane(frontend, &loopback.frontend_connection, Duration::from_secs(2)).await {
        return Err(CallError::ChannelNotReady);
    }
    println!(
        "priority lane connected on port {:?}",
        loopback.frontend_connection.bound_port()
    );

    let sum = frontend
        .remote_call("add", vec![json!(2), json!(3)], CallSettings::blocking(), target)
        .await?;
    println!("add(2, 3) = {}", sum.unwrap_or(Value::Null));

    let error = ErrorWrapper::from_message(
        "RuntimeError",
        "Traceback (most recent call last):\n  in cell 4\nRuntimeError: kernel side failure",
    );
    let payload = serde_json::to_value(&error).map_err(|e| CallError::Comm(e.to_string()))?;
    loopback
        .kernel
        .remote_call(ASYNC_ERROR, vec![payload], CallSettings::default(), CommTarget::All)
        .await?;

    let settings = CallSettings::blocking().with_display_error(true);
    match frontend
        .remote_call("divide", vec![json!(1), json!(0)], settings, target)
        .await
    {
        Err(CallError::Remote(wrapper)) => println!("divide(1, 0) failed remotely: {}", wrapper.kind),
        other => println!("unexpected divide result: {other:?}"),
    }

    // Let the relay notices queued on the default lane drain.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let closed = frontend.close(target)?;
    println!("closed {} comm(s)", closed.len());
    Ok(())
}

/// Run the loopback demo. Returns a process exit code.
pub async fn run_loopback(config: CommConfig) -> u8 {
    let loopback = match Loopback::start(config) {
        Ok(loopback) => loopback,
        Err(e) => {
            eprintln!("Failed to start loopback: {}", e);
            return 1;
        }
    };
    println!("comm {} opened", loopback.comm_id);

    match drive(&loopback).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Loopback failed: {}", e);
            1
        }
    }
}
