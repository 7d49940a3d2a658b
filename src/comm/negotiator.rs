//! Priority-lane port negotiation.
//!
//! The peer advertises the port its priority lane listens on. Applying an
//! advertisement resolves it to a local port (tunneling through SSH when the
//! peer is remote) and rebuilds the connection's priority lane when the
//! resolved port changed or no lane exists yet.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};

use super::connection::KernelConnection;
use super::error::CallError;
use super::lane::LaneKind;
use super::tunnel::{select_random_port, TunnelSpec, Tunneler};
use crate::signal::Signal;
use crate::telemetry;

pub struct PriorityChannelNegotiator {
    tunneler: Arc<dyn Tunneler>,
    tunnel_timeout: Duration,
    lane_changed: Signal<()>,
}

impl PriorityChannelNegotiator {
    pub fn new(tunneler: Arc<dyn Tunneler>, tunnel_timeout: Duration) -> Self {
        Self {
            tunneler,
            tunnel_timeout,
            lane_changed: Signal::new(),
        }
    }

    /// Fired once each time a new priority lane is installed.
    pub fn lane_changed(&self) -> &Signal<()> {
        &self.lane_changed
    }

    /// Apply a port advertisement from the peer.
    ///
    /// Returns `true` when a new priority lane was installed. On failure the
    /// previous lane, if any, stays bound and the advertisement is not
    /// recorded, so the next advertisement of the same port retries.
    pub fn apply_port_advertisement(
        &self,
        connection: &KernelConnection,
        port: Option<u16>,
    ) -> Result<bool, CallError> {
        let Some(port) = port else {
            return Ok(false);
        };
        if connection.advertised_port() == Some(port) && connection.priority_connected() {
            return Ok(false);
        }

        let client = connection.client();
        let (resolved, tunneled) = match client.ssh_parameters() {
            Some(ssh) => {
                let local_port = select_random_port()?;
                let spec = TunnelSpec {
                    local_port,
                    remote_port: port,
                    host: ssh.hostname.clone(),
                    remote_ip: client.ip().to_string(),
                    key_file: ssh.key_file.clone(),
                    password: ssh.password.clone(),
                };
                let timeout = self.tunnel_timeout;
                run_blocking(|| self.tunneler.open_tunnel(&spec, timeout))?;
                (local_port, true)
            }
            None => (port, false),
        };

        if connection.bound_port() == Some(resolved) && connection.priority_connected() {
            connection.record_advertised_port(port);
            return Ok(false);
        }

        let lane = client.create_lane(LaneKind::Comm, resolved, client.session_identity())?;
        connection.install_priority_lane(lane, resolved);
        connection.record_advertised_port(port);
        telemetry::record_priority_lane_built(tunneled);
        tracing::info!(
            advertised_port = port,
            local_port = resolved,
            tunneled,
            "priority lane installed"
        );

        // In-flight waiters may be waiting on this.
        self.lane_changed.emit(&());
        Ok(true)
    }
}

/// Run a blocking tunnel setup without starving the other tasks.
///
/// On a multi-threaded runtime the worker hands its queue to another thread
/// for the duration. Elsewhere `f` simply runs in place.
fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

impl std::fmt::Debug for PriorityChannelNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityChannelNegotiator")
            .field("tunnel_timeout", &self.tunnel_timeout)
            .finish()
    }
}
