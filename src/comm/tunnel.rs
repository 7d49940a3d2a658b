//! SSH port forwarding for remote kernels.

use std::net::TcpListener;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("No free local port: {0}")]
    NoFreePort(std::io::Error),

    #[error("Failed to start ssh: {0}")]
    Spawn(std::io::Error),

    #[error("Tunnel to {host} failed: {reason}")]
    Failed { host: String, reason: String },

    #[error("Tunnel to {host} not established within {timeout:?}")]
    Timeout { host: String, timeout: Duration },
}

/// One local→remote forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local_port: u16,
    pub remote_port: u16,
    /// SSH server, `host` or `host:port`.
    pub host: String,
    /// Kernel address as seen from the SSH server.
    pub remote_ip: String,
    pub key_file: Option<String>,
    pub password: Option<String>,
}

/// Tunnel collaborator. Blocks up to `timeout` until the forward is live.
pub trait Tunneler: Send + Sync {
    fn open_tunnel(&self, spec: &TunnelSpec, timeout: Duration) -> Result<(), TunnelError>;
}

/// Ask the OS for an unused local port.
pub fn select_random_port() -> Result<u16, TunnelError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(TunnelError::NoFreePort)?;
    let port = listener
        .local_addr()
        .map_err(TunnelError::NoFreePort)?
        .port();
    Ok(port)
}

/// Tunnels through the system `ssh` binary.
///
/// `ssh -f` backgrounds itself once authentication succeeded and, with
/// `ExitOnForwardFailure`, only after the forward is bound, so the foreground
/// process exiting cleanly means the tunnel is live.
#[derive(Debug, Clone)]
pub struct OpenSshTunnel {
    ssh_program: PathBuf,
    sshpass_program: PathBuf,
}

impl OpenSshTunnel {
    pub fn new() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            sshpass_program: PathBuf::from("sshpass"),
        }
    }

    pub fn with_programs(ssh_program: impl Into<PathBuf>, sshpass_program: impl Into<PathBuf>) -> Self {
        Self {
            ssh_program: ssh_program.into(),
            sshpass_program: sshpass_program.into(),
        }
    }

    fn command(&self, spec: &TunnelSpec) -> Command {
        let mut command = match &spec.password {
            Some(password) => {
                let mut c = Command::new(&self.sshpass_program);
                c.env("SSHPASS", password).arg("-e").arg(&self.ssh_program);
                c
            }
            None => {
                let mut c = Command::new(&self.ssh_program);
                c.args(["-o", "BatchMode=yes"]);
                c
            }
        };

        let (host, port) = split_host_port(&spec.host);
        command.args(["-f", "-N", "-S", "none"]);
        command.args(["-o", "ExitOnForwardFailure=yes"]);
        command.args(["-o", "StrictHostKeyChecking=accept-new"]);
        if let Some(port) = port {
            command.args(["-p", port]);
        }
        if let Some(key) = &spec.key_file {
            command.args(["-i", key]);
        }
        command.arg("-L").arg(format!(
            "127.0.0.1:{}:{}:{}",
            spec.local_port, spec.remote_ip, spec.remote_port
        ));
        command.arg(host);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        command
    }
}

impl Default for OpenSshTunnel {
    fn default() -> Self {
        Self::new()
    }
}

impl Tunneler for OpenSshTunnel {
    fn open_tunnel(&self, spec: &TunnelSpec, timeout: Duration) -> Result<(), TunnelError> {
        tracing::debug!(
            host = %spec.host,
            local_port = spec.local_port,
            remote_port = spec.remote_port,
            "opening ssh tunnel"
        );
        let mut child = self.command(spec).spawn().map_err(TunnelError::Spawn)?;
        let deadline = Instant::now() + timeout;

        loop {
            match child.try_wait().map_err(TunnelError::Spawn)? {
                Some(status) if status.success() => return Ok(()),
                Some(status) => {
                    let mut reason = format!("ssh exited with {}", status);
                    if let Some(mut stderr) = child.stderr.take() {
                        let mut text = String::new();
                        if std::io::Read::read_to_string(&mut stderr, &mut text).is_ok()
                            && !text.trim().is_empty()
                        {
                            reason = text.trim().to_string();
                        }
                    }
                    return Err(TunnelError::Failed {
                        host: spec.host.clone(),
                        reason,
                    });
                }
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TunnelError::Timeout {
                        host: spec.host.clone(),
                        timeout,
                    });
                }
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }
}

fn split_host_port(host: &str) -> (&str, Option<&str>) {
    match host.rsplit_once(':') {
        Some((name, port)) if !name.is_empty() && port.parse::<u16>().is_ok() => (name, Some(port)),
        _ => (host, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TunnelSpec {
        TunnelSpec {
            local_port: 40000,
            remote_port: 6000,
            host: "gateway:2222".into(),
            remote_ip: "10.0.0.5".into(),
            key_file: Some("/home/user/.ssh/id_ed25519".into()),
            password: None,
        }
    }

    fn args(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn random_port_is_nonzero() {
        assert_ne!(select_random_port().unwrap(), 0);
    }

    #[test]
    fn split_host_port_variants() {
        assert_eq!(split_host_port("gateway"), ("gateway", None));
        assert_eq!(split_host_port("gateway:2222"), ("gateway", Some("2222")));
        assert_eq!(split_host_port("user@gateway:x"), ("user@gateway:x", None));
    }

    #[test]
    fn command_forwards_local_to_remote() {
        let tunnel = OpenSshTunnel::new();
        let command = tunnel.command(&spec());
        assert_eq!(command.get_program(), "ssh");
        let args = args(&command);
        assert!(args.contains(&"127.0.0.1:40000:10.0.0.5:6000".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/home/user/.ssh/id_ed25519"]));
        assert_eq!(args.last().map(String::as_str), Some("gateway"));
    }

    #[test]
    fn password_goes_through_sshpass() {
        let tunnel = OpenSshTunnel::new();
        let mut spec = spec();
        spec.password = Some("secret".into());
        let command = tunnel.command(&spec);
        assert_eq!(command.get_program(), "sshpass");
        let args = args(&command);
        assert_eq!(args[0], "-e");
        assert!(!args.contains(&"secret".to_string()));
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let tunnel = OpenSshTunnel::with_programs("/nonexistent/ssh", "/nonexistent/sshpass");
        let result = tunnel.open_tunnel(&spec(), Duration::from_millis(100));
        assert!(matches!(result, Err(TunnelError::Spawn(_))));
    }
}
