//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `KERNEL_COMM_*` environment
//! variables with sensible defaults. Invalid values fall back to defaults
//! without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `KERNEL_COMM_DEFAULT_TIMEOUT` | 3 | Blocking-call timeout when the call sets none (secs) |
//! | `KERNEL_COMM_TUNNEL_TIMEOUT` | 10 | SSH tunnel connect timeout (secs) |
//! | `KERNEL_COMM_REPLY_TTL` | 300 | Reply inbox eviction age (secs) |
//! | `KERNEL_COMM_LOG_LEVEL` | info | Tracing filter directive |
//! | `KERNEL_COMM_LOG_FORMAT` | json | `json` or `pretty` |

use std::time::Duration;

use crate::telemetry::{LogConfig, LogFormat};

/// Timeouts and limits used by a `KernelComm` endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CommConfig {
    /// Wait used by blocking calls that do not carry their own timeout.
    pub default_timeout: Duration,
    /// Connect timeout for SSH tunnels to a remote kernel.
    pub tunnel_timeout: Duration,
    /// Replies older than this are evicted from the inbox.
    pub reply_ttl: Duration,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(3),
            tunnel_timeout: Duration::from_secs(10),
            reply_ttl: Duration::from_secs(300),
        }
    }
}

/// Effective runtime configuration summary.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub default_timeout_secs: u64,
    pub tunnel_timeout_secs: u64,
    pub reply_ttl_secs: u64,
    pub log_level: String,
    pub log_format: String,
}

/// All runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub comm: CommConfig,
    pub log: LogConfig,
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn load_comm_config() -> CommConfig {
    let default_timeout = parse_u64("KERNEL_COMM_DEFAULT_TIMEOUT", 3).max(1);
    let tunnel_timeout = parse_u64("KERNEL_COMM_TUNNEL_TIMEOUT", 10).max(1);
    let reply_ttl = parse_u64("KERNEL_COMM_REPLY_TTL", 300);
    // A reply must outlive the longest wait that could claim it.
    let reply_ttl = reply_ttl.max(default_timeout);
    CommConfig {
        default_timeout: Duration::from_secs(default_timeout),
        tunnel_timeout: Duration::from_secs(tunnel_timeout),
        reply_ttl: Duration::from_secs(reply_ttl),
    }
}

fn load_log_config() -> LogConfig {
    let level = std::env::var("KERNEL_COMM_LOG_LEVEL")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let format = std::env::var("KERNEL_COMM_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse::<LogFormat>().ok())
        .unwrap_or_default();
    LogConfig {
        format,
        level,
        output_path: None,
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    EnvConfig {
        comm: load_comm_config(),
        log: load_log_config(),
    }
}

impl EnvConfig {
    /// Return a printable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            default_timeout_secs: self.comm.default_timeout.as_secs(),
            tunnel_timeout_secs: self.comm.tunnel_timeout.as_secs(),
            reply_ttl_secs: self.comm.reply_ttl.as_secs(),
            log_level: self.log.level.clone(),
            log_format: match self.log.format {
                LogFormat::Json => "json".to_string(),
                LogFormat::Pretty => "pretty".to_string(),
            },
        }
    }
}
