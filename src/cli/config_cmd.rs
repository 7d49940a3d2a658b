//! Config CLI subcommands: show, defaults.
//!
//! These commands read configuration directly from environment variables.

use crate::config::{self, EffectiveConfig};

/// Print effective config as key-value pairs to stdout.
pub fn run_show() {
    let cfg = config::load().effective_config();
    print_config(&cfg);
}

/// Print the documented defaults, ignoring the environment.
pub fn run_defaults() {
    println!("KERNEL_COMM_DEFAULT_TIMEOUT=3");
    println!("KERNEL_COMM_TUNNEL_TIMEOUT=10");
    println!("KERNEL_COMM_REPLY_TTL=300");
    println!("KERNEL_COMM_LOG_LEVEL=info");
    println!("KERNEL_COMM_LOG_FORMAT=json");
}

fn print_config(cfg: &EffectiveConfig) {
    println!("KERNEL_COMM_DEFAULT_TIMEOUT={}", cfg.default_timeout_secs);
    println!("KERNEL_COMM_TUNNEL_TIMEOUT={}", cfg.tunnel_timeout_secs);
    println!("KERNEL_COMM_REPLY_TTL={}", cfg.reply_ttl_secs);
    println!("KERNEL_COMM_LOG_LEVEL={}", cfg.log_level);
    println!("KERNEL_COMM_LOG_FORMAT={}", cfg.log_format);
}
