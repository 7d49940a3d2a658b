//! CLI subcommands for the `kernel-comm` binary.
//!
//! ## Usage
//!
//! ```bash
//! kernel-comm loopback      # In-process frontend/kernel demo
//! kernel-comm config show   # Print effective configuration
//! ```

pub mod config_cmd;
pub mod loopback;

pub use loopback::{run_loopback, LoopbackClient};
