//! kernel-comm entry point.
//!
//! ## CLI Subcommands
//!
//! - `kernel-comm loopback` - Run the in-process frontend/kernel demo (default)
//! - `kernel-comm config show` - Print effective configuration
//! - `kernel-comm config defaults` - Print documented defaults
//! - `kernel-comm version` - Print version

use std::process::ExitCode;

use kernel_comm::cli::{config_cmd, run_loopback};
use kernel_comm::config as comm_config;
use kernel_comm::telemetry;

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("loopback");

    match command {
        "loopback" | "" => {
            let env = comm_config::load();
            if let Err(e) = telemetry::init_logging(&env.log) {
                eprintln!("Failed to initialize logging: {}", e);
                return ExitCode::from(2u8);
            }
            ExitCode::from(run_loopback(env.comm).await)
        }
        "config" => {
            let subcommand = args.get(2).map(|s| s.as_str()).unwrap_or("show");
            match subcommand {
                "show" => {
                    config_cmd::run_show();
                    ExitCode::SUCCESS
                }
                "defaults" => {
                    config_cmd::run_defaults();
                    ExitCode::SUCCESS
                }
                _ => {
                    eprintln!("Unknown config subcommand: {}", subcommand);
                    print_usage();
                    ExitCode::FAILURE
                }
            }
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        "version" | "--version" | "-V" => {
            println!("kernel-comm {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!(
        "kernel-comm - frontend/kernel call channel v{}

USAGE:
    kernel-comm [COMMAND]

COMMANDS:
    loopback     Run an in-process frontend/kernel pair (default)
    config       Show configuration (show, defaults)
    version      Show version information
    help         Show this help message

ENVIRONMENT:
    KERNEL_COMM_DEFAULT_TIMEOUT  Blocking-call timeout in seconds (default: 3)
    KERNEL_COMM_TUNNEL_TIMEOUT   SSH tunnel connect timeout in seconds (default: 10)
    KERNEL_COMM_REPLY_TTL        Reply inbox eviction age in seconds (default: 300)
    KERNEL_COMM_LOG_LEVEL        Tracing filter (default: info)
    KERNEL_COMM_LOG_FORMAT       json or pretty (default: json)

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
",
        version
    );
}
