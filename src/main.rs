//! Bridge orchestrator entry point.
//!
//! Run modes:
//!   bitbridge run    - start every worker plus the notification gateway
//!   bitbridge help   - show usage

use std::env;
use std::process::ExitCode;

use bitbridge::config::Config;
use bitbridge::server::Server;
use bitbridge::{logging, units};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("run") => run().await,
        Some("help") | Some("--help") | Some("-h") | None => {
            print_usage();
            ExitCode::SUCCESS
        }
        Some(other) => {
            eprintln!("unknown command: {other}");
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    println!("bitbridge - L1 ↔ rollup bridge orchestrator");
    println!();
    println!("Usage:");
    println!("  bitbridge run     Start the indexer, deposit and withdraw workers");
    println!("                    and the notification gateway");
    println!();
    println!("Configuration comes from BRIDGE_* environment variables;");
    println!("see config.rs for the full list. Required:");
    println!("  BRIDGE_LISTEN_ADDRESS     L1 deposit sink address");
    println!("  BRIDGE_CONTRACT_ADDRESS   rollup bridge contract");
    println!("  BRIDGE_PRIV_KEY           rollup signing key (hex)");
}

async fn run() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init_logging(&config.log_level, config.log_json) {
        eprintln!("logging error: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        network = ?config.network,
        listen_address = %config.listen_address,
        withdraw_fee = %units::format_sats(config.withdraw_fee as u64),
        "starting bridge orchestrator"
    );

    match Server::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}
