use std::path::PathBuf;

use log::{error, info};

use minisync::{Config, Node};

/// Single-node daemon: boot the replication core, recover the journal, and
/// idle until interrupted. Peers, acks and client requests come from the
/// embedding server; standalone the daemon is mostly useful for inspecting
/// recovery and checkpointing behavior.
#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = Config::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--data-dir" => {
                if let Some(dir) = args.next() {
                    config.data_dir = PathBuf::from(dir);
                }
            }
            "--peer-id" => {
                if let Some(id) = args.next() {
                    config.peer_id = id.parse().unwrap_or(1);
                }
            }
            "--force-recovery" => config.force_recovery = true,
            other => {
                eprintln!("unknown option: {}", other);
                std::process::exit(2);
            }
        }
    }

    let node = match Node::new(config) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start: {}", e);
            std::process::exit(1);
        }
    };

    info!("minisync is running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for the shutdown signal: {}", e);
    }
    info!("shutting down");
    node.shutdown();
}
