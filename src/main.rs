use std::path::PathBuf;

use clap::Parser;

use swarmpeer::config::{Cohort, CommonConf};
use swarmpeer::engine::Engine;
use swarmpeer::logsink::FileLogger;

/// A fixed-cohort BitTorrent-style peer-to-peer file sharing peer.
#[derive(Parser, Debug)]
#[clap(name = "swarmpeer")]
struct Cli {
    /// This process's peer id, as listed in PeerInfo.cfg.
    peer_id: u32,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli.peer_id).await {
        eprintln!("peer {}: {}", cli.peer_id, e);
        std::process::exit(1);
    }
}

async fn run(peer_id: u32) -> swarmpeer::error::Result<()> {
    let common = CommonConf::read("Common.cfg")?;
    let cohort = Cohort::read("PeerInfo.cfg")?;

    let peer_dir = PathBuf::from(format!("peer_{}", peer_id));
    std::fs::create_dir_all(&peer_dir)?;

    FileLogger::init(&peer_dir, peer_id)?;
    log::info!("starting peer {}", peer_id);

    let engine = Engine::new(peer_id, &common, &cohort, peer_dir)?;
    engine.run().await
}
