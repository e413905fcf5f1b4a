//! The event loop: runs the acceptor for inbound connections during
//! startup, dials prior peers, starts the choke scheduler timers, and waits
//! for the cohort to finish before shutting every session down.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{net::TcpListener, sync::Mutex};

use crate::{
    choke,
    config::{Cohort, CommonConf, PeerInfo},
    context::Shared,
    error::*,
    peer::session::{Command, PeerSession},
    store::{PieceStore, StorageInfo},
    PeerId,
};

/// The maximum frame payload the wire codec accepts: one PIECE message's
/// worth of data (4-byte index + piece bytes) or a BITFIELD, whichever is
/// larger, plus the 1-byte tag.
fn max_payload_len(conf: &CommonConf, piece_count: usize) -> u32 {
    let piece_frame = conf.piece_size + 4;
    let bitfield_frame = crate::byte_count(piece_count) as u32;
    piece_frame.max(bitfield_frame) + 1
}

pub struct Engine {
    shared: Shared,
    local_id: PeerId,
    local_addr: SocketAddr,
    prior: Vec<PeerInfo>,
    later: Vec<PeerInfo>,
    unchoking_interval: Duration,
    optimistic_unchoking_interval: Duration,
    max_payload_len: u32,
}

impl Engine {
    /// Builds the engine for `local_id`, reading its layout from the
    /// already-parsed configuration. `peer_dir` is `peer_<id>/`.
    pub fn new(
        local_id: PeerId,
        common: &CommonConf,
        cohort: &Cohort,
        peer_dir: std::path::PathBuf,
    ) -> Result<Self> {
        let me = cohort
            .get(local_id)
            .ok_or(crate::error::ConfigError::UnknownPeerId(local_id))?;
        let local_addr: SocketAddr =
            format!("{}:{}", me.host, me.port).parse().map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid host/port in PeerInfo.cfg",
                ))
            })?;

        let info = StorageInfo::new(common.file_size, common.piece_size);
        let store = if me.has_file {
            PieceStore::new_seed(info, peer_dir, common.file_name.clone())?
        } else {
            PieceStore::new_leecher(info, peer_dir, common.file_name.clone())?
        };

        let cohort_size = cohort.len();
        let max_payload_len = max_payload_len(common, store.storage_info().piece_count);
        let ctx = PeerContext::new(
            local_id,
            store,
            cohort_size,
            common.num_preferred_neighbors,
            common.request_timeout_secs(),
        );

        let prior = cohort.prior(local_id)?.into_iter().cloned().collect();
        let later = cohort.later(local_id)?.into_iter().cloned().collect();

        Ok(Self {
            shared: Arc::new(Mutex::new(ctx)),
            local_id,
            local_addr,
            prior,
            later,
            unchoking_interval: Duration::from_secs(common.unchoking_interval),
            optimistic_unchoking_interval: Duration::from_secs(
                common.optimistic_unchoking_interval,
            ),
            max_payload_len,
        })
    }

    /// Runs the whole peer process: dials prior peers, accepts later peers,
    /// starts the choke scheduler, and blocks until every peer in the
    /// cohort holds the complete file.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.local_addr).await?;
        log::info!("listening on {}", self.local_addr);

        for peer in self.prior.clone() {
            let shared = self.shared.clone();
            let local_id = self.local_id;
            let max_payload_len = self.max_payload_len;
            tokio::spawn(async move {
                let addr: SocketAddr =
                    match format!("{}:{}", peer.host, peer.port).parse() {
                        Ok(addr) => addr,
                        Err(_) => return,
                    };
                let (mut session, sender) =
                    PeerSession::new(shared, local_id, max_payload_len);
                if let Err(e) =
                    session.start_outbound(sender, addr, peer.id).await
                {
                    log::warn!("outbound session to peer {} failed: {}", peer.id, e);
                }
            });
        }

        let mut later_queue: std::collections::VecDeque<PeerId> =
            self.later.iter().map(|p| p.id).collect();
        let accept_count = later_queue.len();
        for _ in 0..accept_count {
            let (socket, addr) = listener.accept().await?;
            let expected_id = match later_queue.pop_front() {
                Some(id) => id,
                None => break,
            };
            log::info!("accepted connection from {} (expecting peer {})", addr, expected_id);
            let shared = self.shared.clone();
            let local_id = self.local_id;
            let max_payload_len = self.max_payload_len;
            tokio::spawn(async move {
                let (mut session, sender) =
                    PeerSession::new(shared, local_id, max_payload_len);
                if let Err(e) = session
                    .start_inbound(socket, sender, expected_id)
                    .await
                {
                    log::warn!(
                        "inbound session from peer {} failed: {}",
                        expected_id,
                        e
                    );
                }
            });
        }

        tokio::spawn(choke::run_regular_unchoker(
            self.shared.clone(),
            self.unchoking_interval,
        ));
        tokio::spawn(choke::run_optimistic_unchoker(
            self.shared.clone(),
            self.optimistic_unchoking_interval,
        ));

        self.wait_for_completion().await;
        self.shutdown().await;

        Ok(())
    }

    async fn wait_for_completion(&self) {
        loop {
            {
                let ctx = self.shared.lock().await;
                if ctx.is_done() {
                    log::info!("cohort complete, shutting down");
                    return;
                }
            }
            tokio::time::delay_for(Duration::from_millis(200)).await;
        }
    }

    async fn shutdown(&self) {
        let ctx = self.shared.lock().await;
        for peer in ctx.peers.values() {
            let _ = peer.sender.send(Command::Shutdown);
        }
    }
}
