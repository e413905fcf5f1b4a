//! The shared peer context: all state that the event loop, the peer
//! sessions, the request manager and the choke scheduler observe or mutate
//! under a single coarse lock (see the concurrency notes in `engine`).

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tokio::sync::{mpsc::UnboundedSender, Mutex};

use crate::{peer::session::Command, store::PieceStore, Bitfield, PeerId, PieceIndex};

/// The single coarse lock guarding all state shared across a peer process's
/// concurrent activities (event loop, peer sessions, choke scheduler,
/// request timeouts). See the concurrency notes in `engine`.
pub type Shared = Arc<Mutex<PeerContext>>;

/// Per-neighbor state, one record per connected remote peer.
pub struct PeerState {
    /// The channel to that peer's session task; it is the only task that
    /// ever writes to the peer's socket, which serializes outbound frames
    /// without any extra per-socket locking.
    pub sender: UnboundedSender<Command>,
    /// Tracked copy of the remote's bitfield, updated by BITFIELD and HAVE.
    pub remote_bitfield: Bitfield,
    /// Pieces the remote has that we lack and have not yet requested.
    pub interesting_pieces: HashSet<PieceIndex>,
    pub peer_is_choking_me: bool,
    pub peer_is_interested_in_me: bool,
    pub am_choking_peer: bool,
    pub am_interested_in_peer: bool,
    /// Bytes of useful payload received from this peer since the last
    /// regular unchoke tick.
    pub rate_counter: u64,
    /// Set once `remote_bitfield` has been observed to be full, so the
    /// transition into `peers_with_whole_file` is only counted once.
    pub remote_full_counted: bool,
}

impl PeerState {
    pub fn new(sender: UnboundedSender<Command>, piece_count: usize) -> Self {
        Self {
            sender,
            remote_bitfield: crate::empty_bitfield(piece_count),
            interesting_pieces: HashSet::new(),
            peer_is_choking_me: true,
            peer_is_interested_in_me: false,
            am_choking_peer: true,
            am_interested_in_peer: false,
            rate_counter: 0,
            remote_full_counted: false,
        }
    }
}

/// An outstanding REQUEST we've issued, awaiting a PIECE reply.
#[derive(Clone, Copy, Debug)]
pub struct OutstandingRequest {
    pub peer_id: PeerId,
    /// A monotonically increasing generation counter, bumped every time the
    /// index is (re-)requested. The timer task captures the generation at
    /// spawn time and only acts if it still matches when it fires, so a
    /// request that was satisfied (or reissued) in the meantime doesn't get
    /// spuriously restored.
    pub generation: u64,
}

/// All state shared across a peer process's concurrent activities.
pub struct PeerContext {
    pub local_id: PeerId,
    pub store: PieceStore,
    pub peers: HashMap<PeerId, PeerState>,
    pub cohort_size: usize,
    /// Incremented whenever a neighbor is observed to hold the full
    /// bitfield, and when the local peer itself completes.
    pub peers_with_whole_file: usize,
    pub num_preferred_neighbors: usize,
    /// `4 * UnchokingInterval`, the duration the Request Manager waits for
    /// a PIECE reply before restoring interest.
    pub request_timeout_secs: u64,
    pub preferred_neighbors: HashSet<PeerId>,
    pub optimistic_unchoke: Option<PeerId>,
    pub outstanding_requests: HashMap<PieceIndex, OutstandingRequest>,
    /// Set once the local download has been counted into
    /// `peers_with_whole_file`, so completion is only counted once.
    local_counted: bool,
    next_generation: u64,
}

impl PeerContext {
    pub fn new(
        local_id: PeerId,
        store: PieceStore,
        cohort_size: usize,
        num_preferred_neighbors: usize,
        request_timeout_secs: u64,
    ) -> Self {
        let is_complete = store.is_complete();
        let peers_with_whole_file = if is_complete { 1 } else { 0 };
        Self {
            local_id,
            store,
            peers: HashMap::new(),
            cohort_size,
            peers_with_whole_file,
            num_preferred_neighbors,
            request_timeout_secs,
            preferred_neighbors: HashSet::new(),
            optimistic_unchoke: None,
            outstanding_requests: HashMap::new(),
            local_counted: is_complete,
            next_generation: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.peers_with_whole_file >= self.cohort_size
    }

    /// Call after writing a piece that may have just completed the local
    /// download; counts the completion into `peers_with_whole_file` exactly
    /// once.
    pub fn note_local_completion_if_needed(&mut self) {
        if !self.local_counted && self.store.is_complete() {
            self.local_counted = true;
            self.peers_with_whole_file += 1;
        }
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Whether `peer_id` is currently unchoked by us (preferred or the
    /// optimistic pick).
    pub fn is_unchoked(&self, peer_id: PeerId) -> bool {
        self.preferred_neighbors.contains(&peer_id)
            || self.optimistic_unchoke == Some(peer_id)
    }
}
