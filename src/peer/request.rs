//! The Request Manager: picks the next piece to request from a peer and
//! restores interest when a request times out without a PIECE reply.

use rand::seq::IteratorRandom;

use crate::{
    context::{OutstandingRequest, PeerContext},
    peer::codec::Message,
    PeerId, PieceIndex,
};

/// Picks one piece index uniformly at random from `peer_id`'s interesting
/// pieces, removes it from every neighbor's interesting set (it is now
/// outstanding, not merely interesting), and records it as outstanding.
///
/// Returns the chosen index and its request generation, for the caller to
/// send REQUEST(index) and arm a timeout. Returns `None` if the peer has
/// nothing interesting to request.
pub(crate) fn select_request(
    ctx: &mut PeerContext,
    peer_id: PeerId,
) -> Option<(PieceIndex, u64)> {
    let index = {
        let peer = ctx.peers.get(&peer_id)?;
        let mut rng = rand::thread_rng();
        *peer.interesting_pieces.iter().choose(&mut rng)?
    };

    for peer in ctx.peers.values_mut() {
        peer.interesting_pieces.remove(&index);
    }

    let generation = ctx.next_generation();
    ctx.outstanding_requests.insert(
        index,
        OutstandingRequest {
            peer_id,
            generation,
        },
    );

    Some((index, generation))
}

/// Called when a request's timeout elapses. If the request is still
/// outstanding under the same generation (i.e. it hasn't already been
/// satisfied by a PIECE or superseded by a later re-request), "restores
/// interest": the index is removed from `outstanding_requests` and re-added
/// to the interesting set of every neighbor that has it, sending INTERESTED
/// to any neighbor whose set transitioned empty -> nonempty.
pub(crate) fn restore_interest_on_timeout(
    ctx: &mut PeerContext,
    index: PieceIndex,
    generation: u64,
) -> Vec<(PeerId, Message)> {
    let mut outgoing = Vec::new();

    let still_outstanding = matches!(
        ctx.outstanding_requests.get(&index),
        Some(req) if req.generation == generation
    );
    if !still_outstanding {
        return outgoing;
    }
    ctx.outstanding_requests.remove(&index);

    if ctx.store.have(index) {
        // satisfied by some other means between timeout firing and the
        // lock being acquired; nothing to restore.
        return outgoing;
    }

    for (&peer_id, peer) in ctx.peers.iter_mut() {
        if peer.remote_bitfield.get(index).map(|b| *b).unwrap_or(false) {
            let was_empty = peer.interesting_pieces.is_empty();
            peer.interesting_pieces.insert(index);
            if was_empty && !peer.am_interested_in_peer {
                peer.am_interested_in_peer = true;
                outgoing.push((peer_id, Message::Interested));
            }
        }
    }

    outgoing
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{PieceStore, StorageInfo};
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    fn context_with_two_peers() -> PeerContext {
        let info = StorageInfo::new(16, 4);
        let dir = std::env::temp_dir().join("swarmpeer-test-request");
        let _ = std::fs::remove_dir_all(&dir);
        let store =
            PieceStore::new_leecher(info, dir, "f.bin".to_owned()).unwrap();
        let mut ctx = PeerContext::new(1, store, 3, 1, 20);

        for id in [2, 3] {
            let (tx, _rx) = mpsc::unbounded_channel();
            let mut peer = crate::context::PeerState::new(tx, 4);
            peer.interesting_pieces.insert(0);
            peer.remote_bitfield.set(0, true);
            ctx.peers.insert(id, peer);
        }
        ctx
    }

    #[test]
    fn select_request_clears_interest_on_all_peers() {
        let mut ctx = context_with_two_peers();
        let (index, _gen) = select_request(&mut ctx, 2).unwrap();
        assert_eq!(index, 0);
        assert!(ctx.peers[&2].interesting_pieces.is_empty());
        assert!(ctx.peers[&3].interesting_pieces.is_empty());
        assert!(ctx.outstanding_requests.contains_key(&0));
    }

    #[test]
    fn timeout_restores_interest_to_neighbors_with_the_piece() {
        let mut ctx = context_with_two_peers();
        let (index, generation) = select_request(&mut ctx, 2).unwrap();

        let outgoing = restore_interest_on_timeout(&mut ctx, index, generation);
        assert!(!ctx.outstanding_requests.contains_key(&0));
        assert!(ctx.peers[&2].interesting_pieces.contains(&0));
        assert!(ctx.peers[&3].interesting_pieces.contains(&0));
        // both transitioned from empty -> nonempty
        assert_eq!(outgoing.len(), 2);
    }

    #[test]
    fn stale_timeout_generation_is_ignored() {
        let mut ctx = context_with_two_peers();
        let (index, generation) = select_request(&mut ctx, 2).unwrap();
        // simulate the request having already been satisfied and removed
        ctx.outstanding_requests.remove(&index);
        let outgoing = restore_interest_on_timeout(&mut ctx, index, generation);
        assert!(outgoing.is_empty());
    }
}
