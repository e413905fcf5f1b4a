//! The Choke Scheduler: the regular and optimistic unchoker tasks.
//!
//! Both tasks run unconditionally, on both seeds and leechers, for as long
//! as the process is alive. (The original reference implementation this
//! protocol is modeled on guards the regular unchoker to run only while
//! incomplete and the optimistic unchoker to run only once complete — an
//! inverted pair of gates that looks like a bug rather than an intended
//! design, and is not reproduced here; only the regular unchoker's
//! *selection strategy* branches on completion state, exactly as specified
//! in its steps below.)

use std::{collections::HashSet, time::Duration};

use rand::seq::{IteratorRandom, SliceRandom};

use crate::{
    context::Shared, peer::codec::Message, peer::session::Command, PeerId,
};

/// Runs the regular unchoker loop until the process shuts down.
///
/// Every tick: picks up to `k` preferred neighbors (top-`k` by rate counter
/// if the local file is incomplete, uniformly at random once complete),
/// sends UNCHOKE to newcomers and CHOKE to peers dropped from the set, then
/// zeroes every rate counter for the next window.
pub async fn run_regular_unchoker(shared: Shared, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        tick_regular_unchoker(&shared).await;
    }
}

async fn tick_regular_unchoker(shared: &Shared) {
    let mut ctx = shared.lock().await;
    let k = ctx.num_preferred_neighbors;

    let new_preferred: HashSet<PeerId> = if ctx.store.is_complete() {
        let mut rng = rand::thread_rng();
        ctx.peers
            .keys()
            .copied()
            .choose_multiple(&mut rng, k)
            .into_iter()
            .collect()
    } else {
        let mut interested: Vec<(PeerId, u64)> = ctx
            .peers
            .iter()
            .filter(|(_, p)| p.peer_is_interested_in_me)
            .map(|(&id, p)| (id, p.rate_counter))
            .collect();
        // shuffle first so equal rates (notably all-zero, the common case
        // early in a run) tie-break randomly rather than by HashMap order.
        interested.shuffle(&mut rand::thread_rng());
        interested.sort_by(|a, b| b.1.cmp(&a.1));
        let mut chosen: HashSet<PeerId> =
            interested.into_iter().take(k).map(|(id, _)| id).collect();

        if chosen.len() < k {
            let mut rng = rand::thread_rng();
            let remaining: Vec<PeerId> = ctx
                .peers
                .keys()
                .copied()
                .filter(|id| !chosen.contains(id))
                .collect();
            for id in remaining
                .into_iter()
                .choose_multiple(&mut rng, k - chosen.len())
            {
                chosen.insert(id);
            }
        }
        chosen
    };

    let newcomers: Vec<PeerId> = new_preferred
        .difference(&ctx.preferred_neighbors)
        .copied()
        .collect();
    let dropped: Vec<PeerId> = ctx
        .preferred_neighbors
        .difference(&new_preferred)
        .copied()
        .collect();

    for &id in &newcomers {
        if ctx.optimistic_unchoke == Some(id) {
            ctx.optimistic_unchoke = None;
        }
        send_unchoke(&mut ctx, id);
    }
    for &id in &dropped {
        send_choke(&mut ctx, id);
    }

    if !newcomers.is_empty() || !dropped.is_empty() {
        log::info!("preferred neighbors now {:?}", new_preferred);
    }

    ctx.preferred_neighbors = new_preferred;
    for peer in ctx.peers.values_mut() {
        peer.rate_counter = 0;
    }
}

/// Runs the optimistic unchoker loop until the process shuts down.
///
/// Every tick: if there is at least one choked-but-interested peer outside
/// the preferred set and not already the optimistic pick, chooses one
/// uniformly at random, chokes the previous optimistic pick (unless it has
/// since become preferred) and unchokes the new one.
pub async fn run_optimistic_unchoker(shared: Shared, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        tick_optimistic_unchoker(&shared).await;
    }
}

async fn tick_optimistic_unchoker(shared: &Shared) {
    let mut ctx = shared.lock().await;

    let candidates: Vec<PeerId> = ctx
        .peers
        .iter()
        .filter(|(&id, p)| {
            p.peer_is_interested_in_me
                && !ctx.preferred_neighbors.contains(&id)
                && ctx.optimistic_unchoke != Some(id)
        })
        .map(|(&id, _)| id)
        .collect();

    let chosen = {
        let mut rng = rand::thread_rng();
        candidates.into_iter().choose(&mut rng)
    };

    let chosen = match chosen {
        Some(id) => id,
        None => return,
    };

    if let Some(prev) = ctx.optimistic_unchoke {
        if !ctx.preferred_neighbors.contains(&prev) {
            send_choke(&mut ctx, prev);
        }
    }

    send_unchoke(&mut ctx, chosen);
    ctx.optimistic_unchoke = Some(chosen);
    log::info!("optimistic unchoke is now {}", chosen);
}

fn send_unchoke(ctx: &mut crate::PeerContext, id: PeerId) {
    if let Some(peer) = ctx.peers.get_mut(&id) {
        if peer.am_choking_peer {
            peer.am_choking_peer = false;
            let _ = peer.sender.send(Command::Send(Message::Unchoke));
        }
    }
}

fn send_choke(ctx: &mut crate::PeerContext, id: PeerId) {
    if let Some(peer) = ctx.peers.get_mut(&id) {
        if !peer.am_choking_peer {
            peer.am_choking_peer = true;
            let _ = peer.sender.send(Command::Send(Message::Choke));
        }
    }
}
