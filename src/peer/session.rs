use std::{net::SocketAddr, time::Duration};

use futures::{
    select,
    stream::{Fuse, SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    context::{PeerContext, PeerState, Shared},
    error::*,
    peer::{
        codec::{Handshake, HandshakeCodec, Message, PeerCodec},
        request,
    },
    PeerId,
};

/// The channel on which the engine or other activities send a peer session
/// a command.
pub type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// Commands a peer session task accepts on its command channel.
pub enum Command {
    /// Write a message to this peer's socket. This is how every other
    /// activity (other peer sessions broadcasting HAVE, the choke
    /// scheduler, request timeouts) gets a frame onto this peer's
    /// connection, since only the owning session task ever writes to it.
    Send(Message),
    /// Tear down the session.
    Shutdown,
}

type PeerSink = SplitSink<Framed<TcpStream, PeerCodec>, Message>;
type PeerStream = SplitStream<Framed<TcpStream, PeerCodec>>;

/// One per remote peer; owns the connection and drives the message
/// handling state machine described by the protocol.
pub struct PeerSession {
    shared: Shared,
    local_id: PeerId,
    remote_id: PeerId,
    cmd_port: Fuse<Receiver>,
    max_payload_len: u32,
    /// True once the first post-handshake message has been processed.
    /// BITFIELD is only legal as that first message.
    past_first_message: bool,
}

impl PeerSession {
    /// Creates a not-yet-connected session and the sender other activities
    /// use to address it once it is registered in the shared context.
    pub fn new(shared: Shared, local_id: PeerId, max_payload_len: u32) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                shared,
                local_id,
                remote_id: 0,
                cmd_port: cmd_port.fuse(),
                max_payload_len,
                past_first_message: false,
            },
            cmd_chan,
        )
    }

    /// Dials `addr` and performs the outbound handshake: send ours first,
    /// then verify the peer's matches the expected prior-peer id.
    pub async fn start_outbound(
        &mut self,
        sender: Sender,
        addr: SocketAddr,
        expected_remote_id: PeerId,
    ) -> Result<()> {
        log::info!("connecting to peer {}", expected_remote_id);
        let socket = TcpStream::connect(addr).await?;
        let mut handshake_io = Framed::new(socket, HandshakeCodec);

        handshake_io.send(Handshake::new(self.local_id)).await?;
        let peer_handshake = handshake_io
            .next()
            .await
            .ok_or(Error::ShortRead)??;
        if peer_handshake.peer_id != expected_remote_id {
            return Err(Error::UnexpectedPeer {
                expected: expected_remote_id,
                got: peer_handshake.peer_id,
            });
        }
        self.remote_id = expected_remote_id;
        log::info!("handshake with peer {} complete (outbound)", self.remote_id);

        self.finish_handshake(handshake_io, sender).await
    }

    /// Completes an already-accepted inbound connection: read the peer's
    /// handshake first and verify it matches the next-expected later peer,
    /// then send ours.
    pub async fn start_inbound(
        &mut self,
        socket: TcpStream,
        sender: Sender,
        expected_remote_id: PeerId,
    ) -> Result<()> {
        let mut handshake_io = Framed::new(socket, HandshakeCodec);

        let peer_handshake = handshake_io
            .next()
            .await
            .ok_or(Error::ShortRead)??;
        if peer_handshake.peer_id != expected_remote_id {
            return Err(Error::UnexpectedPeer {
                expected: expected_remote_id,
                got: peer_handshake.peer_id,
            });
        }
        handshake_io.send(Handshake::new(self.local_id)).await?;
        self.remote_id = expected_remote_id;
        log::info!("handshake with peer {} complete (inbound)", self.remote_id);

        self.finish_handshake(handshake_io, sender).await
    }

    async fn finish_handshake(
        &mut self,
        handshake_io: Framed<TcpStream, HandshakeCodec>,
        sender: Sender,
    ) -> Result<()> {
        // swap in the message codec, carrying over any bytes the peer may
        // have sent right after its handshake
        let old_parts = handshake_io.into_parts();
        let mut new_parts =
            FramedParts::new(old_parts.io, PeerCodec::new(self.max_payload_len));
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);
        let (mut sink, stream) = socket.split();

        let initial_bitfield = {
            let mut ctx = self.shared.lock().await;
            let piece_count = ctx.store.storage_info().piece_count;
            ctx.peers
                .insert(self.remote_id, PeerState::new(sender, piece_count));
            if ctx.store.pieces_held_count() > 0 {
                Some(ctx.store.bitfield().clone())
            } else {
                None
            }
        };

        if let Some(bitfield) = initial_bitfield {
            sink.send(Message::Bitfield(bitfield)).await?;
        }

        log::info!("peer {} session connected", self.remote_id);
        self.run(sink, stream).await
    }

    /// Runs the session loop until a `Command::Shutdown` is received or the
    /// connection is closed or errors.
    async fn run(&mut self, mut sink: PeerSink, stream: PeerStream) -> Result<()> {
        let mut stream = stream.fuse();
        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    log::debug!("peer {} sent {:?}", self.remote_id, msg.id());
                    self.on_message(msg).await?;
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Send(msg) => {
                            sink.send(msg).await?;
                        }
                        Command::Shutdown => {
                            log::info!("shutting down peer {} session", self.remote_id);
                            break;
                        }
                    }
                }
                complete => break,
            }
        }
        Ok(())
    }

    async fn on_message(&mut self, msg: Message) -> Result<()> {
        if matches!(msg, Message::Bitfield(_)) && self.past_first_message {
            return Err(Error::BitfieldNotFirst);
        }

        let mut ctx = self.shared.lock().await;
        let timeout = Duration::from_secs(ctx.request_timeout_secs);
        let arm = match msg {
            Message::Choke => {
                handle_choke(&mut ctx, self.remote_id);
                None
            }
            Message::Unchoke => handle_unchoke(&mut ctx, self.remote_id),
            Message::Interested => {
                handle_interested(&mut ctx, self.remote_id);
                None
            }
            Message::NotInterested => {
                handle_not_interested(&mut ctx, self.remote_id);
                None
            }
            Message::Have(index) => {
                handle_have(&mut ctx, self.remote_id, index)?;
                None
            }
            Message::Bitfield(bitfield) => {
                handle_bitfield(&mut ctx, self.remote_id, bitfield)?
            }
            Message::Request(index) => {
                handle_request(&mut ctx, self.remote_id, index)?;
                None
            }
            Message::Piece(index, data) => {
                handle_piece(&mut ctx, self.remote_id, index, data)?
            }
        };
        drop(ctx);

        self.past_first_message = true;

        if let Some((index, generation)) = arm {
            self.arm_request_timeout(index, generation, timeout);
        }

        Ok(())
    }

    fn arm_request_timeout(&self, index: crate::PieceIndex, generation: u64, timeout: Duration) {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            tokio::time::delay_for(timeout).await;
            let mut ctx = shared.lock().await;
            let outgoing =
                request::restore_interest_on_timeout(&mut ctx, index, generation);
            for (target, msg) in outgoing {
                dispatch(&ctx, target, msg);
            }
        });
    }
}

/// Pushes `msg` onto `target`'s command channel, so only its owning session
/// task ever writes to its socket.
fn dispatch(ctx: &PeerContext, target: PeerId, msg: Message) {
    if let Some(peer) = ctx.peers.get(&target) {
        let _ = peer.sender.send(Command::Send(msg));
    }
}

fn handle_choke(ctx: &mut PeerContext, remote_id: PeerId) {
    if let Some(peer) = ctx.peers.get_mut(&remote_id) {
        if !peer.peer_is_choking_me {
            log::info!("peer {} choked us", remote_id);
            peer.peer_is_choking_me = true;
        }
    }
}

fn handle_unchoke(
    ctx: &mut PeerContext,
    remote_id: PeerId,
) -> Option<(crate::PieceIndex, u64)> {
    let was_choking = ctx
        .peers
        .get(&remote_id)
        .map(|p| p.peer_is_choking_me)
        .unwrap_or(false);
    if let Some(peer) = ctx.peers.get_mut(&remote_id) {
        peer.peer_is_choking_me = false;
    }
    if was_choking {
        log::info!("peer {} unchoked us", remote_id);
    }

    let has_interesting = ctx
        .peers
        .get(&remote_id)
        .map(|p| !p.interesting_pieces.is_empty())
        .unwrap_or(false);
    if has_interesting {
        if let Some((index, generation)) = request::select_request(ctx, remote_id) {
            dispatch(ctx, remote_id, Message::Request(index));
            return Some((index, generation));
        }
    }
    None
}

fn handle_interested(ctx: &mut PeerContext, remote_id: PeerId) {
    if let Some(peer) = ctx.peers.get_mut(&remote_id) {
        if !peer.peer_is_interested_in_me {
            log::info!("peer {} is interested", remote_id);
            peer.peer_is_interested_in_me = true;
        }
    }
}

fn handle_not_interested(ctx: &mut PeerContext, remote_id: PeerId) {
    if let Some(peer) = ctx.peers.get_mut(&remote_id) {
        if peer.peer_is_interested_in_me {
            log::info!("peer {} is no longer interested", remote_id);
            peer.peer_is_interested_in_me = false;
        }
    }
}

fn handle_have(
    ctx: &mut PeerContext,
    remote_id: PeerId,
    index: crate::PieceIndex,
) -> Result<()> {
    if index >= ctx.store.storage_info().piece_count {
        return Err(Error::InvalidPieceIndex(index));
    }

    let already_have_locally = ctx.store.have(index);
    let already_outstanding = ctx.outstanding_requests.contains_key(&index);

    let peer = match ctx.peers.get_mut(&remote_id) {
        Some(peer) => peer,
        None => return Ok(()),
    };
    peer.remote_bitfield.set(index, true);

    if !peer.remote_full_counted && peer.remote_bitfield == *ctx.store.full_bitfield() {
        peer.remote_full_counted = true;
        ctx.peers_with_whole_file += 1;
        log::info!("peer {} now has the whole file", remote_id);
    }

    if !already_have_locally && !already_outstanding {
        let peer = ctx.peers.get_mut(&remote_id).expect("peer present");
        let was_empty = peer.interesting_pieces.is_empty();
        peer.interesting_pieces.insert(index);
        if was_empty {
            peer.am_interested_in_peer = true;
            dispatch(ctx, remote_id, Message::Interested);
        }
    }

    Ok(())
}

fn handle_bitfield(
    ctx: &mut PeerContext,
    remote_id: PeerId,
    mut bitfield: crate::Bitfield,
) -> Result<Option<(crate::PieceIndex, u64)>> {
    let expected_len = ctx.store.bitfield().len();
    if bitfield.len() != expected_len {
        return Err(Error::BitfieldWrongSize {
            expected: expected_len,
            got: bitfield.len(),
        });
    }

    let is_full = bitfield == *ctx.store.full_bitfield();
    if let Some(peer) = ctx.peers.get_mut(&remote_id) {
        std::mem::swap(&mut peer.remote_bitfield, &mut bitfield);
        if is_full && !peer.remote_full_counted {
            peer.remote_full_counted = true;
            ctx.peers_with_whole_file += 1;
        }
    }

    let piece_count = ctx.store.storage_info().piece_count;
    let interesting: std::collections::HashSet<crate::PieceIndex> = (0..piece_count)
        .filter(|&i| {
            !ctx.store.have(i)
                && !ctx.outstanding_requests.contains_key(&i)
                && ctx
                    .peers
                    .get(&remote_id)
                    .map(|p| p.remote_bitfield.get(i).map(|b| *b).unwrap_or(false))
                    .unwrap_or(false)
        })
        .collect();

    let arm = if interesting.is_empty() {
        if let Some(peer) = ctx.peers.get_mut(&remote_id) {
            peer.am_interested_in_peer = false;
        }
        dispatch(ctx, remote_id, Message::NotInterested);
        None
    } else {
        if let Some(peer) = ctx.peers.get_mut(&remote_id) {
            peer.interesting_pieces = interesting;
            peer.am_interested_in_peer = true;
        }
        dispatch(ctx, remote_id, Message::Interested);
        request::select_request(ctx, remote_id).map(|(index, generation)| {
            dispatch(ctx, remote_id, Message::Request(index));
            (index, generation)
        })
    };

    Ok(arm)
}

fn handle_request(
    ctx: &mut PeerContext,
    remote_id: PeerId,
    index: crate::PieceIndex,
) -> Result<()> {
    if !ctx.is_unchoked(remote_id) {
        // we are choking this peer; ignore its request
        return Ok(());
    }
    if !ctx.store.have(index) {
        return Err(Error::BadRequest(index));
    }
    let data = ctx.store.read_piece(index)?;
    dispatch(ctx, remote_id, Message::Piece(index, data));
    Ok(())
}

fn handle_piece(
    ctx: &mut PeerContext,
    remote_id: PeerId,
    index: crate::PieceIndex,
    data: Vec<u8>,
) -> Result<Option<(crate::PieceIndex, u64)>> {
    if index >= ctx.store.storage_info().piece_count {
        return Err(Error::InvalidPieceIndex(index));
    }
    if ctx.store.have(index) {
        // duplicate/late delivery of a re-requested piece
        return Ok(None);
    }

    let data_len = data.len() as u64;
    ctx.store.write_piece(index, &data)?;
    if let Some(peer) = ctx.peers.get_mut(&remote_id) {
        peer.rate_counter += data_len;
    }
    ctx.outstanding_requests.remove(&index);
    ctx.note_local_completion_if_needed();

    let neighbor_ids: Vec<PeerId> = ctx.peers.keys().copied().collect();
    for id in neighbor_ids {
        dispatch(ctx, id, Message::Have(index));
        let became_empty = if let Some(peer) = ctx.peers.get_mut(&id) {
            let had = peer.interesting_pieces.remove(&index);
            had && peer.interesting_pieces.is_empty()
        } else {
            false
        };
        if became_empty {
            if let Some(peer) = ctx.peers.get_mut(&id) {
                peer.am_interested_in_peer = false;
            }
            dispatch(ctx, id, Message::NotInterested);
        }
    }

    let should_request_more = ctx
        .peers
        .get(&remote_id)
        .map(|p| !p.interesting_pieces.is_empty() && !p.peer_is_choking_me)
        .unwrap_or(false);
    if should_request_more {
        if let Some((next_index, generation)) = request::select_request(ctx, remote_id) {
            dispatch(ctx, remote_id, Message::Request(next_index));
            return Ok(Some((next_index, generation)));
        }
    }
    Ok(None)
}
