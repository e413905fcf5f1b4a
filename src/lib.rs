// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod choke;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod logsink;
mod peer;
pub mod store;

use bitvec::prelude::{BitVec, Msb0};

pub use context::{PeerContext, PeerState};
pub use peer::session::PeerSession;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types in
/// Rust.
pub type PieceIndex = usize;

/// A peer's identity: a 32-bit unsigned integer, unique within the cohort
/// listed in `PeerInfo.cfg`.
pub type PeerId = u32;

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector ordered from most significant to least
/// significant bits, that is, the highest bit of the first byte represents
/// piece 0, the next highest bit piece 1, and so on. A truthy value at a
/// piece's position means the peer has that piece.
pub type Bitfield = BitVec<Msb0, u8>;

/// Builds the canonical "full" bitfield for a torrent of `piece_count`
/// pieces: every real piece bit set, any trailing padding bits within the
/// last byte left zero.
pub fn full_bitfield(piece_count: usize) -> Bitfield {
    let mut bitfield = Bitfield::with_capacity(byte_count(piece_count) * 8);
    bitfield.resize(piece_count, true);
    pad_to_byte_boundary(&mut bitfield);
    bitfield
}

/// Builds the canonical "empty" bitfield for a torrent of `piece_count`
/// pieces: every bit zero.
pub fn empty_bitfield(piece_count: usize) -> Bitfield {
    let mut bitfield = Bitfield::with_capacity(byte_count(piece_count) * 8);
    bitfield.resize(piece_count, false);
    pad_to_byte_boundary(&mut bitfield);
    bitfield
}

/// Returns the number of bytes required to pack `piece_count` bits,
/// `⌈piece_count / 8⌉`.
pub fn byte_count(piece_count: usize) -> usize {
    (piece_count + 7) / 8
}

/// Pads a bitfield out to a whole number of bytes with zero bits, as
/// required by the wire format (trailing bits beyond the real piece count
/// are always zero).
fn pad_to_byte_boundary(bitfield: &mut Bitfield) {
    let padded_len = byte_count(bitfield.len()) * 8;
    bitfield.resize(padded_len, false);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_bitfield_sets_only_real_pieces() {
        let b = full_bitfield(4);
        assert_eq!(b.len(), 8);
        assert!(b[0..4].all());
        assert!(!b[4..8].any());
    }

    #[test]
    fn empty_bitfield_is_all_zero() {
        let b = empty_bitfield(10);
        assert_eq!(b.len(), 16);
        assert!(!b.any());
    }

    #[test]
    fn byte_count_rounds_up() {
        assert_eq!(byte_count(1), 1);
        assert_eq!(byte_count(8), 1);
        assert_eq!(byte_count(9), 2);
        assert_eq!(byte_count(0), 0);
    }
}
