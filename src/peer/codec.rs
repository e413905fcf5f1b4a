//! The wire codec: handshake framing and length-prefixed message framing.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::*, Bitfield, PieceIndex};

/// The fixed ASCII literal every handshake begins with.
pub(crate) const PROTOCOL_STRING: &str = "P2PFILESHARINGPROJ";
const HANDSHAKE_LEN: usize = 18 + 10 + 4;

/// The 32-byte handshake frame: protocol literal, 10 zero bytes, then the
/// sender's 4-byte big-endian peer id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub peer_id: u32,
}

impl Handshake {
    pub fn new(peer_id: u32) -> Self {
        Self { peer_id }
    }
}

pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        dst: &mut BytesMut,
    ) -> Result<()> {
        dst.reserve(HANDSHAKE_LEN);
        dst.extend_from_slice(PROTOCOL_STRING.as_bytes());
        dst.extend_from_slice(&[0u8; 10]);
        dst.put_u32(handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>> {
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let frame = src.split_to(HANDSHAKE_LEN);
        if &frame[0..18] != PROTOCOL_STRING.as_bytes() {
            return Err(Error::BadHandshake);
        }
        let peer_id = u32::from_be_bytes([
            frame[28], frame[29], frame[30], frame[31],
        ]);
        Ok(Some(Handshake { peer_id }))
    }
}

/// Tags for the eight post-handshake message types, matching their wire
/// values exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
}

impl MessageId {
    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// A decoded post-handshake message. Dispatch on this is a plain `match`;
/// there is no abstract message hierarchy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(PieceIndex),
    Piece(PieceIndex, Vec<u8>),
}

impl Message {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Choke => MessageId::Choke,
            Self::Unchoke => MessageId::Unchoke,
            Self::Interested => MessageId::Interested,
            Self::NotInterested => MessageId::NotInterested,
            Self::Have(_) => MessageId::Have,
            Self::Bitfield(_) => MessageId::Bitfield,
            Self::Request(_) => MessageId::Request,
            Self::Piece(..) => MessageId::Piece,
        }
    }
}

/// Frames messages over an established connection.
///
/// A frame whose declared length exceeds this many bytes beyond the 1-byte
/// tag is rejected as oversized; the event loop sets this to
/// `1 + max(piece_size + 4, bitfield_byte_len)` once the storage layout is
/// known. It defaults to a value large enough for any reasonably-sized
/// piece so unit tests don't need to thread it through.
pub(crate) struct PeerCodec {
    pub max_payload_len: u32,
    /// 0 while waiting on the next length prefix; otherwise the decoded
    /// `length` field of the frame currently being accumulated, i.e. the
    /// frame's total size including the prefix (`length + 4`).
    expected_frame_len: usize,
}

impl Default for PeerCodec {
    fn default() -> Self {
        Self {
            max_payload_len: 32 * 1024 * 1024,
            expected_frame_len: 0,
        }
    }
}

impl PeerCodec {
    pub fn new(max_payload_len: u32) -> Self {
        Self {
            max_payload_len,
            expected_frame_len: 0,
        }
    }
}

/// Fails with `PayloadTooShort` rather than letting `Buf::get_u32` panic if
/// `frame` doesn't hold at least `expected` more bytes.
fn require_remaining(frame: &BytesMut, id: MessageId, expected: usize) -> Result<()> {
    let got = frame.remaining();
    if got < expected {
        return Err(Error::PayloadTooShort {
            id: id as u8,
            expected,
            got,
        });
    }
    Ok(())
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if self.expected_frame_len == 0 {
            if src.len() < 4 {
                return Ok(None);
            }
            let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
            if length == 0 {
                // length-0 frames never occur in this protocol (every
                // message carries at least the 1-byte tag); treat as a
                // protocol error rather than silently dropping bytes.
                return Err(Error::UnknownMessageType(0));
            }
            if length > self.max_payload_len {
                return Err(Error::OversizedFrame {
                    len: length,
                    max: self.max_payload_len,
                });
            }
            self.expected_frame_len = length as usize + 4;
        }

        if src.len() < self.expected_frame_len {
            return Ok(None);
        }

        let mut frame = src.split_to(self.expected_frame_len);
        self.expected_frame_len = 0;
        frame.advance(4); // length prefix, already consumed above

        let tag = frame.get_u8();
        let id = MessageId::from_tag(tag)?;
        let msg = match id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => {
                require_remaining(&frame, id, 4)?;
                Message::Have(frame.get_u32() as PieceIndex)
            }
            MessageId::Bitfield => {
                Message::Bitfield(Bitfield::from_vec(frame.to_vec()))
            }
            MessageId::Request => {
                require_remaining(&frame, id, 4)?;
                Message::Request(frame.get_u32() as PieceIndex)
            }
            MessageId::Piece => {
                require_remaining(&frame, id, 4)?;
                let index = frame.get_u32() as PieceIndex;
                Message::Piece(index, frame.to_vec())
            }
        };
        Ok(Some(msg))
    }
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<()> {
        let payload_len = match &msg {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => 0,
            Message::Have(_) | Message::Request(_) => 4,
            Message::Bitfield(bitfield) => bitfield.as_slice().len(),
            Message::Piece(_, data) => 4 + data.len(),
        };

        dst.reserve(4 + 1 + payload_len);
        dst.put_u32(1 + payload_len as u32);
        dst.put_u8(msg.id() as u8);
        match msg {
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have(index) => dst.put_u32(index as u32),
            Message::Bitfield(bitfield) => {
                dst.extend_from_slice(bitfield.as_slice())
            }
            Message::Request(index) => dst.put_u32(index as u32),
            Message::Piece(index, data) => {
                dst.put_u32(index as u32);
                dst.extend_from_slice(&data);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn handshake_round_trips() {
        let mut buf = BytesMut::new();
        let mut codec = HandshakeCodec;
        codec.encode(Handshake::new(1002), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.peer_id, 1002);
    }

    #[test]
    fn bad_handshake_literal_is_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'X'; 18]);
        buf.extend_from_slice(&[0u8; 10]);
        buf.put_u32(7);
        let mut codec = HandshakeCodec;
        assert!(matches!(codec.decode(&mut buf), Err(Error::BadHandshake)));
    }

    fn round_trip_in_chunks(msg: Message, chunk_size: usize) -> Message {
        let mut encode_buf = BytesMut::new();
        let mut codec = PeerCodec::default();
        codec.encode(msg, &mut encode_buf).unwrap();

        let mut feed = BytesMut::new();
        let mut decoded = None;
        while !encode_buf.is_empty() {
            let n = chunk_size.min(encode_buf.len());
            let chunk = encode_buf.split_to(n);
            feed.extend_from_slice(&chunk);
            if let Some(m) = codec.decode(&mut feed).unwrap() {
                decoded = Some(m);
            }
        }
        decoded.expect("message should have been fully decoded")
    }

    #[test]
    fn messages_round_trip_in_arbitrary_chunk_sizes() {
        let messages = vec![
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(3),
            Message::Request(9),
            Message::Piece(2, vec![1, 2, 3, 4, 5]),
        ];
        for msg in messages {
            for chunk_size in [1, 2, 3, 7, 1024] {
                let round_tripped =
                    round_trip_in_chunks(msg.clone(), chunk_size);
                assert_eq!(round_tripped, msg);
            }
        }
    }

    #[test]
    fn bitfield_round_trips() {
        let bitfield = crate::full_bitfield(4);
        let msg = Message::Bitfield(bitfield.clone());
        let round_tripped = round_trip_in_chunks(msg, 1);
        assert_eq!(round_tripped, Message::Bitfield(bitfield));
    }

    #[test]
    fn multiple_frames_in_one_chunk_are_all_decoded() {
        let mut buf = BytesMut::new();
        let mut codec = PeerCodec::default();
        codec.encode(Message::Choke, &mut buf).unwrap();
        codec.encode(Message::Unchoke, &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first, Message::Choke);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second, Message::Unchoke);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        let mut codec = PeerCodec::new(10);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::OversizedFrame { len: 100, max: 10 })
        ));
    }

    #[test]
    fn truncated_have_payload_is_rejected_not_panicking() {
        let mut buf = BytesMut::new();
        buf.put_u32(2); // length = 1-byte tag + 1 stray byte, no room for a u32 index
        buf.put_u8(MessageId::Have as u8);
        buf.put_u8(0xff);
        let mut codec = PeerCodec::default();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::PayloadTooShort { expected: 4, got: 1, .. })
        ));
    }

    #[test]
    fn truncated_piece_payload_is_rejected_not_panicking() {
        let mut buf = BytesMut::new();
        buf.put_u32(1); // length = 1-byte tag only, no index at all
        buf.put_u8(MessageId::Piece as u8);
        let mut codec = PeerCodec::default();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::PayloadTooShort { expected: 4, got: 0, .. })
        ));
    }
}
