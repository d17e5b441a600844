//! Peer wire messages and their codec.
//!
//! Messages are length-prefixed: a 4-byte big-endian length, then a 1-byte
//! message ID (except keep-alive, which is length 0) and payload. Only the
//! messages the download core acts on are decoded; extension-protocol
//! messages pass through opaquely.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::error::PeerError;
use crate::constants::MAX_REQUEST_LENGTH;
use crate::layout::Request;

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    // Fast extension (BEP-6)
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            _ => Err(PeerError::InvalidMessageId(value)),
        }
    }
}

/// A peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request(Request),
    Piece { piece: u32, begin: u32, data: Bytes },
    Cancel(Request),
    HaveAll,
    HaveNone,
    Reject(Request),
    AllowedFast { piece: u32 },
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Encoded length, including the 4-byte length prefix.
    pub fn encoded_len(&self) -> usize {
        4 + match self {
            Message::KeepAlive => 0,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => 1,
            Message::Have { .. } | Message::AllowedFast { .. } => 5,
            Message::Bitfield(bits) => 1 + bits.len(),
            Message::Request(_) | Message::Cancel(_) | Message::Reject(_) => 13,
            Message::Piece { data, .. } => 9 + data.len(),
            Message::Extended { payload, .. } => 2 + payload.len(),
        }
    }

    /// Payload bytes of a Piece message, 0 otherwise. The writer tracks
    /// these separately for upload-rate accounting.
    pub fn piece_data_len(&self) -> usize {
        match self {
            Message::Piece { data, .. } => data.len(),
            _ => 0,
        }
    }

    fn put_request(buf: &mut BytesMut, id: MessageId, r: &Request) {
        buf.put_u32(13);
        buf.put_u8(id as u8);
        buf.put_u32(r.piece);
        buf.put_u32(r.begin);
        buf.put_u32(r.length);
    }

    /// Appends the encoded message to `buf`. Returns the bytes written.
    pub fn encode_into(&self, buf: &mut BytesMut) -> usize {
        let start = buf.len();
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request(r) => Self::put_request(buf, MessageId::Request, r),
            Message::Piece { piece, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel(r) => Self::put_request(buf, MessageId::Cancel, r),
            Message::HaveAll => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveAll as u8);
            }
            Message::HaveNone => {
                buf.put_u32(1);
                buf.put_u8(MessageId::HaveNone as u8);
            }
            Message::Reject(r) => Self::put_request(buf, MessageId::Reject, r),
            Message::AllowedFast { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::AllowedFast as u8);
                buf.put_u32(*piece);
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
        buf.len() - start
    }

    /// Encodes the message to a standalone buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn get_request(data: &mut Bytes, what: &str) -> Result<Request, PeerError> {
        if data.remaining() < 12 {
            return Err(PeerError::InvalidMessage(format!("{what} too short")));
        }
        Ok(Request {
            piece: data.get_u32(),
            begin: data.get_u32(),
            length: data.get_u32(),
        })
    }

    /// Decodes one framed message (without the length prefix; `length` is
    /// the frame length already read).
    pub fn decode_frame(mut data: Bytes) -> Result<Self, PeerError> {
        if data.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let length = data.len();
        let id = MessageId::try_from(data.get_u8())?;
        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                if data.remaining() < 4 {
                    return Err(PeerError::InvalidMessage("have too short".into()));
                }
                Ok(Message::Have {
                    piece: data.get_u32(),
                })
            }
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(length - 1))),
            MessageId::Request => Ok(Message::Request(Self::get_request(&mut data, "request")?)),
            MessageId::Piece => {
                if data.remaining() < 8 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let piece = data.get_u32();
                let begin = data.get_u32();
                Ok(Message::Piece {
                    piece,
                    begin,
                    data: data.copy_to_bytes(length - 9),
                })
            }
            MessageId::Cancel => Ok(Message::Cancel(Self::get_request(&mut data, "cancel")?)),
            MessageId::HaveAll => Ok(Message::HaveAll),
            MessageId::HaveNone => Ok(Message::HaveNone),
            MessageId::Reject => Ok(Message::Reject(Self::get_request(&mut data, "reject")?)),
            MessageId::AllowedFast => {
                if data.remaining() < 4 {
                    return Err(PeerError::InvalidMessage("allowed fast too short".into()));
                }
                Ok(Message::AllowedFast {
                    piece: data.get_u32(),
                })
            }
            MessageId::Extended => {
                if data.remaining() < 1 {
                    return Err(PeerError::InvalidMessage("extended too short".into()));
                }
                let ext_id = data.get_u8();
                Ok(Message::Extended {
                    id: ext_id,
                    payload: data.copy_to_bytes(length - 2),
                })
            }
        }
    }
}

/// Pluggable wire codec. The default implementation speaks the standard
/// framing above; the codec must report `Message::Piece` lengths accurately
/// so write-buffer flow control works.
pub trait WireCodec: Send + Sync {
    /// Appends one message; returns the bytes written. On error the buffer
    /// must be left unchanged (the writer reverts it regardless).
    fn write_message(&self, buf: &mut BytesMut, msg: &Message) -> Result<usize, PeerError>;

    /// Decodes one frame (length prefix stripped).
    fn decode_frame(&self, frame: Bytes) -> Result<Message, PeerError>;
}

/// The standard BitTorrent framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardCodec;

impl WireCodec for StandardCodec {
    fn write_message(&self, buf: &mut BytesMut, msg: &Message) -> Result<usize, PeerError> {
        Ok(msg.encode_into(buf))
    }

    fn decode_frame(&self, frame: Bytes) -> Result<Message, PeerError> {
        Message::decode_frame(frame)
    }
}

/// Largest frame we accept: a full Piece message plus header slack.
const MAX_FRAME_LEN: u32 = MAX_REQUEST_LENGTH + 64;

/// Reads one message off the transport.
pub async fn read_message<R>(io: &mut R) -> Result<Message, PeerError>
where
    R: AsyncRead + Unpin,
{
    let len = io.read_u32().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            PeerError::ConnectionClosed
        } else {
            PeerError::Io(e)
        }
    })?;
    if len > MAX_FRAME_LEN {
        return Err(PeerError::Protocol(format!("frame length {len} too large")));
    }
    let mut frame = vec![0u8; len as usize];
    io.read_exact(&mut frame).await?;
    Message::decode_frame(Bytes::from(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let encoded = msg.encode();
        assert_eq!(encoded.len(), msg.encoded_len());
        let mut frame = encoded.clone();
        let len = frame.get_u32() as usize;
        assert_eq!(len, frame.len());
        let decoded = Message::decode_frame(frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_round_trips() {
        for msg in [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece: 42 },
            Message::Bitfield(Bytes::from_static(&[0xF0, 0x01])),
            Message::Request(Request::new(1, 16384, 16384)),
            Message::Piece {
                piece: 3,
                begin: 0,
                data: Bytes::from_static(b"chunkdata"),
            },
            Message::Cancel(Request::new(1, 16384, 16384)),
            Message::HaveAll,
            Message::HaveNone,
            Message::Reject(Request::new(2, 0, 16384)),
            Message::AllowedFast { piece: 9 },
            Message::Extended {
                id: 1,
                payload: Bytes::from_static(b"d1:md11:ut_metadatai1eee"),
            },
        ] {
            round_trip(msg);
        }
    }

    #[test]
    fn test_piece_length_reported_accurately() {
        let msg = Message::Piece {
            piece: 0,
            begin: 0,
            data: Bytes::from(vec![0u8; 16384]),
        };
        assert_eq!(msg.piece_data_len(), 16384);
        assert_eq!(msg.encoded_len(), 4 + 9 + 16384);
    }

    #[test]
    fn test_fixed_message_lengths_match_constants() {
        use crate::constants::{INTERESTED_MSG_LEN, REQUEST_MSG_LEN};
        assert_eq!(Message::Interested.encoded_len(), INTERESTED_MSG_LEN);
        assert_eq!(
            Message::Request(Request::new(0, 0, 16384)).encoded_len(),
            REQUEST_MSG_LEN
        );
    }

    #[test]
    fn test_unknown_message_id() {
        let frame = Bytes::from_static(&[9]); // Port: not spoken here
        assert!(matches!(
            Message::decode_frame(frame),
            Err(PeerError::InvalidMessageId(9))
        ));
    }

    #[tokio::test]
    async fn test_read_message_from_stream() {
        let mut wire = BytesMut::new();
        Message::Have { piece: 7 }.encode_into(&mut wire);
        Message::KeepAlive.encode_into(&mut wire);
        let mut io = std::io::Cursor::new(wire.freeze().to_vec());

        assert_eq!(
            read_message(&mut io).await.unwrap(),
            Message::Have { piece: 7 }
        );
        assert_eq!(read_message(&mut io).await.unwrap(), Message::KeepAlive);
        assert!(matches!(
            read_message(&mut io).await,
            Err(PeerError::ConnectionClosed)
        ));
    }
}
