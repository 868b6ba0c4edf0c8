//! Wire framing for every datagram the core sends.
//!
//! Layout:
//!
//! ```text
//! [u32 magic][u16 version][u32 sequence][u32 ack][u32 ack bitfield]
//! [u8 kind (bit 7 = reliable)][u32 reliable sequence, if bit 7]
//! [kind-specific payload]
//! ```
//!
//! One datagram carries exactly one message. The header sequence numbers
//! every datagram (reliable or not) so acknowledgments can reference it; the
//! optional reliable sequence orders the reliable stream independently.

use thiserror::Error;

use crate::connection::HostId;
use crate::replication::NetId;
use crate::session::SessionInfo;
use crate::value::{NetValue, NetValueKind};

pub const PROTOCOL_MAGIC: u32 = 0x454D4252; // "EMBR"
pub const PROTOCOL_VERSION: u16 = 1;
pub const DEFAULT_PORT: u16 = 26015;

/// Largest datagram the codec will build. Path-MTU safe; anything bigger is
/// an encoding error, and splitting a logical update across datagrams is the
/// replication engine's job.
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Header bytes plus the kind tag; the floor for a decodable datagram.
pub const HEADER_SIZE: usize = 19;

const RELIABLE_FLAG: u8 = 0x80;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("datagram truncated")]
    Truncated,
    #[error("bad magic 0x{0:08x}")]
    BadMagic(u32),
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("unknown value kind {0}")]
    UnknownValueKind(u8),
    #[error("value kind mismatch: expected {expected:?}, got {got:?}")]
    KindMismatch {
        expected: NetValueKind,
        got: NetValueKind,
    },
    #[error("invalid utf-8 in string value")]
    InvalidUtf8,
    #[error("unknown reject reason {0}")]
    UnknownReason(u8),
    #[error("too many rpc parameters ({0})")]
    TooManyParams(usize),
    #[error("message of {0} bytes exceeds the {MAX_DATAGRAM_SIZE}-byte datagram limit")]
    Oversize(usize),
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Cursor over a received datagram.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }
}

pub(crate) fn put_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 0,
    Accept = 1,
    Reject = 2,
    Disconnect = 3,
    Kick = 4,
    Ack = 5,
    Ping = 6,
    Pong = 7,
    Spawn = 8,
    Destroy = 9,
    Update = 10,
    Rpc = 11,
    SessionSearch = 12,
    SessionNotice = 13,
}

impl TryFrom<u8> for MessageKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(MessageKind::Hello),
            1 => Ok(MessageKind::Accept),
            2 => Ok(MessageKind::Reject),
            3 => Ok(MessageKind::Disconnect),
            4 => Ok(MessageKind::Kick),
            5 => Ok(MessageKind::Ack),
            6 => Ok(MessageKind::Ping),
            7 => Ok(MessageKind::Pong),
            8 => Ok(MessageKind::Spawn),
            9 => Ok(MessageKind::Destroy),
            10 => Ok(MessageKind::Update),
            11 => Ok(MessageKind::Rpc),
            12 => Ok(MessageKind::SessionSearch),
            13 => Ok(MessageKind::SessionNotice),
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

/// Why a connection attempt was refused.
///
/// `Timeout` is only ever produced locally (handshake gave up); it never
/// crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RejectReason {
    Full = 0,
    VersionMismatch = 1,
    GameMismatch = 2,
    Refused = 3,
    Timeout = 4,
}

impl TryFrom<u8> for RejectReason {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(RejectReason::Full),
            1 => Ok(RejectReason::VersionMismatch),
            2 => Ok(RejectReason::GameMismatch),
            3 => Ok(RejectReason::Refused),
            4 => Ok(RejectReason::Timeout),
            other => Err(CodecError::UnknownReason(other)),
        }
    }
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Full => "session full",
            RejectReason::VersionMismatch => "protocol version mismatch",
            RejectReason::GameMismatch => "different game",
            RejectReason::Refused => "refused by host",
            RejectReason::Timeout => "connection attempt timed out",
        }
    }
}

/// One replicated field carried by an [`Message::Update`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub index: u8,
    pub version: u32,
    pub value: NetValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello { game_id: u64, online_id: u64 },
    Accept { host_id: HostId, session: SessionInfo },
    Reject { reason: RejectReason },
    Disconnect,
    Kick,
    Ack,
    Ping { timestamp_ms: u64 },
    Pong { timestamp_ms: u64 },
    Spawn { net_id: NetId, class: String, owner: HostId },
    Destroy { net_id: NetId },
    Update { net_id: NetId, fields: Vec<FieldUpdate> },
    Rpc { net_id: NetId, func: u8, args: Vec<NetValue> },
    SessionSearch { game_id: u64 },
    SessionNotice { game_id: u64, session: SessionInfo },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::Accept { .. } => MessageKind::Accept,
            Message::Reject { .. } => MessageKind::Reject,
            Message::Disconnect => MessageKind::Disconnect,
            Message::Kick => MessageKind::Kick,
            Message::Ack => MessageKind::Ack,
            Message::Ping { .. } => MessageKind::Ping,
            Message::Pong { .. } => MessageKind::Pong,
            Message::Spawn { .. } => MessageKind::Spawn,
            Message::Destroy { .. } => MessageKind::Destroy,
            Message::Update { .. } => MessageKind::Update,
            Message::Rpc { .. } => MessageKind::Rpc,
            Message::SessionSearch { .. } => MessageKind::SessionSearch,
            Message::SessionNotice { .. } => MessageKind::SessionNotice,
        }
    }

    fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Message::Hello { game_id, online_id } => {
                out.extend_from_slice(&game_id.to_le_bytes());
                out.extend_from_slice(&online_id.to_le_bytes());
            }
            Message::Accept { host_id, session } => {
                out.extend_from_slice(&host_id.to_le_bytes());
                encode_session(out, session);
            }
            Message::Reject { reason } => out.push(*reason as u8),
            Message::Disconnect | Message::Kick | Message::Ack => {}
            Message::Ping { timestamp_ms } | Message::Pong { timestamp_ms } => {
                out.extend_from_slice(&timestamp_ms.to_le_bytes());
            }
            Message::Spawn {
                net_id,
                class,
                owner,
            } => {
                out.extend_from_slice(&net_id.to_le_bytes());
                put_string(out, class);
                out.extend_from_slice(&owner.to_le_bytes());
            }
            Message::Destroy { net_id } => out.extend_from_slice(&net_id.to_le_bytes()),
            Message::Update { net_id, fields } => {
                out.extend_from_slice(&net_id.to_le_bytes());
                out.push(fields.len() as u8);
                for field in fields {
                    out.push(field.index);
                    out.extend_from_slice(&field.version.to_le_bytes());
                    field.value.encode(out);
                }
            }
            Message::Rpc { net_id, func, args } => {
                out.extend_from_slice(&net_id.to_le_bytes());
                out.push(*func);
                out.push(args.len() as u8);
                for arg in args {
                    arg.encode(out);
                }
            }
            Message::SessionSearch { game_id } => {
                out.extend_from_slice(&game_id.to_le_bytes());
            }
            Message::SessionNotice { game_id, session } => {
                out.extend_from_slice(&game_id.to_le_bytes());
                encode_session(out, session);
            }
        }
    }

    fn decode_payload(kind: MessageKind, r: &mut Reader) -> Result<Self, CodecError> {
        let message = match kind {
            MessageKind::Hello => Message::Hello {
                game_id: r.read_u64()?,
                online_id: r.read_u64()?,
            },
            MessageKind::Accept => Message::Accept {
                host_id: r.read_u32()?,
                session: decode_session(r)?,
            },
            MessageKind::Reject => Message::Reject {
                reason: RejectReason::try_from(r.read_u8()?)?,
            },
            MessageKind::Disconnect => Message::Disconnect,
            MessageKind::Kick => Message::Kick,
            MessageKind::Ack => Message::Ack,
            MessageKind::Ping => Message::Ping {
                timestamp_ms: r.read_u64()?,
            },
            MessageKind::Pong => Message::Pong {
                timestamp_ms: r.read_u64()?,
            },
            MessageKind::Spawn => Message::Spawn {
                net_id: r.read_u32()?,
                class: r.read_string()?,
                owner: r.read_u32()?,
            },
            MessageKind::Destroy => Message::Destroy {
                net_id: r.read_u32()?,
            },
            MessageKind::Update => {
                let net_id = r.read_u32()?;
                let count = r.read_u8()? as usize;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    fields.push(FieldUpdate {
                        index: r.read_u8()?,
                        version: r.read_u32()?,
                        value: NetValue::decode(r)?,
                    });
                }
                Message::Update { net_id, fields }
            }
            MessageKind::Rpc => {
                let net_id = r.read_u32()?;
                let func = r.read_u8()?;
                let count = r.read_u8()? as usize;
                if count > crate::rpc::MAX_RPC_PARAMS {
                    return Err(CodecError::TooManyParams(count));
                }
                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(NetValue::decode(r)?);
                }
                Message::Rpc { net_id, func, args }
            }
            MessageKind::SessionSearch => Message::SessionSearch {
                game_id: r.read_u64()?,
            },
            MessageKind::SessionNotice => Message::SessionNotice {
                game_id: r.read_u64()?,
                session: decode_session(r)?,
            },
        };
        Ok(message)
    }
}

fn encode_session(out: &mut Vec<u8>, session: &SessionInfo) {
    put_string(out, &session.name);
    out.push(session.max_players);
    out.push(session.player_count);
}

fn decode_session(r: &mut Reader) -> Result<SessionInfo, CodecError> {
    Ok(SessionInfo {
        name: r.read_string()?,
        max_players: r.read_u8()?,
        player_count: r.read_u8()?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u16,
    pub sequence: u32,
    pub ack: u32,
    pub ack_bits: u32,
}

impl MessageHeader {
    pub fn new(sequence: u32, ack: u32, ack_bits: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            ack,
            ack_bits,
        }
    }
}

/// A fully framed datagram: header, optional reliable sequence, one message.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub header: MessageHeader,
    pub reliable: Option<u32>,
    pub message: Message,
}

impl Datagram {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&PROTOCOL_MAGIC.to_le_bytes());
        out.extend_from_slice(&self.header.version.to_le_bytes());
        out.extend_from_slice(&self.header.sequence.to_le_bytes());
        out.extend_from_slice(&self.header.ack.to_le_bytes());
        out.extend_from_slice(&self.header.ack_bits.to_le_bytes());

        let kind = self.message.kind() as u8;
        match self.reliable {
            Some(seq) => {
                out.push(kind | RELIABLE_FLAG);
                out.extend_from_slice(&seq.to_le_bytes());
            }
            None => out.push(kind),
        }

        self.message.encode_payload(&mut out);

        if out.len() > MAX_DATAGRAM_SIZE {
            return Err(CodecError::Oversize(out.len()));
        }
        Ok(out)
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(buf);

        let magic = r.read_u32()?;
        if magic != PROTOCOL_MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let header = MessageHeader {
            version: r.read_u16()?,
            sequence: r.read_u32()?,
            ack: r.read_u32()?,
            ack_bits: r.read_u32()?,
        };

        let kind_byte = r.read_u8()?;
        let reliable = if kind_byte & RELIABLE_FLAG != 0 {
            Some(r.read_u32()?)
        } else {
            None
        };

        let kind = MessageKind::try_from(kind_byte & !RELIABLE_FLAG)?;
        let message = Message::decode_payload(kind, &mut r)?;

        if !r.is_empty() {
            return Err(CodecError::TrailingBytes(r.remaining()));
        }

        Ok(Self {
            header,
            reliable,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::NetValue;

    fn roundtrip(reliable: Option<u32>, message: Message) -> Datagram {
        let datagram = Datagram {
            header: MessageHeader::new(7, 3, 0b101),
            reliable,
            message,
        };
        let bytes = datagram.encode().unwrap();
        Datagram::decode(&bytes).unwrap()
    }

    #[test]
    fn test_hello_roundtrip() {
        let decoded = roundtrip(
            None,
            Message::Hello {
                game_id: 0xABCD,
                online_id: 42,
            },
        );
        assert_eq!(decoded.header.sequence, 7);
        assert_eq!(decoded.header.ack, 3);
        assert_eq!(decoded.reliable, None);
        assert!(matches!(
            decoded.message,
            Message::Hello { game_id: 0xABCD, online_id: 42 }
        ));
    }

    #[test]
    fn test_reliable_flag_carries_sequence() {
        let decoded = roundtrip(
            Some(99),
            Message::Spawn {
                net_id: 5,
                class: "player".to_string(),
                owner: 2,
            },
        );
        assert_eq!(decoded.reliable, Some(99));
        match decoded.message {
            Message::Spawn {
                net_id,
                class,
                owner,
            } => {
                assert_eq!(net_id, 5);
                assert_eq!(class, "player");
                assert_eq!(owner, 2);
            }
            other => panic!("expected Spawn, got {other:?}"),
        }
    }

    #[test]
    fn test_update_roundtrip() {
        let fields = vec![
            FieldUpdate {
                index: 0,
                version: 12,
                value: NetValue::F32(3.5),
            },
            FieldUpdate {
                index: 2,
                version: 4,
                value: NetValue::String("torch".to_string()),
            },
        ];
        let decoded = roundtrip(
            None,
            Message::Update {
                net_id: 17,
                fields: fields.clone(),
            },
        );
        assert_eq!(
            decoded.message,
            Message::Update { net_id: 17, fields }
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let datagram = Datagram {
            header: MessageHeader::new(0, 0, 0),
            reliable: None,
            message: Message::Ack,
        };
        let mut bytes = datagram.encode().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(CodecError::BadMagic(_))
        ));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let datagram = Datagram {
            header: MessageHeader::new(0, 0, 0),
            reliable: None,
            message: Message::Ack,
        };
        let mut bytes = datagram.encode().unwrap();
        bytes[HEADER_SIZE - 1] = 0x7F;
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(CodecError::UnknownKind(0x7F))
        ));
    }

    #[test]
    fn test_oversize_message_refused() {
        let datagram = Datagram {
            header: MessageHeader::new(0, 0, 0),
            reliable: None,
            message: Message::Spawn {
                net_id: 1,
                class: "x".repeat(MAX_DATAGRAM_SIZE),
                owner: 0,
            },
        };
        assert!(matches!(
            datagram.encode(),
            Err(CodecError::Oversize(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let datagram = Datagram {
            header: MessageHeader::new(0, 0, 0),
            reliable: None,
            message: Message::Disconnect,
        };
        let mut bytes = datagram.encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(CodecError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_rpc_param_cap() {
        let args = vec![NetValue::I32(1); 9];
        let datagram = Datagram {
            header: MessageHeader::new(0, 0, 0),
            reliable: None,
            message: Message::Rpc {
                net_id: 1,
                func: 0,
                args,
            },
        };
        let bytes = datagram.encode().unwrap();
        assert!(matches!(
            Datagram::decode(&bytes),
            Err(CodecError::TooManyParams(9))
        ));
    }
}
