//! Typed values carried by property updates and RPC parameters.
//!
//! Each value is framed as `[u8 kind tag][payload]`. Integers and floats are
//! 4-byte little-endian, strings and asset names are length-prefixed UTF-8,
//! vectors are consecutive floats. Decoding never coerces: a tag that does
//! not match the expected kind fails the whole message.

use glam::{Vec2, Vec3, Vec4};

use crate::message::{CodecError, Reader, put_string};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetValueKind {
    I32 = 0,
    F32 = 1,
    Bool = 2,
    String = 3,
    Vec2 = 4,
    Vec3 = 5,
    Vec4 = 6,
    /// A reference to a named asset or object, resolved through the
    /// receiver's registry.
    Asset = 7,
}

impl TryFrom<u8> for NetValueKind {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(NetValueKind::I32),
            1 => Ok(NetValueKind::F32),
            2 => Ok(NetValueKind::Bool),
            3 => Ok(NetValueKind::String),
            4 => Ok(NetValueKind::Vec2),
            5 => Ok(NetValueKind::Vec3),
            6 => Ok(NetValueKind::Vec4),
            7 => Ok(NetValueKind::Asset),
            other => Err(CodecError::UnknownValueKind(other)),
        }
    }
}

impl NetValueKind {
    /// The zero value a freshly declared field of this kind starts with.
    pub fn default_value(&self) -> NetValue {
        match self {
            NetValueKind::I32 => NetValue::I32(0),
            NetValueKind::F32 => NetValue::F32(0.0),
            NetValueKind::Bool => NetValue::Bool(false),
            NetValueKind::String => NetValue::String(String::new()),
            NetValueKind::Vec2 => NetValue::Vec2(Vec2::ZERO),
            NetValueKind::Vec3 => NetValue::Vec3(Vec3::ZERO),
            NetValueKind::Vec4 => NetValue::Vec4(Vec4::ZERO),
            NetValueKind::Asset => NetValue::Asset(String::new()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetValue {
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Asset(String),
}

impl NetValue {
    pub fn kind(&self) -> NetValueKind {
        match self {
            NetValue::I32(_) => NetValueKind::I32,
            NetValue::F32(_) => NetValueKind::F32,
            NetValue::Bool(_) => NetValueKind::Bool,
            NetValue::String(_) => NetValueKind::String,
            NetValue::Vec2(_) => NetValueKind::Vec2,
            NetValue::Vec3(_) => NetValueKind::Vec3,
            NetValue::Vec4(_) => NetValueKind::Vec4,
            NetValue::Asset(_) => NetValueKind::Asset,
        }
    }

    /// Encoded size including the kind tag, used by the replication engine
    /// to fit updates into its byte budget before committing to an encode.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            NetValue::I32(_) | NetValue::F32(_) => 4,
            NetValue::Bool(_) => 1,
            NetValue::String(s) | NetValue::Asset(s) => 4 + s.len(),
            NetValue::Vec2(_) => 8,
            NetValue::Vec3(_) => 12,
            NetValue::Vec4(_) => 16,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kind() as u8);
        match self {
            NetValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            NetValue::F32(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            NetValue::Bool(v) => out.push(*v as u8),
            NetValue::String(s) | NetValue::Asset(s) => put_string(out, s),
            NetValue::Vec2(v) => {
                for f in v.to_array() {
                    out.extend_from_slice(&f.to_bits().to_le_bytes());
                }
            }
            NetValue::Vec3(v) => {
                for f in v.to_array() {
                    out.extend_from_slice(&f.to_bits().to_le_bytes());
                }
            }
            NetValue::Vec4(v) => {
                for f in v.to_array() {
                    out.extend_from_slice(&f.to_bits().to_le_bytes());
                }
            }
        }
    }

    pub fn decode(r: &mut Reader) -> Result<Self, CodecError> {
        let kind = NetValueKind::try_from(r.read_u8()?)?;
        Self::decode_body(kind, r)
    }

    /// Decode a value whose kind is dictated by a schema. The wire tag must
    /// match; mismatches fail rather than coerce so protocol skew surfaces
    /// at the first bad field.
    pub fn decode_expected(kind: NetValueKind, r: &mut Reader) -> Result<Self, CodecError> {
        let got = NetValueKind::try_from(r.read_u8()?)?;
        if got != kind {
            return Err(CodecError::KindMismatch {
                expected: kind,
                got,
            });
        }
        Self::decode_body(kind, r)
    }

    fn decode_body(kind: NetValueKind, r: &mut Reader) -> Result<Self, CodecError> {
        let value = match kind {
            NetValueKind::I32 => NetValue::I32(r.read_i32()?),
            NetValueKind::F32 => NetValue::F32(r.read_f32()?),
            NetValueKind::Bool => NetValue::Bool(r.read_u8()? != 0),
            NetValueKind::String => NetValue::String(r.read_string()?),
            NetValueKind::Asset => NetValue::Asset(r.read_string()?),
            NetValueKind::Vec2 => NetValue::Vec2(Vec2::new(r.read_f32()?, r.read_f32()?)),
            NetValueKind::Vec3 => {
                NetValue::Vec3(Vec3::new(r.read_f32()?, r.read_f32()?, r.read_f32()?))
            }
            NetValueKind::Vec4 => NetValue::Vec4(Vec4::new(
                r.read_f32()?,
                r.read_f32()?,
                r.read_f32()?,
                r.read_f32()?,
            )),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: NetValue) {
        let mut buf = Vec::new();
        value.encode(&mut buf);
        assert_eq!(buf.len(), value.encoded_len());

        let mut r = Reader::new(&buf);
        let decoded = NetValue::decode(&mut r).unwrap();
        assert_eq!(decoded, value);
        assert!(r.is_empty());
    }

    #[test]
    fn test_scalar_roundtrips() {
        roundtrip(NetValue::I32(-12345));
        roundtrip(NetValue::F32(3.75));
        roundtrip(NetValue::Bool(true));
        roundtrip(NetValue::String("hello".to_string()));
        roundtrip(NetValue::Asset("SM_Torch".to_string()));
    }

    #[test]
    fn test_vector_roundtrips() {
        roundtrip(NetValue::Vec2(Vec2::new(1.0, -2.0)));
        roundtrip(NetValue::Vec3(Vec3::new(0.5, 10.0, -3.25)));
        roundtrip(NetValue::Vec4(Vec4::new(1.0, 2.0, 3.0, 4.0)));
    }

    #[test]
    fn test_expected_kind_mismatch_fails() {
        let mut buf = Vec::new();
        NetValue::I32(7).encode(&mut buf);

        let mut r = Reader::new(&buf);
        let err = NetValue::decode_expected(NetValueKind::F32, &mut r).unwrap_err();
        assert_eq!(
            err,
            CodecError::KindMismatch {
                expected: NetValueKind::F32,
                got: NetValueKind::I32,
            }
        );
    }

    #[test]
    fn test_truncated_string_fails() {
        let mut buf = Vec::new();
        NetValue::String("abcdef".to_string()).encode(&mut buf);
        buf.truncate(buf.len() - 2);

        let mut r = Reader::new(&buf);
        assert_eq!(NetValue::decode(&mut r), Err(CodecError::Truncated));
    }

    #[test]
    fn test_unknown_tag_fails() {
        let mut r = Reader::new(&[200u8, 0, 0, 0, 0]);
        assert_eq!(
            NetValue::decode(&mut r),
            Err(CodecError::UnknownValueKind(200))
        );
    }
}
