//! Binary codec.
//!
//! Goals:
//! - One leading marker byte tells the two value encodings apart.
//! - Self-describing types (`BinarySerializable`) write their own bytes and
//!   can be decoded in place, which is the polymorphic path for trait objects.
//! - Everything else goes through the generic serde path (postcard).
//!
//! Length prefixes written by the helpers at the bottom of this module are
//! little-endian `u32`.

use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

pub use bytes::Bytes;

use crate::math::{Pose, Quat, Vec3};

/// Marker byte of generically encoded values.
pub const MARKER_GENERIC: u8 = 0;
/// Marker byte of self-describing values.
pub const MARKER_SELF_DESCRIBING: u8 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of input: needed {needed} bytes, {remaining} left")]
    Eof { needed: usize, remaining: usize },
    #[error("type mismatch: expected marker {expected}, found {found}")]
    TypeMismatch { expected: u8, found: u8 },
    #[error("`{0}` is self-describing and has no generic encoding")]
    GenericUnsupported(&'static str),
    #[error("invalid utf-8 in string field")]
    Utf8,
    #[error("generic codec: {0}")]
    Generic(#[from] postcard::Error),
    #[error("{0}")]
    Invalid(String),
}

/// A value that writes and reads its own byte layout.
///
/// Decoding always happens into an existing instance: trait objects cannot be
/// created from bytes, but an existing `dyn BinarySerializable` of the right
/// concrete type can be overwritten.
pub trait BinarySerializable {
    fn write_to(&self, buf: &mut BytesMut);
    fn read_from(&mut self, buf: &mut Bytes) -> Result<(), CodecError>;
}

/// Marker-tagged value encoding used for fields and RPC arguments.
pub trait Codec: Sized {
    fn encode(&self, force_generic: bool) -> Result<Bytes, CodecError>;

    fn decode(data: &[u8]) -> Result<Self, CodecError>;

    /// Decodes over an existing value.
    fn decode_into(&mut self, data: &[u8]) -> Result<(), CodecError> {
        *self = Self::decode(data)?;
        Ok(())
    }
}

/// Serializes `value`. `force_generic` skips the self-describing path.
pub fn serialize<T: Codec>(value: &T, force_generic: bool) -> Result<Bytes, CodecError> {
    value.encode(force_generic)
}

/// Deserializes a fresh value.
pub fn deserialize<T: Codec>(data: &[u8]) -> Result<T, CodecError> {
    T::decode(data)
}

/// Deserializes over an existing value.
pub fn deserialize_into<T: Codec>(target: &mut T, data: &[u8]) -> Result<(), CodecError> {
    target.decode_into(data)
}

/// Serializes a self-describing value behind a trait object.
pub fn serialize_dyn(value: &dyn BinarySerializable) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(MARKER_SELF_DESCRIBING);
    value.write_to(&mut buf);
    buf.freeze()
}

/// Decodes self-describing bytes into an existing value of any concrete type.
pub fn deserialize_in_place(
    target: &mut dyn BinarySerializable,
    data: &[u8],
) -> Result<(), CodecError> {
    let mut buf = Bytes::copy_from_slice(data);
    expect_marker(&mut buf, MARKER_SELF_DESCRIBING)?;
    target.read_from(&mut buf)
}

pub fn encode_generic<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, CodecError> {
    let mut out = vec![MARKER_GENERIC];
    out.extend_from_slice(&postcard::to_stdvec(value)?);
    Ok(Bytes::from(out))
}

pub fn decode_generic<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
    let found = *data.first().ok_or(CodecError::Eof {
        needed: 1,
        remaining: 0,
    })?;
    if found != MARKER_GENERIC {
        return Err(CodecError::TypeMismatch {
            expected: MARKER_GENERIC,
            found,
        });
    }
    Ok(postcard::from_bytes(&data[1..])?)
}

pub fn encode_binary<T: BinarySerializable + ?Sized>(
    value: &T,
    force_generic: bool,
    type_name: &'static str,
) -> Result<Bytes, CodecError> {
    if force_generic {
        return Err(CodecError::GenericUnsupported(type_name));
    }
    let mut buf = BytesMut::new();
    buf.put_u8(MARKER_SELF_DESCRIBING);
    value.write_to(&mut buf);
    Ok(buf.freeze())
}

pub fn decode_binary_into<T: BinarySerializable>(
    target: &mut T,
    data: &[u8],
) -> Result<(), CodecError> {
    deserialize_in_place(target, data)
}

fn expect_marker(buf: &mut Bytes, expected: u8) -> Result<(), CodecError> {
    let found = take_u8(buf)?;
    if found != expected {
        return Err(CodecError::TypeMismatch { expected, found });
    }
    Ok(())
}

/// Implements `Codec` through the generic serde path.
#[macro_export]
macro_rules! generic_codec {
    ($($t:ty),* $(,)?) => {$(
        impl $crate::codec::Codec for $t {
            fn encode(&self, _force_generic: bool) -> Result<$crate::codec::Bytes, $crate::codec::CodecError> {
                $crate::codec::encode_generic(self)
            }

            fn decode(data: &[u8]) -> Result<Self, $crate::codec::CodecError> {
                $crate::codec::decode_generic(data)
            }
        }
    )*};
}

/// Implements `Codec` for `BinarySerializable + Default` types.
#[macro_export]
macro_rules! binary_codec {
    ($($t:ty),* $(,)?) => {$(
        impl $crate::codec::Codec for $t {
            fn encode(&self, force_generic: bool) -> Result<$crate::codec::Bytes, $crate::codec::CodecError> {
                $crate::codec::encode_binary(self, force_generic, stringify!($t))
            }

            fn decode(data: &[u8]) -> Result<Self, $crate::codec::CodecError> {
                let mut value = <$t as Default>::default();
                $crate::codec::decode_binary_into(&mut value, data)?;
                Ok(value)
            }

            fn decode_into(&mut self, data: &[u8]) -> Result<(), $crate::codec::CodecError> {
                $crate::codec::decode_binary_into(self, data)
            }
        }
    )*};
}

generic_codec!(
    bool, u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, char, String, (), Vec3, Quat, Pose
);

impl<T: Serialize + DeserializeOwned> Codec for Vec<T> {
    fn encode(&self, _force_generic: bool) -> Result<Bytes, CodecError> {
        encode_generic(self)
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        decode_generic(data)
    }
}

impl<T: Serialize + DeserializeOwned> Codec for Option<T> {
    fn encode(&self, _force_generic: bool) -> Result<Bytes, CodecError> {
        encode_generic(self)
    }

    fn decode(data: &[u8]) -> Result<Self, CodecError> {
        decode_generic(data)
    }
}

// ─── Buffer helpers ───

fn need(buf: &Bytes, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Eof {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn put_str(buf: &mut BytesMut, s: &str) {
    put_blob(buf, s.as_bytes());
}

pub fn put_blob(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32_le(b.len() as u32);
    buf.extend_from_slice(b);
}

pub fn put_vec3(buf: &mut BytesMut, v: Vec3) {
    buf.put_f32_le(v.x);
    buf.put_f32_le(v.y);
    buf.put_f32_le(v.z);
}

pub fn put_quat(buf: &mut BytesMut, q: Quat) {
    buf.put_f32_le(q.x);
    buf.put_f32_le(q.y);
    buf.put_f32_le(q.z);
    buf.put_f32_le(q.w);
}

pub fn take_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn take_bool(buf: &mut Bytes) -> Result<bool, CodecError> {
    Ok(take_u8(buf)? != 0)
}

pub fn take_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn take_i32(buf: &mut Bytes) -> Result<i32, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn take_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn take_f32(buf: &mut Bytes) -> Result<f32, CodecError> {
    need(buf, 4)?;
    Ok(buf.get_f32_le())
}

pub fn take_blob(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = take_u32(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}

pub fn take_str(buf: &mut Bytes) -> Result<String, CodecError> {
    let raw = take_blob(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Utf8)
}

pub fn take_vec3(buf: &mut Bytes) -> Result<Vec3, CodecError> {
    Ok(Vec3::new(take_f32(buf)?, take_f32(buf)?, take_f32(buf)?))
}

pub fn take_quat(buf: &mut Bytes) -> Result<Quat, CodecError> {
    Ok(Quat::new(
        take_f32(buf)?,
        take_f32(buf)?,
        take_f32(buf)?,
        take_f32(buf)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Health {
        current: u32,
        max: u32,
    }

    impl BinarySerializable for Health {
        fn write_to(&self, buf: &mut BytesMut) {
            buf.put_u32_le(self.current);
            buf.put_u32_le(self.max);
        }

        fn read_from(&mut self, buf: &mut Bytes) -> Result<(), CodecError> {
            self.current = take_u32(buf)?;
            self.max = take_u32(buf)?;
            Ok(())
        }
    }

    binary_codec!(Health);

    #[derive(Debug, Default, PartialEq)]
    struct Tag(String);

    impl BinarySerializable for Tag {
        fn write_to(&self, buf: &mut BytesMut) {
            put_str(buf, &self.0);
        }

        fn read_from(&mut self, buf: &mut Bytes) -> Result<(), CodecError> {
            self.0 = take_str(buf)?;
            Ok(())
        }
    }

    #[test]
    fn generic_values_roundtrip() {
        let bytes = serialize(&-42i32, false).unwrap();
        assert_eq!(bytes[0], MARKER_GENERIC);
        assert_eq!(deserialize::<i32>(&bytes).unwrap(), -42);

        let name = "crate".to_string();
        let back: String = deserialize(&serialize(&name, false).unwrap()).unwrap();
        assert_eq!(back, name);

        let v = Vec3::new(1.0, -2.5, 3.25);
        let back: Vec3 = deserialize(&serialize(&v, true).unwrap()).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn self_describing_roundtrip() {
        let h = Health {
            current: 40,
            max: 100,
        };
        let bytes = serialize(&h, false).unwrap();
        assert_eq!(bytes[0], MARKER_SELF_DESCRIBING);
        assert_eq!(deserialize::<Health>(&bytes).unwrap(), h);
    }

    #[test]
    fn marker_disagreement_is_a_type_mismatch() {
        let generic = serialize(&7u32, false).unwrap();
        assert!(matches!(
            deserialize::<Health>(&generic),
            Err(CodecError::TypeMismatch {
                expected: MARKER_SELF_DESCRIBING,
                found: MARKER_GENERIC
            })
        ));

        let binary = serialize(&Health::default(), false).unwrap();
        assert!(matches!(
            deserialize::<u64>(&binary),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn forcing_generic_on_self_describing_type_fails() {
        assert!(matches!(
            serialize(&Health::default(), true),
            Err(CodecError::GenericUnsupported(_))
        ));
    }

    #[test]
    fn in_place_decode_through_trait_object() {
        let src = Tag("lamp".into());
        let bytes = serialize_dyn(&src);

        let mut slot: Box<dyn BinarySerializable> = Box::new(Tag::default());
        deserialize_in_place(slot.as_mut(), &bytes).unwrap();

        let mut check = Tag::default();
        deserialize_in_place(&mut check, &bytes).unwrap();
        assert_eq!(check, src);
    }

    #[test]
    fn truncated_input_reports_eof() {
        let bytes = serialize(&Health { current: 1, max: 2 }, false).unwrap();
        assert!(matches!(
            deserialize::<Health>(&bytes[..5]),
            Err(CodecError::Eof { .. })
        ));
        assert!(matches!(deserialize::<u8>(&[]), Err(CodecError::Eof { .. })));
    }
}
