//! Shared bincode configuration.
//!
//! All binary encodings in the crate go through these options: fixed-width
//! big-endian integers, a hard size limit and rejection of trailing bytes.
//! The result is deterministic and every accepted input decodes to exactly
//! one value.
//!
//! Fixed-size byte strings (tagged keys, signatures) go through
//! [`fixed_array`] so they encode as bare tuples with no length prefix.

use bincode::Options;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Upper bound on any encoded value
pub const MAX_ENCODED_SIZE: u64 = 16 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_big_endian()
        .with_limit(MAX_ENCODED_SIZE)
        .reject_trailing_bytes()
}

/// Encode a value with the crate-wide options
pub fn encode<T: Serialize + ?Sized>(value: &T) -> bincode::Result<Vec<u8>> {
    options().serialize(value)
}

/// Decode a value, failing on truncation or trailing data
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> bincode::Result<T> {
    options().deserialize(bytes)
}

/// Serde adapter for `[u8; N]` of any length, encoded as an N-tuple
pub mod fixed_array {
    use super::{de, fmt, Deserializer, SeqAccess, SerializeTuple, Serializer, Visitor};

    /// Write the bytes as a tuple of N elements
    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(N)?;
        for byte in bytes {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }

    /// Read exactly N bytes
    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> std::result::Result<[u8; N], D::Error> {
        struct ArrayVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for ArrayVisitor<N> {
            type Value = [u8; N];

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "an array of {N} bytes")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
                let mut out = [0u8; N];
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                if seq.next_element::<u8>()?.is_some() {
                    return Err(de::Error::invalid_length(N + 1, &self));
                }
                Ok(out)
            }
        }

        deserializer.deserialize_tuple(N, ArrayVisitor::<N>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wide(#[serde(with = "fixed_array")] [u8; 40]);

    #[test]
    fn test_fixed_array_has_no_length_prefix() {
        let value = Wide([9u8; 40]);
        let bytes = encode(&value).unwrap();

        assert_eq!(bytes.len(), 40);
        assert_eq!(decode::<Wide>(&bytes).unwrap(), value);
        assert!(decode::<Wide>(&bytes[..39]).is_err());
    }

    #[test]
    fn test_fixed_array_json_length_checked() {
        let json = serde_json::to_string(&Wide([1u8; 40])).unwrap();
        assert_eq!(serde_json::from_str::<Wide>(&json).unwrap(), Wide([1u8; 40]));
        assert!(serde_json::from_str::<Wide>("[1,2,3]").is_err());
    }

    #[test]
    fn test_fixed_width_big_endian() {
        let bytes = encode(&0x0102_0304u32).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode(&7u32).unwrap();
        bytes.push(0);
        assert!(decode::<u32>(&bytes).is_err());
    }

    #[test]
    fn test_invalid_option_tag_rejected() {
        assert!(decode::<Option<u8>>(&[2, 0]).is_err());
    }
}
