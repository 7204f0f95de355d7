//! Serde helpers for byte-string keys and values
//!
//! Keys and values are arbitrary bytes. Binary formats store them as byte
//! strings instead of sequences of integers; JSON still sees number arrays.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_bytes::{ByteBuf, Bytes as ByteStr};

/// `#[serde(with = "byte_string")]` for a [`Bytes`] field
pub mod byte_string {
    use super::*;

    /// Write the bytes as a single byte string
    pub fn serialize<S: Serializer>(val: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        ByteStr::new(val).serialize(serializer)
    }

    /// Read a byte string, or a sequence of integers from self-describing formats
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        ByteBuf::deserialize(deserializer).map(|buf| Bytes::from(buf.into_vec()))
    }
}

/// `#[serde(with = "byte_strings")]` for a `Vec<Bytes>` field
pub mod byte_strings {
    use super::*;

    /// Write the list as a sequence of byte strings
    pub fn serialize<S: Serializer>(vals: &[Bytes], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(vals.iter().map(|b| ByteStr::new(b)))
    }

    /// Read a sequence of byte strings
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Bytes>, D::Error> {
        let bufs = Vec::<ByteBuf>::deserialize(deserializer)?;
        Ok(bufs.into_iter().map(|b| Bytes::from(b.into_vec())).collect())
    }
}
