//! Value (de)serialization boundary (SPEC_FULL.md §6 "Value codec"): a
//! bidirectional mapping between an application value and `(flags, bytes)`.
//! A full serialization framework is explicitly out of scope (SPEC_FULL.md
//! §1); this crate only defines the trait boundary and a byte-identity
//! default implementation.

use bytes::Bytes;

use crate::error::Result;

pub trait ValueCodec<V>: Send + Sync {
    fn encode(&self, value: &V) -> (u32, Bytes);
    fn decode(&self, flags: u32, bytes: Bytes) -> Result<V>;
}

/// The identity codec: flags are always `0`, and the value is the raw
/// byte string untouched. Suitable when callers want to manage their own
/// serialization above this crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl ValueCodec<Bytes> for RawCodec {
    fn encode(&self, value: &Bytes) -> (u32, Bytes) {
        (0, value.clone())
    }

    fn decode(&self, _flags: u32, bytes: Bytes) -> Result<Bytes> {
        Ok(bytes)
    }
}

impl ValueCodec<Vec<u8>> for RawCodec {
    fn encode(&self, value: &Vec<u8>) -> (u32, Bytes) {
        (0, Bytes::copy_from_slice(value))
    }

    fn decode(&self, _flags: u32, bytes: Bytes) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_codec_round_trips_bytes() {
        let codec = RawCodec;
        let (flags, encoded) = ValueCodec::<Bytes>::encode(&codec, &Bytes::from_static(b"hello"));
        assert_eq!(flags, 0);
        let decoded = ValueCodec::<Bytes>::decode(&codec, flags, encoded).unwrap();
        assert_eq!(decoded, Bytes::from_static(b"hello"));
    }
}
