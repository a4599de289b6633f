//! Binary protocol wire types: header, opcodes, status codes, and the
//! request/response frame shapes the codec encodes and decodes.

pub mod header;
pub mod opcode;
pub mod status;

pub use header::{Header, HEADER_LEN, REQUEST_MAGIC, RESPONSE_MAGIC};
pub use opcode::OpCode;
pub use status::{Status, WireStatus};

use bytes::{Bytes, BytesMut};

/// A fully-formed request, ready to be sized and written.
///
/// Building one is intentionally a plain struct-literal-with-defaults
/// pattern (not a type-state builder) because every caller already knows
/// all its fields up front; the teacher's `ThriftMessage` construction is
/// similarly flat.
#[derive(Debug, Clone)]
pub struct RequestFrame {
    pub opcode: OpCode,
    pub opaque: u32,
    pub cas: u64,
    pub vbucket: u16,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl RequestFrame {
    pub fn new(opcode: OpCode, opaque: u32) -> Self {
        RequestFrame {
            opcode,
            opaque,
            cas: 0,
            vbucket: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_extras(mut self, extras: impl Into<Bytes>) -> Self {
        self.extras = extras.into();
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn is_quiet(&self) -> bool {
        self.opcode.is_quiet()
    }

    fn header(&self) -> Header {
        let total_body_len = (self.extras.len() + self.key.len() + self.value.len()) as u32;
        Header::request(
            self.opcode.into(),
            self.key.len() as u16,
            self.extras.len() as u8,
            total_body_len,
            self.opaque,
            self.cas,
        )
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.extras.len() + self.key.len() + self.value.len()
    }

    /// Single-allocation mode (SPEC_FULL.md §4.C.1): writes header, extras,
    /// key and value contiguously into the caller's buffer.
    pub fn write_contiguous(&self, buf: &mut BytesMut) {
        self.header().write_to(buf);
        buf.extend_from_slice(&self.extras);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.value);
    }

    /// Composite mode (SPEC_FULL.md §4.C.2): one small buffer for the
    /// header+extras, plus the key and value borrowed by reference as
    /// separate `Bytes` so the caller can write them vectored without
    /// copying. The returned slices are in wire order.
    pub fn to_composite_slices(&self) -> [Bytes; 3] {
        let mut head = BytesMut::with_capacity(HEADER_LEN + self.extras.len());
        self.header().write_to(&mut head);
        head.extend_from_slice(&self.extras);
        [head.freeze(), self.key.clone(), self.value.clone()]
    }
}

/// A response, populated incrementally by the parser state machine as each
/// segment (header, extras, key, value) becomes available.
#[derive(Debug, Clone, Default)]
pub struct ResponseFrame {
    pub opcode: u8,
    pub status: WireStatus,
    pub opaque: u32,
    pub cas: u64,
    pub flags: u32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

impl ResponseFrame {
    pub fn is_error(&self) -> bool {
        self.status.is_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_and_composite_encodings_agree_byte_for_byte() {
        let req = RequestFrame::new(OpCode::Set, 7)
            .with_extras(Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0, 0]))
            .with_key(Bytes::from_static(b"foo"))
            .with_value(Bytes::from_static(b"bar"))
            .with_cas(99);

        let mut contiguous = BytesMut::new();
        req.write_contiguous(&mut contiguous);

        let slices = req.to_composite_slices();
        let mut composite = BytesMut::new();
        for slice in &slices {
            composite.extend_from_slice(slice);
        }

        assert_eq!(contiguous.freeze(), composite.freeze());
        assert_eq!(req.encoded_len(), HEADER_LEN + 8 + 3 + 3);
    }
}
