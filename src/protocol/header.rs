//! The 24-byte header shared by requests and responses (SPEC_FULL.md §4.C).

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 24;
pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;

/// A parsed 24-byte header. The sixth/seventh bytes are `vbucket` on
/// requests and `status` on responses; both are carried in `vbucket_or_status`
/// and interpreted by the caller according to which magic was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub fn request(opcode: u8, key_len: u16, extras_len: u8, total_body_len: u32, opaque: u32, cas: u64) -> Self {
        Header {
            magic: REQUEST_MAGIC,
            opcode,
            key_len,
            extras_len,
            data_type: 0,
            vbucket_or_status: 0,
            total_body_len,
            opaque,
            cas,
        }
    }

    pub fn status(&self) -> u16 {
        self.vbucket_or_status
    }

    /// `V = totalBodyLength - keyLength - extrasLength`; negative is a
    /// framing error (SPEC_FULL.md §4.C invariant).
    pub fn value_len(&self) -> Result<u32> {
        let consumed = self.key_len as u32 + self.extras_len as u32;
        self.total_body_len
            .checked_sub(consumed)
            .ok_or_else(|| Error::Framing(format!(
                "total body length {} shorter than key+extras {}",
                self.total_body_len, consumed
            )))
    }

    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_len);
        buf.put_u8(self.extras_len);
        buf.put_u8(self.data_type);
        buf.put_u16(self.vbucket_or_status);
        buf.put_u32(self.total_body_len);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    /// Parses a header from the front of `buf`, advancing it past the 24
    /// bytes consumed. Callers must check `buf.len() >= HEADER_LEN` first.
    pub fn read_from(buf: &mut impl Buf) -> Result<Header> {
        let magic = buf.get_u8();
        let opcode = buf.get_u8();
        let key_len = buf.get_u16();
        let extras_len = buf.get_u8();
        let data_type = buf.get_u8();
        let vbucket_or_status = buf.get_u16();
        let total_body_len = buf.get_u32();
        let opaque = buf.get_u32();
        let cas = buf.get_u64();

        if magic != RESPONSE_MAGIC {
            return Err(Error::Framing(format!("bad response magic {magic:#x}")));
        }

        Ok(Header {
            magic,
            opcode,
            key_len,
            extras_len,
            data_type,
            vbucket_or_status,
            total_body_len,
            opaque,
            cas,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_request_header() {
        let header = Header::request(0x01, 3, 8, 11, 0xdead_beef, 42);
        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);

        // write_to always sets magic=REQUEST_MAGIC; flip it to RESPONSE_MAGIC
        // so read_from (which only accepts responses) can parse it back.
        buf[0] = RESPONSE_MAGIC;
        let mut frozen = buf.freeze();
        let parsed = Header::read_from(&mut frozen).unwrap();
        assert_eq!(parsed.opcode, 0x01);
        assert_eq!(parsed.key_len, 3);
        assert_eq!(parsed.extras_len, 8);
        assert_eq!(parsed.total_body_len, 11);
        assert_eq!(parsed.opaque, 0xdead_beef);
        assert_eq!(parsed.cas, 42);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = BytesMut::new();
        buf.put_u8(0x00);
        buf.resize(HEADER_LEN, 0);
        let mut frozen = buf.freeze();
        assert!(Header::read_from(&mut frozen).is_err());
    }

    #[test]
    fn value_len_detects_short_body() {
        let header = Header {
            magic: RESPONSE_MAGIC,
            opcode: 0,
            key_len: 10,
            extras_len: 4,
            data_type: 0,
            vbucket_or_status: 0,
            total_body_len: 5,
            opaque: 0,
            cas: 0,
        };
        assert!(header.value_len().is_err());
    }
}
