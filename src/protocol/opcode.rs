//! Memcached binary-protocol opcodes.
//!
//! Wire values come from the memcached binary protocol spec, not the
//! teacher; the `num_enum` derive style (fallible `TryFrom<u8>`, infallible
//! `From<OpCode> for u8`) mirrors how `volo-thrift` derives its wire enums.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
    Verbosity = 0x1b,
    Touch = 0x1c,
    GAT = 0x1d,
    GATQ = 0x1e,
    SASLListMechs = 0x20,
    SASLAuth = 0x21,
    SASLStep = 0x22,
    GetsQ = 0x33,
    Gets = 0x34,
}

impl OpCode {
    /// Quiet (no-reply-on-success) opcodes per SPEC_FULL.md §4.C/§6.
    pub fn is_quiet(self) -> bool {
        matches!(
            self,
            OpCode::GetQ
                | OpCode::GetKQ
                | OpCode::GetsQ
                | OpCode::SetQ
                | OpCode::AddQ
                | OpCode::ReplaceQ
                | OpCode::DeleteQ
                | OpCode::IncrementQ
                | OpCode::DecrementQ
                | OpCode::QuitQ
                | OpCode::FlushQ
                | OpCode::AppendQ
                | OpCode::PrependQ
                | OpCode::GATQ
        )
    }

    /// `Stat` is the only multi-frame command: it completes on the frame
    /// with an empty key, not on the first frame (SPEC_FULL.md §4.C "Done").
    pub fn is_multi_frame(self) -> bool {
        matches!(self, OpCode::Stat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_u8() {
        let byte: u8 = OpCode::GetKQ.into();
        assert_eq!(byte, 0x0d);
        assert_eq!(OpCode::try_from(byte).unwrap(), OpCode::GetKQ);
    }

    #[test]
    fn quiet_classification_matches_spec_table() {
        assert!(OpCode::SetQ.is_quiet());
        assert!(!OpCode::Set.is_quiet());
        assert!(!OpCode::Stat.is_quiet());
        assert!(OpCode::Stat.is_multi_frame());
    }

    #[test]
    fn unknown_opcode_byte_is_rejected() {
        assert!(OpCode::try_from(0xffu8).is_err());
    }
}
