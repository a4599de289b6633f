//! Memcached binary-protocol response status codes.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Status {
    NoError = 0x0000,
    KeyNotFound = 0x0001,
    KeyExists = 0x0002,
    ValueTooLarge = 0x0003,
    InvalidArguments = 0x0004,
    ItemNotStored = 0x0005,
    NonNumericValue = 0x0006,
    UnknownCommand = 0x0081,
    OutOfMemory = 0x0082,
}

impl Status {
    pub fn is_error(self) -> bool {
        !matches!(self, Status::NoError)
    }
}

/// A status word that arrived on the wire but is not one this crate
/// recognizes; kept as a raw value rather than dropped, so callers can at
/// least see that *something* went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireStatus {
    Known(Status),
    Unknown(u16),
}

impl Default for WireStatus {
    fn default() -> Self {
        WireStatus::Known(Status::NoError)
    }
}

impl WireStatus {
    pub fn from_u16(raw: u16) -> Self {
        match Status::try_from(raw) {
            Ok(status) => WireStatus::Known(status),
            Err(_) => WireStatus::Unknown(raw),
        }
    }

    pub fn is_error(self) -> bool {
        match self {
            WireStatus::Known(status) => status.is_error(),
            WireStatus::Unknown(raw) => raw != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_error_is_not_an_error() {
        assert!(!Status::NoError.is_error());
        assert!(Status::KeyNotFound.is_error());
    }

    #[test]
    fn unrecognized_status_is_preserved_as_raw() {
        let wire = WireStatus::from_u16(0x00ff);
        assert_eq!(wire, WireStatus::Unknown(0x00ff));
        assert!(wire.is_error());
    }
}
