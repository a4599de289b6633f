use std::{io, net::SocketAddr};

/// Crate-wide result alias, mirroring the teacher's `volo_thrift::error::Result`.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error taxonomy for the codec, pool, dispatcher and health monitor.
///
/// The public façade (`crate::client::Client`) never lets these escape; it
/// collapses the recoverable kinds into "nothing happened" return values
/// per SPEC_FULL.md §7 and only logs the detail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("pool exhausted for {0}: borrow timed out with no idle connection")]
    PoolExhausted(SocketAddr),

    #[error("no valid object for {0}: every candidate failed validation")]
    NoValidObject(SocketAddr),

    #[error("timeout waiting on {0}")]
    Timeout(&'static str),

    #[error("operation was cancelled")]
    Interrupted,

    #[error("framing error: {0}")]
    Framing(String),

    #[error("protocol mismatch: expected opcode {expected:?}, got {got:?}")]
    ProtocolMismatch { expected: u8, got: u8 },

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("server list is empty")]
    EmptyRing,
}

impl Error {
    /// Recoverable kinds per SPEC_FULL.md §7: single-key callers swallow
    /// these into a "nothing happened" value instead of propagating them.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::PoolExhausted(_) | Error::Interrupted | Error::Transport(_)
        )
    }

    /// Fatal for the connection only (§7): other connections to the same
    /// server are unaffected.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::Framing(_) | Error::ProtocolMismatch { .. })
    }
}
