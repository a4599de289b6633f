//! Request encoding and response decoding for one connection.
//!
//! Grounded on `volo-thrift/src/codec/default/framed.rs` (the
//! `decode`/mark-and-rewind shape) and
//! `volo-thrift/src/transport/multiplex/thrift_transport.rs` (the
//! read-loop/write-loop split around a per-connection FIFO).

pub mod inflight;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::{Header, OpCode, RequestFrame, ResponseFrame, WireStatus, HEADER_LEN};
use inflight::{InFlight, PendingResult};

/// Batches at or under this size are written from one contiguous
/// allocation; larger batches use the composite (borrowed-slice) path
/// (SPEC_FULL.md §4.C).
pub const SINGLE_ALLOC_THRESHOLD: usize = 1024 * 1024;

pub enum EncodedBatch {
    Contiguous(Bytes),
    Composite(Vec<Bytes>),
}

pub fn encode_batch(frames: &[RequestFrame]) -> EncodedBatch {
    let total: usize = frames.iter().map(RequestFrame::encoded_len).sum();
    if total <= SINGLE_ALLOC_THRESHOLD {
        let mut buf = BytesMut::with_capacity(total);
        for frame in frames {
            frame.write_contiguous(&mut buf);
        }
        EncodedBatch::Contiguous(buf.freeze())
    } else {
        let mut slices = Vec::with_capacity(frames.len() * 3);
        for frame in frames {
            slices.extend(frame.to_composite_slices());
        }
        EncodedBatch::Composite(slices)
    }
}

/// Writes a batch to `writer`. Composite mode avoids copying key/value
/// bytes into a shared buffer (each `Bytes` is a refcounted view), issuing
/// one `write_all` per segment rather than a single contiguous write.
pub async fn write_batch<W: AsyncWrite + Unpin>(writer: &mut W, batch: &EncodedBatch) -> Result<()> {
    match batch {
        EncodedBatch::Contiguous(bytes) => writer.write_all(bytes).await.map_err(Error::from)?,
        EncodedBatch::Composite(slices) => {
            for slice in slices {
                if !slice.is_empty() {
                    writer.write_all(slice).await.map_err(Error::from)?;
                }
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum DecoderState {
    Idle,
    HaveHeader(Header),
}

/// Streaming response parser for one connection.
///
/// States per SPEC_FULL.md §4.C: `None -> ReadHeader -> ReadExtras ->
/// ReadKey -> ReadValue -> Done`, plus the transient `NoReply`. Here
/// `ReadHeader` through `ReadValue` collapse into one step once a full
/// frame's bytes are available (`buf` already holds any bytes the caller
/// hasn't consumed, so there's nothing to gain from decoding one field at
/// a time); what the state machine actually needs to survive suspension is
/// the already-parsed header, which `HaveHeader` caches so a short read
/// doesn't force re-parsing it.
#[derive(Default)]
pub struct FrameDecoder {
    state_cache: Option<Header>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    /// Parses and dispatches as many complete frames as `buf` currently
    /// holds, advancing it past each one and signalling its `InFlight`
    /// waiter. Returns `Ok(())` once `buf` has too few bytes to make
    /// further progress, leaving any cached header and the unconsumed
    /// bytes in place for the next call.
    pub fn decode(&mut self, buf: &mut BytesMut, inflight: &InFlight) -> Result<()> {
        loop {
            let state = self
                .state_cache
                .map(DecoderState::HaveHeader)
                .unwrap_or(DecoderState::Idle);

            let header = match state {
                DecoderState::Idle => {
                    if buf.len() < HEADER_LEN {
                        return Ok(());
                    }
                    let mut peek = &buf[..HEADER_LEN];
                    let header = Header::read_from(&mut peek)?;
                    self.state_cache = Some(header);
                    header
                }
                DecoderState::HaveHeader(header) => header,
            };

            let value_len = header.value_len()? as usize;
            let body_len = header.extras_len as usize + header.key_len as usize + value_len;
            if buf.len() < HEADER_LEN + body_len {
                return Ok(());
            }

            let head = inflight
                .peek_front()
                .ok_or_else(|| Error::Framing("response arrived with no pending request".into()))?;

            let wire_opcode = OpCode::try_from(header.opcode).ok();
            let opcode_matches = wire_opcode == Some(head.opcode());
            let opaque_matches = header.opaque == head.opaque();

            if !opcode_matches && !head.is_quiet() {
                return Err(Error::ProtocolMismatch {
                    expected: head.opcode().into(),
                    got: header.opcode,
                });
            }

            let no_reply = head.is_quiet() && (!opcode_matches || !opaque_matches);
            if no_reply {
                // The frame in `buf` belongs to the next FIFO entry, not
                // this one: rewind (we never consumed it) and retry.
                inflight.pop_front();
                head.complete(PendingResult::empty_success());
                self.state_cache = None;
                continue;
            }

            buf.advance(HEADER_LEN);
            let extras = buf.split_to(header.extras_len as usize).freeze();
            let key = buf.split_to(header.key_len as usize).freeze();
            let value = buf.split_to(value_len).freeze();
            self.state_cache = None;

            let status = WireStatus::from_u16(header.status());
            let flags = if extras.len() == 4 {
                u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]])
            } else {
                0
            };
            let key = if key.is_empty() { None } else { Some(key) };
            let value = if status.is_error() || value.is_empty() {
                None
            } else {
                Some(value)
            };

            if head.opcode().is_multi_frame() {
                match &key {
                    // Terminator frame: empty key ends the sequence.
                    None => {
                        inflight.pop_front();
                        head.complete(PendingResult {
                            status: header.status(),
                            is_error: status.is_error(),
                            ..Default::default()
                        });
                    }
                    Some(name) => {
                        head.accumulate_stat(name.clone(), value.clone().unwrap_or_default());
                    }
                }
            } else {
                inflight.pop_front();
                head.complete(PendingResult {
                    key,
                    value,
                    cas: header.cas,
                    flags,
                    status: header.status(),
                    is_error: status.is_error(),
                    stats: Vec::new(),
                });
            }
        }
    }
}

/// Builds a `ResponseFrame` view out of a just-completed `PendingResult`;
/// used by callers that want the typed frame shape rather than the raw
/// correlator payload (SPEC_FULL.md §3 "Response frame").
pub fn response_frame_from(opcode: u8, result: &PendingResult) -> ResponseFrame {
    ResponseFrame {
        opcode,
        status: WireStatus::from_u16(result.status),
        opaque: 0,
        cas: result.cas,
        flags: result.flags,
        key: result.key.clone(),
        value: result.value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::inflight::PendingRequest;
    use crate::protocol::{Header, RESPONSE_MAGIC};

    fn push_response(buf: &mut BytesMut, opcode: u8, opaque: u32, status: u16, key: &[u8], value: &[u8]) {
        let header = Header {
            magic: RESPONSE_MAGIC,
            opcode,
            key_len: key.len() as u16,
            extras_len: 0,
            data_type: 0,
            vbucket_or_status: status,
            total_body_len: (key.len() + value.len()) as u32,
            opaque,
            cas: 0,
        };
        header.write_to(buf);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
    }

    #[tokio::test]
    async fn decodes_a_single_response_and_signals_its_waiter() {
        let inflight = InFlight::new();
        let (pending, rx) = PendingRequest::new(OpCode::Get, 42);
        inflight.push(pending);

        let mut buf = BytesMut::new();
        push_response(&mut buf, OpCode::Get.into(), 42, 0, b"", b"value");

        let mut decoder = FrameDecoder::new();
        decoder.decode(&mut buf, &inflight).unwrap();

        let result = rx.await.unwrap();
        assert!(!result.is_error);
        assert_eq!(result.value.unwrap(), Bytes::from_static(b"value"));
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn suspends_on_partial_header() {
        let inflight = InFlight::new();
        let (pending, _rx) = PendingRequest::new(OpCode::Get, 1);
        inflight.push(pending);

        let mut buf = BytesMut::new();
        push_response(&mut buf, OpCode::Get.into(), 1, 0, b"", b"value");
        let mut partial = buf.split_to(10);

        let mut decoder = FrameDecoder::new();
        decoder.decode(&mut partial, &inflight).unwrap();
        assert_eq!(inflight.len(), 1); // nothing signalled yet
    }

    #[tokio::test]
    async fn quiet_head_with_mismatched_opcode_completes_as_no_reply() {
        let inflight = InFlight::new();
        let (quiet, quiet_rx) = PendingRequest::new(OpCode::SetQ, 5);
        let (next, next_rx) = PendingRequest::new(OpCode::Get, 6);
        inflight.push(quiet);
        inflight.push(next);

        // Server never replies to the SetQ; this frame actually answers
        // the following Get.
        let mut buf = BytesMut::new();
        push_response(&mut buf, OpCode::Get.into(), 6, 0, b"", b"v");

        let mut decoder = FrameDecoder::new();
        decoder.decode(&mut buf, &inflight).unwrap();

        assert!(!quiet_rx.await.unwrap().is_error);
        assert!(!next_rx.await.unwrap().is_error);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn non_quiet_head_mismatch_is_a_fatal_protocol_error() {
        let inflight = InFlight::new();
        let (pending, _rx) = PendingRequest::new(OpCode::Get, 1);
        inflight.push(pending);

        let mut buf = BytesMut::new();
        push_response(&mut buf, OpCode::Set.into(), 1, 0, b"", b"");

        let mut decoder = FrameDecoder::new();
        let err = decoder.decode(&mut buf, &inflight).unwrap_err();
        assert!(matches!(err, Error::ProtocolMismatch { .. }));
    }

    #[tokio::test]
    async fn stat_sequence_completes_only_on_terminator() {
        let inflight = InFlight::new();
        let (pending, rx) = PendingRequest::new(OpCode::Stat, 9);
        inflight.push(pending);

        let mut buf = BytesMut::new();
        push_response(&mut buf, OpCode::Stat.into(), 9, 0, b"pid", b"123");
        push_response(&mut buf, OpCode::Stat.into(), 9, 0, b"uptime", b"42");
        push_response(&mut buf, OpCode::Stat.into(), 9, 0, b"", b"");

        let mut decoder = FrameDecoder::new();
        decoder.decode(&mut buf, &inflight).unwrap();

        let result = rx.await.unwrap();
        assert_eq!(result.stats.len(), 2);
        assert!(inflight.is_empty());
    }
}
