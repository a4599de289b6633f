//! The per-connection in-flight FIFO (SPEC_FULL.md §4.D).
//!
//! Generalizes `volo-thrift`'s `tx_map`/`TxHashMap` (a `seq_id`-keyed,
//! sharded map) into a plain FIFO: the memcached protocol's per-connection
//! ordering guarantee makes positional correlation sufficient, so a
//! `VecDeque` replaces the map entirely.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::protocol::OpCode;

/// The decoded result delivered to a waiter.
#[derive(Debug, Clone, Default)]
pub struct PendingResult {
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub cas: u64,
    pub flags: u32,
    pub status: u16,
    pub is_error: bool,
    /// Populated only for `Stat`: every `(name, value)` pair collected
    /// across the multi-frame sequence (SPEC_FULL.md §4.C "Done").
    pub stats: Vec<(Bytes, Bytes)>,
}

impl PendingResult {
    pub fn empty_success() -> Self {
        PendingResult::default()
    }

    pub fn error(status: u16) -> Self {
        PendingResult {
            status,
            is_error: true,
            ..Default::default()
        }
    }
}

/// One entry in a connection's in-flight FIFO.
///
/// `completion` is taken exactly once; `disposed` guards against the
/// decoder and a timed-out caller racing to complete the same request
/// (SPEC_FULL.md "disposed flag ensures at-most-once completion").
pub struct PendingRequest {
    opcode: OpCode,
    opaque: u32,
    quiet: bool,
    completion: Mutex<Option<oneshot::Sender<PendingResult>>>,
    disposed: AtomicBool,
    stat_accumulator: Mutex<Vec<(Bytes, Bytes)>>,
}

impl PendingRequest {
    pub fn new(opcode: OpCode, opaque: u32) -> (Arc<Self>, oneshot::Receiver<PendingResult>) {
        let (tx, rx) = oneshot::channel();
        let quiet = opcode.is_quiet();
        let pending = Arc::new(PendingRequest {
            opcode,
            opaque,
            quiet,
            completion: Mutex::new(Some(tx)),
            disposed: AtomicBool::new(false),
            stat_accumulator: Mutex::new(Vec::new()),
        });
        (pending, rx)
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Appends one `(name, value)` pair to the `Stat` accumulator without
    /// completing the request; call `complete` on the terminating frame.
    pub fn accumulate_stat(&self, name: Bytes, value: Bytes) {
        self.stat_accumulator.lock().push((name, value));
    }

    /// Completes this request at most once. Later calls (a duplicate
    /// decoder signal racing a caller timeout) are silently dropped.
    pub fn complete(&self, mut result: PendingResult) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.opcode.is_multi_frame() {
            result.stats = std::mem::take(&mut self.stat_accumulator.lock());
        }
        if let Some(tx) = self.completion.lock().take() {
            let _ = tx.send(result);
        }
    }

    pub fn complete_error(&self, status: u16) {
        self.complete(PendingResult::error(status));
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// FIFO of pending requests for one connection. Single-producer (the
/// writer) pushes; single-consumer (the decoder) pops/peeks — still
/// `Mutex`-guarded because a timed-out caller can also pop/fail entries.
#[derive(Default)]
pub struct InFlight {
    queue: Mutex<VecDeque<Arc<PendingRequest>>>,
}

impl InFlight {
    pub fn new() -> Self {
        InFlight::default()
    }

    pub fn push(&self, request: Arc<PendingRequest>) {
        self.queue.lock().push_back(request);
    }

    pub fn peek_front(&self) -> Option<Arc<PendingRequest>> {
        self.queue.lock().front().cloned()
    }

    pub fn pop_front(&self) -> Option<Arc<PendingRequest>> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drains the FIFO, completing every entry with an error. Called when
    /// the connection is discarded (framing error, transport error,
    /// response timeout) so no waiter hangs forever (SPEC_FULL.md §5
    /// "Cancellation and timeouts").
    pub fn fail_all(&self) {
        let drained: Vec<_> = self.queue.lock().drain(..).collect();
        for pending in drained {
            pending.complete_error(u16::MAX);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_exactly_once() {
        let (pending, rx) = PendingRequest::new(OpCode::Get, 1);
        pending.complete(PendingResult::empty_success());
        pending.complete_error(0x0001); // dropped, already disposed
        let result = rx.await.unwrap();
        assert!(!result.is_error);
    }

    #[tokio::test]
    async fn fail_all_completes_every_waiter_with_error() {
        let inflight = InFlight::new();
        let (p1, rx1) = PendingRequest::new(OpCode::Get, 1);
        let (p2, rx2) = PendingRequest::new(OpCode::Set, 2);
        inflight.push(p1);
        inflight.push(p2);

        inflight.fail_all();

        assert!(rx1.await.unwrap().is_error);
        assert!(rx2.await.unwrap().is_error);
        assert!(inflight.is_empty());
    }

    #[test]
    fn fifo_order_is_preserved() {
        let inflight = InFlight::new();
        let (p1, _rx1) = PendingRequest::new(OpCode::Get, 1);
        let (p2, _rx2) = PendingRequest::new(OpCode::Get, 2);
        inflight.push(p1);
        inflight.push(p2);

        assert_eq!(inflight.pop_front().unwrap().opaque(), 1);
        assert_eq!(inflight.pop_front().unwrap().opaque(), 2);
    }
}
