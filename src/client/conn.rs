//! The pooled connection actor: a live TCP connection plus its in-flight
//! FIFO and background read loop.
//!
//! Grounded on `volo-thrift/src/transport/multiplex/thrift_transport.rs`'s
//! split between a write path owned by the caller and a spawned read loop
//! that demultiplexes responses; simplified because this crate's
//! connections are never shared concurrently (SPEC_FULL.md §5 "exclusively
//! owned by their current holder"), so there's no batch queue or condvar —
//! the holder writes directly through `&mut self`.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use bytes::BytesMut;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::Duration;
use tracing::{debug, error};

use crate::{
    codec::{encode_batch, inflight::{InFlight, PendingRequest, PendingResult}, write_batch, FrameDecoder},
    error::{Error, Result},
    net::{dial::DefaultMakeTransport, dial::MakeTransport, Server},
    pool::{ConnectionFactory, Poolable},
    protocol::{OpCode, RequestFrame},
};

const READ_BUF_CAPACITY: usize = 16 * 1024;

pub struct ManagedConn {
    server: Server,
    write_half: OwnedWriteHalf,
    inflight: Arc<InFlight>,
    dead: Arc<AtomicBool>,
    opaque_counter: AtomicU32,
    read_task: tokio::task::JoinHandle<()>,
}

/// Aborting the read loop drops its `OwnedReadHalf`; combined with
/// `write_half` dropping as an ordinary field, both halves of the split
/// `Arc<TcpStream>` release and the socket actually closes. Every disposal
/// path (`Pool::destroy`, the idle-eviction sweep, `Pooled::discard`/`Drop`,
/// the health monitor's probe connection) goes through this because each
/// one, eventually, just drops the `ManagedConn` value.
impl Drop for ManagedConn {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

impl ManagedConn {
    fn next_opaque(&self) -> u32 {
        self.opaque_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn server(&self) -> Server {
        self.server
    }

    pub fn new_opaque_frame(&self, opcode: OpCode) -> RequestFrame {
        RequestFrame::new(opcode, self.next_opaque())
    }

    /// Writes a batch, enqueuing each frame's correlator entry *before*
    /// the write completes (SPEC_FULL.md §4.C: "enqueue happens-before
    /// write completion"). On write failure or write timeout the
    /// connection is marked dead and every in-flight request fails.
    pub async fn send_batch(
        &mut self,
        frames: &[RequestFrame],
        write_timeout: Duration,
    ) -> Result<Vec<tokio::sync::oneshot::Receiver<PendingResult>>> {
        let mut receivers = Vec::with_capacity(frames.len());
        for frame in frames {
            let (pending, rx) = PendingRequest::new(frame.opcode, frame.opaque);
            self.inflight.push(pending);
            receivers.push(rx);
        }

        let batch = encode_batch(frames);
        let write_result = tokio::time::timeout(write_timeout, write_batch(&mut self.write_half, &batch)).await;
        match write_result {
            Ok(Ok(())) => Ok(receivers),
            Ok(Err(err)) => {
                self.dead.store(true, Ordering::Release);
                self.inflight.fail_all();
                Err(err)
            }
            Err(_) => {
                self.dead.store(true, Ordering::Release);
                self.inflight.fail_all();
                Err(Error::Timeout("write"))
            }
        }
    }

    pub async fn send_one(&mut self, frame: RequestFrame, write_timeout: Duration, response_timeout: Duration) -> Result<PendingResult> {
        let mut receivers = self.send_batch(std::slice::from_ref(&frame), write_timeout).await?;
        let rx = receivers.pop().expect("exactly one receiver for one frame");
        match tokio::time::timeout(response_timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => {
                self.dead.store(true, Ordering::Release);
                Err(Error::Interrupted)
            }
            Err(_) => {
                // Positional invariant can no longer be upheld: a future
                // frame may still arrive and be misattributed.
                self.dead.store(true, Ordering::Release);
                Err(Error::Timeout("response"))
            }
        }
    }
}

#[async_trait::async_trait]
impl Poolable for ManagedConn {
    fn reusable(&self) -> bool {
        !self.dead.load(Ordering::Acquire)
    }

    async fn validate(&mut self, timeout: Duration) -> bool {
        let frame = self.new_opaque_frame(OpCode::Noop);
        matches!(
            self.send_one(frame, timeout, timeout).await,
            Ok(result) if !result.is_error
        )
    }
}

fn spawn_read_loop(
    server: Server,
    mut reader: OwnedReadHalf,
    inflight: Arc<InFlight>,
    dead: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;

        let mut buf = BytesMut::with_capacity(READ_BUF_CAPACITY);
        let mut decoder = FrameDecoder::new();
        loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => {
                    debug!(%server, "connection closed by peer");
                    break;
                }
                Ok(_) => {
                    if let Err(err) = decoder.decode(&mut buf, &inflight) {
                        error!(%server, %err, "fatal framing error, closing connection");
                        break;
                    }
                }
                Err(err) => {
                    error!(%server, %err, "transport read error, closing connection");
                    break;
                }
            }
        }
        dead.store(true, Ordering::Release);
        inflight.fail_all();
    })
}

/// Dials a fresh TCP connection and wires up its read loop
/// (SPEC_FULL.md §4.B's `MakeTransport` collaborator, generalized by the
/// pool's `ConnectionFactory` seam).
pub struct DefaultConnectionFactory {
    make_transport: DefaultMakeTransport,
}

impl DefaultConnectionFactory {
    pub fn new(make_transport: DefaultMakeTransport) -> Self {
        DefaultConnectionFactory { make_transport }
    }
}

#[async_trait::async_trait]
impl ConnectionFactory<ManagedConn> for DefaultConnectionFactory {
    async fn create(&self, server: Server) -> Result<ManagedConn> {
        let (read_half, write_half) = self
            .make_transport
            .make_transport(server)
            .await
            .map_err(Error::from)?;
        let inflight = Arc::new(InFlight::new());
        let dead = Arc::new(AtomicBool::new(false));
        let read_task = spawn_read_loop(server, read_half, inflight.clone(), dead.clone());
        Ok(ManagedConn {
            server,
            write_half,
            inflight,
            dead,
            opaque_counter: AtomicU32::new(0),
            read_task,
        })
    }
}
