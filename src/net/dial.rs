//! [`MakeTransport`] creates an [`AsyncRead`]/[`AsyncWrite`] pair for a server,
//! the same seam `volo::net::dial::MakeTransport` provides for RPC transports.

use std::io;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::{timeout, Duration},
};

use super::{conn::Conn, Server};

#[async_trait::async_trait]
pub trait MakeTransport: Clone + Send + Sync + 'static {
    type ReadHalf: AsyncRead + Send + Sync + Unpin + 'static;
    type WriteHalf: AsyncWrite + Send + Sync + Unpin + 'static;

    async fn make_transport(
        &self,
        server: Server,
    ) -> io::Result<(Self::ReadHalf, Self::WriteHalf)>;
}

/// Dialing configuration: connect timeout only. Read/write timeouts are
/// enforced by the dispatcher around individual operations (§5), not at the
/// socket layer, since a single connection multiplexes many in-flight
/// requests with different deadlines.
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    pub connect_timeout: Option<Duration>,
}

impl Config {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMakeTransport {
    cfg: Config,
}

impl DefaultMakeTransport {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    pub async fn make_connection(&self, server: Server) -> io::Result<Conn> {
        let connect = TcpStream::connect(server.addr());
        let stream = if let Some(d) = self.cfg.connect_timeout {
            timeout(d, connect)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??
        } else {
            connect.await?
        };
        stream.set_nodelay(true)?;
        Ok(Conn::from(stream))
    }
}

#[async_trait::async_trait]
impl MakeTransport for DefaultMakeTransport {
    type ReadHalf = OwnedReadHalf;
    type WriteHalf = OwnedWriteHalf;

    async fn make_transport(
        &self,
        server: Server,
    ) -> io::Result<(Self::ReadHalf, Self::WriteHalf)> {
        let conn = self.make_connection(server).await?;
        Ok(conn.into_split())
    }
}
