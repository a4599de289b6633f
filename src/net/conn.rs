//! A thin wrapper around a split TCP stream, analogous to `volo::net::conn::Conn`
//! but narrowed to the one stream kind this crate dials: TCP.

use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};

pub struct Conn {
    pub stream: TcpStream,
}

impl From<TcpStream> for Conn {
    fn from(stream: TcpStream) -> Self {
        Conn { stream }
    }
}

impl Conn {
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }
}
