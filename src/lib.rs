//! A memcached binary-protocol client: consistent-hash routing, a bounded
//! per-server connection pool, and automatic failover/failback, built in
//! the style of `volo`/`volo-thrift`'s connection and load-balancing
//! primitives.
//!
//! The typical entry point is [`client::Client`]:
//!
//! ```no_run
//! use bytes::Bytes;
//! use volo_memcache::client::{Client, Config, RawCodec};
//! use volo_memcache::net::Server;
//!
//! # async fn example() {
//! let client: Client<Bytes, RawCodec> = Client::new(
//!     [Server("127.0.0.1:11211".parse().unwrap())],
//!     Config::default(),
//!     RawCodec,
//! );
//! client.spawn_health_monitor();
//! client.set("key", &Bytes::from_static(b"value"), 0).await;
//! let value = client.get("key").await;
//! # let _ = value;
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod health;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod ring;

pub use client::{Client, Config};
pub use error::{Error, Result};
pub use net::Server;
