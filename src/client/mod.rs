//! The client dispatcher: config, server state machine, single/multi-key
//! routing, and the public cache façade (SPEC_FULL.md §4.E).
//!
//! Grounded on `volo-thrift/src/transport/multiplex/client.rs` (`Client`
//! wrapping a pooled transport, routing each call through borrow → send →
//! reuse/drop) and `volo/src/net/dial.rs`'s builder-style `Config`.

pub mod codec;
pub mod conn;

use std::{
    collections::HashMap,
    hash::Hash,
    marker::PhantomData,
    sync::Arc,
};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    codec::inflight::PendingResult,
    discovery::Discover,
    error::{Error, Result},
    net::{dial, Server},
    pool::{ConnectionFactory, Pool, Pooled},
    protocol::OpCode,
    protocol::RequestFrame,
    ring::HashRing,
};

pub use codec::{RawCodec, ValueCodec};
pub use conn::{DefaultConnectionFactory, ManagedConn};

/// Every knob SPEC_FULL.md §6 enumerates, builder-style like the
/// teacher's `volo::net::dial::Config`/`volo_thrift::transport::pool::Config`.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub min: usize,
    pub max: usize,
    pub keep_alive: std::time::Duration,
    pub disposable: bool,
    pub borrow_validate: bool,
    pub return_validate: bool,
    pub connect_timeout: std::time::Duration,
    pub write_timeout: std::time::Duration,
    pub response_timeout: std::time::Duration,
    pub health_interval: std::time::Duration,
    pub failover: bool,
    pub prefer_remote_config: bool,
}

impl Default for Config {
    fn default() -> Self {
        use std::time::Duration;
        Config {
            min: 0,
            max: 8,
            keep_alive: Duration::from_secs(60),
            disposable: false,
            borrow_validate: false,
            return_validate: false,
            connect_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(1),
            health_interval: Duration::from_secs(30),
            failover: true,
            prefer_remote_config: false,
        }
    }
}

macro_rules! with_field {
    ($name:ident, $field:ident, $ty:ty) => {
        pub fn $name(mut self, $field: $ty) -> Self {
            self.$field = $field;
            self
        }
    };
}

impl Config {
    with_field!(with_min, min, usize);
    with_field!(with_max, max, usize);
    with_field!(with_keep_alive, keep_alive, std::time::Duration);
    with_field!(with_disposable, disposable, bool);
    with_field!(with_borrow_validate, borrow_validate, bool);
    with_field!(with_return_validate, return_validate, bool);
    with_field!(with_connect_timeout, connect_timeout, std::time::Duration);
    with_field!(with_write_timeout, write_timeout, std::time::Duration);
    with_field!(with_response_timeout, response_timeout, std::time::Duration);
    with_field!(with_health_interval, health_interval, std::time::Duration);
    with_field!(with_failover, failover, bool);
    with_field!(with_prefer_remote_config, prefer_remote_config, bool);

    fn pool_config(&self) -> crate::pool::Config {
        crate::pool::Config::default()
            .with_min(self.min)
            .with_max(self.max)
            .with_keep_alive(self.keep_alive)
            .with_disposable(self.disposable)
            .with_borrow_validate(self.borrow_validate)
            .with_return_validate(self.return_validate)
            .with_validate_timeout(self.response_timeout)
    }
}

/// Consecutive write failures on a server's connections before the
/// dispatcher quarantines it on its own initiative, independent of the
/// pool's `NoValidObject` signal (SPEC_FULL.md §4.E "or on repeated write
/// failure").
const WRITE_FAILURE_QUARANTINE_THRESHOLD: u32 = 3;

/// Ring + pool + quarantine bookkeeping, shared between [`Client`] and the
/// health monitor (SPEC_FULL.md §4.F operates on exactly this state).
pub struct Registry {
    pub ring: HashRing,
    pub pool: Pool<ManagedConn>,
    pub factory: Arc<dyn ConnectionFactory<ManagedConn>>,
    quarantined: Mutex<std::collections::HashSet<Server>>,
    write_failures: Mutex<HashMap<Server, u32>>,
}

impl Registry {
    fn new(servers: Vec<Server>, config: &Config) -> Self {
        let factory: Arc<dyn ConnectionFactory<ManagedConn>> = Arc::new(DefaultConnectionFactory::new(
            dial::DefaultMakeTransport::new(dial::Config::new(Some(config.connect_timeout))),
        ));
        Registry {
            ring: HashRing::with_servers(servers, 160),
            pool: Pool::new(config.pool_config(), factory.clone()),
            factory,
            quarantined: Mutex::new(std::collections::HashSet::new()),
            write_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Moves a server from active to quarantined (SPEC_FULL.md §4.E
    /// "state machine for a server").
    pub fn quarantine(&self, server: Server) {
        self.ring.remove(server);
        self.write_failures.lock().remove(&server);
        debug!(%server, "quarantining server");
        self.quarantined.lock().insert(server);
    }

    /// Counts one write failure toward `WRITE_FAILURE_QUARANTINE_THRESHOLD`,
    /// quarantining the server once it's crossed.
    fn record_write_failure(&self, server: Server) {
        let crossed = {
            let mut failures = self.write_failures.lock();
            let count = failures.entry(server).or_insert(0);
            *count += 1;
            *count >= WRITE_FAILURE_QUARANTINE_THRESHOLD
        };
        if crossed {
            debug!(%server, "quarantining after repeated write failure");
            self.quarantine(server);
        }
    }

    fn clear_write_failures(&self, server: Server) {
        self.write_failures.lock().remove(&server);
    }

    /// Attempts to move a quarantined server back to active by re-adding it
    /// through the pool+ring `add_server` path: `create_all_min_objects`
    /// warms the pool, then the ring gains the server. If warming fails,
    /// the server is re-quarantined and this returns `false` (SPEC_FULL.md
    /// §4.F step 4). Also returns `false` if it wasn't quarantined.
    pub async fn revive(&self, server: Server) -> bool {
        if !self.quarantined.lock().remove(&server) {
            return false;
        }
        match self.pool.create_all_min_objects(server).await {
            Ok(()) => {
                self.ring.add(server);
                true
            }
            Err(err) => {
                debug!(%server, %err, "revival failed to warm pool, re-quarantining");
                self.quarantined.lock().insert(server);
                false
            }
        }
    }

    pub fn quarantined_snapshot(&self) -> Vec<Server> {
        self.quarantined.lock().iter().copied().collect()
    }
}

/// The memcached client. Generic over the application value type `V` and
/// the [`ValueCodec`] used to (de)serialize it.
pub struct Client<V, VC: ValueCodec<V>> {
    registry: Arc<Registry>,
    config: Config,
    value_codec: VC,
    _marker: PhantomData<fn() -> V>,
}

impl<V, VC: ValueCodec<V>> Clone for Client<V, VC>
where
    VC: Clone,
{
    fn clone(&self) -> Self {
        Client {
            registry: self.registry.clone(),
            config: self.config,
            value_codec: self.value_codec.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V, VC: ValueCodec<V>> Client<V, VC> {
    pub fn new(servers: impl IntoIterator<Item = Server>, config: Config, value_codec: VC) -> Self {
        let registry = Arc::new(Registry::new(servers.into_iter().collect(), &config));
        Client {
            registry,
            config,
            value_codec,
            _marker: PhantomData,
        }
    }

    pub async fn from_discover(discover: &dyn Discover, config: Config, value_codec: VC) -> Result<Self> {
        let servers = discover.discover().await?;
        Ok(Self::new(servers, config, value_codec))
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn config(&self) -> Config {
        self.config
    }

    /// Starts the health-monitor task (SPEC_FULL.md §4.F), wired to this
    /// client's registry via a weak reference. Returns `None` if
    /// `failover` is disabled or `health_interval` is zero.
    pub fn spawn_health_monitor(&self) -> Option<tokio::task::JoinHandle<()>> {
        crate::health::spawn(&self.registry, self.config)
    }

    async fn borrow(&self, server: Server) -> Result<Pooled<ManagedConn>> {
        match self.registry.pool.borrow(server, self.config.connect_timeout).await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                if matches!(err, Error::NoValidObject(_)) {
                    self.registry.quarantine(server);
                }
                Err(err)
            }
        }
    }

    /// Borrow → write → await → return/remove for a single request
    /// (SPEC_FULL.md §4.E "Single-key path").
    async fn dispatch_single(&self, server: Server, frame: RequestFrame) -> Result<PendingResult> {
        let mut conn = self.borrow(server).await?;
        match conn.send_one(frame, self.config.write_timeout, self.config.response_timeout).await {
            Ok(result) => {
                self.registry.clear_write_failures(server);
                Ok(result)
            }
            Err(err) => {
                conn.discard();
                if err.is_recoverable() {
                    debug!(%server, %err, "recoverable dispatch failure");
                } else if err.is_connection_fatal() {
                    warn!(%server, %err, "connection-fatal dispatch failure");
                }
                if matches!(err, Error::Transport(_) | Error::Timeout("write")) {
                    self.registry.record_write_failure(server);
                }
                Err(err)
            }
        }
    }

    /// Advanced entry point that skips the façade's "nothing happened"
    /// collapsing and exposes the typed [`Error`] (SPEC_FULL.md §7 "the
    /// dispatcher's lower-level methods ... are available to advanced
    /// callers"). SASL opcodes are rejected outright — the protocol
    /// reserves them, but this crate doesn't implement SASL authentication.
    pub async fn send_raw(&self, key: impl AsRef<[u8]>, frame: RequestFrame) -> Result<PendingResult> {
        if matches!(
            frame.opcode,
            OpCode::SASLListMechs | OpCode::SASLAuth | OpCode::SASLStep
        ) {
            return Err(Error::UnsupportedOperation("SASL authentication is not implemented"));
        }
        let server = self.owner(key.as_ref()).ok_or(Error::EmptyRing)?;
        self.dispatch_single(server, frame).await
    }

    fn owner(&self, key: &[u8]) -> Option<Server> {
        self.registry.ring.get(key)
    }

    // -- single-key façade -------------------------------------------------

    pub async fn get(&self, key: impl AsRef<[u8]>) -> Option<V> {
        let key = key.as_ref();
        let server = self.owner(key)?;
        let frame = RequestFrame::new(OpCode::Get, 0).with_key(Bytes::copy_from_slice(key));
        let result = self.dispatch_single(server, frame).await.ok()?;
        if result.is_error {
            return None;
        }
        let value = result.value?;
        self.value_codec.decode(result.flags, value).ok()
    }

    pub async fn gets(&self, key: impl AsRef<[u8]>) -> Option<(V, u64)> {
        let key = key.as_ref();
        let server = self.owner(key)?;
        let frame = RequestFrame::new(OpCode::Gets, 0).with_key(Bytes::copy_from_slice(key));
        let result = self.dispatch_single(server, frame).await.ok()?;
        if result.is_error {
            return None;
        }
        let value = result.value?;
        let cas = result.cas;
        self.value_codec.decode(result.flags, value).ok().map(|v| (v, cas))
    }

    async fn store(&self, opcode: OpCode, key: &[u8], value: &V, expiry: u32, cas: u64) -> bool {
        let server = match self.owner(key) {
            Some(server) => server,
            None => return false,
        };
        let (flags, bytes) = self.value_codec.encode(value);
        let mut extras = BytesMut::with_capacity(8);
        extras.put_u32(flags);
        extras.put_u32(expiry);
        let mut frame = RequestFrame::new(opcode, 0)
            .with_extras(extras.freeze())
            .with_key(Bytes::copy_from_slice(key))
            .with_value(bytes);
        if cas != 0 {
            frame = frame.with_cas(cas);
        }
        matches!(self.dispatch_single(server, frame).await, Ok(result) if !result.is_error)
    }

    pub async fn set(&self, key: impl AsRef<[u8]>, value: &V, expiry: u32) -> bool {
        self.store(OpCode::Set, key.as_ref(), value, expiry, 0).await
    }

    pub async fn cas_set(&self, key: impl AsRef<[u8]>, value: &V, expiry: u32, cas: u64) -> bool {
        self.store(OpCode::Set, key.as_ref(), value, expiry, cas).await
    }

    pub async fn add(&self, key: impl AsRef<[u8]>, value: &V, expiry: u32) -> bool {
        self.store(OpCode::Add, key.as_ref(), value, expiry, 0).await
    }

    pub async fn replace(&self, key: impl AsRef<[u8]>, value: &V, expiry: u32) -> bool {
        self.store(OpCode::Replace, key.as_ref(), value, expiry, 0).await
    }

    pub async fn delete(&self, key: impl AsRef<[u8]>) -> bool {
        let key = key.as_ref();
        let server = match self.owner(key) {
            Some(server) => server,
            None => return false,
        };
        let frame = RequestFrame::new(OpCode::Delete, 0).with_key(Bytes::copy_from_slice(key));
        matches!(self.dispatch_single(server, frame).await, Ok(result) if !result.is_error)
    }

    async fn incr_decr(&self, opcode: OpCode, key: &[u8], delta: u64, initial: u64, expiry: u32) -> Option<u64> {
        let server = self.owner(key)?;
        let mut extras = BytesMut::with_capacity(20);
        extras.put_u64(delta);
        extras.put_u64(initial);
        extras.put_u32(expiry);
        let frame = RequestFrame::new(opcode, 0)
            .with_extras(extras.freeze())
            .with_key(Bytes::copy_from_slice(key));
        let result = self.dispatch_single(server, frame).await.ok()?;
        if result.is_error {
            return None;
        }
        let value = result.value?;
        if value.len() < 8 {
            return None;
        }
        Some(u64::from_be_bytes(value[..8].try_into().ok()?))
    }

    pub async fn increment(&self, key: impl AsRef<[u8]>, delta: u64, initial: u64, expiry: u32) -> Option<u64> {
        self.incr_decr(OpCode::Increment, key.as_ref(), delta, initial, expiry).await
    }

    pub async fn decrement(&self, key: impl AsRef<[u8]>, delta: u64, initial: u64, expiry: u32) -> Option<u64> {
        self.incr_decr(OpCode::Decrement, key.as_ref(), delta, initial, expiry).await
    }

    async fn concat(&self, opcode: OpCode, key: &[u8], value: impl AsRef<[u8]>) -> bool {
        let server = match self.owner(key) {
            Some(server) => server,
            None => return false,
        };
        let frame = RequestFrame::new(opcode, 0)
            .with_key(Bytes::copy_from_slice(key))
            .with_value(Bytes::copy_from_slice(value.as_ref()));
        matches!(self.dispatch_single(server, frame).await, Ok(result) if !result.is_error)
    }

    pub async fn append(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> bool {
        self.concat(OpCode::Append, key.as_ref(), value).await
    }

    pub async fn prepend(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> bool {
        self.concat(OpCode::Prepend, key.as_ref(), value).await
    }

    pub async fn touch(&self, key: impl AsRef<[u8]>, expiry: u32) -> bool {
        let key = key.as_ref();
        let server = match self.owner(key) {
            Some(server) => server,
            None => return false,
        };
        let mut extras = BytesMut::with_capacity(4);
        extras.put_u32(expiry);
        let frame = RequestFrame::new(OpCode::Touch, 0)
            .with_extras(extras.freeze())
            .with_key(Bytes::copy_from_slice(key));
        matches!(self.dispatch_single(server, frame).await, Ok(result) if !result.is_error)
    }

    pub async fn gat(&self, key: impl AsRef<[u8]>, expiry: u32) -> Option<V> {
        let key = key.as_ref();
        let server = self.owner(key)?;
        let mut extras = BytesMut::with_capacity(4);
        extras.put_u32(expiry);
        let frame = RequestFrame::new(OpCode::GAT, 0)
            .with_extras(extras.freeze())
            .with_key(Bytes::copy_from_slice(key));
        let result = self.dispatch_single(server, frame).await.ok()?;
        if result.is_error {
            return None;
        }
        let value = result.value?;
        self.value_codec.decode(result.flags, value).ok()
    }

    /// Broadcasts `Flush` to every active server; `true` only if every
    /// server acknowledged (SPEC_FULL.md §6 "Supported opcodes").
    pub async fn flush_all(&self, delay: Option<u32>) -> bool {
        let servers = self.registry.ring.servers();
        if servers.is_empty() {
            return false;
        }
        let mut all_ok = true;
        for server in servers {
            let mut frame = RequestFrame::new(OpCode::Flush, 0);
            if let Some(delay) = delay {
                let mut extras = BytesMut::with_capacity(4);
                extras.put_u32(delay);
                frame = frame.with_extras(extras.freeze());
            }
            match self.dispatch_single(server, frame).await {
                Ok(result) if !result.is_error => {}
                _ => all_ok = false,
            }
        }
        all_ok
    }

    pub async fn version(&self) -> HashMap<Server, String> {
        let mut out = HashMap::new();
        for server in self.registry.ring.servers() {
            let frame = RequestFrame::new(OpCode::Version, 0);
            if let Ok(result) = self.dispatch_single(server, frame).await {
                if !result.is_error {
                    if let Some(value) = result.value {
                        if let Ok(text) = String::from_utf8(value.to_vec()) {
                            out.insert(server, text);
                        }
                    }
                }
            }
        }
        out
    }

    pub async fn stat(&self, server: Server) -> Option<HashMap<String, String>> {
        let frame = RequestFrame::new(OpCode::Stat, 0);
        let result = self.dispatch_single(server, frame).await.ok()?;
        if result.is_error {
            return None;
        }
        let mut map = HashMap::with_capacity(result.stats.len());
        for (name, value) in result.stats {
            if let (Ok(name), Ok(value)) = (String::from_utf8(name.to_vec()), String::from_utf8(value.to_vec())) {
                map.insert(name, value);
            }
        }
        Some(map)
    }

    pub async fn noop(&self, server: Server) -> bool {
        let frame = RequestFrame::new(OpCode::Noop, 0);
        matches!(self.dispatch_single(server, frame).await, Ok(result) if !result.is_error)
    }

    pub async fn quit(&self, server: Server) -> bool {
        let mut conn = match self.borrow(server).await {
            Ok(conn) => conn,
            Err(_) => return false,
        };
        let frame = RequestFrame::new(OpCode::Quit, 0);
        let ok = matches!(
            conn.send_one(frame, self.config.write_timeout, self.config.response_timeout).await,
            Ok(result) if !result.is_error
        );
        conn.discard();
        ok
    }

    // -- multi-key façade ----------------------------------------------------

    /// Partitions `keys` by owner server and fetches each partition in one
    /// batched round trip (SPEC_FULL.md §4.E "Multi-key path").
    pub async fn get_multi<K>(&self, keys: impl IntoIterator<Item = K>) -> HashMap<K, V>
    where
        K: AsRef<[u8]> + Clone + Eq + Hash + Send + Sync,
    {
        let mut by_server: HashMap<Server, Vec<K>> = HashMap::new();
        for key in keys {
            match self.owner(key.as_ref()) {
                Some(server) => by_server.entry(server).or_default().push(key),
                None => debug!("key has no owner (empty ring); omitting from get_multi"),
            }
        }

        let mut results = HashMap::new();
        for (server, group) in by_server {
            results.extend(self.get_multi_on_server(server, group).await);
        }
        results
    }

    /// Unlike `set_multi`/`delete_multi`, every key here goes out as a
    /// non-quiet `GetK`. This spec defines "quiet" uniformly as no-reply-
    /// on-success (SPEC_FULL.md Glossary), which for the `Get` family means
    /// a quiet hit produces nothing to decode — the opposite of what a
    /// multi-get needs. The N-1-quiet-then-final pattern from §4.D still
    /// saves a round trip per key for writes, where silence on success is
    /// exactly the information wanted; reads need every hit's payload, so
    /// they're still pipelined over one write/one borrow, just without the
    /// quiet-skip.
    async fn get_multi_on_server<K>(&self, server: Server, keys: Vec<K>) -> HashMap<K, V>
    where
        K: AsRef<[u8]> + Clone + Eq + Hash,
    {
        let mut results = HashMap::new();
        if keys.is_empty() {
            return results;
        }
        let frames: Vec<RequestFrame> = keys
            .iter()
            .map(|key| RequestFrame::new(OpCode::GetK, 0).with_key(Bytes::copy_from_slice(key.as_ref())))
            .collect();

        let by_key: HashMap<Vec<u8>, K> = keys.iter().map(|k| (k.as_ref().to_vec(), k.clone())).collect();

        let mut conn = match self.borrow(server).await {
            Ok(conn) => conn,
            Err(_) => return results,
        };
        let receivers = match conn.send_batch(&frames, self.config.write_timeout).await {
            Ok(receivers) => receivers,
            Err(_) => {
                conn.discard();
                return results;
            }
        };

        for rx in receivers {
            match tokio::time::timeout(self.config.response_timeout, rx).await {
                Ok(Ok(result)) if !result.is_error => {
                    if let (Some(key_bytes), Some(value_bytes)) = (result.key, result.value) {
                        if let Some(original) = by_key.get(key_bytes.as_ref()) {
                            if let Ok(value) = self.value_codec.decode(result.flags, value_bytes) {
                                results.insert(original.clone(), value);
                            }
                        }
                    }
                }
                Ok(Ok(_)) => {} // miss, or non-hit error: key stays absent
                _ => {
                    conn.discard();
                    return results;
                }
            }
        }
        results
    }

    /// `(key, value, expiry, cas)` tuples, cas `0` meaning unconditional.
    pub async fn set_multi<K>(&self, items: impl IntoIterator<Item = (K, V, u32, u64)>) -> HashMap<K, bool>
    where
        K: AsRef<[u8]> + Clone + Eq + Hash + Send + Sync,
    {
        let mut by_server: HashMap<Server, Vec<(K, V, u32, u64)>> = HashMap::new();
        for item in items {
            if let Some(server) = self.owner(item.0.as_ref()) {
                by_server.entry(server).or_default().push(item);
            }
        }
        let mut results = HashMap::new();
        for (server, group) in by_server {
            results.extend(self.set_multi_on_server(server, group).await);
        }
        results
    }

    async fn set_multi_on_server<K>(&self, server: Server, items: Vec<(K, V, u32, u64)>) -> HashMap<K, bool>
    where
        K: AsRef<[u8]> + Clone + Eq + Hash,
    {
        let mut results = HashMap::new();
        if items.is_empty() {
            return results;
        }
        let last = items.len() - 1;
        let mut order = Vec::with_capacity(items.len());
        let mut frames = Vec::with_capacity(items.len());
        for (i, (key, value, expiry, cas)) in items.into_iter().enumerate() {
            let (flags, bytes) = self.value_codec.encode(&value);
            let mut extras = BytesMut::with_capacity(8);
            extras.put_u32(flags);
            extras.put_u32(expiry);
            let opcode = if i == last { OpCode::Set } else { OpCode::SetQ };
            let mut frame = RequestFrame::new(opcode, 0)
                .with_extras(extras.freeze())
                .with_key(Bytes::copy_from_slice(key.as_ref()))
                .with_value(bytes);
            if cas != 0 {
                frame = frame.with_cas(cas);
            }
            order.push(key);
            frames.push(frame);
        }

        let mut conn = match self.borrow(server).await {
            Ok(conn) => conn,
            Err(_) => return results,
        };
        let receivers = match conn.send_batch(&frames, self.config.write_timeout).await {
            Ok(receivers) => receivers,
            Err(_) => {
                conn.discard();
                return results;
            }
        };

        for (key, rx) in order.into_iter().zip(receivers) {
            match tokio::time::timeout(self.config.response_timeout, rx).await {
                Ok(Ok(result)) => {
                    results.insert(key, !result.is_error);
                }
                _ => {
                    conn.discard();
                    break;
                }
            }
        }
        results
    }

    pub async fn delete_multi<K>(&self, keys: impl IntoIterator<Item = K>) -> HashMap<K, bool>
    where
        K: AsRef<[u8]> + Clone + Eq + Hash + Send + Sync,
    {
        let mut by_server: HashMap<Server, Vec<K>> = HashMap::new();
        for key in keys {
            if let Some(server) = self.owner(key.as_ref()) {
                by_server.entry(server).or_default().push(key);
            }
        }
        let mut results = HashMap::new();
        for (server, group) in by_server {
            results.extend(self.delete_multi_on_server(server, group).await);
        }
        results
    }

    async fn delete_multi_on_server<K>(&self, server: Server, keys: Vec<K>) -> HashMap<K, bool>
    where
        K: AsRef<[u8]> + Clone + Eq + Hash,
    {
        let mut results = HashMap::new();
        if keys.is_empty() {
            return results;
        }
        let last = keys.len() - 1;
        let frames: Vec<RequestFrame> = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let opcode = if i == last { OpCode::Delete } else { OpCode::DeleteQ };
                RequestFrame::new(opcode, 0).with_key(Bytes::copy_from_slice(key.as_ref()))
            })
            .collect();

        let mut conn = match self.borrow(server).await {
            Ok(conn) => conn,
            Err(_) => return results,
        };
        let receivers = match conn.send_batch(&frames, self.config.write_timeout).await {
            Ok(receivers) => receivers,
            Err(_) => {
                conn.discard();
                return results;
            }
        };

        for (key, rx) in keys.into_iter().zip(receivers) {
            match tokio::time::timeout(self.config.response_timeout, rx).await {
                Ok(Ok(result)) => {
                    results.insert(key, !result.is_error);
                }
                _ => {
                    conn.discard();
                    break;
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;
    use crate::protocol::{Header, RESPONSE_MAGIC};

    /// Bare-bones request header, hand-parsed because [`Header::read_from`]
    /// only accepts response magic — the client side of the wire never
    /// needs to parse requests, so there's no shared parser for it.
    struct RawRequestHeader {
        opcode: u8,
        key_len: u16,
        extras_len: u8,
        opaque: u32,
    }

    fn parse_request_header(buf: &[u8; 24]) -> RawRequestHeader {
        RawRequestHeader {
            opcode: buf[1],
            key_len: u16::from_be_bytes([buf[2], buf[3]]),
            extras_len: buf[4],
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }

    /// A minimal loopback memcached server: replies `NoError` to every
    /// `Get`/`Set`/`Noop` it sees, echoing a fixed value, just enough to
    /// exercise the dispatcher end to end (SPEC_FULL.md §8 "Round-trip
    /// laws ... on a synthetic loopback").
    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            loop {
                let mut header_buf = [0u8; 24];
                if socket.read_exact(&mut header_buf).await.is_err() {
                    return;
                }
                let req = parse_request_header(&header_buf);
                let mut body = vec![0u8; req.extras_len as usize + req.key_len as usize];
                if !body.is_empty() && socket.read_exact(&mut body).await.is_err() {
                    return;
                }
                let value = b"echoed".to_vec();
                let resp_header = Header {
                    magic: RESPONSE_MAGIC,
                    opcode: req.opcode,
                    key_len: 0,
                    extras_len: 0,
                    data_type: 0,
                    vbucket_or_status: 0,
                    total_body_len: value.len() as u32,
                    opaque: req.opaque,
                    cas: 0,
                };
                let mut out = BytesMut::new();
                resp_header.write_to(&mut out);
                out.extend_from_slice(&value);
                if socket.write_all(&out).await.is_err() {
                    return;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn get_round_trips_against_a_loopback_server() {
        let addr = spawn_echo_server().await;
        let client: Client<Bytes, RawCodec> = Client::new([Server(addr)], Config::default(), RawCodec);
        let value = client.get(b"foo").await;
        assert_eq!(value, Some(Bytes::from_static(b"echoed")));
    }

    #[tokio::test]
    async fn get_on_empty_ring_returns_none_without_dialing() {
        let client: Client<Bytes, RawCodec> = Client::new(Vec::<Server>::new(), Config::default(), RawCodec);
        assert_eq!(client.get(b"foo").await, None);
    }
}
