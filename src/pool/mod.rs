//! A bounded, per-server keyed connection pool.
//!
//! Grounded on `volo-thrift/src/transport/pool/mod.rs` (`Pool`, `Inner`,
//! `Idle`, `WaiterList`/`LinkedHashMap` FIFO waiters, `IdleTask` background
//! sweep, `Pooled` drop-returns-to-pool). The teacher's pool is an
//! unbounded idle cache keyed only by `max_idle_per_key` and a flat
//! `timeout`; this generalizes it into the bounded pool SPEC_FULL.md §4.B
//! requires by adding per-server `managed`/`active`/`peak` accounting, a
//! `min` floor, and the disposable-overflow path the teacher has no
//! equivalent of.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;
use tokio::{
    sync::oneshot,
    time::{interval, Duration, Instant},
};
use tracing::{debug, trace};

use crate::{
    error::{Error, Result},
    net::Server,
};

/// A pooled object's health contract. Implemented by the client's
/// connection actor (`src/client`), kept generic here the same way the
/// teacher's pool is generic over `T: Poolable`.
#[async_trait::async_trait]
pub trait Poolable: Send + Sized + 'static {
    /// Cheap, synchronous liveness check (e.g. "has the read/write task
    /// already exited").
    fn reusable(&self) -> bool;

    /// Expensive, round-trip validation (the `Noop` probe in
    /// SPEC_FULL.md §4.E). Only called when `borrow_validate`/
    /// `return_validate` is configured; bounded by `timeout` rather than a
    /// hardcoded probe deadline so it honors the configured
    /// `response_timeout`.
    async fn validate(&mut self, timeout: Duration) -> bool;
}

/// Creates a new connection for a server; the async analogue of the
/// teacher's `MakeTransport`/`UnaryService<Key, Response = T>` seam.
#[async_trait::async_trait]
pub trait ConnectionFactory<C: Send>: Send + Sync {
    async fn create(&self, server: Server) -> Result<C>;
}

#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub min: usize,
    pub max: usize,
    pub keep_alive: Duration,
    pub disposable: bool,
    pub borrow_validate: bool,
    pub return_validate: bool,
    pub validate_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min: 0,
            max: 8,
            keep_alive: Duration::from_secs(60),
            disposable: false,
            borrow_validate: false,
            return_validate: false,
            validate_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    pub fn with_min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_disposable(mut self, disposable: bool) -> Self {
        self.disposable = disposable;
        self
    }

    pub fn with_borrow_validate(mut self, borrow_validate: bool) -> Self {
        self.borrow_validate = borrow_validate;
        self
    }

    pub fn with_return_validate(mut self, return_validate: bool) -> Self {
        self.return_validate = return_validate;
        self
    }

    pub fn with_validate_timeout(mut self, validate_timeout: Duration) -> Self {
        self.validate_timeout = validate_timeout;
        self
    }
}

struct Idle<C> {
    inner: C,
    idle_at: Instant,
}

struct WaiterList<C> {
    inner: LinkedHashMap<usize, oneshot::Sender<C>>,
    counter: usize,
}

impl<C> Default for WaiterList<C> {
    fn default() -> Self {
        WaiterList {
            inner: LinkedHashMap::new(),
            counter: 0,
        }
    }
}

impl<C> WaiterList<C> {
    fn insert(&mut self, tx: oneshot::Sender<C>) -> usize {
        let index = self.counter;
        self.counter = self.counter.wrapping_add(1);
        self.inner.insert(index, tx);
        index
    }

    fn pop(&mut self) -> Option<oneshot::Sender<C>> {
        self.inner.pop_front().map(|(_, tx)| tx)
    }

    fn remove(&mut self, index: usize) {
        self.inner.remove(&index);
    }
}

struct PoolEntry<C> {
    idle: VecDeque<Idle<C>>,
    waiters: WaiterList<C>,
    managed: usize,
    active: usize,
    peak: usize,
}

impl<C> Default for PoolEntry<C> {
    fn default() -> Self {
        PoolEntry {
            idle: VecDeque::new(),
            waiters: WaiterList::default(),
            managed: 0,
            active: 0,
            peak: 0,
        }
    }
}

type Entries<C> = Arc<Mutex<HashMap<Server, PoolEntry<C>>>>;

pub struct Pool<C> {
    entries: Entries<C>,
    config: Config,
    factory: Arc<dyn ConnectionFactory<C>>,
}

impl<C> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Pool {
            entries: self.entries.clone(),
            config: self.config,
            factory: self.factory.clone(),
        }
    }
}

impl<C: Poolable> Pool<C> {
    pub fn new(config: Config, factory: Arc<dyn ConnectionFactory<C>>) -> Self {
        let entries: Entries<C> = Arc::new(Mutex::new(HashMap::new()));
        let pool = Pool {
            entries: entries.clone(),
            config,
            factory,
        };
        tokio::spawn(sweep_loop(Arc::downgrade(&entries), config));
        pool
    }

    /// Eagerly creates connections until `managed == min` (SPEC_FULL.md
    /// §4.B `create_all_min_objects`).
    pub async fn create_all_min_objects(&self, server: Server) -> Result<()> {
        loop {
            let should_create = {
                let mut entries = self.entries.lock();
                let entry = entries.entry(server).or_default();
                if entry.managed < self.config.min {
                    entry.managed += 1;
                    entry.peak = entry.peak.max(entry.managed);
                    true
                } else {
                    false
                }
            };
            if !should_create {
                return Ok(());
            }
            match self.factory.create(server).await {
                Ok(conn) => {
                    let mut entries = self.entries.lock();
                    if let Some(entry) = entries.get_mut(&server) {
                        entry.idle.push_back(Idle {
                            inner: conn,
                            idle_at: Instant::now(),
                        });
                    }
                }
                Err(err) => {
                    let mut entries = self.entries.lock();
                    if let Some(entry) = entries.get_mut(&server) {
                        entry.managed = entry.managed.saturating_sub(1);
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Borrows a connection for `server`, bounded by `timeout`
    /// (SPEC_FULL.md §4.B `borrow`).
    pub async fn borrow(&self, server: Server, timeout: Duration) -> Result<Pooled<C>> {
        let deadline = Instant::now() + timeout;

        loop {
            enum Action<C> {
                Use(C),
                Create,
                Disposable,
                Wait(oneshot::Receiver<C>),
            }

            let action = {
                let mut entries = self.entries.lock();
                let entry = entries.entry(server).or_default();

                let mut found = None;
                while let Some(idle) = entry.idle.pop_back() {
                    if !idle.inner.reusable() {
                        entry.managed = entry.managed.saturating_sub(1);
                        trace!(%server, "dropping dead idle connection on borrow");
                        continue;
                    }
                    found = Some(idle.inner);
                    break;
                }

                if let Some(conn) = found {
                    entry.active += 1;
                    Action::Use(conn)
                } else if entry.managed < self.config.max {
                    entry.managed += 1;
                    entry.active += 1;
                    entry.peak = entry.peak.max(entry.managed);
                    Action::Create
                } else if self.config.disposable {
                    Action::Disposable
                } else {
                    let (tx, rx) = oneshot::channel();
                    entry.waiters.insert(tx);
                    Action::Wait(rx)
                }
            };

            let mut candidate = match action {
                Action::Use(conn) => conn,
                Action::Create => match self.factory.create(server).await {
                    Ok(conn) => conn,
                    Err(err) => {
                        self.rollback_managed(server);
                        return Err(err);
                    }
                },
                Action::Disposable => {
                    debug!(%server, "pool exhausted, fabricating disposable connection");
                    let conn = self.factory.create(server).await?;
                    return Ok(Pooled::disposable(server, self.clone(), conn));
                }
                Action::Wait(rx) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, rx).await {
                        Ok(Ok(conn)) => conn,
                        _ => return Err(Error::PoolExhausted(server.addr())),
                    }
                }
            };

            if self.config.borrow_validate && !candidate.validate(self.config.validate_timeout).await {
                self.rollback_managed(server);
                if Instant::now() >= deadline {
                    return Err(Error::NoValidObject(server.addr()));
                }
                continue;
            }

            return Ok(Pooled::managed(server, self.clone(), candidate));
        }
    }

    fn rollback_managed(&self, server: Server) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&server) {
            entry.managed = entry.managed.saturating_sub(1);
            entry.active = entry.active.saturating_sub(1);
        }
    }

    /// Returns `conn` to the pool, handing off directly to the earliest
    /// waiter if one exists; destroys it instead if it fails `reusable`/
    /// `return_validate` (SPEC_FULL.md §4.B `return`).
    async fn return_conn(&self, server: Server, mut conn: C) {
        let mut valid = conn.reusable();
        if valid && self.config.return_validate {
            valid = conn.validate(self.config.validate_timeout).await;
        }

        let mut entries = self.entries.lock();
        let entry = match entries.get_mut(&server) {
            Some(entry) => entry,
            None => return, // server's entry was destroy()ed while this was in flight
        };
        entry.active = entry.active.saturating_sub(1);

        if !valid {
            entry.managed = entry.managed.saturating_sub(1);
            trace!(%server, "discarding invalid connection on return");
            return;
        }

        while let Some(waiter) = entry.waiters.pop() {
            match waiter.send(conn) {
                Ok(()) => return,
                Err(rejected) => conn = rejected,
            }
        }
        entry.idle.push_back(Idle {
            inner: conn,
            idle_at: Instant::now(),
        });
    }

    /// Destroys `server`'s entry: closes idle connections (by dropping
    /// them) and leaves in-flight returns with nowhere to land, so they
    /// destroy on arrival. Subsequent stat queries return the sentinel −1.
    pub fn destroy(&self, server: Server) {
        self.entries.lock().remove(&server);
    }

    pub fn destroy_all(&self) {
        self.entries.lock().clear();
    }

    pub fn pool_size(&self, server: Server) -> i64 {
        self.stat(server, |e| e.managed as i64)
    }

    pub fn active_count(&self, server: Server) -> i64 {
        self.stat(server, |e| e.active as i64)
    }

    pub fn idle_count(&self, server: Server) -> i64 {
        self.stat(server, |e| e.idle.len() as i64)
    }

    pub fn peak_count(&self, server: Server) -> i64 {
        self.stat(server, |e| e.peak as i64)
    }

    fn stat(&self, server: Server, f: impl FnOnce(&PoolEntry<C>) -> i64) -> i64 {
        self.entries.lock().get(&server).map(f).unwrap_or(-1)
    }
}

async fn sweep_loop<C: Poolable>(entries: std::sync::Weak<Mutex<HashMap<Server, PoolEntry<C>>>>, config: Config) {
    let period = if config.keep_alive.is_zero() {
        Duration::from_secs(1)
    } else {
        config.keep_alive
    };
    let mut ticker = interval(period);
    loop {
        ticker.tick().await;
        let Some(entries) = entries.upgrade() else {
            trace!("pool dropped, idle sweep exiting");
            return;
        };
        let mut guard = entries.lock();
        let now = Instant::now();
        for entry in guard.values_mut() {
            while entry.managed > config.min {
                let overdue = match entry.idle.front() {
                    Some(idle) => now.saturating_duration_since(idle.idle_at) > config.keep_alive,
                    None => false,
                };
                if !overdue {
                    break;
                }
                entry.idle.pop_front();
                entry.managed -= 1;
            }
        }
    }
}

/// An exclusively-held connection on loan from a [`Pool`]. Returns itself
/// on drop (by spawning the async `return_conn`, since `Drop` cannot
/// `.await` — the teacher's `Pooled::reuse()` avoids this by being purely
/// synchronous; this pool's `return_validate` option forces the async
/// path).
pub struct Pooled<C: Poolable> {
    server: Server,
    pool: Pool<C>,
    inner: Option<C>,
    disposable: bool,
    disposed: bool,
}

impl<C: Poolable> std::fmt::Debug for Pooled<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("server", &self.server)
            .field("disposable", &self.disposable)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl<C: Poolable> Pooled<C> {
    fn managed(server: Server, pool: Pool<C>, conn: C) -> Self {
        Pooled {
            server,
            pool,
            inner: Some(conn),
            disposable: false,
            disposed: false,
        }
    }

    fn disposable(server: Server, pool: Pool<C>, conn: C) -> Self {
        Pooled {
            server,
            pool,
            inner: Some(conn),
            disposable: true,
            disposed: false,
        }
    }

    /// Explicitly removes this connection from the pool instead of
    /// returning it — used when the dispatcher knows the positional
    /// correlation invariant has been violated (write failure, response
    /// timeout) and the connection must not be reused.
    pub fn discard(mut self) {
        self.disposed = true;
        if self.disposable {
            return;
        }
        self.pool.rollback_managed(self.server);
    }
}

impl<C: Poolable> std::ops::Deref for Pooled<C> {
    type Target = C;
    fn deref(&self) -> &C {
        self.inner.as_ref().expect("not dropped")
    }
}

impl<C: Poolable> std::ops::DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.inner.as_mut().expect("not dropped")
    }
}

impl<C: Poolable> Drop for Pooled<C> {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.disposable {
            return;
        }
        if let Some(conn) = self.inner.take() {
            let pool = self.pool.clone();
            let server = self.server;
            tokio::spawn(async move {
                pool.return_conn(server, conn).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    fn server(port: u16) -> Server {
        Server(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    struct MockConn {
        alive: bool,
    }

    #[async_trait::async_trait]
    impl Poolable for MockConn {
        fn reusable(&self) -> bool {
            self.alive
        }

        async fn validate(&mut self, _timeout: Duration) -> bool {
            self.alive
        }
    }

    struct MockFactory {
        created: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<MockConn> for MockFactory {
        async fn create(&self, _server: Server) -> Result<MockConn> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(MockConn { alive: true })
        }
    }

    fn make_pool(config: Config) -> (Pool<MockConn>, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory {
            created: AtomicUsize::new(0),
        });
        (Pool::new(config, factory.clone()), factory)
    }

    #[tokio::test]
    async fn borrow_creates_up_to_max_then_waits() {
        let (pool, _factory) = make_pool(Config::default().with_min(0).with_max(1));
        let s = server(1);

        let first = pool.borrow(s, Duration::from_millis(50)).await.unwrap();
        assert_eq!(pool.active_count(s), 1);
        assert_eq!(pool.pool_size(s), 1);

        let err = pool.borrow(s, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::PoolExhausted(_)));

        drop(first);
    }

    #[tokio::test]
    async fn returned_connection_is_reused_without_growing_managed() {
        let (pool, factory) = make_pool(Config::default().with_min(0).with_max(2));
        let s = server(2);

        let conn = pool.borrow(s, Duration::from_millis(50)).await.unwrap();
        drop(conn);
        // give the spawned return task a chance to run
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let _conn2 = pool.borrow(s, Duration::from_millis(50)).await.unwrap();
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.pool_size(s), 1);
    }

    #[tokio::test]
    async fn disposable_overflow_never_blocks() {
        let (pool, _factory) = make_pool(
            Config::default()
                .with_min(0)
                .with_max(1)
                .with_disposable(true),
        );
        let s = server(3);

        let _held = pool.borrow(s, Duration::from_millis(10)).await.unwrap();
        let overflow = pool.borrow(s, Duration::from_millis(10)).await.unwrap();
        overflow.discard();
        // disposable connections never count toward managed
        assert_eq!(pool.pool_size(s), 1);
    }

    #[tokio::test]
    async fn peak_is_monotonic_until_destroy() {
        let (pool, _factory) = make_pool(Config::default().with_min(0).with_max(4));
        let s = server(4);

        let a = pool.borrow(s, Duration::from_millis(10)).await.unwrap();
        let b = pool.borrow(s, Duration::from_millis(10)).await.unwrap();
        assert_eq!(pool.peak_count(s), 2);
        drop(a);
        drop(b);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.peak_count(s), 2);

        pool.destroy(s);
        assert_eq!(pool.peak_count(s), -1);
        assert_eq!(pool.pool_size(s), -1);
    }

    #[tokio::test]
    async fn observers_on_unknown_server_get_sentinel() {
        let (pool, _factory) = make_pool(Config::default());
        let s = server(5);
        assert_eq!(pool.pool_size(s), -1);
        assert_eq!(pool.active_count(s), -1);
        assert_eq!(pool.idle_count(s), -1);
        assert_eq!(pool.peak_count(s), -1);
    }

    #[tokio::test]
    async fn waiters_are_served_fifo() {
        let (pool, _factory) = make_pool(Config::default().with_min(0).with_max(1));
        let s = server(6);

        let held = pool.borrow(s, Duration::from_millis(200)).await.unwrap();

        let pool2 = pool.clone();
        let first = tokio::spawn(async move { pool2.borrow(s, Duration::from_millis(200)).await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let pool3 = pool.clone();
        let second = tokio::spawn(async move { pool3.borrow(s, Duration::from_millis(200)).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        drop(held);

        let first_result = first.await.unwrap();
        assert!(first_result.is_ok());
        // second waiter should still be waiting; release first's connection too
        drop(first_result.unwrap());
        let second_result = second.await.unwrap();
        assert!(second_result.is_ok());
    }
}
