//! Keyed connection pool
//!
//! [`ConnectionPool`] keeps idle transport connections per
//! [`ConnectionKey`] and dials new ones on a miss. HTTP/1.x connections
//! are handed out exclusively and come back through
//! [`PersistentConnection::release`]; each idle one carries an
//! [`IdleTimer`] that evicts it. HTTP/2 connections stay in their bucket
//! while usable and are shared by every caller; their reader thread
//! enforces its own idle deadline and unregisters the connection through a
//! close hook.
//!
//! Network I/O never happens under the pool lock. Connections removed under
//! the lock are closed after it is released.
//!
//! A pool may be tied to a [`CloseSignal`]. Once it fires the pool stops
//! handing out and accepting connections.

use super::h2::signal::CloseSignal;
use super::h2::{ClientConfig, Error, Http2ClientConnection, Result};
use super::SharedSession;
use crate::diag::{TaskGuard, TaskKind};
use crate::net::{self, DialOptions};
use parking_lot::{Condvar, Mutex};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Application protocol a pooled connection speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    H1,
    H2,
}

/// Identity of a reusable connection
///
/// Two requests with equal keys may share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub proxies: Vec<String>,
    pub scheme: Scheme,
    /// `host:port`
    pub addr: String,
    pub https: bool,
    pub gm_tls: bool,
    pub client_hello_spec: Option<String>,
    pub sni: Option<String>,
}

impl ConnectionKey {
    pub fn new(addr: impl Into<String>, https: bool, scheme: Scheme) -> Self {
        ConnectionKey {
            proxies: Vec::new(),
            scheme,
            addr: addr.into(),
            https,
            gm_tls: false,
            client_hello_spec: None,
            sni: None,
        }
    }

    /// Key for dialing `addr` with `opts`
    pub fn from_options(addr: impl Into<String>, https: bool, scheme: Scheme, opts: &DialOptions) -> Self {
        ConnectionKey {
            proxies: opts.proxies.clone(),
            scheme,
            addr: addr.into(),
            https,
            gm_tls: opts.gm_tls,
            client_hello_spec: opts.client_hello_spec.clone(),
            sni: opts.sni.clone(),
        }
    }

    /// Stable hash of every key field
    pub fn bucket(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

/// Pool limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle connections across all keys
    pub max_idle_conn: usize,
    pub max_idle_conn_per_host: usize,
    /// Idle HTTP/1.x connections are closed after this long
    pub idle_conn_timeout: Duration,
    /// TCP keepalive interval for dialed connections
    pub keep_alive: Duration,
    /// Settings for HTTP/2 connections the pool creates
    pub h2: ClientConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_idle_conn: 100,
            max_idle_conn_per_host: 2,
            idle_conn_timeout: Duration::from_secs(90),
            keep_alive: Duration::from_secs(30),
            h2: ClientConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn max_idle_conn(mut self, max: usize) -> Self {
        self.max_idle_conn = max;
        self
    }

    pub fn max_idle_conn_per_host(mut self, max: usize) -> Self {
        self.max_idle_conn_per_host = max;
        self
    }

    pub fn idle_conn_timeout(mut self, timeout: Duration) -> Self {
        self.idle_conn_timeout = timeout;
        self
    }

    pub fn h2(mut self, config: ClientConfig) -> Self {
        self.h2 = config;
        self
    }
}

type Bucket = Vec<Arc<PersistentConnection>>;

#[derive(Default)]
struct IdleState {
    buckets: HashMap<ConnectionKey, Bucket>,
    count: usize,
    /// Emptied bucket vectors kept for reuse
    spare: Vec<Bucket>,
}

impl IdleState {
    /// Remove `conn` from its bucket; false if it was not pooled
    fn remove_conn_locked(&mut self, conn: &Arc<PersistentConnection>) -> bool {
        let Some(bucket) = self.buckets.get_mut(&conn.key) else {
            return false;
        };
        let Some(idx) = bucket.iter().position(|c| Arc::ptr_eq(c, conn)) else {
            return false;
        };
        bucket.remove(idx);
        self.count -= 1;
        if bucket.is_empty() {
            if let Some(vec) = self.buckets.remove(&conn.key) {
                self.spare.push(vec);
            }
        }
        conn.stop_idle_timer();
        true
    }

    fn bucket_mut(&mut self, key: &ConnectionKey) -> &mut Bucket {
        let IdleState { buckets, spare, .. } = self;
        buckets
            .entry(key.clone())
            .or_insert_with(|| spare.pop().unwrap_or_default())
    }
}

struct PoolInner {
    config: PoolConfig,
    idle: Mutex<IdleState>,
    cancel: Arc<CloseSignal>,
}

/// Idle-connection registry; cheap to clone, clones share state
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

enum Scan {
    /// Unusable; remove and close
    Dead,
    /// Usable later but not now
    Busy,
    /// Multiplexed; hand out and keep pooled
    Shared,
    /// Exclusive; hand out and unpool
    Take,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_cancel(config, Arc::new(CloseSignal::new()))
    }

    /// Pool that shuts its doors once `cancel` fires
    pub fn with_cancel(config: PoolConfig, cancel: Arc<CloseSignal>) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner { config, idle: Mutex::new(IdleState::default()), cancel }),
        }
    }

    /// Fire the cancel signal and close every pooled connection
    pub fn cancel(&self) {
        self.inner.cancel.fire();
        tracing::debug!("pool cancelled");
        self.clear();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_fired()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Reuse an idle connection for `key` or dial a new one
    ///
    /// Dial errors are returned as is; a failed dial only triggers one more
    /// scan in case another caller pooled a connection meanwhile.
    pub fn get_idle_conn(&self, key: &ConnectionKey, opts: &DialOptions) -> Result<Arc<PersistentConnection>> {
        if self.is_cancelled() {
            return Err(Error::PoolCancelled);
        }
        if let Some(conn) = self.scan_idle(key) {
            tracing::debug!(addr = %key.addr, bucket = key.bucket(), h2 = conn.is_h2(), "pool hit");
            return Ok(conn);
        }
        tracing::debug!(addr = %key.addr, bucket = key.bucket(), "pool miss, dialing");

        match PersistentConnection::dial(self, key, opts) {
            Ok(conn) => Ok(conn),
            Err(e) => match self.scan_idle(key) {
                Some(conn) => {
                    tracing::debug!(addr = %key.addr, error = %e, "dial failed, reusing a connection pooled meanwhile");
                    Ok(conn)
                }
                None => Err(e),
            },
        }
    }

    fn scan_idle(&self, key: &ConnectionKey) -> Option<Arc<PersistentConnection>> {
        if self.is_cancelled() {
            return None;
        }
        let timeout = self.inner.config.idle_conn_timeout;
        let now = Instant::now();
        let mut dead = Vec::new();
        let found = {
            let mut guard = self.inner.idle.lock();
            let IdleState { buckets, count, spare } = &mut *guard;
            let bucket = buckets.get_mut(key)?;

            let mut found = None;
            let mut i = bucket.len();
            while i > 0 {
                i -= 1;
                match bucket[i].scan(now, timeout) {
                    Scan::Dead => {
                        let conn = bucket.remove(i);
                        conn.stop_idle_timer();
                        *count -= 1;
                        dead.push(conn);
                    }
                    Scan::Busy => {}
                    Scan::Shared => {
                        found = Some(Arc::clone(&bucket[i]));
                        break;
                    }
                    Scan::Take => {
                        let conn = bucket.remove(i);
                        conn.stop_idle_timer();
                        *count -= 1;
                        found = Some(conn);
                        break;
                    }
                }
            }
            if bucket.is_empty() {
                if let Some(vec) = buckets.remove(key) {
                    spare.push(vec);
                }
            }
            found
        };

        for conn in dead {
            tracing::debug!(addr = %conn.key.addr, "dropping dead pooled connection");
            conn.shutdown();
        }
        found
    }

    /// Pool an idle connection
    ///
    /// Rejected when the key's bucket holds `max_idle_conn_per_host`
    /// connections, the pool holds `max_idle_conn` or the pool was
    /// cancelled. A rejected HTTP/1.x
    /// connection is closed; a rejected HTTP/2 connection stays with its
    /// current user, unshared.
    pub fn put_idle_conn(&self, conn: &Arc<PersistentConnection>) -> bool {
        if !conn.is_alive() {
            return false;
        }
        let config = &self.inner.config;
        let rejected = {
            let mut idle = self.inner.idle.lock();
            let per_host = idle.buckets.get(&conn.key).map_or(0, Vec::len);
            if idle
                .buckets
                .get(&conn.key)
                .is_some_and(|b| b.iter().any(|c| Arc::ptr_eq(c, conn)))
            {
                return true;
            }
            if self.is_cancelled() {
                Some("pool cancelled")
            } else if per_host >= config.max_idle_conn_per_host {
                Some("per-host idle limit")
            } else if idle.count >= config.max_idle_conn {
                Some("pool idle limit")
            } else {
                idle.bucket_mut(&conn.key).push(Arc::clone(conn));
                idle.count += 1;
                *conn.idle_at.lock() = Instant::now();
                if !conn.is_h2() {
                    conn.arm_idle_timer(self, config.idle_conn_timeout);
                }
                None
            }
        };

        match rejected {
            None => {
                tracing::trace!(addr = %conn.key.addr, h2 = conn.is_h2(), "connection pooled");
                true
            }
            Some(reason) => {
                tracing::warn!(addr = %conn.key.addr, reason, "idle insert rejected");
                if !conn.is_h2() {
                    conn.shutdown();
                }
                false
            }
        }
    }

    /// Unpool a connection; safe to call for a connection already removed
    pub fn remove_conn(&self, conn: &Arc<PersistentConnection>) -> bool {
        self.inner.idle.lock().remove_conn_locked(conn)
    }

    /// Evict on idle timer expiry, unless the connection was reused or
    /// re-armed since the timer was started
    fn evict_idle(&self, conn: &Arc<PersistentConnection>, timer_id: u64) {
        let removed = {
            let mut idle = self.inner.idle.lock();
            if conn.idle_timer_id() != Some(timer_id) {
                return;
            }
            idle.remove_conn_locked(conn)
        };
        if removed {
            tracing::debug!(addr = %conn.key.addr, "idle connection evicted");
            conn.shutdown();
        }
    }

    /// Close and drop every pooled connection
    pub fn clear(&self) {
        let conns: Vec<_> = {
            let mut idle = self.inner.idle.lock();
            idle.count = 0;
            let IdleState { buckets, spare, .. } = &mut *idle;
            let mut conns = Vec::new();
            for (_, mut bucket) in buckets.drain() {
                conns.append(&mut bucket);
                spare.push(bucket);
            }
            conns
        };
        tracing::debug!(closed = conns.len(), "pool cleared");
        for conn in conns {
            conn.stop_idle_timer();
            conn.shutdown();
        }
    }

    /// Whether `key`'s bucket reached the per-host limit
    pub fn host_conn_full(&self, key: &ConnectionKey) -> bool {
        self.bucket_len(key) >= self.inner.config.max_idle_conn_per_host
    }

    pub fn bucket_len(&self, key: &ConnectionKey) -> usize {
        self.inner.idle.lock().buckets.get(key).map_or(0, Vec::len)
    }

    /// Pooled connections across all keys
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().count
    }

    fn downgrade(&self) -> Weak<PoolInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(inner: &Weak<PoolInner>) -> Option<ConnectionPool> {
        inner.upgrade().map(|inner| ConnectionPool { inner })
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").field("idle", &self.idle_count()).finish()
    }
}

/// One dialed transport connection
///
/// Hosts an [`Http2ClientConnection`] when the connection speaks HTTP/2.
pub struct PersistentConnection {
    key: ConnectionKey,
    pool: Weak<PoolInner>,
    session: Arc<SharedSession>,
    alt: Option<Arc<Http2ClientConnection>>,
    idle_at: Mutex<Instant>,
    alive: AtomicBool,
    timer: Mutex<Option<IdleTimer>>,
}

impl PersistentConnection {
    fn dial(pool: &ConnectionPool, key: &ConnectionKey, opts: &DialOptions) -> Result<Arc<Self>> {
        let mut opts = opts.clone();
        if opts.keep_alive.is_some() {
            opts.keep_alive = Some(pool.inner.config.keep_alive);
        }
        opts.proxies = key.proxies.clone();
        if key.sni.is_some() {
            opts.sni = key.sni.clone();
        }
        if key.scheme == Scheme::H1 {
            opts.alpn = vec!["http/1.1".to_string()];
        }

        let session = Arc::new(SharedSession::from_boxed(net::dial(&key.addr, key.https, &opts)?));
        let mut key = key.clone();
        if key.scheme == Scheme::H2 && key.https && session.alpn_protocol().as_deref() != Some(&b"h2"[..]) {
            tracing::debug!(addr = %key.addr, "server did not negotiate h2, using HTTP/1.1");
            key.scheme = Scheme::H1;
        }

        if key.scheme == Scheme::H1 {
            return Ok(Self::wrap(pool, key, session, None));
        }

        let h2 = Arc::new(Http2ClientConnection::new(
            Arc::clone(&session),
            key.https,
            key.addr.clone(),
            pool.inner.config.h2.clone(),
        ));
        h2.start()?;
        if let Err(e) = h2.preface() {
            tracing::debug!(addr = %key.addr, error = %e, "h2 preface failed, redialing as HTTP/1.1");
            h2.set_close();
            key.scheme = Scheme::H1;
            opts.alpn = vec!["http/1.1".to_string()];
            let session = Arc::new(SharedSession::from_boxed(net::dial(&key.addr, key.https, &opts)?));
            return Ok(Self::wrap(pool, key, session, None));
        }

        let conn = Self::wrap(pool, key, session, Some(Arc::clone(&h2)));
        let pool_ref = pool.downgrade();
        let conn_ref = Arc::downgrade(&conn);
        h2.set_on_close(move || {
            if let Some(conn) = conn_ref.upgrade() {
                conn.alive.store(false, Ordering::Release);
                if let Some(pool) = ConnectionPool::upgrade(&pool_ref) {
                    pool.remove_conn(&conn);
                }
            }
        });
        pool.put_idle_conn(&conn);
        tracing::debug!(addr = %conn.key.addr, "h2 connection ready");
        Ok(conn)
    }

    fn wrap(
        pool: &ConnectionPool,
        key: ConnectionKey,
        session: Arc<SharedSession>,
        alt: Option<Arc<Http2ClientConnection>>,
    ) -> Arc<Self> {
        Arc::new(PersistentConnection {
            key,
            pool: pool.downgrade(),
            session,
            alt,
            idle_at: Mutex::new(Instant::now()),
            alive: AtomicBool::new(true),
            timer: Mutex::new(None),
        })
    }

    /// Key the connection is pooled under; the scheme reflects any
    /// downgrade to HTTP/1.1
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn is_h2(&self) -> bool {
        self.alt.is_some()
    }

    /// The multiplexing engine, for HTTP/2 connections
    pub fn h2(&self) -> Option<&Arc<Http2ClientConnection>> {
        self.alt.as_ref()
    }

    /// Raw transport, for HTTP/1.x exchanges
    pub fn session(&self) -> &Arc<SharedSession> {
        &self.session
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.session.is_closed()
    }

    /// Hand an HTTP/1.x connection back to its pool
    ///
    /// HTTP/2 connections never leave the pool while usable, so this is a
    /// no-op for them. Returns whether the connection is pooled afterwards.
    pub fn release(self: &Arc<Self>) -> bool {
        if self.is_h2() {
            return true;
        }
        match ConnectionPool::upgrade(&self.pool) {
            Some(pool) => pool.put_idle_conn(self),
            None => {
                self.shutdown();
                false
            }
        }
    }

    /// Unpool and close
    pub fn close(self: &Arc<Self>) {
        if let Some(pool) = ConnectionPool::upgrade(&self.pool) {
            pool.remove_conn(self);
        }
        self.shutdown();
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        self.stop_idle_timer();
        match &self.alt {
            Some(h2) => h2.set_close(),
            None => self.session.close(),
        }
    }

    fn scan(&self, now: Instant, timeout: Duration) -> Scan {
        if !self.is_alive() {
            return Scan::Dead;
        }
        match &self.alt {
            Some(h2) if h2.is_closed() || h2.read_goaway() => Scan::Dead,
            Some(h2) if h2.is_full() => Scan::Busy,
            Some(_) => Scan::Shared,
            None if now.duration_since(*self.idle_at.lock()) > timeout => Scan::Dead,
            None => Scan::Take,
        }
    }

    fn arm_idle_timer(self: &Arc<Self>, pool: &ConnectionPool, timeout: Duration) {
        let mut timer = self.timer.lock();
        if let Some(t) = timer.as_ref() {
            if t.reset(timeout) {
                return;
            }
        }
        let pool_ref = pool.downgrade();
        let conn_ref = Arc::downgrade(self);
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        let started = IdleTimer::start(id, timeout, move || {
            if let (Some(pool), Some(conn)) = (ConnectionPool::upgrade(&pool_ref), conn_ref.upgrade()) {
                pool.evict_idle(&conn, id);
            }
        });
        match started {
            Ok(t) => *timer = Some(t),
            Err(e) => tracing::warn!(addr = %self.key.addr, error = %e, "idle timer not started"),
        }
    }

    fn stop_idle_timer(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.stop();
        }
    }

    fn idle_timer_id(&self) -> Option<u64> {
        self.timer.lock().as_ref().map(|t| t.id)
    }
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("key", &self.key)
            .field("h2", &self.is_h2())
            .field("alive", &self.is_alive())
            .finish()
    }
}

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TimerState {
    deadline: Instant,
    stopped: bool,
    fired: bool,
}

#[derive(Debug)]
struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Runs a callback once a deadline passes unless stopped first
///
/// One thread per armed timer; it exits when the timer fires or stops.
#[derive(Debug)]
pub struct IdleTimer {
    id: u64,
    shared: Arc<TimerShared>,
}

impl IdleTimer {
    fn start(id: u64, timeout: Duration, on_fire: impl FnOnce() + Send + 'static) -> std::io::Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState { deadline: Instant::now() + timeout, stopped: false, fired: false }),
            cond: Condvar::new(),
        });
        let s = Arc::clone(&shared);
        thread::Builder::new().name("pool-idle-timer".to_string()).spawn(move || {
            let _task = TaskGuard::new(TaskKind::IdleTimer);
            {
                let mut state = s.state.lock();
                loop {
                    if state.stopped {
                        return;
                    }
                    let deadline = state.deadline;
                    if Instant::now() >= deadline {
                        state.fired = true;
                        break;
                    }
                    s.cond.wait_until(&mut state, deadline);
                }
            }
            on_fire();
        })?;
        Ok(IdleTimer { id, shared })
    }

    /// Push the deadline out; false if the timer already fired or stopped
    fn reset(&self, timeout: Duration) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopped || state.fired {
            return false;
        }
        state.deadline = Instant::now() + timeout;
        self.shared.cond.notify_all();
        true
    }

    fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        self.shared.cond.notify_all();
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.stop();
    }
}
