//! A pool of warm sessions with address failover.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::session::Session;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, interval_at, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

struct Idle {
    session: Session,
    since: Instant,
}

struct PoolInner {
    config: PoolConfig,
    addresses: Vec<String>,
    rotation_tx: flume::Sender<String>,
    rotation_rx: flume::Receiver<String>,
    idle: Mutex<VecDeque<Idle>>,
    live: AtomicUsize,
    returned: Notify,
    cancel: CancellationToken,
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn report(&self, err: &PoolError) {
        if let Some(hook) = &self.config.on_error {
            hook(err);
        }
    }

    fn refill_rotation(&self) {
        for address in &self.addresses {
            self.return_address(address.clone());
        }
    }

    fn return_address(&self, address: String) {
        // Full means the address is already queued.
        if self.rotation_tx.try_send(address).is_err() {
            trace!("Address rotation already full");
        }
    }

    /// Claim a live slot if fewer than `max_cap` sessions exist.
    fn try_reserve(&self) -> bool {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.config.max_cap).then_some(live + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.returned.notify_one();
    }

    /// Dial the next address in the rotation, moving on after a failure until
    /// every address has been tried once.
    async fn create(&self) -> Result<Session> {
        let dial_timeout = self.config.dial_timeout;
        let mut last_error = None;

        for _ in 0..self.addresses.len() {
            let address = match timeout(dial_timeout, self.rotation_rx.recv_async()).await {
                Ok(Ok(address)) => address,
                _ => {
                    self.refill_rotation();
                    let err = PoolError::NoAddress(dial_timeout);
                    self.report(&err);
                    return Err(err);
                }
            };

            let config = self.config.session.clone().with_dial_timeout(dial_timeout);
            match Session::connect(self.config.network.clone(), &address, config).await {
                Ok(session) => {
                    if !self.config.ping_interval.is_zero() {
                        session.start_ping(self.config.ping_interval, Bytes::new());
                    }
                    self.return_address(address.clone());
                    debug!("Pool opened session to {}", address);
                    if let Some(hook) = &self.config.on_open {
                        hook(&address);
                    }
                    return Ok(session);
                }
                Err(e) => {
                    warn!("Pool failed to dial {}: {}", address, e);
                    self.return_address(address);
                    let err = PoolError::Session(e);
                    self.report(&err);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(PoolError::NoAddress(dial_timeout)))
    }

    fn expired(&self, idle: &Idle) -> bool {
        self.config
            .idle_timeout
            .is_some_and(|limit| idle.since.elapsed() > limit)
    }

    async fn healthy(&self, idle: &Idle) -> bool {
        if !idle.session.is_open() || self.expired(idle) {
            return false;
        }
        idle.session
            .ping(Bytes::new(), self.config.dial_timeout)
            .await
            .is_ok()
    }

    fn discard(&self, session: &Session) {
        session.close();
        debug!("Pool discarded session to {}", session.address());
        if let Some(hook) = &self.config.on_close {
            hook(session.address());
        }
        self.release();
    }

    fn put(&self, session: Session) {
        if self.is_closed() || !session.is_open() {
            self.discard(&session);
            return;
        }
        self.idle.lock().push_back(Idle {
            session,
            since: Instant::now(),
        });
        self.returned.notify_one();
    }

    fn pop_idle(&self) -> Option<Idle> {
        self.idle.lock().pop_front()
    }

    /// Evict dead or expired idle sessions, then refill to `initial_cap`.
    async fn maintain(&self) {
        let evicted: Vec<Session> = {
            let mut idle = self.idle.lock();
            let (keep, evict): (VecDeque<Idle>, VecDeque<Idle>) = idle
                .drain(..)
                .partition(|entry| entry.session.is_open() && !self.expired(entry));
            *idle = keep;
            evict.into_iter().map(|entry| entry.session).collect()
        };
        for session in &evicted {
            self.discard(session);
        }

        let target = self.config.initial_cap.min(self.config.max_cap);
        while self.live.load(Ordering::Acquire) < target && self.try_reserve() {
            match self.create().await {
                Ok(session) => self.put(session),
                Err(_) => {
                    self.release();
                    break;
                }
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        let idle: Vec<Idle> = self.idle.get_mut().drain(..).collect();
        if !idle.is_empty() {
            debug!("Pool dropped with {} idle sessions", idle.len());
        }
        for entry in &idle {
            self.discard(&entry.session);
        }
    }
}

async fn maintenance_loop(pool: Weak<PoolInner>, cancel: CancellationToken, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.maintain().await;
    }
    trace!("Pool maintenance stopped");
}

/// Keeps sessions to a set of equivalent servers open and hands them out.
///
/// Sessions are dialed round-robin over the addresses; a failed dial moves on
/// to the next address. There is no process-wide pool: create one and pass it
/// where it is needed. Cloning is cheap; idle sessions close once the last
/// clone and every checked-out session are gone.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool and open `initial_cap` sessions.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::NoAddress`] if `addresses` is empty, or the last
    /// dial error if no initial session could be opened.
    #[instrument(skip(addresses, config))]
    pub async fn connect<I, S>(addresses: I, config: PoolConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let addresses: Vec<String> = addresses.into_iter().map(Into::into).collect();
        if addresses.is_empty() {
            return Err(PoolError::NoAddress(config.dial_timeout));
        }

        let (rotation_tx, rotation_rx) = flume::bounded(addresses.len());
        let period = config.ping_interval;
        let inner = Arc::new(PoolInner {
            config,
            addresses,
            rotation_tx,
            rotation_rx,
            idle: Mutex::new(VecDeque::new()),
            live: AtomicUsize::new(0),
            returned: Notify::new(),
            cancel: CancellationToken::new(),
        });
        inner.refill_rotation();

        let initial = inner.config.initial_cap.min(inner.config.max_cap);
        let mut last_error = None;
        for _ in 0..initial {
            if !inner.try_reserve() {
                break;
            }
            match inner.create().await {
                Ok(session) => inner.put(session),
                Err(e) => {
                    inner.release();
                    last_error = Some(e);
                }
            }
        }
        if initial > 0 && inner.live.load(Ordering::Acquire) == 0 {
            return Err(last_error.unwrap_or(PoolError::NoAddress(inner.config.dial_timeout)));
        }

        if !period.is_zero() {
            tokio::spawn(maintenance_loop(
                Arc::downgrade(&inner),
                inner.cancel.clone(),
                period,
            ));
        }

        info!(
            "Pool ready with {} sessions over {} addresses",
            inner.live.load(Ordering::Acquire),
            inner.addresses.len()
        );
        Ok(Self { inner })
    }

    /// Check out a session.
    ///
    /// Idle sessions are health-checked first. If none is usable and fewer
    /// than `max_cap` exist, a new one is dialed; otherwise this waits up to
    /// the dial timeout for one to be returned.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Exhausted`] if nothing frees up in time,
    /// [`PoolError::Closed`] after [`Pool::close`], or the dial error.
    pub async fn session(&self) -> Result<PooledSession> {
        let deadline = Instant::now() + self.inner.config.dial_timeout;

        loop {
            if self.inner.is_closed() {
                return Err(PoolError::Closed);
            }

            while let Some(idle) = self.inner.pop_idle() {
                if self.inner.healthy(&idle).await {
                    return Ok(self.wrap(idle.session));
                }
                self.inner.discard(&idle.session);
            }

            if self.inner.try_reserve() {
                return match self.inner.create().await {
                    Ok(session) => Ok(self.wrap(session)),
                    Err(e) => {
                        self.inner.release();
                        Err(e)
                    }
                };
            }

            if timeout_at(deadline, self.inner.returned.notified())
                .await
                .is_err()
            {
                return Err(PoolError::Exhausted {
                    live: self.len(),
                    max: self.inner.config.max_cap,
                });
            }
        }
    }

    fn wrap(&self, session: Session) -> PooledSession {
        PooledSession {
            session,
            pool: Arc::clone(&self.inner),
            discarded: false,
        }
    }

    /// Live sessions, idle or checked out.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Returns `true` if no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sessions waiting in the pool.
    #[must_use]
    pub fn idle_len(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Server addresses in rotation.
    #[must_use]
    pub fn addresses(&self) -> &[String] {
        &self.inner.addresses
    }

    /// Stop maintenance and close every session. Checked-out sessions close
    /// when they are returned.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let idle: Vec<Idle> = self.inner.idle.lock().drain(..).collect();
        for entry in &idle {
            self.inner.discard(&entry.session);
        }
        info!("Pool closed");
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("addresses", &self.inner.addresses)
            .field("live", &self.len())
            .field("idle", &self.idle_len())
            .field("closed", &self.inner.is_closed())
            .finish_non_exhaustive()
    }
}

/// A session checked out of a [`Pool`], returned when dropped.
pub struct PooledSession {
    session: Session,
    pool: Arc<PoolInner>,
    discarded: bool,
}

impl PooledSession {
    /// Close the session instead of returning it.
    pub fn discard(mut self) {
        self.discarded = true;
        self.pool.discard(&self.session);
    }
}

impl Deref for PooledSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if !self.discarded {
            self.pool.put(self.session.clone());
        }
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledSession").field(&self.session).finish()
    }
}
