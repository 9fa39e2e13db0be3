//! Backend connection pool.
//!
//! A priority heap of slots ordered so that the oldest live connection pops
//! first and empty slots pop last. A bounded pool is primed with `max_size`
//! empty slots and never holds more than that many entries; a semaphore with
//! one permit per queued slot makes [`Pool::acquire`] wait while every slot is
//! checked out. Unbounded pools create connections on demand.
//!
//! Entry age is measured from connection creation on the monotonic clock.
//! Stale entries are dropped on checkout and check-in.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ConnectError;

/// Creates new pooled connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Conn, ConnectError>;
}

enum Slot<T> {
    Live { created: Instant, conn: T },
    Empty,
}

impl<T> Slot<T> {
    /// Heap key: live entries before empty ones, older before newer.
    fn key(&self) -> (bool, Option<Instant>) {
        match self {
            Slot::Live { created, .. } => (false, Some(*created)),
            Slot::Empty => (true, None),
        }
    }
}

impl<T> PartialEq for Slot<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for Slot<T> {}

impl<T> PartialOrd for Slot<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Slot<T> {
    // BinaryHeap is a max-heap, so the entry that should pop first compares greatest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

/// Pool counters.
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Connections created.
    pub created: AtomicU64,
    /// Checkouts served by an existing connection.
    pub reused: AtomicU64,
    /// Connections dropped for exceeding the timeout.
    pub evicted: AtomicU64,
    /// Connection attempts that failed.
    pub failed: AtomicU64,
}

/// A pool of reusable connections produced by a [`Connector`].
pub struct Pool<C: Connector> {
    connector: C,
    max_size: Option<usize>,
    timeout: Duration,
    slots: Mutex<BinaryHeap<Slot<C::Conn>>>,
    /// One permit per queued slot. `None` for unbounded pools.
    available: Option<Semaphore>,
    stats: PoolStats,
}

impl<C: Connector> Pool<C> {
    /// Create a pool. `max_size` of `None` makes it unbounded.
    pub fn new(connector: C, max_size: Option<usize>, timeout: Duration) -> Self {
        let mut slots = BinaryHeap::new();
        if let Some(max) = max_size {
            slots.extend((0..max).map(|_| Slot::Empty));
        }
        Self {
            connector,
            max_size,
            timeout,
            slots: Mutex::new(slots),
            available: max_size.map(Semaphore::new),
            stats: PoolStats::default(),
        }
    }

    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Number of live connections waiting in the pool.
    pub fn idle(&self) -> usize {
        self.lock_slots()
            .iter()
            .filter(|slot| matches!(slot, Slot::Live { .. }))
            .count()
    }

    /// Check out a connection, reusing a fresh one or creating a new one.
    ///
    /// Waits while a bounded pool has every slot checked out. Creation
    /// failures are returned to the caller and the slot is given back.
    pub async fn acquire(self: &Arc<Self>) -> Result<Reservation<C>, ConnectError> {
        loop {
            if let Some(available) = &self.available {
                if let Ok(permit) = available.acquire().await {
                    permit.forget();
                }
            }

            let popped = self.lock_slots().pop();
            match popped {
                Some(Slot::Live { created, conn }) => {
                    if created.elapsed() < self.timeout {
                        self.stats.reused.fetch_add(1, Ordering::Relaxed);
                        return Ok(self.reservation(created, conn));
                    }
                    self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    debug!(age_secs = created.elapsed().as_secs(), "Dropping stale pooled connection");
                    drop(conn);
                    if self.max_size.is_some() {
                        self.push(Slot::Empty);
                    }
                }
                Some(Slot::Empty) | None => return self.create().await,
            }
        }
    }

    async fn create(self: &Arc<Self>) -> Result<Reservation<C>, ConnectError> {
        match self.connector.connect().await {
            Ok(conn) => {
                self.stats.created.fetch_add(1, Ordering::Relaxed);
                Ok(self.reservation(Instant::now(), conn))
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                if self.max_size.is_some() {
                    self.push(Slot::Empty);
                }
                Err(e)
            }
        }
    }

    fn reservation(self: &Arc<Self>, created: Instant, conn: C::Conn) -> Reservation<C> {
        Reservation {
            pool: Arc::clone(self),
            created,
            conn: Some(conn),
            closed: false,
        }
    }

    fn release(&self, created: Instant, conn: C::Conn, closed: bool) {
        if !closed && created.elapsed() < self.timeout {
            self.push(Slot::Live { created, conn });
            return;
        }
        drop(conn);
        if self.max_size.is_some() {
            self.push(Slot::Empty);
        }
    }

    fn push(&self, slot: Slot<C::Conn>) {
        self.lock_slots().push(slot);
        if let Some(available) = &self.available {
            available.add_permits(1);
        }
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Slot<C::Conn>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out connection. Dropping it returns the connection to the pool.
pub struct Reservation<C: Connector> {
    pool: Arc<Pool<C>>,
    created: Instant,
    conn: Option<C::Conn>,
    closed: bool,
}

impl<C: Connector> Reservation<C> {
    /// Discard the connection on release instead of pooling it.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// When the underlying connection was created.
    pub fn created(&self) -> Instant {
        self.created
    }
}

impl<C: Connector> Deref for Reservation<C> {
    type Target = C::Conn;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<C: Connector> Drop for Reservation<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(self.created, conn, self.closed);
        }
    }
}
