//! The chaos proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Proxy -> Behavior -> Protocol -> Backend Pool -> Backend
//!             |
//!       Selection (fixed | weighted | dynamic)
//! ```
//!
//! Each accepted connection gets its own task. The task checks a backend
//! socket out of the pool, picks a behavior and then pumps forward cycles in
//! both directions until one side goes away, the idle timeout expires or the
//! protocol reports the exchange is over.

use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

mod backend;
mod connection;
mod listener;

pub use backend::BackendConnector;
pub use listener::Proxy;

/// Default idle timeout for reads and readiness waits.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default age after which a pooled backend socket is discarded.
pub const DEFAULT_POOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound of the backend pool.
pub const DEFAULT_POOL_MAX_SIZE: usize = 100;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 8192;

/// Resolved proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Address to accept clients on.
    pub listen: SocketAddr,
    /// Address of the proxied service.
    pub backend: SocketAddr,
    /// Idle timeout. Also bounds backend connects.
    pub timeout: Duration,
    /// Keep pumping after an idle timeout or an exchange that reported done.
    pub stay_connected: bool,
    /// Pool bound. `None` is unbounded.
    pub pool_max_size: Option<usize>,
    pub pool_timeout: Duration,
    pub backlog: u32,
}

impl ProxySettings {
    pub fn new(listen: SocketAddr, backend: SocketAddr) -> Self {
        Self {
            listen,
            backend,
            timeout: DEFAULT_TIMEOUT,
            stay_connected: false,
            pool_max_size: Some(DEFAULT_POOL_MAX_SIZE),
            pool_timeout: DEFAULT_POOL_TIMEOUT,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Statistics for a proxy.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being proxied.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections that failed to get a backend socket.
    pub backend_failed: AtomicU64,
    /// Connections torn down by a socket or framing error.
    pub connection_errors: AtomicU64,
}
