//! TCP listener and connection handling.
//!
//! The proxy accepts clients, checks a backend socket out of the pool, picks
//! the behavior for the connection and hands both sockets to the pump. When
//! the pump is done the client socket is closed and the backend socket goes
//! back to the pool if the protocol allows it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::BackendConnector;
use super::connection::Session;
use super::{ProxySettings, ProxyStats};
use crate::behavior::Selection;
use crate::endpoint::{Endpoint, Side};
use crate::error::{ConfigError, ConnectionError};
use crate::metrics::MetricsSink;
use crate::pool::Pool;
use crate::protocol::Protocol;

/// A bound chaos proxy.
pub struct Proxy {
    listener: TcpListener,
    backend: SocketAddr,
    protocol: Arc<dyn Protocol>,
    selection: Selection,
    pool: Arc<Pool<BackendConnector>>,
    metrics: Arc<dyn MetricsSink>,
    timeout: Duration,
    stay_connected: bool,
    next_id: AtomicU64,
    stats: Arc<ProxyStats>,
}

impl Proxy {
    /// Bind the listen socket with the configured backlog.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(
        settings: &ProxySettings,
        protocol: Arc<dyn Protocol>,
        selection: Selection,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        let listener = listen(settings.listen, settings.backlog).map_err(|source| {
            ConfigError::Bind {
                addr: settings.listen,
                source,
            }
        })?;

        let connector = BackendConnector::new(settings.backend, settings.timeout, settings.timeout);
        let pool = Arc::new(Pool::new(
            connector,
            settings.pool_max_size,
            settings.pool_timeout,
        ));

        info!(
            listen = %settings.listen,
            backend = %settings.backend,
            protocol = protocol.name(),
            mode = selection.mode(),
            backlog = settings.backlog,
            "Proxy bound"
        );

        Ok(Self {
            listener,
            backend: settings.backend,
            protocol,
            selection,
            pool,
            metrics,
            timeout: settings.timeout,
            stay_connected: settings.stay_connected,
            next_id: AtomicU64::new(1),
            stats: Arc::new(ProxyStats::default()),
        })
    }

    /// Get the local address this proxy is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn backend_addr(&self) -> SocketAddr {
        self.backend
    }

    /// Get proxy statistics.
    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    pub fn pool(&self) -> &Pool<BackendConnector> {
        &self.pool
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Every connection runs under a child of `shutdown`, so cancelling it
    /// also tears down the connections in flight.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(listen = %local_addr, backend = %self.backend_addr(), "Proxy started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let proxy = Arc::clone(&self);
                    let cancel = shutdown.child_token();

                    tokio::spawn(
                        async move {
                            if let Err(e) = proxy.handle_connection(stream, conn_id, cancel).await
                            {
                                proxy
                                    .stats
                                    .connection_errors
                                    .fetch_add(1, Ordering::Relaxed);
                                debug!(error = %e, "Connection error");
                            }

                            proxy
                                .stats
                                .connections_active
                                .fetch_sub(1, Ordering::Relaxed);
                            proxy
                                .stats
                                .connections_closed
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", conn_id, peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }

        info!(listen = %local_addr, "Proxy stopped");
        Ok(())
    }

    /// Handle a single connection.
    async fn handle_connection(
        &self,
        stream: TcpStream,
        conn_id: u64,
        cancel: CancellationToken,
    ) -> Result<(), ConnectionError> {
        let client = Endpoint::new(stream, Side::Client, self.timeout);

        let acquired = tokio::select! {
            acquired = self.pool.acquire() => acquired,
            _ = cancel.cancelled() => {
                client.close();
                return Ok(());
            }
        };
        let mut backend = match acquired {
            Ok(backend) => backend,
            Err(e) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "No backend connection");
                client.close();
                return Err(e.into());
            }
        };

        let active = self.selection.select();
        let protocol = self.protocol.name();
        self.metrics.increment(active.name());
        self.metrics.increment(&format!("{protocol}.{conn_id}.start"));
        debug!(
            behavior = active.name(),
            protocol,
            backend_peer = ?backend.peer(),
            "Connection started"
        );

        let result = Session {
            conn_id,
            protocol: self.protocol.as_ref(),
            active,
            client: &client,
            backend: &backend,
            metrics: self.metrics.as_ref(),
            timeout: self.timeout,
            stay_connected: self.stay_connected,
            cancel: &cancel,
        }
        .pump()
        .await;

        self.metrics.increment(&format!("{protocol}.{conn_id}.end"));
        client.close();

        let reuse =
            self.protocol.options().reuse_socket && result.is_ok() && backend.is_reusable();
        if !reuse {
            backend.close();
            backend.mark_closed();
        }
        debug!(
            reused = reuse,
            backend_age_ms = backend.created().elapsed().as_millis() as u64,
            "Connection finished"
        );

        result.map_err(Into::into)
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}
