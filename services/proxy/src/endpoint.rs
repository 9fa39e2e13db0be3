//! Connection handles shared between the two directions of a proxied
//! connection.
//!
//! An [`Endpoint`] wraps one TCP socket split into halves, each behind its own
//! lock, so that one direction can read a socket while the other writes it.
//! Locks are held for a single read or write only. The `closed` flag is owned
//! by the handle: closing it cancels the endpoint token, which wakes every task
//! currently suspended on the socket.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Which peer an endpoint talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Client => "client",
            Side::Backend => "backend",
        })
    }
}

struct ReadState {
    half: OwnedReadHalf,
    /// Bytes pushed back by a protocol that read past a message boundary.
    pending: BytesMut,
}

/// One side of a proxied connection.
pub struct Endpoint {
    side: Side,
    peer: Option<SocketAddr>,
    reader: Mutex<ReadState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    closed: AtomicBool,
    /// Set once a read returned end-of-stream.
    eof: AtomicBool,
    cancel: CancellationToken,
    /// Idle limit for a single read.
    read_timeout: Duration,
}

impl Endpoint {
    pub fn new(stream: TcpStream, side: Side, read_timeout: Duration) -> Self {
        let peer = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            side,
            peer,
            reader: Mutex::new(ReadState {
                half: read,
                pending: BytesMut::new(),
            }),
            writer: Mutex::new(Some(write)),
            closed: AtomicBool::new(false),
            eof: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            read_timeout,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Read at most `max` bytes, waiting no longer than the idle timeout.
    ///
    /// An empty result means the peer closed the socket or the endpoint was
    /// closed locally. Expiry of the idle timeout is a `TimedOut` error.
    pub async fn read_chunk(&self, max: usize) -> io::Result<Bytes> {
        self.read_inner(max, Some(self.read_timeout)).await
    }

    /// Like [`read_chunk`](Self::read_chunk) without the idle timeout.
    pub async fn read_chunk_untimed(&self, max: usize) -> io::Result<Bytes> {
        self.read_inner(max, None).await
    }

    async fn read_inner(&self, max: usize, limit: Option<Duration>) -> io::Result<Bytes> {
        if self.is_closed() {
            return Ok(Bytes::new());
        }

        let mut state = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = self.cancel.cancelled() => return Ok(Bytes::new()),
        };

        if !state.pending.is_empty() {
            let n = max.max(1).min(state.pending.len());
            return Ok(state.pending.split_to(n).freeze());
        }

        let mut buf = vec![0u8; max.max(1)];
        let read = state.half.read(&mut buf);
        let n = match limit {
            Some(limit) => tokio::select! {
                res = tokio::time::timeout(limit, read) => res.map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} idle for {}s", self.side, limit.as_secs_f64()),
                    )
                })??,
                _ = self.cancel.cancelled() => return Ok(Bytes::new()),
            },
            None => tokio::select! {
                res = read => res?,
                _ = self.cancel.cancelled() => return Ok(Bytes::new()),
            },
        };

        if n == 0 {
            self.eof.store(true, Ordering::Release);
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    /// Push bytes back so the next read returns them first.
    pub async fn unread(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.reader.lock().await;
        let mut joined = BytesMut::with_capacity(data.len() + state.pending.len());
        joined.extend_from_slice(data);
        joined.extend_from_slice(&state.pending);
        state.pending = joined;
    }

    /// Write all of `data`. Fails with `NotConnected` once the endpoint is closed.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(self.not_connected());
        }
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or_else(|| self.not_connected())?;
        tokio::select! {
            res = half.write_all(data) => res,
            _ = self.cancel.cancelled() => Err(self.not_connected()),
        }
    }

    /// Wait until a read would not block: buffered bytes, socket readiness,
    /// or local close.
    pub async fn readable(&self) -> io::Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let state = tokio::select! {
            guard = self.reader.lock() => guard,
            _ = self.cancel.cancelled() => return Ok(()),
        };
        if !state.pending.is_empty() {
            return Ok(());
        }
        tokio::select! {
            res = state.half.readable() => res,
            _ = self.cancel.cancelled() => Ok(()),
        }
    }

    /// Mark the socket closed and wake every task waiting on it.
    ///
    /// The write half is shut down immediately when no write is in flight;
    /// otherwise it goes away with the endpoint.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn at_eof(&self) -> bool {
        self.eof.load(Ordering::Acquire)
    }

    /// Whether the socket can serve another exchange.
    pub fn is_reusable(&self) -> bool {
        !self.is_closed() && !self.at_eof()
    }

    /// Resolves once the endpoint is closed.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    fn not_connected(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::NotConnected,
            format!("{} socket closed", self.side),
        )
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("side", &self.side)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .field("eof", &self.at_eof())
            .finish()
    }
}
