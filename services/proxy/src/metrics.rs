//! Counter sinks.
//!
//! The proxy counts the behavior chosen for each connection and the
//! `<protocol>.<conn-id>.start|end|to_backend|to_client` events. Sinks are
//! fire and forget: a failing sink never affects traffic.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info};

/// Receives counter increments.
pub trait MetricsSink: Send + Sync + 'static {
    fn increment(&self, name: &str);
}

/// Writes each increment as an info log line. Used when no statsd server is
/// configured.
#[derive(Debug, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn increment(&self, name: &str) {
        info!(counter = name, "counter");
    }
}

/// Sends `<prefix>.<name>:1|c` datagrams to a statsd server.
pub struct StatsdSink {
    socket: UdpSocket,
    target: SocketAddr,
    prefix: String,
    sample_rate: f64,
    rng: Mutex<StdRng>,
}

impl StatsdSink {
    /// Resolve `host:port` and open a non-blocking UDP socket towards it.
    ///
    /// `sample_rate` is clamped to `0.0..=1.0`.
    pub fn connect(
        host: &str,
        port: u16,
        prefix: &str,
        sample_rate: f64,
        rng: StdRng,
    ) -> io::Result<Self> {
        let target = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("statsd host {host:?} did not resolve"),
            )
        })?;
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            target,
            prefix: prefix.trim_end_matches('.').to_string(),
            sample_rate: sample_rate.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        })
    }

    fn datagram(&self, name: &str) -> String {
        let stat = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        };
        if self.sample_rate < 1.0 {
            format!("{stat}:1|c|@{}", self.sample_rate)
        } else {
            format!("{stat}:1|c")
        }
    }
}

impl MetricsSink for StatsdSink {
    fn increment(&self, name: &str) {
        if self.sample_rate < 1.0 {
            let roll: f64 = self
                .rng
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .random();
            if roll >= self.sample_rate {
                return;
            }
        }
        if let Err(e) = self.socket.send_to(self.datagram(name).as_bytes(), self.target) {
            debug!(error = %e, counter = name, "Failed to send statsd counter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::time::Duration;

    fn receiver() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    fn recv(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 512];
        let n = socket.recv(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_counter_datagram() {
        let (server, port) = receiver();
        let sink =
            StatsdSink::connect("127.0.0.1", port, "mayhem.", 1.0, StdRng::seed_from_u64(0))
                .unwrap();

        sink.increment("http.1.start");
        assert_eq!(recv(&server), "mayhem.http.1.start:1|c");
    }

    #[test]
    fn test_sampled_counter_carries_rate() {
        let sink =
            StatsdSink::connect("127.0.0.1", 8125, "mayhem", 0.5, StdRng::seed_from_u64(0))
                .unwrap();
        assert_eq!(sink.datagram("delay"), "mayhem.delay:1|c|@0.5");
    }

    #[test]
    fn test_zero_rate_sends_nothing() {
        let (server, port) = receiver();
        server
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let sink = StatsdSink::connect("127.0.0.1", port, "", 0.0, StdRng::seed_from_u64(0))
            .unwrap();

        sink.increment("dummy");
        let mut buf = [0u8; 64];
        assert!(server.recv(&mut buf).is_err());
    }
}
