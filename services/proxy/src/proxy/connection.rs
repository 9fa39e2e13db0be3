//! The per-connection pump.

use std::io;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::behavior::{ActiveBehavior, Direction, Forward};
use crate::endpoint::Endpoint;
use crate::error::ProtocolError;
use crate::metrics::MetricsSink;
use crate::protocol::Protocol;

/// Everything one proxied connection runs with.
pub(super) struct Session<'a> {
    pub conn_id: u64,
    pub protocol: &'a dyn Protocol,
    /// Chosen at accept time and kept for the whole connection.
    pub active: ActiveBehavior,
    pub client: &'a Endpoint,
    pub backend: &'a Endpoint,
    pub metrics: &'a dyn MetricsSink,
    pub timeout: Duration,
    pub stay_connected: bool,
    pub cancel: &'a CancellationToken,
}

impl Session<'_> {
    /// Run forward cycles until the connection is done.
    ///
    /// Each round waits for either socket to become readable and then runs
    /// one cycle per ready socket, both directions concurrently. The loop
    /// ends when a socket is closed or at end-of-stream, when the idle
    /// timeout expires, or when a round does not report every cycle as
    /// wanting more. `stay_connected` overrides the last two.
    pub async fn pump(&self) -> Result<(), ProtocolError> {
        loop {
            if self.finished() {
                return Ok(());
            }

            let ready = tokio::select! {
                ready = tokio::time::timeout(self.timeout, self.wait_readable()) => ready,
                _ = self.cancel.cancelled() => {
                    self.abort();
                    return Ok(());
                }
            };
            let (client_ready, backend_ready) = match ready {
                Ok(ready) => ready?,
                Err(_) if self.stay_connected => continue,
                Err(_) => {
                    debug!(
                        conn_id = self.conn_id,
                        idle_secs = self.timeout.as_secs_f64(),
                        "Idle timeout"
                    );
                    return Ok(());
                }
            };

            let mut cycles = Vec::with_capacity(2);
            if client_ready {
                cycles.push(self.cycle(Direction::ToBackend));
            }
            if backend_ready {
                cycles.push(self.cycle(Direction::ToClient));
            }

            let results = tokio::select! {
                results = join_all(cycles) => results,
                _ = self.cancel.cancelled() => {
                    self.abort();
                    return Ok(());
                }
            };

            let mut keep_going = true;
            for result in results {
                keep_going &= result?;
            }
            if !keep_going && !self.stay_connected {
                return Ok(());
            }
        }
    }

    fn finished(&self) -> bool {
        [self.client, self.backend]
            .iter()
            .any(|endpoint| endpoint.is_closed() || endpoint.at_eof())
    }

    fn abort(&self) {
        debug!(conn_id = self.conn_id, "Connection cancelled");
        self.client.close();
        self.backend.close();
    }

    /// Wait until at least one socket is readable; report which ones are.
    async fn wait_readable(&self) -> io::Result<(bool, bool)> {
        tokio::select! {
            res = self.client.readable() => {
                res?;
                Ok((true, self.backend.readable().now_or_never().is_some()))
            }
            res = self.backend.readable() => {
                res?;
                Ok((self.client.readable().now_or_never().is_some(), true))
            }
        }
    }

    /// One forward cycle in `direction`.
    async fn cycle(&self, direction: Direction) -> Result<bool, ProtocolError> {
        let protocol = self.protocol.name();
        self.metrics
            .increment(&format!("{protocol}.{}.{direction}", self.conn_id));

        let (source, dest) = match direction {
            Direction::ToBackend => (self.client, self.backend),
            Direction::ToClient => (self.backend, self.client),
        };
        let fwd = Forward {
            conn_id: self.conn_id,
            protocol,
            direction,
            source,
            dest,
            buffer: self.protocol.options().buffer,
        };

        let result = self.protocol.forward_one_message(&self.active, &fwd).await;
        match &result {
            Ok(keep) => trace!(
                conn_id = self.conn_id,
                direction = %direction,
                keep,
                "Forward cycle done"
            ),
            Err(e) => debug!(
                conn_id = self.conn_id,
                direction = %direction,
                behavior = self.active.name(),
                protocol,
                reason = e.reason_code(),
                error = %e,
                "Forward cycle failed"
            ),
        }
        result
    }
}
