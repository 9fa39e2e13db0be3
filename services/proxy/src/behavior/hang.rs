use std::io;

use async_trait::async_trait;
use tracing::debug;

use super::{Behavior, Forward};
use crate::options::Settings;

/// Swallows the input and never answers.
///
/// Reads are not bound by the idle timeout. Once the source is drained the
/// cycle waits for either endpoint to be closed locally, which only happens
/// when the connection is cancelled. A peer half-close does not release it.
#[derive(Debug, Default)]
pub struct Hang;

#[async_trait]
impl Behavior for Hang {
    fn name(&self) -> &'static str {
        "hang"
    }

    fn description(&self) -> &'static str {
        "Reads the packets that have been sent then hangs"
    }

    async fn before_forward(&self, fwd: &Forward<'_>, _settings: &Settings) -> io::Result<bool> {
        let mut swallowed = 0usize;
        loop {
            let data = fwd.source.read_chunk_untimed(fwd.buffer).await?;
            if data.is_empty() {
                break;
            }
            swallowed += data.len();
        }
        debug!(conn_id = fwd.conn_id, swallowed, "Source drained, hanging");

        tokio::select! {
            _ = fwd.source.closed() => {}
            _ = fwd.dest.closed() => {}
        }
        debug!(conn_id = fwd.conn_id, "Hang released");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Direction;
    use crate::testing::proxied_pair;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_hangs_until_cancelled() {
        let (mut client_peer, client, backend, _b) = proxied_pair().await;
        client_peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let fwd = Forward {
            conn_id: 1,
            protocol: "http",
            direction: Direction::ToBackend,
            source: &client,
            dest: &backend,
            buffer: 4,
        };
        let settings = Settings::default();
        let hung = Hang.before_forward(&fwd, &settings);
        tokio::pin!(hung);

        let still_hung = tokio::time::timeout(Duration::from_millis(200), &mut hung).await;
        assert!(still_hung.is_err());

        client.close();
        assert!(!hung.await.unwrap());
    }

    #[tokio::test]
    async fn test_source_eof_does_not_release() {
        let (mut client_peer, client, backend, _b) = proxied_pair().await;
        client_peer.write_all(b"stuck").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let fwd = Forward {
            conn_id: 1,
            protocol: "tcp",
            direction: Direction::ToBackend,
            source: &client,
            dest: &backend,
            buffer: 1024,
        };
        let settings = Settings::default();
        let hung = Hang.before_forward(&fwd, &settings);
        tokio::pin!(hung);

        let still_hung = tokio::time::timeout(Duration::from_millis(200), &mut hung).await;
        assert!(still_hung.is_err());
        assert!(client.at_eof());

        backend.close();
        assert!(!hung.await.unwrap());
    }
}
