use std::io;

use async_trait::async_trait;
use tracing::debug;

use super::{Behavior, Forward};
use crate::options::Settings;

/// Closes the source socket without forwarding anything.
#[derive(Debug, Default)]
pub struct Blackout;

#[async_trait]
impl Behavior for Blackout {
    fn name(&self) -> &'static str {
        "blackout"
    }

    fn description(&self) -> &'static str {
        "Immediately closes the source socket, no data is exchanged"
    }

    async fn before_forward(&self, fwd: &Forward<'_>, _settings: &Settings) -> io::Result<bool> {
        debug!(conn_id = fwd.conn_id, direction = %fwd.direction, "Blacking out");
        fwd.source.close();
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Direction;
    use crate::testing::proxied_pair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_closes_source_without_forwarding() {
        let (mut client_peer, client, backend, _backend_peer) = proxied_pair().await;
        client_peer.write_all(b"hello").await.unwrap();

        let fwd = Forward {
            conn_id: 1,
            protocol: "tcp",
            direction: Direction::ToBackend,
            source: &client,
            dest: &backend,
            buffer: 1024,
        };
        let go_on = Blackout
            .before_forward(&fwd, &Settings::default())
            .await
            .unwrap();

        assert!(!go_on);
        assert!(client.is_closed());
        assert!(!backend.is_closed());

        drop(client);
        let mut buf = [0u8; 16];
        let n = client_peer.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }
}
