use async_trait::async_trait;

use super::{abort_handling, relay_chunk, MessageReader, Protocol, ProtocolOptions, MAX_HEAD};
use crate::behavior::{Direction, Forward};
use crate::error::ProtocolError;

const NAME: &str = "redis";

/// Redis: one request chunk, then one RESP reply.
///
/// Status, error and integer replies are one line; bulk replies carry a
/// declared byte count. Multi-bulk replies are not supported.
#[derive(Debug)]
pub struct Redis {
    options: ProtocolOptions,
}

impl Redis {
    pub fn new(options: ProtocolOptions) -> Self {
        Self { options }
    }

    async fn relay_reply(&self, fwd: &Forward<'_>) -> Result<(), ProtocolError> {
        let mut reply = MessageReader::new(fwd.dest, self.options.buffer);
        let line = reply
            .line(NAME, MAX_HEAD)
            .await?
            .ok_or(ProtocolError::Truncated)?;

        match line.first() {
            Some(b'+' | b'-' | b':') => fwd.source.write_all(&line).await?,
            Some(b'$') => {
                let size: i64 = std::str::from_utf8(&line[1..])
                    .ok()
                    .and_then(|s| s.trim_end().parse().ok())
                    .ok_or_else(|| ProtocolError::malformed(NAME, "bad bulk length"))?;
                fwd.source.write_all(&line).await?;
                // A negative length is the null bulk reply, which has no body.
                if let Ok(size) = u64::try_from(size) {
                    reply.relay_exact(fwd.source, size + 2).await?;
                }
            }
            Some(b'*') => return Err(ProtocolError::NotImplemented("multi-bulk replies")),
            _ => {
                return Err(ProtocolError::malformed(
                    NAME,
                    format!("unknown reply type {:?}", String::from_utf8_lossy(&line[..1])),
                ))
            }
        }
        reply.finish().await;
        Ok(())
    }
}

#[async_trait]
impl Protocol for Redis {
    fn name(&self) -> &'static str {
        NAME
    }

    fn options(&self) -> &ProtocolOptions {
        &self.options
    }

    async fn handle(&self, fwd: &Forward<'_>) -> Result<bool, ProtocolError> {
        if fwd.direction == Direction::ToClient {
            return Ok(relay_chunk(fwd, &self.options).await?);
        }

        let request = fwd.source.read_chunk(self.options.buffer).await?;
        if request.is_empty() {
            abort_handling(fwd, &self.options);
            return Ok(false);
        }
        fwd.dest.write_all(&request).await?;

        self.relay_reply(fwd).await?;
        Ok(self.options.keep_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use crate::testing::proxied_pair;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn forward<'a>(client: &'a Endpoint, backend: &'a Endpoint) -> Forward<'a> {
        Forward {
            conn_id: 1,
            protocol: NAME,
            direction: Direction::ToBackend,
            source: client,
            dest: backend,
            buffer: 4,
        }
    }

    #[rstest]
    #[case(b"+OK\r\n".as_slice())]
    #[case(b"-ERR unknown command\r\n".as_slice())]
    #[case(b":42\r\n".as_slice())]
    #[case(b"$5\r\nhello\r\n".as_slice())]
    #[case(b"$-1\r\n".as_slice())]
    #[case(b"$0\r\n\r\n".as_slice())]
    #[tokio::test]
    async fn test_replies_are_relayed_whole(#[case] reply: &'static [u8]) {
        let (mut client_peer, client, backend, mut backend_peer) = proxied_pair().await;
        client_peer
            .write_all(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")
            .await
            .unwrap();

        let backend_task = tokio::spawn(async move {
            let mut request = [0u8; 20];
            backend_peer.read_exact(&mut request).await.unwrap();
            backend_peer.write_all(reply).await.unwrap();
            backend_peer
        });

        let protocol = Redis::new(ProtocolOptions {
            buffer: 64,
            ..ProtocolOptions::default()
        });
        let keep = protocol.handle(&forward(&client, &backend)).await.unwrap();
        assert!(!keep);
        let _backend_peer = backend_task.await.unwrap();

        let mut out = vec![0u8; reply.len()];
        client_peer.read_exact(&mut out).await.unwrap();
        assert_eq!(out, reply);
    }

    #[tokio::test]
    async fn test_multi_bulk_is_not_implemented() {
        let (mut client_peer, client, backend, mut backend_peer) = proxied_pair().await;
        client_peer.write_all(b"KEYS *\r\n").await.unwrap();
        backend_peer.write_all(b"*1\r\n$1\r\na\r\n").await.unwrap();

        let protocol = Redis::new(ProtocolOptions::default());
        let err = protocol
            .handle(&forward(&client, &backend))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotImplemented(_)));
    }
}
