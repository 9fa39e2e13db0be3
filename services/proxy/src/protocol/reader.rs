//! Buffered reads for message framing.

use bytes::{Bytes, BytesMut};

use crate::endpoint::Endpoint;
use crate::error::ProtocolError;

/// Accumulates reads from one endpoint so a protocol can find message
/// boundaries regardless of how the peer segmented its writes.
///
/// Bytes read past the end of a message are pushed back to the endpoint by
/// [`finish`](Self::finish) so the next cycle sees them.
pub(crate) struct MessageReader<'a> {
    source: &'a Endpoint,
    buf: BytesMut,
    chunk: usize,
}

impl<'a> MessageReader<'a> {
    pub(crate) fn new(source: &'a Endpoint, chunk: usize) -> Self {
        Self {
            source,
            buf: BytesMut::new(),
            chunk: chunk.max(1),
        }
    }

    /// Read once more. Returns `false` when the peer closed the socket.
    pub(crate) async fn fill(&mut self) -> Result<bool, ProtocolError> {
        let data = self.source.read_chunk(self.chunk).await?;
        if data.is_empty() {
            return Ok(false);
        }
        self.buf.extend_from_slice(&data);
        Ok(true)
    }

    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Take the first `n` buffered bytes.
    pub(crate) fn consume(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n.min(self.buf.len())).freeze()
    }

    /// Next line including its terminator, at most `limit` bytes long.
    ///
    /// `None` when the peer closed before sending anything. A close in the
    /// middle of a line is [`ProtocolError::Truncated`].
    pub(crate) async fn line(
        &mut self,
        protocol: &'static str,
        limit: usize,
    ) -> Result<Option<Bytes>, ProtocolError> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|b| *b == b'\n') {
                return Ok(Some(self.consume(scanned + pos + 1)));
            }
            scanned = self.buf.len();
            if scanned > limit {
                return Err(ProtocolError::malformed(
                    protocol,
                    format!("line longer than {limit} bytes"),
                ));
            }
            if !self.fill().await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated);
            }
        }
    }

    /// Relay exactly `n` bytes to `dest`, buffered bytes first.
    pub(crate) async fn relay_exact(&mut self, dest: &Endpoint, n: u64) -> Result<(), ProtocolError> {
        let mut left = n;
        while left > 0 {
            if self.buf.is_empty() && !self.fill().await? {
                return Err(ProtocolError::Truncated);
            }
            let take = usize::try_from(left).unwrap_or(usize::MAX).min(self.buf.len());
            let part = self.consume(take);
            dest.write_all(&part).await?;
            left -= part.len() as u64;
        }
        Ok(())
    }

    /// Relay everything up to end-of-stream to `dest`.
    pub(crate) async fn relay_to_eof(&mut self, dest: &Endpoint) -> Result<u64, ProtocolError> {
        let mut total = 0u64;
        loop {
            if !self.buf.is_empty() {
                let part = self.consume(self.buf.len());
                dest.write_all(&part).await?;
                total += part.len() as u64;
            }
            if !self.fill().await? {
                return Ok(total);
            }
        }
    }

    /// Give unconsumed bytes back to the endpoint.
    pub(crate) async fn finish(self) {
        self.source.unread(&self.buf).await;
    }
}
