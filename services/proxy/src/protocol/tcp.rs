use async_trait::async_trait;

use super::{Protocol, ProtocolOptions};
use crate::behavior::Forward;
use crate::error::ProtocolError;

/// Undifferentiated TCP: one read is one message.
///
/// Without keep-alive the cycle is single shot: the answer is drained back
/// until the destination closes, then the destination is closed too unless
/// sockets are reused.
#[derive(Debug)]
pub struct Tcp {
    name: &'static str,
    options: ProtocolOptions,
}

impl Tcp {
    pub fn new(options: ProtocolOptions) -> Self {
        Self::named("tcp", options)
    }

    /// Raw TCP framing registered under another protocol name.
    pub fn named(name: &'static str, options: ProtocolOptions) -> Self {
        Self { name, options }
    }
}

#[async_trait]
impl Protocol for Tcp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn options(&self) -> &ProtocolOptions {
        &self.options
    }

    async fn handle(&self, fwd: &Forward<'_>) -> Result<bool, ProtocolError> {
        let data = fwd.source.read_chunk(self.options.buffer).await?;
        if data.is_empty() {
            return Ok(false);
        }
        fwd.dest.write_all(&data).await?;

        if self.options.keep_alive {
            return Ok(true);
        }

        loop {
            let answer = fwd.dest.read_chunk(self.options.buffer).await?;
            if answer.is_empty() {
                break;
            }
            fwd.source.write_all(&answer).await?;
        }
        if !self.options.reuse_socket {
            fwd.dest.close();
        }
        Ok(false)
    }
}
