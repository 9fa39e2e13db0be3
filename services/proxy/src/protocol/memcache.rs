use async_trait::async_trait;

use super::{abort_handling, relay_chunk, MessageReader, Protocol, ProtocolOptions, MAX_HEAD};
use crate::behavior::{Direction, Forward};
use crate::error::ProtocolError;

const NAME: &str = "memcache";

/// Commands followed by a data block whose size is the fifth token.
const STORAGE_COMMANDS: &[&str] = &["set", "add", "replace", "append", "prepend", "cas"];

/// Memcache text protocol: one command and its reply per cycle.
#[derive(Debug)]
pub struct Memcache {
    options: ProtocolOptions,
}

impl Memcache {
    pub fn new(options: ProtocolOptions) -> Self {
        Self { options }
    }

    /// Relay one command line and its data block. Returns whether a reply
    /// follows, or `None` if the client went away.
    async fn relay_command(&self, fwd: &Forward<'_>) -> Result<Option<bool>, ProtocolError> {
        let mut request = MessageReader::new(fwd.source, self.options.buffer);
        let Some(line) = request.line(NAME, MAX_HEAD).await? else {
            return Ok(None);
        };
        fwd.dest.write_all(&line).await?;

        let text = String::from_utf8_lossy(&line);
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let command = tokens.first().copied().unwrap_or_default();
        let noreply = tokens.last() == Some(&"noreply");

        if STORAGE_COMMANDS.contains(&command) {
            let size: u64 = tokens
                .get(4)
                .and_then(|t| t.parse().ok())
                .ok_or_else(|| {
                    ProtocolError::malformed(NAME, format!("bad storage command {:?}", text.trim_end()))
                })?;
            // Data block plus its CRLF.
            let block = size
                .checked_add(2)
                .ok_or_else(|| ProtocolError::malformed(NAME, format!("data block of {size} bytes")))?;
            request.relay_exact(fwd.dest, block).await?;
        }
        request.finish().await;
        Ok(Some(!noreply))
    }

    /// Relay one reply: a single line, or `VALUE`/`STAT` lines up to `END`.
    async fn relay_reply(&self, fwd: &Forward<'_>) -> Result<(), ProtocolError> {
        let mut reply = MessageReader::new(fwd.dest, self.options.buffer);
        let mut listing = false;
        loop {
            let line = reply
                .line(NAME, MAX_HEAD)
                .await?
                .ok_or(ProtocolError::Truncated)?;
            fwd.source.write_all(&line).await?;

            let text = String::from_utf8_lossy(&line);
            let mut tokens = text.split_whitespace();
            match tokens.next() {
                Some("VALUE") => {
                    listing = true;
                    let size: u64 = tokens
                        .nth(2)
                        .and_then(|t| t.parse().ok())
                        .ok_or_else(|| {
                            ProtocolError::malformed(NAME, format!("bad value line {:?}", text.trim_end()))
                        })?;
                    let block = size.checked_add(2).ok_or_else(|| {
                        ProtocolError::malformed(NAME, format!("value of {size} bytes"))
                    })?;
                    reply.relay_exact(fwd.source, block).await?;
                }
                Some("STAT") => listing = true,
                Some("END") => break,
                _ if listing => {}
                _ => break,
            }
        }
        reply.finish().await;
        Ok(())
    }
}

#[async_trait]
impl Protocol for Memcache {
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

        match self.relay_command(fwd).await? {
            None => {
                abort_handling(fwd, &self.options);
                Ok(false)
            }
            Some(false) => Ok(true),
            Some(true) => {
                self.relay_reply(fwd).await?;
                Ok(true)
            }
        }
    }
}
