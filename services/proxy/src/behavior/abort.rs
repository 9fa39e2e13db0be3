use std::io;

use async_trait::async_trait;

use super::{Behavior, Direction, Forward};
use crate::options::Settings;

/// A client that gives up before the response arrives.
///
/// The pending request bytes reach the backend, then both sockets are closed.
/// The backend socket is never pooled again.
#[derive(Debug, Default)]
pub struct Abort;

#[async_trait]
impl Behavior for Abort {
    fn name(&self) -> &'static str {
        "abort"
    }

    fn description(&self) -> &'static str {
        "Simulates a client aborting the connection before receiving a response"
    }

    async fn before_forward(&self, fwd: &Forward<'_>, _settings: &Settings) -> io::Result<bool> {
        if fwd.direction == Direction::ToBackend {
            let data = fwd.source.read_chunk(fwd.buffer).await?;
            if !data.is_empty() {
                fwd.dest.write_all(&data).await?;
            }
        }
        fwd.source.close();
        fwd.dest.close();
        Ok(false)
    }
}
