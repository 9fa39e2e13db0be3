use std::io;

use async_trait::async_trait;
use rand::rngs::StdRng;

use super::error::{Corrupter, INJECT};
use super::{count, Behavior, Forward, SharedCounter};
use crate::options::{OptionSpec, OptionValue, Settings};

const OPTIONS: &[OptionSpec] = &[
    OptionSpec::new(
        "agitate",
        "Number of calls that error out before succeeding",
        OptionValue::Int(1),
    )
    .at_least(0.0),
    INJECT,
];

/// The inverse of `error`'s warmup: errors for the first `agitate` calls,
/// then forwards transparently. Simulates a flapping backend that recovers.
pub struct Transient {
    corrupter: Corrupter,
    calls: SharedCounter,
}

impl Transient {
    pub fn new(rng: StdRng) -> Self {
        Self {
            corrupter: Corrupter::new(rng),
            calls: SharedCounter::default(),
        }
    }
}

#[async_trait]
impl Behavior for Transient {
    fn name(&self) -> &'static str {
        "transient"
    }

    fn description(&self) -> &'static str {
        "Errors out for a number of calls, then behaves like dummy"
    }

    fn options(&self) -> &'static [OptionSpec] {
        OPTIONS
    }

    async fn before_forward(&self, fwd: &Forward<'_>, settings: &Settings) -> io::Result<bool> {
        if !self.calls.try_consume(count(settings, "agitate")) {
            return Ok(true);
        }
        self.corrupter.corrupt(fwd, settings.bool("inject")).await?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Direction;
    use crate::testing::proxied_pair;
    use rand::SeedableRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_errors_then_recovers() {
        let behavior = Transient::new(StdRng::seed_from_u64(3));
        let settings = Settings::defaults(OPTIONS);

        let (mut client_peer, client, backend, mut backend_peer) = proxied_pair().await;
        backend_peer.write_all(b"data").await.unwrap();
        let fwd = Forward {
            conn_id: 9,
            protocol: "tcp",
            direction: Direction::ToClient,
            source: &backend,
            dest: &client,
            buffer: 8192,
        };

        assert!(!behavior.before_forward(&fwd, &settings).await.unwrap());
        let mut noise = [0u8; 1000];
        client_peer.read_exact(&mut noise).await.unwrap();

        assert!(behavior.before_forward(&fwd, &settings).await.unwrap());
        assert!(behavior.before_forward(&fwd, &settings).await.unwrap());
        assert_eq!(behavior.calls.get(), 1);
    }
}
