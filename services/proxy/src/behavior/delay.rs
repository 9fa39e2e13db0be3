use std::io;
use std::time::Duration;

use async_trait::async_trait;

use super::{Behavior, Forward};
use crate::options::{OptionSpec, OptionValue, Settings};

const OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("sleep", "Delay in seconds", OptionValue::Float(1.0)).at_least(0.0),
    OptionSpec::new(
        "before",
        "Sleep before forwarding if true, after it otherwise",
        OptionValue::Bool(true),
    ),
];

/// Adds a fixed delay before or after each forward.
#[derive(Debug, Default)]
pub struct Delay;

impl Delay {
    /// Sleep for the configured time, or until the connection goes away.
    async fn pause(fwd: &Forward<'_>, settings: &Settings) -> io::Result<()> {
        let sleep = Duration::try_from_secs_f64(settings.float("sleep"))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = fwd.source.closed() => {}
            _ = fwd.dest.closed() => {}
        }
        Ok(())
    }
}

#[async_trait]
impl Behavior for Delay {
    fn name(&self) -> &'static str {
        "delay"
    }

    fn description(&self) -> &'static str {
        "Adds a delay before or after the backend is called"
    }

    fn options(&self) -> &'static [OptionSpec] {
        OPTIONS
    }

    async fn before_forward(&self, fwd: &Forward<'_>, settings: &Settings) -> io::Result<bool> {
        if settings.bool("before") {
            Self::pause(fwd, settings).await?;
        }
        Ok(true)
    }

    async fn after_forward(&self, fwd: &Forward<'_>, settings: &Settings) -> io::Result<()> {
        if !settings.bool("before") {
            Self::pause(fwd, settings).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Direction;
    use crate::options::{RawOptions, RawValue};
    use crate::testing::proxied_pair;
    use tokio::time::Instant;

    fn settings(before: bool) -> Settings {
        let raw: RawOptions = [
            ("sleep".to_string(), RawValue::Float(2.0)),
            ("before".to_string(), RawValue::Bool(before)),
        ]
        .into_iter()
        .collect();
        Settings::defaults(OPTIONS)
            .overlay("delay", OPTIONS, &raw)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_on_the_configured_side() {
        let (_c, client, backend, _b) = proxied_pair().await;
        let fwd = Forward {
            conn_id: 1,
            protocol: "tcp",
            direction: Direction::ToBackend,
            source: &client,
            dest: &backend,
            buffer: 1024,
        };

        let start = Instant::now();
        assert!(Delay.before_forward(&fwd, &settings(true)).await.unwrap());
        Delay.after_forward(&fwd, &settings(true)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));

        let start = Instant::now();
        assert!(Delay.before_forward(&fwd, &settings(false)).await.unwrap());
        assert!(start.elapsed() < Duration::from_secs(1));
        Delay.after_forward(&fwd, &settings(false)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cuts_the_sleep_short() {
        let (_c, client, backend, _b) = proxied_pair().await;
        let fwd = Forward {
            conn_id: 1,
            protocol: "tcp",
            direction: Direction::ToClient,
            source: &backend,
            dest: &client,
            buffer: 1024,
        };
        client.close();

        let start = Instant::now();
        Delay.before_forward(&fwd, &settings(true)).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
