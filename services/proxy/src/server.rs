//! Wiring of a configured proxy.
//!
//! Everything that can fail because of configuration happens in
//! [`Server::from_config`], before any traffic is accepted.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::behavior::{master_rng, BehaviorRegistry, Selection, WeightedSelector, WeightedTable};
use crate::config::{self, raw_options, Config, Mode};
use crate::control::{self, ControlSurface};
use crate::error::ConfigError;
use crate::metrics::{LogSink, MetricsSink, StatsdSink};
use crate::options::{RawOptions, Settings};
use crate::protocol;
use crate::proxy::Proxy;

/// A bound proxy plus its optional control server.
pub struct Server {
    proxy: Arc<Proxy>,
    control: Option<(TcpListener, Arc<ControlSurface>)>,
}

impl Server {
    /// Build from `config`, sending counters to statsd when it is enabled and
    /// to the log otherwise.
    pub async fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let mut rng = master_rng(config.proxy.seed);
        let metrics: Arc<dyn MetricsSink> = if config.statsd.enabled {
            let statsd = &config.statsd;
            Arc::new(
                StatsdSink::connect(
                    &statsd.host,
                    statsd.port,
                    &statsd.prefix,
                    statsd.sample_rate,
                    StdRng::from_rng(&mut rng),
                )
                .map_err(ConfigError::Statsd)?,
            )
        } else {
            Arc::new(LogSink)
        };
        Self::build(config, metrics, rng).await
    }

    /// Build from `config` with a custom counter sink.
    pub async fn with_metrics(
        config: &Config,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        Self::build(config, metrics, master_rng(config.proxy.seed)).await
    }

    async fn build(
        config: &Config,
        metrics: Arc<dyn MetricsSink>,
        mut rng: StdRng,
    ) -> Result<Self, ConfigError> {
        let mut registry = BehaviorRegistry::builtin(&mut rng);
        for (name, table) in &config.behavior {
            registry.configure(name, &raw_options(table))?;
        }
        let registry = Arc::new(registry);

        let protocol_name = config.proxy.protocol.as_str();
        for (name, table) in &config.protocol {
            if name != protocol_name {
                validate_protocol_options(name, &raw_options(table))?;
            }
        }
        let overrides = config
            .protocol
            .get(protocol_name)
            .map(raw_options)
            .unwrap_or_default();
        let protocol = protocol::build(protocol_name, &overrides, &config.proxy.backend)?;

        let (selection, surface) = match config.effective_mode() {
            Mode::Random => {
                let table = WeightedTable::parse(&config.proxy.behavior)?;
                let selector = WeightedSelector::new(table, &registry, StdRng::from_rng(&mut rng))?;
                (Selection::Weighted(selector), None)
            }
            Mode::Fixed => (
                Selection::Fixed(registry.active(&config.proxy.initial_behavior)?),
                None,
            ),
            Mode::Dynamic => {
                let surface = Arc::new(ControlSurface::new(
                    Arc::clone(&registry),
                    &config.proxy.initial_behavior,
                )?);
                (surface.selection(), Some(surface))
            }
        };

        let settings = config.proxy_settings().await?;

        let control = match surface {
            Some(surface) if config.control.enabled => {
                let control = &config.control;
                let addr = config::resolve(&format!("{}:{}", control.host, control.port)).await?;
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|source| ConfigError::Bind { addr, source })?;
                Some((listener, surface))
            }
            _ => None,
        };

        let proxy = Proxy::bind(&settings, protocol, selection, metrics)?;

        Ok(Self {
            proxy: Arc::new(proxy),
            control,
        })
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub fn proxy_addr(&self) -> io::Result<SocketAddr> {
        self.proxy.local_addr()
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control
            .as_ref()
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    pub fn control_surface(&self) -> Option<&Arc<ControlSurface>> {
        self.control.as_ref().map(|(_, surface)| surface)
    }

    /// Serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        let control = self.control.map(|(listener, surface)| {
            tokio::spawn(control::serve(listener, surface, shutdown.clone()))
        });

        let result = self.proxy.run(shutdown.clone()).await;
        shutdown.cancel();

        if let Some(handle) = control {
            match handle.await {
                Ok(Ok(())) => info!("Control server stopped"),
                Ok(Err(e)) => error!(error = %e, "Control server error"),
                Err(e) => error!(error = %e, "Control server task failed"),
            }
        }
        result
    }
}

fn validate_protocol_options(name: &str, raw: &RawOptions) -> Result<(), ConfigError> {
    let schema = protocol::schema(name).ok_or_else(|| ConfigError::UnknownProtocol {
        name: name.to_string(),
        known: protocol::CATALOG
            .iter()
            .map(|(n, _, _)| format!("{n:?}"))
            .collect::<Vec<_>>()
            .join(", "),
    })?;
    Settings::defaults(schema).overlay(name, schema, raw)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &str) -> Config {
        let text = format!(
            "[proxy]\nlisten = \"127.0.0.1:0\"\nbackend = \"127.0.0.1:9\"\n{extra}"
        );
        toml::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn test_default_random_mode() {
        let server = Server::from_config(&config("")).await.unwrap();
        assert!(server.control_addr().is_none());
        assert_ne!(server.proxy_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_table_over_hundred_is_fatal() {
        let err = Server::from_config(&config("behavior = \"60:delay,50:hang\""))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::BehaviorTotal(110)));
    }

    #[tokio::test]
    async fn test_unknown_behavior_override_is_fatal() {
        let mut config = config("");
        config.apply_override("behavior.chaos.level=3").unwrap();
        let err = Server::from_config(&config).await.err().unwrap();
        assert!(matches!(err, ConfigError::UnknownBehavior(_)));
    }

    #[tokio::test]
    async fn test_bad_option_value_is_fatal() {
        let mut config = config("");
        config.apply_override("behavior.delay.sleep=soon").unwrap();
        let err = Server::from_config(&config).await.err().unwrap();
        assert!(matches!(err, ConfigError::Option(_)));
    }

    #[tokio::test]
    async fn test_unknown_protocol_override_is_fatal() {
        let mut config = config("");
        config.apply_override("protocol.gopher.buffer=10").unwrap();
        let err = Server::from_config(&config).await.err().unwrap();
        assert!(matches!(err, ConfigError::UnknownProtocol { .. }));
    }

    #[tokio::test]
    async fn test_control_enables_dynamic_mode() {
        let mut config = config("initial_behavior = \"blackout\"");
        config.control.enabled = true;
        config.control.host = "127.0.0.1".to_string();
        config.control.port = 0;

        let server = Server::from_config(&config).await.unwrap();
        assert!(server.control_addr().is_some());
        let surface = server.control_surface().unwrap();
        assert_eq!(surface.active_behavior_name(), "blackout");
    }
}
