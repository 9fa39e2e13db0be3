//! Proxy configuration.
//!
//! Defaults are overlaid by an optional TOML file, which the binary then
//! overlays with command line flags. Behavior and protocol option tables are
//! kept raw here and validated against their schemas when the server is built.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::options::{RawOptions, RawValue};
use crate::proxy::{
    ProxySettings, DEFAULT_BACKLOG, DEFAULT_POOL_MAX_SIZE, DEFAULT_POOL_TIMEOUT, DEFAULT_TIMEOUT,
};

/// How each accepted connection gets its behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Weighted random choice from the behavior table.
    #[default]
    Random,
    /// `initial_behavior` for every connection.
    Fixed,
    /// Settable at runtime through the control API.
    Dynamic,
}

/// Full configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub proxy: ProxySection,
    pub control: ControlSection,
    pub statsd: StatsdSection,
    /// Option overrides per behavior name.
    pub behavior: BTreeMap<String, toml::Table>,
    /// Option overrides per protocol name.
    pub protocol: BTreeMap<String, toml::Table>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySection {
    pub listen: String,
    pub backend: String,
    pub protocol: String,
    pub mode: Mode,
    /// Weighted `percentage:name` table for random mode.
    pub behavior: String,
    /// Behavior for fixed mode and the starting behavior of dynamic mode.
    pub initial_behavior: String,
    /// Idle timeout in seconds.
    pub timeout: u64,
    pub stay_connected: bool,
    /// 0 makes the pool unbounded.
    pub pool_max_size: usize,
    /// Seconds a pooled backend socket may live.
    pub pool_timeout: u64,
    pub backlog: u32,
    /// Seed for reproducible chaos.
    pub seed: Option<u64>,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen: "localhost:8000".to_string(),
            backend: "localhost:80".to_string(),
            protocol: "tcp".to_string(),
            mode: Mode::default(),
            behavior: "100:dummy".to_string(),
            initial_behavior: "dummy".to_string(),
            timeout: DEFAULT_TIMEOUT.as_secs(),
            stay_connected: false,
            pool_max_size: DEFAULT_POOL_MAX_SIZE,
            pool_timeout: DEFAULT_POOL_TIMEOUT.as_secs(),
            backlog: DEFAULT_BACKLOG,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlSection {
    /// Serve the control API. Forces dynamic mode.
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatsdSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub prefix: String,
    pub sample_rate: f64,
}

impl Default for StatsdSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 8125,
            prefix: "mayhem".to_string(),
            sample_rate: 1.0,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply a `behavior.<name>.<option>=<value>` or
    /// `protocol.<name>.<option>=<value>` override.
    ///
    /// The value is read as a TOML literal; anything that is not one is kept
    /// as a string.
    pub fn apply_override(&mut self, spec: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::Override(spec.to_string());

        let (key, value) = spec.split_once('=').ok_or_else(invalid)?;
        let parts: Vec<&str> = key.trim().split('.').collect();
        let [namespace, name, option] = parts.as_slice() else {
            return Err(invalid());
        };
        if name.is_empty() || option.is_empty() {
            return Err(invalid());
        }

        let tables = match *namespace {
            "behavior" => &mut self.behavior,
            "protocol" => &mut self.protocol,
            _ => return Err(invalid()),
        };
        tables
            .entry(name.to_string())
            .or_default()
            .insert(option.to_string(), literal(value.trim()));
        Ok(())
    }

    /// Resolve addresses and collect the proxy settings.
    pub async fn proxy_settings(&self) -> Result<ProxySettings, ConfigError> {
        let proxy = &self.proxy;
        Ok(ProxySettings {
            listen: resolve(&proxy.listen).await?,
            backend: resolve(&proxy.backend).await?,
            timeout: Duration::from_secs(proxy.timeout),
            stay_connected: proxy.stay_connected,
            pool_max_size: (proxy.pool_max_size > 0).then_some(proxy.pool_max_size),
            pool_timeout: Duration::from_secs(proxy.pool_timeout),
            backlog: proxy.backlog,
        })
    }

    /// The mode actually used: serving the control API implies dynamic.
    pub fn effective_mode(&self) -> Mode {
        if self.control.enabled {
            Mode::Dynamic
        } else {
            self.proxy.mode
        }
    }
}

/// Raw option overrides from a TOML table.
pub fn raw_options(table: &toml::Table) -> RawOptions {
    table
        .iter()
        .map(|(key, value)| (key.clone(), RawValue::from(value)))
        .collect()
}

fn literal(value: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("v = {value}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .unwrap_or_else(|| toml::Value::String(value.to_string()))
}

/// Resolve a `HOST:PORT` string to its first address.
pub async fn resolve(addr: &str) -> Result<SocketAddr, ConfigError> {
    let valid_port = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if !valid_port {
        return Err(ConfigError::AddressFormat(addr.to_string()));
    }

    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| ConfigError::Resolve {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    addrs.next().ok_or_else(|| ConfigError::Resolve {
        addr: addr.to_string(),
        reason: "no addresses found".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const SAMPLE: &str = r#"
        [proxy]
        listen = "127.0.0.1:8000"
        backend = "127.0.0.1:6379"
        protocol = "redis"
        mode = "fixed"
        initial_behavior = "delay"
        pool_max_size = 0
        seed = 42

        [control]
        enabled = true
        port = 9090

        [behavior.delay]
        sleep = 0.5

        [protocol.redis]
        keep_alive = true
    "#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();

        assert_eq!(config.proxy.protocol, "redis");
        assert_eq!(config.proxy.mode, Mode::Fixed);
        assert_eq!(config.proxy.seed, Some(42));
        assert_eq!(config.proxy.timeout, 30);
        assert_eq!(config.control.port, 9090);
        assert_eq!(config.control.host, "localhost");
        assert!(!config.statsd.enabled);

        let delay = raw_options(&config.behavior["delay"]);
        assert_eq!(delay["sleep"], RawValue::Float(0.5));
        assert_eq!(config.effective_mode(), Mode::Dynamic);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = toml::from_str::<Config>("[proxy]\nlisten_on = \"x\"\n").unwrap_err();
        assert!(err.to_string().contains("listen_on"));
    }

    #[tokio::test]
    async fn test_zero_pool_size_is_unbounded() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        let settings = config.proxy_settings().await.unwrap();
        assert_eq!(settings.pool_max_size, None);
        assert_eq!(settings.backend.port(), 6379);
        assert_eq!(settings.timeout, DEFAULT_TIMEOUT);
    }

    #[rstest]
    #[case("behavior.delay.sleep=2", "delay", "sleep", RawValue::Int(2))]
    #[case("behavior.delay.sleep = 0.25", "delay", "sleep", RawValue::Float(0.25))]
    #[case("behavior.delay.before=false", "delay", "before", RawValue::Bool(false))]
    #[case("behavior.error.note=hello", "error", "note", RawValue::Text("hello".into()))]
    #[case("behavior.error.note=\"a b\"", "error", "note", RawValue::Text("a b".into()))]
    fn test_behavior_override(
        #[case] spec: &str,
        #[case] name: &str,
        #[case] option: &str,
        #[case] expected: RawValue,
    ) {
        let mut config = Config::default();
        config.apply_override(spec).unwrap();
        assert_eq!(raw_options(&config.behavior[name])[option], expected);
    }

    #[test]
    fn test_protocol_override() {
        let mut config = Config::default();
        config
            .apply_override("protocol.http.overwrite_host_header=true")
            .unwrap();
        assert_eq!(
            raw_options(&config.protocol["http"])["overwrite_host_header"],
            RawValue::Bool(true)
        );
    }

    #[rstest]
    #[case("behavior.delay.sleep")]
    #[case("delay.sleep=1")]
    #[case("behaviour.delay.sleep=1")]
    #[case("behavior..sleep=1")]
    #[case("behavior.delay.sleep.extra=1")]
    fn test_bad_overrides(#[case] spec: &str) {
        let err = Config::default().apply_override(spec).unwrap_err();
        assert!(matches!(err, ConfigError::Override(_)));
    }

    #[rstest]
    #[case("localhost")]
    #[case(":8000")]
    #[case("localhost:http")]
    #[case("localhost:70000")]
    #[tokio::test]
    async fn test_malformed_address(#[case] addr: &str) {
        assert!(matches!(
            resolve(addr).await,
            Err(ConfigError::AddressFormat(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_ip() {
        let addr = resolve("127.0.0.1:8000").await.unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 8000)));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/mayhem.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
