//! mayhem
//!
//! Chaos-injecting TCP proxy.
//!
//! This binary:
//! - Loads the optional TOML config and overlays command line flags
//! - Validates behaviors, protocol options and addresses up front
//! - Accepts connections and applies the configured behaviors
//! - Optionally serves the control API for switching behaviors at runtime

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mayhem_proxy::behavior::{master_rng, BehaviorRegistry};
use mayhem_proxy::options::OptionSpec;
use mayhem_proxy::protocol::CATALOG;
use mayhem_proxy::{Behavior, Config, Mode, Server};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "mayhem", version, about = "Chaos-injecting TCP proxy")]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "MAYHEM_CONFIG")]
    config: Option<PathBuf>,

    /// Proxy listen address (HOST:PORT)
    #[arg(long, env = "MAYHEM_LISTEN")]
    listen: Option<String>,

    /// Backend address (HOST:PORT)
    #[arg(long, env = "MAYHEM_BACKEND")]
    backend: Option<String>,

    /// Protocol used to frame messages
    #[arg(long, env = "MAYHEM_PROTOCOL")]
    protocol: Option<String>,

    /// Weighted behavior table, e.g. "20:delay,10:blackout"
    #[arg(long, env = "MAYHEM_BEHAVIOR")]
    behavior: Option<String>,

    /// How connections get their behavior
    #[arg(long, value_enum, env = "MAYHEM_MODE")]
    mode: Option<Mode>,

    /// Behavior for fixed mode and the starting behavior of dynamic mode
    #[arg(long, env = "MAYHEM_INITIAL_BEHAVIOR")]
    initial_behavior: Option<String>,

    /// Idle timeout in seconds
    #[arg(long, env = "MAYHEM_TIMEOUT")]
    timeout: Option<u64>,

    /// Keep connections open after idle timeouts
    #[arg(long, env = "MAYHEM_STAY_CONNECTED")]
    stay_connected: bool,

    /// Backend pool size, 0 for unbounded
    #[arg(long, env = "MAYHEM_POOL_MAX_SIZE")]
    pool_max_size: Option<usize>,

    /// Seconds a pooled backend connection may live
    #[arg(long, env = "MAYHEM_POOL_TIMEOUT")]
    pool_timeout: Option<u64>,

    /// Listen backlog
    #[arg(long, env = "MAYHEM_BACKLOG")]
    backlog: Option<u32>,

    /// Seed for reproducible behavior selection and payloads
    #[arg(long, env = "MAYHEM_SEED")]
    seed: Option<u64>,

    /// Serve the control API (forces dynamic mode)
    #[arg(long, env = "MAYHEM_HTTP")]
    http: bool,

    /// Control API host
    #[arg(long, env = "MAYHEM_HTTP_HOST")]
    http_host: Option<String>,

    /// Control API port
    #[arg(long, env = "MAYHEM_HTTP_PORT")]
    http_port: Option<u16>,

    /// Send counters to statsd
    #[arg(long, env = "MAYHEM_STATSD")]
    statsd: bool,

    /// Statsd host
    #[arg(long, env = "MAYHEM_STATSD_HOST")]
    statsd_host: Option<String>,

    /// Statsd port
    #[arg(long, env = "MAYHEM_STATSD_PORT")]
    statsd_port: Option<u16>,

    /// Statsd metric prefix
    #[arg(long, env = "MAYHEM_STATSD_PREFIX")]
    statsd_prefix: Option<String>,

    /// Option override: behavior.<name>.<option>=<value> or protocol.<name>.<option>=<value>
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, default_value = "info", env = "MAYHEM_LOG_LEVEL")]
    log_level: String,

    /// Log line format
    #[arg(long, value_enum, default_value = "text", env = "MAYHEM_LOG_FORMAT")]
    log_format: LogFormat,

    /// Write logs to this file instead of stderr
    #[arg(long, env = "MAYHEM_LOG_OUTPUT")]
    log_output: Option<PathBuf>,

    /// List behaviors with their options and exit
    #[arg(long)]
    list_behaviors: bool,

    /// List protocols with their options and exit
    #[arg(long)]
    list_protocols: bool,
}

impl Cli {
    /// Config file contents with the flags applied on top.
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        let proxy = &mut config.proxy;
        set(&mut proxy.listen, &self.listen);
        set(&mut proxy.backend, &self.backend);
        set(&mut proxy.protocol, &self.protocol);
        set(&mut proxy.behavior, &self.behavior);
        set(&mut proxy.mode, &self.mode);
        set(&mut proxy.initial_behavior, &self.initial_behavior);
        set(&mut proxy.timeout, &self.timeout);
        set(&mut proxy.pool_max_size, &self.pool_max_size);
        set(&mut proxy.pool_timeout, &self.pool_timeout);
        set(&mut proxy.backlog, &self.backlog);
        if self.seed.is_some() {
            proxy.seed = self.seed;
        }
        proxy.stay_connected |= self.stay_connected;

        let control = &mut config.control;
        control.enabled |= self.http;
        set(&mut control.host, &self.http_host);
        set(&mut control.port, &self.http_port);

        let statsd = &mut config.statsd;
        statsd.enabled |= self.statsd;
        set(&mut statsd.host, &self.statsd_host);
        set(&mut statsd.port, &self.statsd_port);
        set(&mut statsd.prefix, &self.statsd_prefix);

        for spec in &self.overrides {
            config.apply_override(spec)?;
        }
        Ok(config)
    }
}

fn set<T: Clone>(target: &mut T, value: &Option<T>) {
    if let Some(value) = value {
        *target = value.clone();
    }
}

fn init_tracing(level: &str, format: LogFormat, output: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let writer = match output {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let ansi = output.is_none();

    let layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_ansi(ansi)
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry().with(layer).with(filter).init();
    Ok(())
}

fn print_options(options: &[OptionSpec]) {
    for spec in options {
        println!(
            "    {} ({}, default {}): {}",
            spec.name,
            spec.kind(),
            spec.default,
            spec.help
        );
    }
}

fn list_behaviors() {
    let registry = BehaviorRegistry::builtin(&mut master_rng(None));
    for active in registry.iter() {
        println!("{}: {}", active.name(), active.behavior.description());
        print_options(active.behavior.options());
    }
}

fn list_protocols() {
    for (name, description, options) in CATALOG {
        println!("{name}: {description}");
        print_options(options);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.list_behaviors {
        list_behaviors();
        return Ok(());
    }
    if cli.list_protocols {
        list_protocols();
        return Ok(());
    }

    init_tracing(&cli.log_level, cli.log_format, cli.log_output.as_deref())?;
    let config = cli.config()?;

    info!("Starting mayhem");
    info!(
        listen = %config.proxy.listen,
        backend = %config.proxy.backend,
        protocol = %config.proxy.protocol,
        mode = ?config.effective_mode(),
        "Configuration loaded"
    );

    let server = Server::from_config(&config)
        .await
        .context("invalid configuration")?;
    if let Some(addr) = server.control_addr() {
        info!(addr = %addr, "Control API enabled");
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                signal.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    server.run(shutdown).await.context("proxy failed")?;
    info!("Bye!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;
    use std::ffi::OsStr;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case("stay_connected", "MAYHEM_STAY_CONNECTED")]
    #[case("http", "MAYHEM_HTTP")]
    #[case("statsd", "MAYHEM_STATSD")]
    #[case("backend", "MAYHEM_BACKEND")]
    fn test_flags_fall_back_to_env(#[case] id: &str, #[case] env: &str) {
        let command = Cli::command();
        let arg = command
            .get_arguments()
            .find(|arg| arg.get_id() == id)
            .unwrap();
        assert_eq!(arg.get_env(), Some(OsStr::new(env)));
    }

    #[test]
    fn test_boolean_flags_overlay_config() {
        let cli = Cli::try_parse_from(["mayhem", "--stay-connected", "--http"]).unwrap();
        let config = cli.config().unwrap();
        assert!(config.proxy.stay_connected);
        assert!(config.control.enabled);
        assert!(!config.statsd.enabled);
    }
}
