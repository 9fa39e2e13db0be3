//! Protocol-aware framing.
//!
//! A protocol reads exactly one logical message (or request/response
//! exchange) per forward cycle and decides whether the connection stays open.
//! One protocol instance serves every connection of a proxy.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::behavior::{ActiveBehavior, Direction, Forward};
use crate::error::{ConfigError, ProtocolError};
use crate::options::{OptionSpec, OptionValue, RawOptions, Settings};

mod http;
mod memcache;
mod reader;
mod redis;
mod tcp;

pub use http::Http;
pub use memcache::Memcache;
pub use redis::Redis;
pub use tcp::Tcp;

pub(crate) use reader::MessageReader;

/// Default read chunk size.
pub const DEFAULT_BUFFER: usize = 8192;

/// Longest protocol line or header block accepted.
pub(crate) const MAX_HEAD: usize = 64 * 1024;

const REUSE_SOCKET: OptionSpec = OptionSpec::new(
    "reuse_socket",
    "Return the backend socket to the pool after a message",
    OptionValue::Bool(false),
);

const BUFFER: OptionSpec = OptionSpec::new(
    "buffer",
    "Read chunk size in bytes",
    OptionValue::Int(DEFAULT_BUFFER as i64),
)
.at_least(1.0);

const KEEP_ALIVE: OptionSpec = OptionSpec::new(
    "keep_alive",
    "Keep the connection alive between messages",
    OptionValue::Bool(false),
);

const BASE_OPTIONS: &[OptionSpec] = &[REUSE_SOCKET, BUFFER, KEEP_ALIVE];

/// Options of protocols that always keep the connection alive.
const PERSISTENT_OPTIONS: &[OptionSpec] = &[REUSE_SOCKET, BUFFER];

const HTTP_OPTIONS: &[OptionSpec] = &[
    REUSE_SOCKET,
    BUFFER,
    KEEP_ALIVE,
    OptionSpec::new(
        "overwrite_host_header",
        "Rewrite the Host header of requests to the backend address",
        OptionValue::Bool(false),
    ),
];

/// Every protocol name with its description and option schema.
pub const CATALOG: &[(&str, &str, &[OptionSpec])] = &[
    ("http", "HTTP/1.x requests and responses", HTTP_OPTIONS),
    ("memcache", "Memcache text protocol", BASE_OPTIONS),
    ("mysql", "MySQL, raw TCP kept alive", PERSISTENT_OPTIONS),
    ("redis", "Redis RESP replies", BASE_OPTIONS),
    ("smtp", "SMTP, raw TCP kept alive", PERSISTENT_OPTIONS),
    ("tcp", "Raw TCP chunks", BASE_OPTIONS),
];

/// Validated protocol configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolOptions {
    pub buffer: usize,
    pub keep_alive: bool,
    pub reuse_socket: bool,
    pub overwrite_host_header: bool,
}

impl ProtocolOptions {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            buffer: usize::try_from(settings.int("buffer")).map_or(DEFAULT_BUFFER, |b| b.max(1)),
            keep_alive: settings.bool("keep_alive"),
            reuse_socket: settings.bool("reuse_socket"),
            overwrite_host_header: settings.bool("overwrite_host_header"),
        }
    }
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::defaults(BASE_OPTIONS))
    }
}

/// Wire-format-aware framing for one forward cycle.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn options(&self) -> &ProtocolOptions;

    /// Relay one message from `fwd.source` to `fwd.dest`.
    ///
    /// Returns whether the connection should stay open for another cycle.
    async fn handle(&self, fwd: &Forward<'_>) -> Result<bool, ProtocolError>;

    /// One forward cycle wrapped in the behavior hooks.
    ///
    /// A vetoed forward keeps the connection going unless the behavior closed
    /// a socket. A message cut short by the peer closes both sockets.
    async fn forward_one_message(
        &self,
        active: &ActiveBehavior,
        fwd: &Forward<'_>,
    ) -> Result<bool, ProtocolError> {
        let behavior = &active.behavior;
        let settings = &active.settings;

        if !behavior.before_forward(fwd, settings).await? {
            behavior.after_forward(fwd, settings).await?;
            return Ok(!fwd.source.is_closed() && !fwd.dest.is_closed());
        }

        let result = self.handle(fwd).await;
        let after = behavior.after_forward(fwd, settings).await;
        match result {
            Err(ProtocolError::Truncated) => {
                fwd.source.close();
                fwd.dest.close();
                after?;
                Ok(false)
            }
            result => {
                let keep = result?;
                after?;
                Ok(keep)
            }
        }
    }
}

/// The source had nothing to send. When the backend went quiet and sockets
/// are not reused, it is closed.
pub(crate) fn abort_handling(fwd: &Forward<'_>, options: &ProtocolOptions) {
    if fwd.direction == Direction::ToClient && !options.reuse_socket {
        fwd.backend().close();
    }
}

/// Option schema of a protocol.
pub fn schema(name: &str) -> Option<&'static [OptionSpec]> {
    CATALOG
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, _, schema)| *schema)
}

/// Build the protocol `name` with `overrides` applied.
///
/// `backend` is the configured backend address, used for Host rewriting.
pub fn build(
    name: &str,
    overrides: &RawOptions,
    backend: &str,
) -> Result<Arc<dyn Protocol>, ConfigError> {
    let (name, _, schema) = CATALOG
        .iter()
        .find(|(n, _, _)| *n == name)
        .copied()
        .ok_or_else(|| ConfigError::UnknownProtocol {
            name: name.to_string(),
            known: CATALOG
                .iter()
                .map(|(n, _, _)| format!("{n:?}"))
                .collect::<Vec<_>>()
                .join(", "),
        })?;

    let settings = Settings::defaults(schema).overlay(name, schema, overrides)?;
    let mut options = ProtocolOptions::from_settings(&settings);

    let protocol: Arc<dyn Protocol> = match name {
        "http" => Arc::new(Http::new(options, backend.to_string())),
        "memcache" => Arc::new(Memcache::new(options)),
        "redis" => Arc::new(Redis::new(options)),
        "smtp" | "mysql" => {
            options.keep_alive = true;
            Arc::new(Tcp::named(name, options))
        }
        _ => Arc::new(Tcp::new(options)),
    };
    Ok(protocol)
}

/// Relay one raw chunk. Used for traffic a request/response protocol did
/// not ask for, such as data the backend pushes unprompted.
pub(crate) async fn relay_chunk(fwd: &Forward<'_>, options: &ProtocolOptions) -> io::Result<bool> {
    let data = fwd.source.read_chunk(options.buffer).await?;
    if data.is_empty() {
        abort_handling(fwd, options);
        return Ok(false);
    }
    fwd.dest.write_all(&data).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{Behavior, BehaviorRegistry};
    use crate::options::RawValue;
    use crate::testing::proxied_pair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn active(name: &str) -> ActiveBehavior {
        BehaviorRegistry::builtin(&mut StdRng::seed_from_u64(0))
            .active(name)
            .unwrap()
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let err = build("gopher", &RawOptions::new(), "localhost:80")
            .err()
            .unwrap();
        assert!(err.to_string().contains("\"tcp\""));
    }

    #[test]
    fn test_persistent_protocols_force_keep_alive() {
        for name in ["smtp", "mysql"] {
            let protocol = build(name, &RawOptions::new(), "localhost:25").unwrap();
            assert_eq!(protocol.name(), name);
            assert!(protocol.options().keep_alive);
        }

        let overrides: RawOptions = [("keep_alive".to_string(), RawValue::Bool(false))]
            .into_iter()
            .collect();
        assert!(matches!(
            build("smtp", &overrides, "localhost:25"),
            Err(ConfigError::Option(_))
        ));
    }

    #[test]
    fn test_buffer_override() {
        let overrides: RawOptions = [("buffer".to_string(), RawValue::Int(512))]
            .into_iter()
            .collect();
        let protocol = build("tcp", &overrides, "localhost:80").unwrap();
        assert_eq!(protocol.options().buffer, 512);
        assert!(!protocol.options().keep_alive);
    }

    #[tokio::test]
    async fn test_blackout_veto_reports_closed() {
        let (mut client_peer, client, backend, _b) = proxied_pair().await;
        client_peer.write_all(b"data").await.unwrap();
        let protocol = build("tcp", &RawOptions::new(), "localhost:80").unwrap();

        let fwd = Forward {
            conn_id: 1,
            protocol: "tcp",
            direction: Direction::ToBackend,
            source: &client,
            dest: &backend,
            buffer: 1024,
        };
        let keep = protocol
            .forward_one_message(&active("blackout"), &fwd)
            .await
            .unwrap();
        assert!(!keep);
    }

    #[tokio::test]
    async fn test_dummy_forwards_through_protocol() {
        let (mut client_peer, client, backend, mut backend_peer) = proxied_pair().await;
        let overrides: RawOptions = [("keep_alive".to_string(), RawValue::Bool(true))]
            .into_iter()
            .collect();
        let protocol = build("tcp", &overrides, "localhost:80").unwrap();
        client_peer.write_all(b"ping").await.unwrap();

        let fwd = Forward {
            conn_id: 1,
            protocol: "tcp",
            direction: Direction::ToBackend,
            source: &client,
            dest: &backend,
            buffer: 1024,
        };
        assert!(protocol
            .forward_one_message(&active("dummy"), &fwd)
            .await
            .unwrap());

        let mut out = [0u8; 4];
        backend_peer.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ping");
        assert_eq!(active("dummy").behavior.name(), "dummy");
    }
}
