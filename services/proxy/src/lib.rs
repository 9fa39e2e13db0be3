//! Mayhem: a chaos-injecting TCP proxy.
//!
//! The proxy sits between clients and a backend service and applies a
//! configurable fault-injection behavior (delays, blackouts, hangs, corrupted
//! responses) to each connection, framing traffic with a protocol-aware
//! reader so faults land on message boundaries.

pub mod behavior;
pub mod config;
pub mod control;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod options;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod server;

#[cfg(test)]
mod testing;

pub use behavior::{ActiveBehavior, Behavior, BehaviorRegistry, Direction, Forward, Selection};
pub use config::{Config, Mode};
pub use control::ControlSurface;
pub use error::{ConfigError, ConnectError, ControlError, ProtocolError};
pub use metrics::{LogSink, MetricsSink, StatsdSink};
pub use protocol::Protocol;
pub use proxy::{Proxy, ProxySettings, ProxyStats};
pub use server::Server;
