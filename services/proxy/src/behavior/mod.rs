//! Chaos behaviors.
//!
//! A behavior wraps one forward cycle with two hooks. Returning `false` from
//! [`Behavior::before_forward`] skips the protocol forward for that cycle; the
//! behavior has then either synthesized its own response or dropped the input.
//!
//! Behaviors are built once at startup and shared by every connection. Their
//! call counters (`warmup`, `agitate`) are therefore global per behavior
//! instance, not per connection.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::endpoint::Endpoint;
use crate::options::{OptionSpec, Settings};

mod abort;
mod blackout;
mod delay;
mod dummy;
mod error;
mod hang;
mod registry;
mod selector;
mod transient;

pub use abort::Abort;
pub use blackout::Blackout;
pub use delay::Delay;
pub use dummy::Dummy;
pub use error::{Corrupter, ErrorInjection};
pub use hang::Hang;
pub use registry::BehaviorRegistry;
pub use selector::{Selection, WeightedSelector, WeightedTable};
pub use transient::Transient;

/// Direction of a forward cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to backend.
    ToBackend,
    /// Backend to client.
    ToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToBackend => "to_backend",
            Direction::ToClient => "to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a behavior or protocol needs for one forward cycle.
#[derive(Debug, Clone, Copy)]
pub struct Forward<'a> {
    pub conn_id: u64,
    /// Name of the active protocol.
    pub protocol: &'static str,
    pub direction: Direction,
    /// Socket the message is read from.
    pub source: &'a Endpoint,
    /// Socket the message is written to.
    pub dest: &'a Endpoint,
    /// Read chunk size.
    pub buffer: usize,
}

impl<'a> Forward<'a> {
    /// The endpoint facing the client.
    pub fn client(&self) -> &'a Endpoint {
        match self.direction {
            Direction::ToBackend => self.source,
            Direction::ToClient => self.dest,
        }
    }

    /// The endpoint facing the backend.
    pub fn backend(&self) -> &'a Endpoint {
        match self.direction {
            Direction::ToBackend => self.dest,
            Direction::ToClient => self.source,
        }
    }
}

/// A chaos strategy applied around a forward cycle.
#[async_trait]
pub trait Behavior: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// One-line description for listings.
    fn description(&self) -> &'static str;

    fn options(&self) -> &'static [OptionSpec] {
        &[]
    }

    /// Runs before the protocol forward. `Ok(false)` skips the forward.
    async fn before_forward(&self, _fwd: &Forward<'_>, _settings: &Settings) -> io::Result<bool> {
        Ok(true)
    }

    /// Runs after the protocol forward, whether or not it happened.
    async fn after_forward(&self, _fwd: &Forward<'_>, _settings: &Settings) -> io::Result<()> {
        Ok(())
    }
}

/// A behavior together with the settings a connection runs it with.
#[derive(Clone)]
pub struct ActiveBehavior {
    pub behavior: Arc<dyn Behavior>,
    pub settings: Arc<Settings>,
}

impl ActiveBehavior {
    /// Pair a behavior with its default settings.
    pub fn with_defaults(behavior: Arc<dyn Behavior>) -> Self {
        let settings = Arc::new(Settings::defaults(behavior.options()));
        Self { behavior, settings }
    }

    pub fn name(&self) -> &'static str {
        self.behavior.name()
    }
}

impl fmt::Debug for ActiveBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveBehavior")
            .field("name", &self.name())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Call counter shared by every connection using a behavior.
#[derive(Debug, Default)]
pub struct SharedCounter(AtomicU64);

impl SharedCounter {
    /// Count one call if fewer than `limit` calls were counted so far.
    pub fn try_consume(&self, limit: u64) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Root generator for every random choice the proxy makes.
///
/// With a seed, behavior selection and generated payloads are reproducible.
pub fn master_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Non-negative integer option as a count.
fn count(settings: &Settings, name: &str) -> u64 {
    u64::try_from(settings.int(name)).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_stops_at_limit() {
        let counter = SharedCounter::default();
        assert!(counter.try_consume(2));
        assert!(counter.try_consume(2));
        assert!(!counter.try_consume(2));
        assert_eq!(counter.get(), 2);
    }

    #[test]
    fn test_zero_limit_never_counts() {
        let counter = SharedCounter::default();
        assert!(!counter.try_consume(0));
        assert_eq!(counter.get(), 0);
    }

    #[tokio::test]
    async fn test_counter_is_shared_across_tasks() {
        let counter = Arc::new(SharedCounter::default());
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move { counter.try_consume(5) })
            })
            .collect();

        let mut counted = 0;
        for task in tasks {
            if task.await.unwrap() {
                counted += 1;
            }
        }
        assert_eq!(counted, 5);
    }
}
