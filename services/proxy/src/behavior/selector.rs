//! Per-connection behavior selection.

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use rand::rngs::StdRng;
use rand::Rng;

use super::{ActiveBehavior, BehaviorRegistry};
use crate::error::ConfigError;

/// Behavior that receives whatever share a table leaves unassigned.
pub const FALLBACK_BEHAVIOR: &str = "dummy";

/// A parsed `percentage:name,percentage:name` table.
///
/// Shares always add up to 100: the shortfall of a table is given to
/// [`FALLBACK_BEHAVIOR`]. Repeated names have their shares summed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedTable {
    shares: Vec<(String, u32)>,
}

impl WeightedTable {
    pub fn parse(table: &str) -> Result<Self, ConfigError> {
        let mut shares: Vec<(String, u32)> = Vec::new();
        let mut total: u32 = 0;

        for entry in table.split(',') {
            let fields: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [percent, name] = fields.as_slice() else {
                return Err(ConfigError::BehaviorSyntax(entry.to_string()));
            };
            if name.is_empty() {
                return Err(ConfigError::BehaviorSyntax(entry.to_string()));
            }
            let percent: u32 = percent
                .parse()
                .map_err(|_| ConfigError::BehaviorPercent(percent.to_string()))?;

            total = total.saturating_add(percent);
            add_share(&mut shares, name, percent);
        }

        if total > 100 {
            return Err(ConfigError::BehaviorTotal(total));
        }
        if total < 100 {
            add_share(&mut shares, FALLBACK_BEHAVIOR, 100 - total);
        }
        Ok(Self { shares })
    }

    /// `(name, percentage)` pairs in table order.
    pub fn shares(&self) -> &[(String, u32)] {
        &self.shares
    }

    pub fn share(&self, name: &str) -> u32 {
        self.shares
            .iter()
            .find(|(n, _)| n == name)
            .map_or(0, |(_, p)| *p)
    }
}

impl FromStr for WeightedTable {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn add_share(shares: &mut Vec<(String, u32)>, name: &str, percent: u32) {
    match shares.iter_mut().find(|(n, _)| n == name) {
        Some((_, existing)) => *existing = existing.saturating_add(percent),
        None => shares.push((name.to_string(), percent)),
    }
}

/// Uniform choice over one entry per percentage point.
pub struct WeightedSelector {
    table: WeightedTable,
    choices: Vec<ActiveBehavior>,
    rng: Mutex<StdRng>,
}

impl WeightedSelector {
    /// Resolve every table entry in `registry`. Unknown names are fatal.
    pub fn new(
        table: WeightedTable,
        registry: &BehaviorRegistry,
        rng: StdRng,
    ) -> Result<Self, ConfigError> {
        let mut choices = Vec::with_capacity(100);
        for (name, percent) in table.shares() {
            let active = registry.active(name)?;
            choices.extend(std::iter::repeat_n(active, *percent as usize));
        }
        Ok(Self {
            table,
            choices,
            rng: Mutex::new(rng),
        })
    }

    pub fn table(&self) -> &WeightedTable {
        &self.table
    }

    pub fn pick(&self) -> ActiveBehavior {
        let index = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_range(0..self.choices.len());
        self.choices[index].clone()
    }
}

/// How a proxy picks the behavior for each accepted connection.
pub enum Selection {
    /// Same behavior for every connection.
    Fixed(ActiveBehavior),
    /// Weighted random choice per connection.
    Weighted(WeightedSelector),
    /// Whatever the control surface set last.
    Dynamic(Arc<ArcSwap<ActiveBehavior>>),
}

impl Selection {
    pub fn select(&self) -> ActiveBehavior {
        match self {
            Selection::Fixed(active) => active.clone(),
            Selection::Weighted(selector) => selector.pick(),
            Selection::Dynamic(current) => current.load().as_ref().clone(),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Selection::Fixed(_) => "fixed",
            Selection::Weighted(_) => "random",
            Selection::Dynamic(_) => "dynamic",
        }
    }
}
