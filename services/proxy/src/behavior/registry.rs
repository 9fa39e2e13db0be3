use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{
    Abort, ActiveBehavior, Behavior, Blackout, Delay, Dummy, ErrorInjection, Hang, Transient,
};
use crate::error::{ControlError, UnknownBehavior};
use crate::options::{OptionError, RawOptions, Settings};

/// Behaviors by name, each with the settings configured at startup.
///
/// Configured settings become the defaults every connection starts from.
/// Per-activation overrides produce a copy and never touch them.
#[derive(Default)]
pub struct BehaviorRegistry {
    entries: BTreeMap<&'static str, ActiveBehavior>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in behavior. Random behaviors draw their
    /// generators from `rng`.
    pub fn builtin(rng: &mut StdRng) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Dummy));
        registry.register(Arc::new(Delay));
        registry.register(Arc::new(Blackout));
        registry.register(Arc::new(Hang));
        registry.register(Arc::new(Abort));
        registry.register(Arc::new(ErrorInjection::new(StdRng::from_rng(rng))));
        registry.register(Arc::new(Transient::new(StdRng::from_rng(rng))));
        registry
    }

    /// Add a behavior, replacing any behavior of the same name.
    pub fn register(&mut self, behavior: Arc<dyn Behavior>) {
        self.entries
            .insert(behavior.name(), ActiveBehavior::with_defaults(behavior));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Behavior>, UnknownBehavior> {
        self.active(name).map(|active| active.behavior)
    }

    /// Sorted behavior names.
    pub fn names(&self) -> Vec<&'static str> {
        self.entries.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActiveBehavior> {
        self.entries.values()
    }

    /// Validate `raw` and make it part of the behavior's defaults.
    pub fn configure(&mut self, name: &str, raw: &RawOptions) -> Result<(), ControlError> {
        let known = self.known();
        let entry = self.entries.get_mut(name).ok_or_else(|| UnknownBehavior {
            name: name.to_string(),
            known,
        })?;
        let settings = overlay(entry, raw)?;
        entry.settings = Arc::new(settings);
        Ok(())
    }

    /// The behavior with its configured settings.
    pub fn active(&self, name: &str) -> Result<ActiveBehavior, UnknownBehavior> {
        self.entries.get(name).cloned().ok_or_else(|| UnknownBehavior {
            name: name.to_string(),
            known: self.known(),
        })
    }

    /// The behavior with `raw` applied on top of its configured settings.
    pub fn activate(&self, name: &str, raw: &RawOptions) -> Result<ActiveBehavior, ControlError> {
        let active = self.active(name)?;
        let settings = overlay(&active, raw)?;
        Ok(ActiveBehavior {
            behavior: active.behavior,
            settings: Arc::new(settings),
        })
    }

    fn known(&self) -> String {
        self.names()
            .iter()
            .map(|name| format!("{name:?}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn overlay(active: &ActiveBehavior, raw: &RawOptions) -> Result<Settings, OptionError> {
    active
        .settings
        .overlay(active.name(), active.behavior.options(), raw)
}
