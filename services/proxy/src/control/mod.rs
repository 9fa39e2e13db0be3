//! Runtime control of the dynamically selected behavior.
//!
//! [`ControlSurface`] is the only way to change what a running proxy does.
//! Swaps are atomic: a connection picks up the behavior current at accept
//! time and keeps it until it ends.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::info;

use crate::behavior::{ActiveBehavior, BehaviorRegistry, Selection};
use crate::error::{ControlError, UnknownBehavior};
use crate::options::RawOptions;

mod api;

pub use api::{router, serve};

/// Reads and replaces the active behavior of a proxy in dynamic mode.
pub struct ControlSurface {
    current: Arc<ArcSwap<ActiveBehavior>>,
    registry: Arc<BehaviorRegistry>,
}

impl ControlSurface {
    /// Start out with the behavior `initial` and its configured settings.
    pub fn new(registry: Arc<BehaviorRegistry>, initial: &str) -> Result<Self, UnknownBehavior> {
        let active = registry.active(initial)?;
        Ok(Self {
            current: Arc::new(ArcSwap::from_pointee(active)),
            registry,
        })
    }

    /// Selection that follows this surface.
    pub fn selection(&self) -> Selection {
        Selection::Dynamic(Arc::clone(&self.current))
    }

    pub fn active_behavior_name(&self) -> &'static str {
        self.current.load().name()
    }

    /// Make `name` the behavior for new connections, with `options` applied
    /// on top of its configured settings.
    pub fn set_active_behavior(&self, name: &str, options: &RawOptions) -> Result<(), ControlError> {
        let active = self.registry.activate(name, options)?;
        info!(behavior = name, settings = ?active.settings, "Active behavior changed");
        self.current.store(Arc::new(active));
        Ok(())
    }

    /// Sorted names of every registered behavior.
    pub fn behavior_names(&self) -> Vec<&'static str> {
        self.registry.names()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RawValue;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn surface() -> ControlSurface {
        let registry = BehaviorRegistry::builtin(&mut StdRng::seed_from_u64(0));
        ControlSurface::new(Arc::new(registry), "dummy").unwrap()
    }

    #[test]
    fn test_set_then_get() {
        let surface = surface();
        assert_eq!(surface.active_behavior_name(), "dummy");

        surface
            .set_active_behavior("blackout", &RawOptions::new())
            .unwrap();
        assert_eq!(surface.active_behavior_name(), "blackout");
    }

    #[test]
    fn test_unknown_name_keeps_current() {
        let surface = surface();
        let err = surface
            .set_active_behavior("chaos", &RawOptions::new())
            .unwrap_err();
        assert!(matches!(err, ControlError::UnknownBehavior(_)));
        assert_eq!(surface.active_behavior_name(), "dummy");
    }

    #[test]
    fn test_in_flight_selection_keeps_its_behavior() {
        let surface = surface();
        let selection = surface.selection();
        let before = selection.select();

        let options: RawOptions = [("sleep".to_string(), RawValue::Float(2.0))]
            .into_iter()
            .collect();
        surface.set_active_behavior("delay", &options).unwrap();

        assert_eq!(before.name(), "dummy");
        let after = selection.select();
        assert_eq!(after.name(), "delay");
        assert_eq!(after.settings.float("sleep"), 2.0);
    }

    #[test]
    fn test_invalid_option_is_rejected() {
        let surface = surface();
        let options: RawOptions = [("sleep".to_string(), RawValue::Text("long".to_string()))]
            .into_iter()
            .collect();
        let err = surface.set_active_behavior("delay", &options).unwrap_err();
        assert!(matches!(err, ControlError::InvalidOption(_)));
    }
}
