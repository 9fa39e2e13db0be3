use async_trait::async_trait;

use super::Behavior;

/// Transparent forwarding.
#[derive(Debug, Default)]
pub struct Dummy;

#[async_trait]
impl Behavior for Dummy {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn description(&self) -> &'static str {
        "Transparent proxy, forwards everything untouched"
    }
}
