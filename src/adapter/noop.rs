use super::Adapter;
use crate::error::AdapterError;
use crate::events::AnalyticsEvent;
use crate::logging::{log, obj, v_str, Domain, Level};

/// Placeholder for a provider that has an id but no integration yet.
pub struct NoopAdapter {
    name: String,
    id: String,
    ready: bool,
}

impl NoopAdapter {
    pub fn new(name: &str, id: String) -> Self {
        Self {
            name: name.to_string(),
            id,
            ready: false,
        }
    }
}

impl Adapter for NoopAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self) -> Result<(), AdapterError> {
        if !self.ready {
            log(
                Level::Info,
                Domain::Adapter,
                "provider_not_wired",
                obj(&[("adapter", v_str(&self.name)), ("provider_id", v_str(&self.id))]),
            );
        }
        self.ready = true;
        Ok(())
    }

    fn track(&mut self, _event: &AnalyticsEvent) -> Result<(), AdapterError> {
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}
