use super::Adapter;
use crate::error::AdapterError;
use crate::events::AnalyticsEvent;
use crate::logging::{log, obj, v_str, Domain, Level};

/// Debug-only mirror of every event into the structured log.
#[derive(Default)]
pub struct ConsoleAdapter {
    ready: bool,
}

impl ConsoleAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Adapter for ConsoleAdapter {
    fn name(&self) -> &str {
        "console"
    }

    fn initialize(&mut self) -> Result<(), AdapterError> {
        self.ready = true;
        Ok(())
    }

    fn track(&mut self, event: &AnalyticsEvent) -> Result<(), AdapterError> {
        log(
            Level::Info,
            Domain::Tracker,
            "debug_event",
            obj(&[
                ("event_name", v_str(event.name())),
                ("payload", event.to_json()),
            ]),
        );
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}
