use std::sync::Arc;

use serde_json::{json, Value};

use super::wire::{WireCommand, WireSink};
use super::Adapter;
use crate::clock::Clock;
use crate::error::AdapterError;
use crate::events::AnalyticsEvent;

/// Tag-manager sink: every event becomes a `dataLayer.push`.
pub struct DataLayerAdapter {
    container_id: String,
    sink: Arc<dyn WireSink>,
    clock: Arc<dyn Clock>,
    ready: bool,
}

impl DataLayerAdapter {
    pub fn new(container_id: String, sink: Arc<dyn WireSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            container_id,
            sink,
            clock,
            ready: false,
        }
    }

    fn push(&self, object: Value) -> Result<(), String> {
        self.sink.emit(WireCommand::DataLayerPush { object })
    }
}

impl Adapter for DataLayerAdapter {
    fn name(&self) -> &str {
        "data_layer"
    }

    fn initialize(&mut self) -> Result<(), AdapterError> {
        if self.ready {
            return Ok(());
        }
        let init = |reason: String| AdapterError::Init {
            adapter: "data_layer".to_string(),
            reason,
        };
        self.sink
            .emit(WireCommand::Init {
                provider: "gtm".to_string(),
                id: self.container_id.clone(),
            })
            .map_err(init)?;
        self.push(json!({
            "gtm.start": self.clock.now().timestamp_millis(),
            "event": "gtm.js",
        }))
        .map_err(init)?;
        self.ready = true;
        Ok(())
    }

    fn track(&mut self, event: &AnalyticsEvent) -> Result<(), AdapterError> {
        self.push(event.to_json()).map_err(|reason| AdapterError::Dispatch {
            adapter: "data_layer".to_string(),
            reason,
        })
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}
