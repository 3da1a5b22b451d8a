use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::wire::{WireCommand, WireSink};
use super::Adapter;
use crate::error::AdapterError;
use crate::events::{AnalyticsEvent, EventKind};

/// Client-side conversion pixel. User-matching fields are hashed before they
/// leave the process.
pub struct PixelAdapter {
    pixel_id: String,
    sink: Arc<dyn WireSink>,
    ready: bool,
}

impl PixelAdapter {
    pub fn new(pixel_id: String, sink: Arc<dyn WireSink>) -> Self {
        Self {
            pixel_id,
            sink,
            ready: false,
        }
    }
}

/// Standard pixel event for `kind`, or `None` when it must go out as custom.
pub fn standard_event_name(kind: &EventKind) -> Option<&'static str> {
    match kind {
        EventKind::PageView { .. } => Some("PageView"),
        EventKind::LeadCaptured { .. } => Some("Lead"),
        EventKind::FormSubmit { .. } => Some("CompleteRegistration"),
        EventKind::PricingViewed { .. } => Some("ViewContent"),
        EventKind::CheckoutStarted { .. } => Some("InitiateCheckout"),
        EventKind::Purchase { .. } => Some("Purchase"),
        EventKind::ChatOpened { .. } => Some("Contact"),
        _ => None,
    }
}

fn params(event: &AnalyticsEvent) -> Map<String, Value> {
    let mut params = match &event.kind {
        EventKind::PageView { .. } => event.extra.clone(),
        _ => event.properties(),
    };
    match &event.kind {
        EventKind::CheckoutStarted { plan, .. } | EventKind::Purchase { plan, .. } => {
            params.insert("content_name".to_string(), json!(plan));
        }
        EventKind::PricingViewed { plan: Some(plan) } => {
            params.insert("content_name".to_string(), json!(plan));
        }
        _ => {}
    }
    if let Some((value, currency)) = event.kind.value() {
        params.insert("value".to_string(), json!(value));
        params.insert("currency".to_string(), json!(currency));
    }
    params
}

impl Adapter for PixelAdapter {
    fn name(&self) -> &str {
        "pixel"
    }

    fn initialize(&mut self) -> Result<(), AdapterError> {
        if self.ready {
            return Ok(());
        }
        self.sink
            .emit(WireCommand::Init {
                provider: "meta_pixel".to_string(),
                id: self.pixel_id.clone(),
            })
            .map_err(|reason| AdapterError::Init {
                adapter: "pixel".to_string(),
                reason,
            })?;
        self.ready = true;
        Ok(())
    }

    fn track(&mut self, event: &AnalyticsEvent) -> Result<(), AdapterError> {
        let (method, name) = match standard_event_name(&event.kind) {
            Some(name) => ("track", name.to_string()),
            None => ("trackCustom", event.name().to_string()),
        };
        self.sink
            .emit(WireCommand::PixelTrack {
                method: method.to_string(),
                name,
                params: params(event),
                user_data: event.hashed_user_data(),
            })
            .map_err(|reason| AdapterError::Dispatch {
                adapter: "pixel".to_string(),
                reason,
            })
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}
