use std::sync::Arc;

use serde_json::{json, Map, Value};

use super::wire::{WireCommand, WireSink};
use super::Adapter;
use crate::error::AdapterError;
use crate::events::{AnalyticsEvent, EventKind};

/// Analytics-platform sink (`gtag('event', name, params)`).
pub struct PlatformAdapter {
    measurement_id: String,
    sink: Arc<dyn WireSink>,
    ready: bool,
}

impl PlatformAdapter {
    pub fn new(measurement_id: String, sink: Arc<dyn WireSink>) -> Self {
        Self {
            measurement_id,
            sink,
            ready: false,
        }
    }
}

/// Platform-recommended event names where one exists.
pub fn platform_event_name(kind: &EventKind) -> &str {
    match kind {
        EventKind::PageView { .. } => "page_view",
        EventKind::LeadCaptured { .. } => "generate_lead",
        EventKind::FormSubmit { .. } => "sign_up",
        EventKind::PricingViewed { .. } => "view_item",
        EventKind::CheckoutStarted { .. } => "begin_checkout",
        EventKind::Purchase { .. } => "purchase",
        EventKind::PdfDownload { .. } => "file_download",
        EventKind::CtaClick { .. } => "select_content",
        other => other.name(),
    }
}

fn params(event: &AnalyticsEvent) -> Map<String, Value> {
    let mut params = event.properties();
    params.insert("page_path".to_string(), json!(event.base.page_path));
    let utm = &event.base.utm;
    if let Some(source) = &utm.utm_source {
        params.insert("campaign_source".to_string(), json!(source));
    }
    if let Some(medium) = &utm.utm_medium {
        params.insert("campaign_medium".to_string(), json!(medium));
    }
    if let Some(campaign) = &utm.utm_campaign {
        params.insert("campaign_name".to_string(), json!(campaign));
    }
    if let Some((value, currency)) = event.kind.value() {
        params.insert("value".to_string(), json!(value));
        params.insert("currency".to_string(), json!(currency));
    }
    params
}

impl Adapter for PlatformAdapter {
    fn name(&self) -> &str {
        "platform"
    }

    fn initialize(&mut self) -> Result<(), AdapterError> {
        if self.ready {
            return Ok(());
        }
        self.sink
            .emit(WireCommand::Init {
                provider: "ga4".to_string(),
                id: self.measurement_id.clone(),
            })
            .map_err(|reason| AdapterError::Init {
                adapter: "platform".to_string(),
                reason,
            })?;
        self.ready = true;
        Ok(())
    }

    fn track(&mut self, event: &AnalyticsEvent) -> Result<(), AdapterError> {
        self.sink
            .emit(WireCommand::PlatformEvent {
                name: platform_event_name(&event.kind).to_string(),
                params: params(event),
            })
            .map_err(|reason| AdapterError::Dispatch {
                adapter: "platform".to_string(),
                reason,
            })
    }

    fn is_ready(&self) -> bool {
        self.ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RecordingSink;
    use crate::events::sample_event;

    #[test]
    fn test_purchase_maps_to_recommended_event() {
        let sink = RecordingSink::new();
        let mut adapter = PlatformAdapter::new("G-TEST".to_string(), Arc::new(sink.clone()));
        adapter.initialize().unwrap();
        adapter
            .track(&sample_event(EventKind::Purchase {
                transaction_id: "t_1".to_string(),
                plan: "premium".to_string(),
                value: 79.0,
                currency: "USD".to_string(),
            }))
            .unwrap();
        match sink.commands().last() {
            Some(WireCommand::PlatformEvent { name, params }) => {
                assert_eq!(name, "purchase");
                assert_eq!(params["value"], 79.0);
                assert_eq!(params["currency"], "USD");
                assert_eq!(params["transaction_id"], "t_1");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unmapped_event_keeps_its_name() {
        let kind = EventKind::ScrollDepth { percent: 75 };
        assert_eq!(platform_event_name(&kind), "scroll_depth");
    }
}
