//! Event model: what the site tracks, and the envelope the queue ships.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attribution::UtmParams;
use crate::error::PipelineError;

mod user_data;

pub use user_data::{normalize, HashedUserData, UserData};

/// Fields every event carries, snapshotted at `track()` time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseFields {
    pub page_path: String,
    pub referrer: String,
    #[serde(flatten)]
    pub utm: UtmParams,
    pub timestamp: String,
}

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    PageView {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    CtaClick {
        cta_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cta_text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
    },
    FormStart {
        form_id: String,
    },
    FormSubmit {
        form_id: String,
        #[serde(default = "default_true")]
        success: bool,
    },
    LeadCaptured {
        form_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exam: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<f64>,
    },
    ChatOpened {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trigger: Option<String>,
    },
    ChatMessageSent {
        #[serde(default = "default_one")]
        message_count: u32,
    },
    PricingViewed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        plan: Option<String>,
    },
    CheckoutStarted {
        plan: String,
        value: f64,
        #[serde(default = "default_currency")]
        currency: String,
    },
    Purchase {
        transaction_id: String,
        plan: String,
        value: f64,
        #[serde(default = "default_currency")]
        currency: String,
    },
    PdfDownload {
        document: String,
    },
    ScrollDepth {
        percent: u8,
    },
    ExperimentExposure {
        experiment_id: String,
        variant_id: String,
    },
    ExperimentConversion {
        experiment_id: String,
        variant_id: String,
        goal: String,
    },
    /// Anything outside the catalog, or a catalog name whose properties did
    /// not fit its shape.
    #[serde(skip)]
    Custom {
        name: String,
        properties: Map<String, Value>,
    },
}

pub enum Parsed {
    /// Catalog event plus any caller properties outside its declared fields.
    Known(EventKind, Map<String, Value>),
    Unknown(EventKind),
    Malformed(EventKind, PipelineError),
}

impl EventKind {
    /// Build a typed event from a name and a loose property bag. Never fails:
    /// unknown names and bad properties both land in `Custom`.
    pub fn parse(name: &str, properties: Map<String, Value>) -> Parsed {
        let mut tagged = properties.clone();
        tagged.insert("event".to_string(), Value::String(name.to_string()));
        match serde_json::from_value::<EventKind>(Value::Object(tagged)) {
            Ok(kind) => {
                let declared = kind.properties();
                let extra = properties
                    .into_iter()
                    .filter(|(k, v)| k != "event" && !v.is_null() && !declared.contains_key(k))
                    .collect();
                Parsed::Known(kind, extra)
            }
            Err(err) => {
                let custom = EventKind::Custom {
                    name: name.to_string(),
                    properties,
                };
                if is_catalog_name(name) {
                    Parsed::Malformed(custom, PipelineError::MalformedInput(err.to_string()))
                } else {
                    Parsed::Unknown(custom)
                }
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EventKind::PageView { .. } => "page_view",
            EventKind::CtaClick { .. } => "cta_click",
            EventKind::FormStart { .. } => "form_start",
            EventKind::FormSubmit { .. } => "form_submit",
            EventKind::LeadCaptured { .. } => "lead_captured",
            EventKind::ChatOpened { .. } => "chat_opened",
            EventKind::ChatMessageSent { .. } => "chat_message_sent",
            EventKind::PricingViewed { .. } => "pricing_viewed",
            EventKind::CheckoutStarted { .. } => "checkout_started",
            EventKind::Purchase { .. } => "purchase",
            EventKind::PdfDownload { .. } => "pdf_download",
            EventKind::ScrollDepth { .. } => "scroll_depth",
            EventKind::ExperimentExposure { .. } => "experiment_exposure",
            EventKind::ExperimentConversion { .. } => "experiment_conversion",
            EventKind::Custom { name, .. } => name,
        }
    }

    /// Event-specific fields only, without the `event` tag.
    pub fn properties(&self) -> Map<String, Value> {
        if let EventKind::Custom { properties, .. } = self {
            return properties.clone();
        }
        match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => {
                map.remove("event");
                map
            }
            _ => Map::new(),
        }
    }

    /// Monetary value and currency, for sinks that report revenue.
    pub fn value(&self) -> Option<(f64, &str)> {
        match self {
            EventKind::CheckoutStarted { value, currency, .. }
            | EventKind::Purchase { value, currency, .. } => Some((*value, currency)),
            EventKind::LeadCaptured { value: Some(v), .. } => Some((*v, "USD")),
            _ => None,
        }
    }
}

const CATALOG: &[&str] = &[
    "page_view",
    "cta_click",
    "form_start",
    "form_submit",
    "lead_captured",
    "chat_opened",
    "chat_message_sent",
    "pricing_viewed",
    "checkout_started",
    "purchase",
    "pdf_download",
    "scroll_depth",
    "experiment_exposure",
    "experiment_conversion",
];

fn is_catalog_name(name: &str) -> bool {
    CATALOG.contains(&name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticsEvent {
    pub base: BaseFields,
    pub kind: EventKind,
    /// Caller properties the catalog shape does not declare.
    pub extra: Map<String, Value>,
    pub user_data: Option<UserData>,
}

impl AnalyticsEvent {
    pub fn name(&self) -> &str {
        self.kind.name()
    }

    /// Extra caller properties overlaid with the typed fields, which win on
    /// a key clash.
    pub fn properties(&self) -> Map<String, Value> {
        let mut map = self.extra.clone();
        for (k, v) in self.kind.properties() {
            map.insert(k, v);
        }
        map
    }

    /// Flat JSON: base fields, `event`, then event-specific fields.
    pub fn to_json(&self) -> Value {
        let mut map = match serde_json::to_value(&self.base) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for (k, v) in self.properties() {
            map.insert(k, v);
        }
        map.insert("event".to_string(), Value::String(self.name().to_string()));
        Value::Object(map)
    }

    pub fn hashed_user_data(&self) -> Option<HashedUserData> {
        self.user_data
            .as_ref()
            .map(|u| u.hashed())
            .filter(|h| !h.is_empty())
    }
}

/// Envelope POSTed to the first-party ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<HashedUserData>,
    pub timestamp: String,
    pub session_id: String,
    pub provider: String,
}

impl TrackingEvent {
    pub fn from_event(event: &AnalyticsEvent, session_id: &str, provider: &str) -> Self {
        Self {
            event_type: event.name().to_string(),
            data: event.to_json(),
            user_data: event.hashed_user_data(),
            timestamp: event.base.timestamp.clone(),
            session_id: session_id.to_string(),
            provider: provider.to_string(),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_event(kind: EventKind) -> AnalyticsEvent {
    AnalyticsEvent {
        base: BaseFields {
            page_path: "/".to_string(),
            referrer: String::new(),
            utm: UtmParams::default(),
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
        },
        kind,
        extra: Map::new(),
        user_data: None,
    }
}
