//! Event construction and fan-out.
//!
//! `track()` stamps every event with page, referrer, the current UTM snapshot
//! and a timestamp, then hands it synchronously to each ready adapter and,
//! when server-side delivery is on, to the [`EventQueue`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value};

use crate::adapter::Adapter;
use crate::attribution::{AttributionStore, PageContext};
use crate::clock::Clock;
use crate::error::AdapterError;
use crate::events::{AnalyticsEvent, BaseFields, EventKind, Parsed, TrackingEvent, UserData};
use crate::logging::{log, log_adapter_failure, obj, v_str, Domain, Level};
use crate::queue::EventQueue;
use crate::storage::{KeyValueStore, SESSION_ID_KEY};

pub const SERVER_PROVIDER: &str = "server";

/// Events held before `initialize()`. Older ones are dropped past this.
pub const MAX_PENDING: usize = 500;

pub struct Tracker {
    adapters: Vec<Box<dyn Adapter>>,
    pending: Vec<AnalyticsEvent>,
    initialized: bool,
    attribution: Arc<AttributionStore>,
    page: PageContext,
    queue: Option<EventQueue>,
    session_id: String,
    clock: Arc<dyn Clock>,
}

fn new_session_id(clock: &dyn Clock) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect();
    format!("s_{}_{}", clock.now().timestamp_millis(), suffix)
}

impl Tracker {
    pub fn new(attribution: Arc<AttributionStore>, session: &dyn KeyValueStore, clock: Arc<dyn Clock>) -> Self {
        let session_id = match session.get(SESSION_ID_KEY).filter(|s| !s.is_empty()) {
            Some(id) => id,
            None => {
                let id = new_session_id(clock.as_ref());
                session.set(SESSION_ID_KEY, &id, None);
                id
            }
        };
        Self {
            adapters: Vec::new(),
            pending: Vec::new(),
            initialized: false,
            attribution,
            page: PageContext::default(),
            queue: None,
            session_id,
            clock,
        }
    }

    pub fn with_queue(mut self, queue: EventQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn adapter_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub fn page(&self) -> &PageContext {
        &self.page
    }

    /// Navigate. UTM parameters on the new URL replace the stored snapshot.
    pub fn set_page(&mut self, page: PageContext) {
        self.attribution.capture(&page);
        self.page = page;
    }

    /// Initialize and keep `adapter`. A failing adapter is logged and dropped
    /// without affecting the others.
    pub fn register_adapter(&mut self, mut adapter: Box<dyn Adapter>) -> bool {
        let result = catch_unwind(AssertUnwindSafe(|| adapter.initialize())).unwrap_or_else(|_| {
            Err(AdapterError::Panicked {
                adapter: adapter.name().to_string(),
                stage: "initialize".to_string(),
            })
        });
        match result {
            Ok(()) => {
                log(
                    Level::Debug,
                    Domain::Adapter,
                    "adapter_registered",
                    obj(&[("adapter", v_str(adapter.name()))]),
                );
                self.adapters.push(adapter);
                true
            }
            Err(err) => {
                log_adapter_failure(adapter.name(), "initialize", &err);
                false
            }
        }
    }

    /// Mark the tracker live and replay anything tracked before this point.
    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;
        let pending = std::mem::take(&mut self.pending);
        if !pending.is_empty() {
            log(
                Level::Debug,
                Domain::Tracker,
                "replay_pending",
                obj(&[("count", json!(pending.len()))]),
            );
        }
        for event in &pending {
            self.deliver(event);
        }
    }

    /// Track by name with loose properties. Unknown names and malformed
    /// properties still produce an event (as `Custom`).
    pub fn track(&mut self, event_name: &str, properties: Map<String, Value>) -> AnalyticsEvent {
        self.track_with_user(event_name, properties, None)
    }

    pub fn track_with_user(
        &mut self,
        event_name: &str,
        properties: Map<String, Value>,
        user_data: Option<UserData>,
    ) -> AnalyticsEvent {
        let (kind, extra) = match EventKind::parse(event_name, properties) {
            Parsed::Known(kind, extra) => (kind, extra),
            Parsed::Unknown(kind) => (kind, Map::new()),
            Parsed::Malformed(kind, err) => {
                log(
                    Level::Warn,
                    Domain::Tracker,
                    "malformed_properties",
                    obj(&[("event_name", v_str(event_name)), ("msg", v_str(&err.to_string()))]),
                );
                (kind, Map::new())
            }
        };
        let mut event = self.build_event(kind, user_data);
        event.extra = extra;
        self.submit(event)
    }

    pub fn track_kind(&mut self, kind: EventKind, user_data: Option<UserData>) -> AnalyticsEvent {
        let event = self.build_event(kind, user_data);
        self.submit(event)
    }

    fn submit(&mut self, event: AnalyticsEvent) -> AnalyticsEvent {
        if self.initialized {
            self.deliver(&event);
            return event;
        }
        if self.pending.len() >= MAX_PENDING {
            let dropped = self.pending.remove(0);
            log(
                Level::Warn,
                Domain::Tracker,
                "pending_overflow",
                obj(&[
                    ("event_name", v_str(dropped.name())),
                    ("limit", json!(MAX_PENDING)),
                ]),
            );
        }
        self.pending.push(event.clone());
        event
    }

    /// Conversion path that goes straight to the adapters, skipping the
    /// queue, so it fires before a checkout redirect navigates away. Nothing
    /// here is retried or kept for later: a sink that is down misses the
    /// conversion.
    pub fn track_conversion_direct(&mut self, kind: EventKind, user_data: Option<UserData>) -> AnalyticsEvent {
        let event = self.build_event(kind, user_data);
        self.dispatch(&event);
        event
    }

    pub fn build_event(&self, kind: EventKind, user_data: Option<UserData>) -> AnalyticsEvent {
        AnalyticsEvent {
            base: BaseFields {
                page_path: self.page.path().to_string(),
                referrer: self.page.referrer().to_string(),
                utm: self.attribution.get_current(),
                timestamp: self.clock.now_iso(),
            },
            kind,
            extra: Map::new(),
            user_data,
        }
    }

    fn deliver(&mut self, event: &AnalyticsEvent) {
        self.dispatch(event);
        if let Some(queue) = &self.queue {
            queue.enqueue(TrackingEvent::from_event(event, &self.session_id, SERVER_PROVIDER));
        }
    }

    /// Hand `event` to every ready adapter. Returns how many accepted it.
    /// An adapter that panics is dropped from the registry.
    fn dispatch(&mut self, event: &AnalyticsEvent) -> usize {
        let mut accepted = 0;
        let mut panicked = Vec::new();
        for (i, adapter) in self.adapters.iter_mut().enumerate() {
            if !adapter.is_ready() {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| adapter.track(event))) {
                Ok(Ok(())) => accepted += 1,
                Ok(Err(err)) => log_adapter_failure(adapter.name(), "track", &err),
                Err(_) => {
                    let err = AdapterError::Panicked {
                        adapter: adapter.name().to_string(),
                        stage: "track".to_string(),
                    };
                    log_adapter_failure(adapter.name(), "track", &err);
                    panicked.push(i);
                }
            }
        }
        for i in panicked.into_iter().rev() {
            self.adapters.remove(i);
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{DataLayerAdapter, RecordingSink, WireCommand};
    use crate::clock::SystemClock;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingAdapter {
        name: &'static str,
        fail_init: bool,
        fail_track: bool,
        panic_in: Option<&'static str>,
        ready: bool,
        seen: Arc<AtomicUsize>,
    }

    impl CountingAdapter {
        fn boxed(name: &'static str, seen: &Arc<AtomicUsize>) -> Box<Self> {
            Box::new(Self {
                name,
                fail_init: false,
                fail_track: false,
                panic_in: None,
                ready: false,
                seen: seen.clone(),
            })
        }
    }

    impl Adapter for CountingAdapter {
        fn name(&self) -> &str {
            self.name
        }

        fn initialize(&mut self) -> Result<(), AdapterError> {
            if self.panic_in == Some("initialize") {
                panic!("{} exploded", self.name);
            }
            if self.fail_init {
                return Err(AdapterError::Init {
                    adapter: self.name.to_string(),
                    reason: "blocked".to_string(),
                });
            }
            self.ready = true;
            Ok(())
        }

        fn track(&mut self, _event: &AnalyticsEvent) -> Result<(), AdapterError> {
            if self.panic_in == Some("track") {
                panic!("{} exploded", self.name);
            }
            if self.fail_track {
                return Err(AdapterError::Dispatch {
                    adapter: self.name.to_string(),
                    reason: "boom".to_string(),
                });
            }
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_ready(&self) -> bool {
            self.ready
        }
    }

    fn tracker() -> Tracker {
        let session = Arc::new(MemoryStore::new());
        let attribution = Arc::new(AttributionStore::new(session.clone(), Arc::new(MemoryStore::new())));
        Tracker::new(attribution, session.as_ref(), Arc::new(SystemClock))
    }

    fn props(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_events_before_initialize_are_replayed() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut t = tracker();
        t.track("page_view", Map::new());
        t.track("cta_click", props(json!({"cta_id": "hero"})));
        assert_eq!(t.pending_len(), 2);

        t.register_adapter(CountingAdapter::boxed("a", &seen));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        t.initialize();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(t.pending_len(), 0);

        t.track("form_start", props(json!({"form_id": "f"})));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failing_init_is_excluded() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut t = tracker();
        let mut bad = CountingAdapter::boxed("bad", &seen);
        bad.fail_init = true;
        assert!(!t.register_adapter(bad));
        assert!(t.register_adapter(CountingAdapter::boxed("good", &seen)));
        assert_eq!(t.adapter_names(), vec!["good"]);
    }

    #[test]
    fn test_throwing_adapter_does_not_block_others() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut t = tracker();
        t.register_adapter(CountingAdapter::boxed("first", &seen));
        let mut broken = CountingAdapter::boxed("broken", &seen);
        broken.fail_track = true;
        t.register_adapter(broken);
        t.register_adapter(CountingAdapter::boxed("last", &seen));
        t.initialize();

        t.track("page_view", Map::new());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_adapter_is_contained() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut t = tracker();
        let mut bad_init = CountingAdapter::boxed("bad_init", &seen);
        bad_init.panic_in = Some("initialize");
        assert!(!t.register_adapter(bad_init));

        t.register_adapter(CountingAdapter::boxed("first", &seen));
        let mut bad_track = CountingAdapter::boxed("bad_track", &seen);
        bad_track.panic_in = Some("track");
        t.register_adapter(bad_track);
        t.register_adapter(CountingAdapter::boxed("last", &seen));
        t.initialize();

        t.track("page_view", Map::new());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(t.adapter_names(), vec!["first", "last"]);

        t.track("page_view", Map::new());
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_pending_buffer_is_capped() {
        let mut t = tracker();
        for i in 0..MAX_PENDING + 5 {
            t.track("scroll_depth", props(json!({"percent": i % 100})));
        }
        assert_eq!(t.pending_len(), MAX_PENDING);
    }

    #[test]
    fn test_extra_properties_reach_adapters() {
        let sink = RecordingSink::new();
        let mut t = tracker();
        t.register_adapter(Box::new(DataLayerAdapter::new("GTM-1".to_string(), Arc::new(sink.clone()), Arc::new(SystemClock))));
        t.initialize();
        t.track(
            "cta_click",
            props(json!({"cta_id": "hero", "button_color": "red", "exam": "nclex"})),
        );
        let pushed = sink
            .commands()
            .into_iter()
            .find_map(|c| match c {
                WireCommand::DataLayerPush { object } if object["event"] == "cta_click" => Some(object),
                _ => None,
            })
            .unwrap();
        assert_eq!(pushed["cta_id"], "hero");
        assert_eq!(pushed["button_color"], "red");
        assert_eq!(pushed["exam"], "nclex");
    }

    #[test]
    fn test_base_fields_snapshot_at_call_time() {
        let sink = RecordingSink::new();
        let mut t = tracker();
        t.register_adapter(Box::new(DataLayerAdapter::new("GTM-1".to_string(), Arc::new(sink.clone()), Arc::new(SystemClock))));
        t.initialize();

        t.set_page(PageContext::new("https://prep.example.com/pricing?utm_source=google&utm_medium=cpc", ""));
        let event = t.track("pricing_viewed", props(json!({"plan": "premium"})));
        assert_eq!(event.base.page_path, "/pricing");
        assert_eq!(event.base.utm.utm_source.as_deref(), Some("google"));
        assert!(!event.base.timestamp.is_empty());

        t.set_page(PageContext::new("https://prep.example.com/?utm_source=newsletter", ""));
        let later = t.track("page_view", Map::new());
        assert_eq!(later.base.utm.utm_source.as_deref(), Some("newsletter"));
        assert_eq!(event.base.utm.utm_source.as_deref(), Some("google"));

        let pushes = sink
            .commands()
            .into_iter()
            .filter(|c| matches!(c, WireCommand::DataLayerPush { object } if object["event"] != "gtm.js"))
            .count();
        assert_eq!(pushes, 2);
    }

    #[test]
    fn test_malformed_properties_still_track() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut t = tracker();
        t.register_adapter(CountingAdapter::boxed("a", &seen));
        t.initialize();
        let event = t.track("purchase", props(json!({"value": "not a number"})));
        assert_eq!(event.name(), "purchase");
        assert!(matches!(event.kind, EventKind::Custom { .. }));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_direct_conversion_skips_pending_buffer() {
        let seen = Arc::new(AtomicUsize::new(0));
        let mut t = tracker();
        t.register_adapter(CountingAdapter::boxed("a", &seen));
        t.track_conversion_direct(
            EventKind::Purchase {
                transaction_id: "t".to_string(),
                plan: "basic".to_string(),
                value: 29.0,
                currency: "USD".to_string(),
            },
            None,
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(t.pending_len(), 0);
    }

    #[test]
    fn test_session_id_is_stable_within_session() {
        let session = Arc::new(MemoryStore::new());
        let attribution = Arc::new(AttributionStore::new(session.clone(), Arc::new(MemoryStore::new())));
        let a = Tracker::new(attribution.clone(), session.as_ref(), Arc::new(SystemClock));
        let b = Tracker::new(attribution, session.as_ref(), Arc::new(SystemClock));
        assert!(a.session_id().starts_with("s_"));
        assert_eq!(a.session_id(), b.session_id());
    }
}
