//! One analytics runtime per page session, built once and passed around.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};

use crate::adapter::{build_adapters, Adapter, WireSink};
use crate::attribution::{AttributionStore, PageContext, TrafficSource};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::events::{AnalyticsEvent, EventKind, UserData};
use crate::experiment::{default_catalog, load_catalog, Experiment, ExperimentEngine, Variant};
use crate::logging::{log, obj, v_str, Domain, Level};
use crate::queue::{EventQueue, HttpTransport, QueueConfig, Transport};
use crate::storage::{CookieJar, CookieOptions, KeyValueStore, MemoryStore, SqliteStore};
use crate::tracker::Tracker;

/// Everything [`Analytics`] needs from the host.
pub struct Components {
    pub session: Arc<dyn KeyValueStore>,
    pub cookie_backend: Arc<dyn KeyValueStore>,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn WireSink>,
    pub transport: Arc<dyn Transport>,
    pub experiments: Vec<Experiment>,
}

pub struct Analytics {
    config: Config,
    sink: Arc<dyn WireSink>,
    clock: Arc<dyn Clock>,
    cookies: Arc<CookieJar>,
    attribution: Arc<AttributionStore>,
    tracker: Tracker,
    experiments: ExperimentEngine,
    queue: Option<EventQueue>,
    started: bool,
}

impl Analytics {
    /// Production wiring: HTTP transport, SQLite cookies when a path is set.
    pub fn from_config(config: Config, sink: Arc<dyn WireSink>) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cookie_backend: Arc<dyn KeyValueStore> = match &config.storage_path {
            Some(path) => Arc::new(SqliteStore::open_with_clock(path, clock.clone())?),
            None => Arc::new(MemoryStore::with_clock(clock.clone())),
        };
        let experiments = match &config.experiments_path {
            Some(path) => load_catalog(path)?,
            None => default_catalog(),
        };
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.ingestion_url()));
        let components = Components {
            session: Arc::new(MemoryStore::with_clock(clock.clone())),
            cookie_backend,
            clock,
            sink,
            transport,
            experiments,
        };
        Ok(Self::assemble(config, components))
    }

    pub fn assemble(config: Config, parts: Components) -> Self {
        let options = CookieOptions::for_origin(&config.endpoint_base);
        let cookies = Arc::new(match &config.cookie_header {
            Some(header) => CookieJar::from_header(header, parts.cookie_backend, options),
            None => CookieJar::new(parts.cookie_backend, options),
        });
        let attribution = Arc::new(AttributionStore::new(parts.session.clone(), cookies.clone()));
        let queue = config
            .enable_server_side
            .then(|| EventQueue::new(QueueConfig::from_config(&config), parts.transport));
        let mut tracker = Tracker::new(attribution.clone(), parts.session.as_ref(), parts.clock.clone());
        if let Some(q) = &queue {
            tracker = tracker.with_queue(q.clone());
        }
        let experiments = ExperimentEngine::new(parts.experiments, cookies.clone(), parts.clock.clone());
        Self {
            config,
            sink: parts.sink,
            clock: parts.clock,
            cookies,
            attribution,
            tracker,
            experiments,
            queue,
            started: false,
        }
    }

    /// Register the configured sinks, replay anything tracked so far, and
    /// start the periodic queue flush.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for adapter in build_adapters(&self.config, self.sink.clone(), self.clock.clone()) {
            self.tracker.register_adapter(adapter);
        }
        self.tracker.initialize();
        if let Some(queue) = &self.queue {
            queue.start();
        }
        log(
            Level::Info,
            Domain::System,
            "analytics_started",
            obj(&[
                ("environment", v_str(&self.config.environment)),
                ("session_id", v_str(self.tracker.session_id())),
                ("adapters", Value::from(self.tracker.adapter_names())),
            ]),
        );
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn queue(&self) -> Option<&EventQueue> {
        self.queue.as_ref()
    }

    pub fn experiments(&self) -> &ExperimentEngine {
        &self.experiments
    }

    pub fn register_adapter(&mut self, adapter: Box<dyn Adapter>) -> bool {
        self.tracker.register_adapter(adapter)
    }

    pub fn page(&mut self, url: &str, referrer: &str) {
        self.tracker.set_page(PageContext::new(url, referrer));
    }

    pub fn traffic_source(&self) -> TrafficSource {
        self.attribution.get_traffic_source(self.tracker.page())
    }

    pub fn track(&mut self, event_name: &str, properties: Map<String, Value>) -> AnalyticsEvent {
        self.tracker.track(event_name, properties)
    }

    pub fn track_with_user(
        &mut self,
        event_name: &str,
        properties: Map<String, Value>,
        user_data: Option<UserData>,
    ) -> AnalyticsEvent {
        self.tracker.track_with_user(event_name, properties, user_data)
    }

    /// Adapters only; see [`Tracker::track_conversion_direct`].
    pub fn track_conversion(&mut self, kind: EventKind, user_data: Option<UserData>) -> AnalyticsEvent {
        self.tracker.track_conversion_direct(kind, user_data)
    }

    pub fn get_variant(&self, experiment_id: &str) -> Option<Variant> {
        self.experiments.get_variant(experiment_id)
    }

    /// Resolve the variant and report that the visitor saw it.
    pub fn track_exposure(&mut self, experiment_id: &str) -> Option<Variant> {
        let variant = self.experiments.get_variant(experiment_id)?;
        self.tracker.track_kind(
            EventKind::ExperimentExposure {
                experiment_id: experiment_id.to_string(),
                variant_id: variant.id.clone(),
            },
            None,
        );
        Some(variant)
    }

    pub fn track_experiment_conversion(&mut self, experiment_id: &str, goal: &str) -> Option<Variant> {
        let variant = self.experiments.get_variant(experiment_id)?;
        self.tracker.track_kind(
            EventKind::ExperimentConversion {
                experiment_id: experiment_id.to_string(),
                variant_id: variant.id.clone(),
                goal: goal.to_string(),
            },
            None,
        );
        Some(variant)
    }

    /// `Set-Cookie` headers produced since the last call.
    pub fn take_set_cookie_headers(&self) -> Vec<String> {
        self.cookies.take_set_cookie_headers()
    }

    /// Page is closing. Returns how many queued events went out by beacon.
    pub fn on_unload(&mut self) -> usize {
        self.queue.as_ref().map(|q| q.on_unload()).unwrap_or(0)
    }
}
