//! Client-side analytics and experimentation pipeline: attribution capture,
//! event dispatch to marketing sinks, a retrying first-party queue, and
//! deterministic A/B assignment.

pub mod adapter;
pub mod attribution;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod experiment;
pub mod logging;
pub mod queue;
pub mod storage;
pub mod tracker;

pub use config::Config;
pub use context::{Analytics, Components};
pub use error::{AdapterError, DeliveryError, PipelineError, StorageError};
pub use events::{AnalyticsEvent, EventKind, TrackingEvent, UserData};
pub use experiment::{Experiment, ExperimentEngine, Variant};
pub use tracker::Tracker;
