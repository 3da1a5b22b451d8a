//! Delivery sinks for analytics events.
//!
//! Every sink implements [`Adapter`]. Which sinks exist is decided once, at
//! startup, by which provider ids are present in [`Config`]; the tracker
//! never contains sink-specific code.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::AdapterError;
use crate::events::AnalyticsEvent;

mod console;
mod data_layer;
mod noop;
mod pixel;
mod platform;
pub mod wire;

pub use console::ConsoleAdapter;
pub use data_layer::DataLayerAdapter;
pub use noop::NoopAdapter;
pub use pixel::PixelAdapter;
pub use platform::PlatformAdapter;
pub use wire::{RecordingSink, StdoutSink, WireCommand, WireSink};

pub trait Adapter: Send {
    fn name(&self) -> &str;

    /// Safe to call more than once.
    fn initialize(&mut self) -> Result<(), AdapterError>;

    /// Best-effort, fire-and-forget.
    fn track(&mut self, event: &AnalyticsEvent) -> Result<(), AdapterError>;

    fn is_ready(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterKind {
    Console,
    DataLayer,
    Pixel,
    Platform,
    Noop,
}

impl AdapterKind {
    /// Sinks enabled by `cfg`, each with the provider id that enabled it.
    pub fn enabled(cfg: &Config) -> Vec<(AdapterKind, String)> {
        let mut out = Vec::new();
        if cfg.debug {
            out.push((AdapterKind::Console, "console".to_string()));
        }
        if let Some(id) = &cfg.gtm_id {
            out.push((AdapterKind::DataLayer, id.clone()));
        }
        if let Some(id) = &cfg.meta_pixel_id {
            out.push((AdapterKind::Pixel, id.clone()));
        }
        if let Some(id) = &cfg.ga_measurement_id {
            out.push((AdapterKind::Platform, id.clone()));
        }
        if let Some(id) = &cfg.tiktok_pixel_id {
            out.push((AdapterKind::Noop, id.clone()));
        }
        out
    }

    pub fn build(self, id: String, sink: Arc<dyn WireSink>, clock: Arc<dyn Clock>) -> Box<dyn Adapter> {
        match self {
            AdapterKind::Console => Box::new(ConsoleAdapter::new()),
            AdapterKind::DataLayer => Box::new(DataLayerAdapter::new(id, sink, clock)),
            AdapterKind::Pixel => Box::new(PixelAdapter::new(id, sink)),
            AdapterKind::Platform => Box::new(PlatformAdapter::new(id, sink)),
            AdapterKind::Noop => Box::new(NoopAdapter::new("tiktok", id)),
        }
    }
}

pub fn build_adapters(cfg: &Config, sink: Arc<dyn WireSink>, clock: Arc<dyn Clock>) -> Vec<Box<dyn Adapter>> {
    AdapterKind::enabled(cfg)
        .into_iter()
        .map(|(kind, id)| kind.build(id, sink.clone(), clock.clone()))
        .collect()
}
