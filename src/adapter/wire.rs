//! Downstream wire formats, expressed as commands a host page would run.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::events::HashedUserData;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireCommand {
    /// Provider bootstrap (`gtag('config', id)`, `fbq('init', id)`, ...).
    Init { provider: String, id: String },
    /// `dataLayer.push(object)`.
    DataLayerPush { object: Value },
    /// `gtag('event', name, params)`.
    PlatformEvent { name: String, params: Map<String, Value> },
    /// `fbq(method, name, params, userData)` with `method` `track` or `trackCustom`.
    PixelTrack {
        method: String,
        name: String,
        params: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_data: Option<HashedUserData>,
    },
}

pub trait WireSink: Send + Sync {
    fn emit(&self, command: WireCommand) -> Result<(), String>;
}

/// Keeps every command in memory; used by tests and by embedding hosts that
/// forward commands in batches.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    commands: Arc<Mutex<Vec<WireCommand>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<WireCommand> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut c) = self.commands.lock() {
            c.clear();
        }
    }
}

impl WireSink for RecordingSink {
    fn emit(&self, command: WireCommand) -> Result<(), String> {
        self.commands
            .lock()
            .map_err(|_| "recording sink poisoned".to_string())?
            .push(command);
        Ok(())
    }
}

/// Writes one JSON line per command to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl WireSink for StdoutSink {
    fn emit(&self, command: WireCommand) -> Result<(), String> {
        let line = serde_json::to_string(&command).map_err(|e| e.to_string())?;
        let stdout = std::io::stdout();
        let mut w = stdout.lock();
        writeln!(w, "{}", line).map_err(|e| e.to_string())
    }
}
