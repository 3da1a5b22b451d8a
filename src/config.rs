use std::time::Duration;

/// Pipeline configuration. A provider is enabled exactly when its id is set.
#[derive(Clone, Debug)]
pub struct Config {
    pub gtm_id: Option<String>,
    pub meta_pixel_id: Option<String>,
    pub ga_measurement_id: Option<String>,
    /// Reserved for a provider that is not wired up yet; its sink is a no-op.
    pub tiktok_pixel_id: Option<String>,
    pub debug: bool,
    pub enable_queue: bool,
    pub enable_server_side: bool,
    pub environment: String,
    pub endpoint_base: String,
    pub queue_max_size: usize,
    pub flush_interval_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub storage_path: Option<String>,
    pub experiments_path: Option<String>,
    /// Incoming `Cookie` header to seed the jar from, as a server-side
    /// render would receive it.
    pub cookie_header: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gtm_id: None,
            meta_pixel_id: None,
            ga_measurement_id: None,
            tiktok_pixel_id: None,
            debug: false,
            enable_queue: true,
            enable_server_side: false,
            environment: "development".to_string(),
            endpoint_base: "http://localhost:3000".to_string(),
            queue_max_size: 50,
            flush_interval_ms: 2000,
            max_attempts: 3,
            retry_delay_ms: 1000,
            storage_path: None,
            experiments_path: None,
            cookie_header: None,
        }
    }
}

fn env_id(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let environment = std::env::var("SB_ENV").unwrap_or(d.environment);
        Self {
            gtm_id: env_id("SB_GTM_ID"),
            meta_pixel_id: env_id("SB_META_PIXEL_ID"),
            ga_measurement_id: env_id("SB_GA_ID"),
            tiktok_pixel_id: env_id("SB_TIKTOK_PIXEL_ID"),
            debug: env_flag("SB_DEBUG").unwrap_or(environment == "development"),
            enable_queue: env_flag("SB_ENABLE_QUEUE").unwrap_or(d.enable_queue),
            enable_server_side: env_flag("SB_ENABLE_SERVER_SIDE").unwrap_or(d.enable_server_side),
            environment,
            endpoint_base: std::env::var("SB_ENDPOINT_BASE").unwrap_or(d.endpoint_base),
            queue_max_size: std::env::var("SB_QUEUE_MAX_SIZE").ok().and_then(|v| v.parse().ok()).unwrap_or(d.queue_max_size),
            flush_interval_ms: std::env::var("SB_FLUSH_INTERVAL_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.flush_interval_ms),
            max_attempts: std::env::var("SB_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.max_attempts),
            retry_delay_ms: std::env::var("SB_RETRY_DELAY_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.retry_delay_ms),
            storage_path: env_id("SB_STORAGE_PATH"),
            experiments_path: env_id("SB_EXPERIMENTS_PATH"),
            cookie_header: env_id("SB_COOKIE"),
        }
    }

    pub fn ingestion_url(&self) -> String {
        format!("{}/api/tracking", self.endpoint_base.trim_end_matches('/'))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
