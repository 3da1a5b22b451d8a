use std::sync::{Arc, Mutex};

use chrono::Duration;
use url::form_urlencoded;

use super::KeyValueStore;
use crate::error::StorageError;

#[derive(Debug, Clone)]
pub struct CookieOptions {
    pub path: String,
    pub same_site: String,
    pub secure: bool,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            same_site: "Lax".to_string(),
            secure: false,
        }
    }
}

impl CookieOptions {
    pub fn for_origin(origin: &str) -> Self {
        Self {
            secure: origin.starts_with("https://"),
            ..Default::default()
        }
    }
}

/// Cookie-semantics store: values are URL-encoded at rest and every write
/// produces a `Set-Cookie` header the host can forward.
pub struct CookieJar {
    backend: Arc<dyn KeyValueStore>,
    options: CookieOptions,
    issued: Mutex<Vec<String>>,
}

impl CookieJar {
    pub fn new(backend: Arc<dyn KeyValueStore>, options: CookieOptions) -> Self {
        Self {
            backend,
            options,
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Seed the jar from a request `Cookie` header. Malformed pairs are skipped.
    pub fn from_header(header: &str, backend: Arc<dyn KeyValueStore>, options: CookieOptions) -> Self {
        let jar = Self::new(backend, options);
        for pair in header.split(';') {
            let Some((name, raw)) = pair.trim().split_once('=') else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            jar.backend.set(name, raw, None);
        }
        jar
    }

    /// Drain the `Set-Cookie` headers produced since the last call.
    pub fn take_set_cookie_headers(&self) -> Vec<String> {
        self.issued
            .lock()
            .map(|mut h| std::mem::take(&mut *h))
            .unwrap_or_default()
    }

    fn render(&self, name: &str, encoded: &str, max_age: Option<i64>) -> String {
        let mut header = format!("{}={}; Path={}", name, encoded, self.options.path);
        if let Some(secs) = max_age {
            header.push_str(&format!("; Max-Age={}", secs));
        }
        header.push_str(&format!("; SameSite={}", self.options.same_site));
        if self.options.secure {
            header.push_str("; Secure");
        }
        header
    }

    fn issue(&self, header: String) {
        if let Ok(mut issued) = self.issued.lock() {
            issued.push(header);
        }
    }
}

pub fn encode_value(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

pub fn decode_value(raw: &str) -> String {
    let wrapped = format!("v={}", raw);
    form_urlencoded::parse(wrapped.as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_default()
}

impl KeyValueStore for CookieJar {
    fn name(&self) -> &str {
        "cookie"
    }

    fn try_get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.backend.try_get(key)?.map(|raw| decode_value(&raw)))
    }

    fn try_set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let encoded = encode_value(value);
        self.backend.try_set(key, &encoded, ttl)?;
        self.issue(self.render(key, &encoded, ttl.map(|t| t.num_seconds())));
        Ok(())
    }

    fn try_remove(&self, key: &str) -> Result<(), StorageError> {
        self.backend.try_remove(key)?;
        self.issue(self.render(key, "", Some(0)));
        Ok(())
    }
}
