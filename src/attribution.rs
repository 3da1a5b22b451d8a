//! Marketing attribution: UTM capture, click ids, and referrer classification.
//!
//! The UTM snapshot lives in session storage and is mirrored into a 7-day
//! cookie. A URL carrying UTM parameters replaces the snapshot; a URL without
//! them leaves it untouched.

use std::sync::Arc;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::StorageError;
use crate::logging::{log, log_storage_failure, obj, v_str, Domain, Level};
use crate::storage::{KeyValueStore, UTM_KEY};

pub const UTM_COOKIE_DAYS: i64 = 7;

const SEARCH_ENGINES: &[&str] = &["google", "bing", "yahoo", "duckduckgo"];
const SOCIAL_NETWORKS: &[(&str, &str)] = &[
    ("facebook.", "facebook"),
    ("fb.", "facebook"),
    ("instagram.", "instagram"),
    ("linkedin.", "linkedin"),
    ("lnkd.in", "linkedin"),
    ("twitter.", "twitter"),
    ("t.co", "twitter"),
    ("x.com", "twitter"),
    ("youtube.", "youtube"),
    ("reddit.", "reddit"),
    ("tiktok.", "tiktok"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtmParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_campaign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utm_term: Option<String>,
}

impl UtmParams {
    pub fn is_empty(&self) -> bool {
        self.utm_source.is_none()
            && self.utm_medium.is_none()
            && self.utm_campaign.is_none()
            && self.utm_content.is_none()
            && self.utm_term.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClickIds {
    pub gclid: Option<String>,
    pub fbclid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSource {
    pub source: String,
    pub medium: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign: Option<String>,
}

impl TrafficSource {
    fn new(source: &str, medium: &str, campaign: Option<String>) -> Self {
        Self {
            source: source.to_string(),
            medium: medium.to_string(),
            campaign,
        }
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.source, self.medium)
    }
}

/// The page a track call or attribution capture is made from.
#[derive(Debug, Clone)]
pub struct PageContext {
    url: Option<Url>,
    path: String,
    referrer: String,
}

impl PageContext {
    /// Accepts absolute URLs and bare paths (`/pricing?utm_source=x`).
    pub fn new(raw_url: &str, referrer: &str) -> Self {
        let url = Url::parse(raw_url).ok().or_else(|| {
            Url::parse("http://localhost")
                .ok()
                .and_then(|base| base.join(raw_url).ok())
        });
        let path = url
            .as_ref()
            .map(|u| u.path().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());
        Self {
            url,
            path,
            referrer: referrer.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn referrer(&self) -> &str {
        &self.referrer
    }

    pub fn host(&self) -> Option<&str> {
        self.url.as_ref().and_then(|u| u.host_str())
    }

    fn query_value(&self, name: &str) -> Option<String> {
        self.url.as_ref().and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    }

    pub fn utm_params(&self) -> UtmParams {
        UtmParams {
            utm_source: self.query_value("utm_source"),
            utm_medium: self.query_value("utm_medium"),
            utm_campaign: self.query_value("utm_campaign"),
            utm_content: self.query_value("utm_content"),
            utm_term: self.query_value("utm_term"),
        }
    }

    pub fn click_ids(&self) -> ClickIds {
        ClickIds {
            gclid: self.query_value("gclid"),
            fbclid: self.query_value("fbclid"),
        }
    }

    pub fn referrer_host(&self) -> Option<String> {
        if self.referrer.is_empty() {
            return None;
        }
        Url::parse(&self.referrer)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_lowercase()))
    }
}

impl Default for PageContext {
    fn default() -> Self {
        Self::new("/", "")
    }
}

/// Normalize everything known about a visit into a source/medium pair.
pub fn classify(utm: &UtmParams, clicks: &ClickIds, page: &PageContext) -> TrafficSource {
    if let Some(source) = &utm.utm_source {
        let medium = utm.utm_medium.as_deref().unwrap_or("none");
        return TrafficSource::new(source, medium, utm.utm_campaign.clone());
    }
    if clicks.gclid.is_some() {
        return TrafficSource::new("google-ads", "cpc", utm.utm_campaign.clone());
    }
    if clicks.fbclid.is_some() {
        return TrafficSource::new("facebook", "cpc", utm.utm_campaign.clone());
    }

    let Some(host) = page.referrer_host() else {
        return TrafficSource::new("direct", "none", None);
    };
    let own_host = page.host().map(|h| h.trim_start_matches("www.").to_lowercase());
    if own_host.as_deref() == Some(host.as_str()) {
        return TrafficSource::new("direct", "none", None);
    }
    for engine in SEARCH_ENGINES {
        if host.split('.').any(|label| label == *engine) {
            return TrafficSource::new(engine, "organic", None);
        }
    }
    for (needle, network) in SOCIAL_NETWORKS {
        if host_matches(&host, needle) {
            return TrafficSource::new(network, "referral", None);
        }
    }
    TrafficSource::new(&host, "referral", None)
}

fn host_matches(host: &str, needle: &str) -> bool {
    if needle.ends_with('.') {
        host.starts_with(needle) || host.contains(&format!(".{}", needle))
    } else {
        host == needle || host.ends_with(&format!(".{}", needle))
    }
}

pub struct AttributionStore {
    session: Arc<dyn KeyValueStore>,
    cookies: Arc<dyn KeyValueStore>,
}

impl AttributionStore {
    pub fn new(session: Arc<dyn KeyValueStore>, cookies: Arc<dyn KeyValueStore>) -> Self {
        Self { session, cookies }
    }

    /// Record the UTM parameters of `page` if it carries any, and return the
    /// snapshot now in effect.
    pub fn capture(&self, page: &PageContext) -> UtmParams {
        let fresh = page.utm_params();
        if fresh.is_empty() {
            return self.get_current();
        }
        self.persist_utm_params(&fresh);
        log(
            Level::Debug,
            Domain::Attribution,
            "utm_captured",
            obj(&[
                ("source", v_str(fresh.utm_source.as_deref().unwrap_or(""))),
                ("medium", v_str(fresh.utm_medium.as_deref().unwrap_or(""))),
            ]),
        );
        fresh
    }

    pub fn persist_utm_params(&self, utm: &UtmParams) {
        let Ok(json) = serde_json::to_string(utm) else {
            return;
        };
        self.session.set(UTM_KEY, &json, None);
        self.cookies.set(UTM_KEY, &json, Some(Duration::days(UTM_COOKIE_DAYS)));
    }

    /// Session storage first, then the cookie (re-seeding the session), then empty.
    pub fn get_current(&self) -> UtmParams {
        if let Some(utm) = read_snapshot(self.session.as_ref(), "get_session") {
            return utm;
        }
        match read_snapshot(self.cookies.as_ref(), "get_cookie") {
            Some(utm) => {
                if let Ok(json) = serde_json::to_string(&utm) {
                    self.session.set(UTM_KEY, &json, None);
                }
                utm
            }
            None => UtmParams::default(),
        }
    }

    pub fn get_utm_params(&self) -> UtmParams {
        self.get_current()
    }

    pub fn get_traffic_source(&self, page: &PageContext) -> TrafficSource {
        let utm = self.capture(page);
        classify(&utm, &page.click_ids(), page)
    }

    pub fn clear(&self) {
        self.session.remove(UTM_KEY);
        self.cookies.remove(UTM_KEY);
    }
}

fn parse_snapshot(raw: &str) -> Result<UtmParams, StorageError> {
    serde_json::from_str::<UtmParams>(raw).map_err(|err| StorageError::Corrupt {
        key: UTM_KEY.to_string(),
        reason: err.to_string(),
    })
}

/// Read and decode the snapshot from one store; a corrupt value counts as absent.
fn read_snapshot(store: &dyn KeyValueStore, origin: &str) -> Option<UtmParams> {
    let raw = store.get(UTM_KEY)?;
    match parse_snapshot(&raw) {
        Ok(utm) => Some(utm),
        Err(err) => {
            log_storage_failure(origin, UTM_KEY, &err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, UnavailableStore};

    fn store() -> (AttributionStore, Arc<MemoryStore>, Arc<MemoryStore>) {
        let session = Arc::new(MemoryStore::new());
        let cookies = Arc::new(MemoryStore::new());
        (AttributionStore::new(session.clone(), cookies.clone()), session, cookies)
    }

    #[test]
    fn test_first_visit_then_revisit_keeps_source() {
        let (attr, _, _) = store();
        let landing = PageContext::new("https://prep.example.com/?utm_source=facebook&utm_medium=cpc", "");
        let first = attr.get_traffic_source(&landing);
        assert_eq!(first, TrafficSource::new("facebook", "cpc", None));

        let revisit = PageContext::new("https://prep.example.com/pricing", "https://prep.example.com/");
        assert_eq!(attr.get_traffic_source(&revisit), first);
    }

    #[test]
    fn test_persist_round_trip() {
        let (attr, _, _) = store();
        let utm = UtmParams {
            utm_source: Some("newsletter".to_string()),
            utm_campaign: Some("spring".to_string()),
            ..Default::default()
        };
        attr.persist_utm_params(&utm);
        assert_eq!(attr.get_utm_params(), utm);
    }

    #[test]
    fn test_new_utms_override_old() {
        let (attr, _, _) = store();
        attr.capture(&PageContext::new("/?utm_source=google&utm_medium=cpc&utm_term=exam", ""));
        let second = attr.capture(&PageContext::new("/?utm_source=bing", ""));
        assert_eq!(second.utm_source.as_deref(), Some("bing"));
        assert_eq!(second.utm_term, None);
        assert_eq!(attr.get_current(), second);
    }

    #[test]
    fn test_cookie_fallback_reseeds_session() {
        let (attr, session, cookies) = store();
        cookies.set(UTM_KEY, r#"{"utm_source":"partner"}"#, None);
        assert!(session.get(UTM_KEY).is_none());
        assert_eq!(attr.get_current().utm_source.as_deref(), Some("partner"));
        assert!(session.get(UTM_KEY).is_some());
    }

    #[test]
    fn test_corrupt_snapshot_degrades_to_empty() {
        let (attr, session, _) = store();
        session.set(UTM_KEY, "{not json", None);
        assert!(attr.get_current().is_empty());
    }

    #[test]
    fn test_corrupt_session_falls_back_to_cookie() {
        let (attr, session, cookies) = store();
        session.set(UTM_KEY, "{not json", None);
        cookies.set(UTM_KEY, r#"{"utm_source":"partner","utm_medium":"email"}"#, None);
        assert_eq!(attr.get_current().utm_source.as_deref(), Some("partner"));
        assert!(matches!(
            parse_snapshot("{not json"),
            Err(StorageError::Corrupt { ref key, .. }) if key == UTM_KEY
        ));
        let reseeded = session.get(UTM_KEY).unwrap();
        assert!(parse_snapshot(&reseeded).is_ok());
    }

    #[test]
    fn test_unavailable_storage_never_panics() {
        let attr = AttributionStore::new(Arc::new(UnavailableStore), Arc::new(UnavailableStore));
        let page = PageContext::new("/?utm_source=x", "");
        assert_eq!(attr.capture(&page).utm_source.as_deref(), Some("x"));
        assert!(attr.get_current().is_empty());
    }

    #[test]
    fn test_classification_rules() {
        let none = UtmParams::default();
        let page = |url: &str, referrer: &str| PageContext::new(url, referrer);

        let p = page("https://prep.example.com/?gclid=abc", "");
        assert_eq!(classify(&none, &p.click_ids(), &p).label(), "google-ads/cpc");

        let p = page("https://prep.example.com/?fbclid=abc", "");
        assert_eq!(classify(&none, &p.click_ids(), &p).label(), "facebook/cpc");

        let p = page("https://prep.example.com/", "https://www.google.com/search?q=x");
        assert_eq!(classify(&none, &p.click_ids(), &p).label(), "google/organic");

        let p = page("https://prep.example.com/", "https://m.facebook.com/");
        assert_eq!(classify(&none, &p.click_ids(), &p).label(), "facebook/referral");

        let p = page("https://prep.example.com/", "https://blog.nursing.org/post");
        assert_eq!(classify(&none, &p.click_ids(), &p).label(), "blog.nursing.org/referral");

        let p = page("https://prep.example.com/", "https://prep.example.com/about");
        assert_eq!(classify(&none, &p.click_ids(), &p).label(), "direct/none");

        let p = page("https://prep.example.com/", "");
        assert_eq!(classify(&none, &p.click_ids(), &p).label(), "direct/none");
    }

    #[test]
    fn test_malformed_url_still_has_path() {
        let p = PageContext::new("http://[::1", "not a url");
        assert!(!p.path().is_empty());
        assert!(p.utm_params().is_empty());
        assert_eq!(p.referrer_host(), None);
    }
}
