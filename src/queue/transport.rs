use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use crate::error::DeliveryError;
use crate::events::TrackingEvent;
use crate::logging::{log, obj, v_str, Domain, Level};

#[async_trait]
pub trait Transport: Send + Sync {
    /// One event, one request. Any 2xx is success.
    async fn send(&self, event: &TrackingEvent) -> Result<(), DeliveryError>;

    /// Hand a batch off without waiting for the outcome. Returns whether the
    /// batch was handed off at all.
    fn send_beacon(&self, events: Vec<TrackingEvent>) -> bool;
}

/// POSTs JSON to the first-party ingestion endpoint.
pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, url }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, event: &TrackingEvent) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(event)?;
        let resp = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DeliveryError::Status(status.as_u16()));
        }
        Ok(())
    }

    fn send_beacon(&self, events: Vec<TrackingEvent>) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let body = match serde_json::to_vec(&events) {
            Ok(body) => body,
            Err(err) => {
                log(
                    Level::Error,
                    Domain::Queue,
                    "beacon_failed",
                    obj(&[("msg", v_str(&DeliveryError::from(err).to_string()))]),
                );
                return false;
            }
        };
        let request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        handle.spawn(async move {
            if let Err(err) = request.send().await {
                log(
                    Level::Warn,
                    Domain::Queue,
                    "beacon_failed",
                    obj(&[("msg", v_str(&err.to_string()))]),
                );
            }
        });
        true
    }
}

#[derive(Debug, Default)]
struct Recorded {
    fail_next: u32,
    attempts: u32,
    posts: Vec<TrackingEvent>,
    beacons: Vec<Vec<TrackingEvent>>,
}

/// In-memory transport that records deliveries and can fail on demand.
#[derive(Debug, Default, Clone)]
pub struct RecordingTransport {
    state: Arc<Mutex<Recorded>>,
    latency: Option<Duration>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    /// The next `n` sends fail with a 503.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_next = n;
        }
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().map(|s| s.attempts).unwrap_or(0)
    }

    pub fn posts(&self) -> Vec<TrackingEvent> {
        self.state.lock().map(|s| s.posts.clone()).unwrap_or_default()
    }

    pub fn beacons(&self) -> Vec<Vec<TrackingEvent>> {
        self.state.lock().map(|s| s.beacons.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, event: &TrackingEvent) -> Result<(), DeliveryError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut s = self
            .state
            .lock()
            .map_err(|_| DeliveryError::Network("recording transport poisoned".to_string()))?;
        s.attempts += 1;
        if s.fail_next > 0 {
            s.fail_next -= 1;
            return Err(DeliveryError::Status(503));
        }
        s.posts.push(event.clone());
        Ok(())
    }

    fn send_beacon(&self, events: Vec<TrackingEvent>) -> bool {
        match self.state.lock() {
            Ok(mut s) => {
                s.beacons.push(events);
                true
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{EventQueue, QueueConfig, RetryConfig};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn event(n: usize) -> TrackingEvent {
        TrackingEvent {
            event_type: "form_submit".to_string(),
            data: json!({ "n": n }),
            user_data: None,
            timestamp: "2026-01-01T00:00:00.000Z".to_string(),
            session_id: "s_http".to_string(),
            provider: "server".to_string(),
        }
    }

    fn header_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }

    async fn read_body(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 2048];
        loop {
            let n = socket.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                return String::new();
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = header_end(&buf) {
                let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                let start = end + 4;
                if buf.len() >= start + len {
                    return String::from_utf8_lossy(&buf[start..start + len]).to_string();
                }
            }
        }
    }

    /// Answers one connection per scripted status and records request bodies.
    async fn ingestion_server(statuses: Vec<u16>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let bodies = Arc::new(Mutex::new(Vec::new()));
        let seen = bodies.clone();
        tokio::spawn(async move {
            for status in statuses {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let body = read_body(&mut socket).await;
                seen.lock().unwrap().push(body);
                let resp = if status == 204 {
                    "HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n".to_string()
                } else {
                    format!(
                        "HTTP/1.1 {} Status\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    )
                };
                let _ = socket.write_all(resp.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}/api/tracking", addr), bodies)
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_status_error() {
        let (url, bodies) = ingestion_server(vec![503]).await;
        let transport = HttpTransport::new(url);
        let err = transport.send(&event(1)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Status(503)));

        let sent: Value = serde_json::from_str(&bodies.lock().unwrap()[0]).unwrap();
        assert_eq!(sent["type"], "form_submit");
        assert_eq!(sent["sessionId"], "s_http");
    }

    #[tokio::test]
    async fn test_queue_retries_over_http_until_2xx() {
        let (url, bodies) = ingestion_server(vec![503, 204]).await;
        let config = QueueConfig {
            retry: RetryConfig {
                base_delay_ms: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let queue = EventQueue::new(config, Arc::new(HttpTransport::new(url)));
        queue.enqueue(event(7));

        assert_eq!(queue.flush().await, 1);
        let stats = queue.stats();
        assert_eq!(stats.failed_attempts, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 0);

        let bodies = bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0], bodies[1], "retry resends the same payload");
    }

    #[tokio::test]
    async fn test_beacon_posts_the_batch_as_an_array() {
        let (url, bodies) = ingestion_server(vec![200]).await;
        let transport = HttpTransport::new(url);
        assert!(transport.send_beacon(vec![event(1), event(2)]));

        for _ in 0..200 {
            if !bodies.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let body = bodies.lock().unwrap().first().cloned().unwrap_or_default();
        let sent: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(sent.as_array().map(|a| a.len()), Some(2));
        assert_eq!(sent[1]["data"]["n"], 2);
    }

    #[test]
    fn test_beacon_without_runtime_is_refused() {
        let transport = HttpTransport::new("http://127.0.0.1:9/api/tracking".to_string());
        assert!(!transport.send_beacon(vec![event(1)]));
    }
}
