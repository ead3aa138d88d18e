//! Alert delivery for engine and enforcement events
//!
//! Supports:
//! - Structured log lines (always on)
//! - Webhooks (HTTP POST with optional HMAC signature)
//!
//! Delivery is fire-and-forget: `notify` never blocks the calling job.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Events raised by the control loops
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    EngineRestarted { reason: String },
    EngineRestartFailed { error: String },
    EngineCrashed { result: String },
    IpLimitExceeded {
        client: String,
        limit: u32,
        disallowed: Vec<String>,
    },
    QuotaExceeded { kind: String, name: String },
}

impl Notification {
    pub fn severity(&self) -> &'static str {
        match self {
            Notification::EngineRestarted { .. } => "info",
            Notification::IpLimitExceeded { .. } | Notification::QuotaExceeded { .. } => {
                "warning"
            }
            Notification::EngineRestartFailed { .. } | Notification::EngineCrashed { .. } => {
                "critical"
            }
        }
    }
}

/// JSON body posted to webhooks
#[derive(Debug, Serialize)]
pub struct NotificationPayload<'a> {
    #[serde(flatten)]
    pub notification: &'a Notification,
    pub severity: &'static str,
    pub timestamp: String,
}

impl<'a> NotificationPayload<'a> {
    pub fn new(notification: &'a Notification) -> Self {
        Self {
            notification,
            severity: notification.severity(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes every event to the log
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match &notification {
            Notification::EngineRestarted { reason } => {
                info!(reason = %reason, "Engine restarted");
            }
            Notification::EngineRestartFailed { error } => {
                error!(error = %error, "Engine restart failed");
            }
            Notification::EngineCrashed { result } => {
                error!(result = %result, "Engine crashed");
            }
            Notification::IpLimitExceeded {
                client,
                limit,
                disallowed,
            } => {
                warn!(client = %client, limit, disallowed = ?disallowed, "Client exceeded IP limit");
            }
            Notification::QuotaExceeded { kind, name } => {
                warn!(kind = %kind, name = %name, "Traffic quota exceeded, entry disabled");
            }
        }
    }
}

/// Posts events to an HTTP endpoint
pub struct WebhookNotifier {
    url: String,
    secret: Option<String>,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            url: url.into(),
            secret,
            http_client,
        })
    }

    fn request(&self, notification: &Notification) -> anyhow::Result<reqwest::RequestBuilder> {
        let body = serde_json::to_string(&NotificationPayload::new(notification))?;

        let mut request = self
            .http_client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", concat!("corekeeper/", env!("CARGO_PKG_VERSION")));

        if let Some(secret) = &self.secret {
            let signature = compute_hmac_signature(secret, &body)?;
            request = request.header("X-Signature-256", format!("sha256={}", signature));
        }

        Ok(request.body(body))
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        let request = match self.request(&notification) {
            Ok(request) => request,
            Err(e) => {
                error!(error = %e, "Failed to build webhook request");
                return;
            }
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime, webhook notification dropped");
                return;
            }
        };

        let url = self.url.clone();
        runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %url, "Webhook notification delivered");
                }
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    error!(url = %url, %status, body = %text, "Webhook returned error");
                }
                Err(e) => {
                    error!(url = %url, error = %e, "Failed to deliver webhook notification");
                }
            }
        });
    }
}

/// Sends each event to every inner notifier
#[derive(Default)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, notification: Notification) {
        for sink in &self.sinks {
            sink.notify(notification.clone());
        }
    }
}

/// Keeps events in memory, for embedding and tests
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: Notification) {
        self.events.lock().push(notification);
    }
}

fn compute_hmac_signature(secret: &str, body: &str) -> anyhow::Result<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json() {
        let notification = Notification::IpLimitExceeded {
            client: "alice@example.com".into(),
            limit: 1,
            disallowed: vec!["203.0.113.5".into()],
        };
        let json = serde_json::to_value(NotificationPayload::new(&notification)).unwrap();

        assert_eq!(json["event"], "ip_limit_exceeded");
        assert_eq!(json["client"], "alice@example.com");
        assert_eq!(json["disallowed"][0], "203.0.113.5");
        assert_eq!(json["severity"], "warning");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn test_hmac_signature() {
        // RFC 4231 test case 2
        let signature = compute_hmac_signature("Jefe", "what do ya want for nothing?").unwrap();
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_webhook_request_is_signed() {
        let notifier =
            WebhookNotifier::new("http://127.0.0.1:9/hook", Some("secret".into())).unwrap();
        let request = notifier
            .request(&Notification::EngineCrashed {
                result: "panic: boom".into(),
            })
            .unwrap()
            .build()
            .unwrap();

        let signature = request.headers().get("X-Signature-256").unwrap();
        assert!(signature.to_str().unwrap().starts_with("sha256="));
        assert_eq!(request.method(), reqwest::Method::POST);
    }

    #[test]
    fn test_fanout_delivers_to_all() {
        let a = Arc::new(RecordingNotifier::default());
        let b = Arc::new(RecordingNotifier::default());
        let fanout = FanoutNotifier::new().with(a.clone()).with(b.clone());

        fanout.notify(Notification::QuotaExceeded {
            kind: "client".into(),
            name: "bob".into(),
        });

        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events(), a.events());
    }
}
