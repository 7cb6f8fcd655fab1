//! User and admin notification dispatch.
//!
//! Verification outcomes and reconciliation findings produce
//! notifications. Delivery is fire-and-forget: a failed or slow webhook
//! must never stall verification or a scan.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

/// A single outbound notification.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Recipient user id.
    pub user_id: i64,
    pub facility_id: i64,
    pub title: String,
    pub body: String,
}

/// Sink for outbound notifications.
pub trait Notifier: Send + Sync {
    /// Queue a notification for delivery. Must not block.
    fn notify(&self, notification: Notification);
}

/// Delivers notifications as JSON POSTs to a configured webhook.
pub struct WebhookNotifier {
    http: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, notification: Notification) {
        let http = self.http.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            match http.post(&url).json(&notification).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(user_id = notification.user_id, "Notification delivered");
                }
                Ok(response) => {
                    warn!(
                        user_id = notification.user_id,
                        status = %response.status(),
                        "Notification webhook rejected the request"
                    );
                }
                Err(e) => {
                    warn!(user_id = notification.user_id, error = %e, "Notification delivery failed");
                }
            }
        });
    }
}

/// Used when no webhook is configured; logs and drops.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, notification: Notification) {
        debug!(
            user_id = notification.user_id,
            title = %notification.title,
            "Notification dropped (no webhook configured)"
        );
    }
}

/// Build the notifier selected by configuration.
pub fn notifier_from_config(webhook: Option<&String>) -> Arc<dyn Notifier> {
    match webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(NoopNotifier),
    }
}
