use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tether_core::config::NotifyConfig;
use tether_sync::{Attributes, LogNotifier, Notifier};

/// POSTs `{title, message, attributes}` as JSON to a webhook URL. Delivery
/// failures are logged and dropped.
pub struct HttpNotifier {
    url: String,
    agent: ureq::Agent,
}

impl HttpNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(10))
            .build();
        HttpNotifier {
            url: url.into(),
            agent,
        }
    }
}

impl Notifier for HttpNotifier {
    fn send(&self, title: &str, message: &str, attributes: &Attributes) {
        tracing::info!(title, message, "sending notification");
        let payload = json!({
            "title": title,
            "message": message,
            "attributes": attributes,
        });
        if let Err(err) = self.agent.post(&self.url).send_json(payload) {
            tracing::warn!(error = %err, url = %self.url, "notification delivery failed");
        }
    }
}

/// HTTP delivery when a URL is configured, the log otherwise.
pub fn notifier_for(config: &NotifyConfig) -> Arc<dyn Notifier> {
    match config.url.as_deref().filter(|u| !u.is_empty()) {
        Some(url) => Arc::new(HttpNotifier::new(url)),
        None => Arc::new(LogNotifier),
    }
}
