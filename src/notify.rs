//! Progress notifications: structured run events posted to a webhook.
//!
//! Delivery is best-effort. A sink failure is logged and swallowed; it
//! never affects the pipeline.

use async_trait::async_trait;
use std::time::Duration;

use crate::config::NotifyConfig;
use crate::models::TaskReport;

/// How chatty the sink is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NotifyLevel {
    None,
    /// Run start and final summary only.
    Minimal,
    /// Per-document outcomes as well.
    Normal,
}

impl NotifyLevel {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "none" => Self::None,
            "minimal" => Self::Minimal,
            _ => Self::Normal,
        }
    }
}

/// One structured progress event.
#[derive(Debug, Clone)]
pub enum Event {
    RunStarted { total: usize },
    DocumentFinished { path: String, outcome: String },
    RunFinished { summary: String },
}

impl Event {
    fn min_level(&self) -> NotifyLevel {
        match self {
            Event::RunStarted { .. } | Event::RunFinished { .. } => NotifyLevel::Minimal,
            Event::DocumentFinished { .. } => NotifyLevel::Normal,
        }
    }

    fn render(&self) -> String {
        match self {
            Event::RunStarted { total } => format!("Import started: {} documents", total),
            Event::DocumentFinished { path, outcome } => format!("{}: {}", path, outcome),
            Event::RunFinished { summary } => summary.clone(),
        }
    }
}

#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn send(&self, event: Event);
}

/// Sink that drops everything; used when notifications are off.
pub struct NullSink;

#[async_trait]
impl NotifySink for NullSink {
    async fn send(&self, _event: Event) {}
}

/// JSON webhook sink with level filtering. Long messages are split so
/// each post stays within the configured byte budget.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    level: NotifyLevel,
    message_max_bytes: usize,
}

impl WebhookSink {
    pub fn new(config: &NotifyConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            url: config.webhook_url.clone(),
            level: NotifyLevel::parse(&config.level),
            message_max_bytes: config.message_max_bytes.max(1),
        }
    }
}

/// Build the configured sink. Missing URL or `level = "none"` yields
/// the null sink.
pub fn create_sink(config: &NotifyConfig) -> Box<dyn NotifySink> {
    if config.webhook_url.is_empty() || NotifyLevel::parse(&config.level) == NotifyLevel::None {
        Box::new(NullSink)
    } else {
        Box::new(WebhookSink::new(config))
    }
}

#[async_trait]
impl NotifySink for WebhookSink {
    async fn send(&self, event: Event) {
        if event.min_level() > self.level {
            return;
        }
        let message = event.render();
        for part in crate::chunker::split_text(&message, self.message_max_bytes) {
            let body = serde_json::json!({ "msg_type": "text", "content": { "text": part } });
            match self.client.post(&self.url).json(&body).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    tracing::warn!(status = %response.status(), "Webhook rejected notification");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Webhook delivery failed");
                }
            }
        }
    }
}

/// Final-report summary text shared by the sink and the CLI.
pub fn summarize(report: &TaskReport) -> String {
    let mut lines = vec![format!(
        "Import finished: {} total, {} succeeded, {} failed, {} skipped",
        report.total, report.success, report.failed, report.skipped
    )];
    for failure in &report.failures {
        lines.push(format!("  failed: {} ({})", failure.path, failure.reason));
    }
    for skipped in &report.skipped_docs {
        lines.push(format!("  skipped: {} ({})", skipped.path, skipped.reason));
    }
    lines.join("\n")
}
