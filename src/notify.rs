use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::state_machine::{CompletionEvent, Outcome};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook rejected notification (status {status})")]
    Rejected { status: u16 },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Fire-and-forget sink for terminal outcomes. Errors are logged by the
/// caller and never change an item's state.
pub trait CompletionNotifier: Send + Sync + 'static {
    fn notify(&self, event: CompletionEvent) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// Writes each completion to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl CompletionNotifier for LogNotifier {
    async fn notify(&self, event: CompletionEvent) -> Result<(), NotifyError> {
        tracing::info!(
            identity = %event.identity,
            outcome = %event.outcome,
            attempts = event.attempts,
            duration_ms = event.duration_ms,
            "item finished"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookMessage {
    content: String,
}

/// Posts completions to a chat webhook as `{"content": "..."}`.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn render(event: &CompletionEvent) -> String {
    let mark = match event.outcome {
        Outcome::Succeeded => "✅",
        Outcome::Duplicate => "♻️",
        Outcome::Failed(_) => "❌",
        Outcome::Cancelled => "⏹️",
    };
    let mb = event.size as f64 / (1024.0 * 1024.0);
    format!(
        "{mark} {} ({mb:.1} MB): {} after {} failed attempt(s)",
        event.identity, event.outcome, event.attempts
    )
}

impl CompletionNotifier for WebhookNotifier {
    async fn notify(&self, event: CompletionEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookMessage {
                content: render(&event),
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

/// Notifier picked at runtime from configuration.
pub enum AnyNotifier {
    Log(LogNotifier),
    Webhook(WebhookNotifier),
}

impl CompletionNotifier for AnyNotifier {
    async fn notify(&self, event: CompletionEvent) -> Result<(), NotifyError> {
        match self {
            AnyNotifier::Log(inner) => inner.notify(event).await,
            AnyNotifier::Webhook(inner) => {
                LogNotifier.notify(event.clone()).await?;
                inner.notify(event).await
            }
        }
    }
}
