use std::time::Duration;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use reqwest::Client;

use crate::ports::notifier::{NotifyError, PanicNotifier, PanicReport};

/// Posts panic reports as JSON to an operator webhook.
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .wrap_err("Failed to build webhook HTTP client")?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PanicNotifier for WebhookNotifier {
    async fn notify(&self, report: &PanicReport) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(report)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
            });
        }

        tracing::debug!(url = %self.url, trace_id = %report.trace_id, "Panic report posted");
        Ok(())
    }
}
