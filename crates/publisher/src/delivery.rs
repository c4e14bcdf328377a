//! Per-subscriber HTTP delivery.

use std::time::Duration;

use thiserror::Error;

use mnx_events::Delivery;

use crate::config::SubscriberEndpoint;

/// Failure classification for metrics and retry reasons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryErrorKind {
    Timeout,
    Network,
    HttpStatus(u16),
}

impl DeliveryErrorKind {
    pub fn label(&self) -> String {
        match self {
            DeliveryErrorKind::Timeout => "timeout".to_string(),
            DeliveryErrorKind::Network => "network".to_string(),
            DeliveryErrorKind::HttpStatus(status) => format!("http_{status}"),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("subscriber '{subscriber}' failed ({}): {detail}", kind.label())]
pub struct DeliveryFailure {
    pub subscriber: String,
    pub kind: DeliveryErrorKind,
    pub detail: String,
}

/// HTTP client for posting deliveries to projector endpoints.
///
/// The publisher never interprets response bodies: `200`/`202` is success,
/// everything else (including timeouts) is a failure for that subscriber.
pub struct SubscriberClient {
    client: reqwest::Client,
    publisher_id: String,
    timeout: Duration,
}

impl SubscriberClient {
    pub fn new(publisher_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            publisher_id: publisher_id.into(),
            timeout,
        }
    }

    pub async fn deliver(
        &self,
        endpoint: &SubscriberEndpoint,
        delivery: &Delivery,
    ) -> Result<(), DeliveryFailure> {
        let response = self
            .client
            .post(&endpoint.url)
            .header("X-Publisher-ID", &self.publisher_id)
            .timeout(self.timeout)
            .json(delivery)
            .send()
            .await
            .map_err(|e| DeliveryFailure {
                subscriber: endpoint.name.clone(),
                kind: if e.is_timeout() {
                    DeliveryErrorKind::Timeout
                } else {
                    DeliveryErrorKind::Network
                },
                detail: e.to_string(),
            })?;

        match response.status().as_u16() {
            200 | 202 => Ok(()),
            status => Err(DeliveryFailure {
                subscriber: endpoint.name.clone(),
                kind: DeliveryErrorKind::HttpStatus(status),
                detail: format!("subscriber returned {status}"),
            }),
        }
    }
}
