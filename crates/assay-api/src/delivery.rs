use assay_core::models::PushEvent;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, PushDeliveryConfig};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Push delivery request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Push delivery endpoint answered HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Serialize)]
struct DeliveryPayload<'a> {
    #[serde(flatten)]
    event: &'a PushEvent,
    collapse_id: String,
}

/// Forwards push-trigger events to the device-push service.
#[derive(Debug, Clone)]
pub struct PushDelivery {
    client: reqwest::Client,
    target: Option<PushDeliveryConfig>,
}

impl PushDelivery {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            target: config.push_delivery.clone(),
        }
    }

    pub async fn deliver(&self, event: &PushEvent) -> Result<(), DeliveryError> {
        let Some(target) = &self.target else {
            tracing::info!(
                recipient = event.recipient,
                assay_id = event.assay_id,
                message_kind = ?event.message_kind,
                "No push delivery endpoint configured; event logged only"
            );
            return Ok(());
        };

        let payload = DeliveryPayload {
            event,
            collapse_id: event.collapse_id(),
        };
        let mut request = self
            .client
            .post(&target.url)
            .header("Accept", "application/json")
            .json(&payload);
        if let Some(token) = &target.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(DeliveryError::Status(response.status().as_u16()));
        }
        tracing::debug!(
            recipient = event.recipient,
            assay_id = event.assay_id,
            "Delivered push event"
        );
        Ok(())
    }

    /// Drain the outbox until every sender is gone.
    pub fn spawn(self, mut events: UnboundedReceiver<PushEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Err(error) = self.deliver(&event).await {
                    tracing::warn!(
                        recipient = event.recipient,
                        assay_id = event.assay_id,
                        %error,
                        "Push delivery failed"
                    );
                }
            }
            tracing::debug!("Push outbox closed; delivery worker stopping");
        })
    }
}

#[cfg(test)]
mod tests {
    use assay_core::models::MessageKind;
    use assay_core::notify::PushOutbox;

    use super::*;

    fn logging_only() -> PushDelivery {
        PushDelivery {
            client: reqwest::Client::new(),
            target: None,
        }
    }

    #[tokio::test]
    async fn without_endpoint_events_are_only_logged() {
        let event = PushEvent::new(4, 9, MessageKind::Ready, Some("G-1".into()));
        logging_only().deliver(&event).await.unwrap();
    }

    #[tokio::test]
    async fn worker_stops_when_outbox_closes() {
        let (outbox, rx) = PushOutbox::channel();
        let worker = logging_only().spawn(rx);
        outbox.send([PushEvent::new(4, 9, MessageKind::NotReady, None)]);
        drop(outbox);
        worker.await.unwrap();
    }

    #[test]
    fn payload_carries_collapse_id() {
        let event = PushEvent::new(4, 9, MessageKind::Ready, Some("G-1".into()));
        let payload = DeliveryPayload {
            event: &event,
            collapse_id: event.collapse_id(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["collapse_id"], "assay-ready-9");
        assert_eq!(json["message_kind"], "ready");
        assert_eq!(json["recipient"], 4);
    }
}
