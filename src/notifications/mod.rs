//! Invoice delivery for confirmed orders.
//!
//! The outbox relay publishes `InvoiceRequested` payloads to the
//! [`INVOICE_TOPIC`] queue; [`InvoiceDispatcher`] consumes them, hands each
//! one to an [`InvoiceSender`] and acknowledges the outbox row once the send
//! succeeds.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::events::outbox::OutboxAcks;
use crate::message_queue::{Message, MessageQueue, MessageQueueError, INVOICE_TOPIC};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invoice transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invoice endpoint returned {0}")]
    Rejected(u16),
    #[error("invoice signature error: {0}")]
    Signature(String),
    #[error("invoice payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Queue(#[from] MessageQueueError),
    #[error("outbox acknowledgement failed: {0}")]
    Outbox(#[from] sea_orm::DbErr),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRecipient {
    pub email: String,
    pub name: String,
}

/// Payload of an `InvoiceRequested` event: the joined order view plus who to bill
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub order: serde_json::Value,
    pub user: InvoiceRecipient,
}

impl InvoiceRequest {
    fn order_id(&self) -> &str {
        self.order
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown")
    }
}

#[async_trait]
pub trait InvoiceSender: Send + Sync {
    async fn send(&self, invoice: &InvoiceRequest) -> Result<(), NotificationError>;
}

/// Records the invoice in the log; used when no webhook is configured
#[derive(Debug, Default, Clone)]
pub struct LoggingInvoiceSender;

#[async_trait]
impl InvoiceSender for LoggingInvoiceSender {
    async fn send(&self, invoice: &InvoiceRequest) -> Result<(), NotificationError> {
        info!(
            order_id = invoice.order_id(),
            email = %invoice.user.email,
            "Invoice ready for delivery"
        );
        Ok(())
    }
}

/// HMAC signature generator for webhook authentication
pub struct SignatureGenerator {
    secret: String,
}

impl SignatureGenerator {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Hex HMAC-SHA256 over `"{timestamp}.{body}"`
    pub fn sign_payload(&self, timestamp: &str, body: &str) -> Result<String, NotificationError> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        type HmacSha256 = Hmac<Sha256>;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|e| NotificationError::Signature(e.to_string()))?;
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

/// POSTs the invoice JSON to an external mailer
pub struct WebhookInvoiceSender {
    client: reqwest::Client,
    url: String,
    signature_generator: Option<SignatureGenerator>,
}

impl WebhookInvoiceSender {
    pub fn new(
        url: String,
        secret: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotificationError> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
            url,
            signature_generator: secret.map(SignatureGenerator::new),
        })
    }
}

#[async_trait]
impl InvoiceSender for WebhookInvoiceSender {
    #[instrument(skip(self, invoice), fields(order_id = invoice.order_id()))]
    async fn send(&self, invoice: &InvoiceRequest) -> Result<(), NotificationError> {
        let body = serde_json::to_string(invoice)?;
        let timestamp = chrono::Utc::now().to_rfc3339();

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("Timestamp", &timestamp)
            .body(body.clone());

        if let Some(generator) = &self.signature_generator {
            request = request.header("Signature", generator.sign_payload(&timestamp, &body)?);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(NotificationError::Rejected(response.status().as_u16()));
        }

        info!("Invoice delivered to {}", self.url);
        Ok(())
    }
}

/// Consumes the invoice topic and retries failed deliveries through the queue
pub struct InvoiceDispatcher {
    queue: Arc<dyn MessageQueue>,
    sender: Arc<dyn InvoiceSender>,
    acks: Option<OutboxAcks>,
}

impl InvoiceDispatcher {
    pub fn new(queue: Arc<dyn MessageQueue>, sender: Arc<dyn InvoiceSender>) -> Self {
        Self {
            queue,
            sender,
            acks: None,
        }
    }

    /// Settles the outbox row behind each message (the message id is the row id)
    pub fn with_outbox_acks(mut self, acks: OutboxAcks) -> Self {
        self.acks = Some(acks);
        self
    }

    /// Handles at most one message. Returns `Ok(false)` when the topic is empty.
    pub async fn process_next(&self) -> Result<bool, NotificationError> {
        let Some(message) = self.queue.subscribe(INVOICE_TOPIC).await? else {
            return Ok(false);
        };

        let invoice: InvoiceRequest = match serde_json::from_value(message.payload.clone()) {
            Ok(invoice) => invoice,
            Err(e) => {
                error!(message_id = %message.id, "Dropping malformed invoice message: {}", e);
                if let Some(acks) = &self.acks {
                    acks.failed(message.id, &e.to_string()).await?;
                }
                return Ok(true);
            }
        };

        match self.sender.send(&invoice).await {
            Ok(()) => {
                metrics::counter!("invoices.sent", 1);
                if let Some(acks) = &self.acks {
                    acks.delivered(message.id).await?;
                }
            }
            Err(e) if message.retries_exhausted() => {
                error!(
                    message_id = %message.id,
                    attempts = message.retry_count + 1,
                    "Invoice delivery abandoned: {}", e
                );
                metrics::counter!("invoices.dropped", 1);
                if let Some(acks) = &self.acks {
                    acks.failed(message.id, &e.to_string()).await?;
                }
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    retry = message.retry_count + 1,
                    "Invoice delivery failed; requeueing: {}", e
                );
                self.requeue(message, &e).await;
                return Err(e);
            }
        }

        Ok(true)
    }

    /// Puts a failed message back on the queue. If the queue refuses it, the
    /// outbox row is reopened so the relay publishes it again.
    async fn requeue(&self, message: Message, send_error: &NotificationError) {
        let id = message.id;
        let Err(queue_error) = self.queue.publish(message.retried()).await else {
            return;
        };
        error!(
            message_id = %id,
            send_error = %send_error,
            queue_error = %queue_error,
            "Failed to requeue invoice message"
        );
        let Some(acks) = &self.acks else {
            return;
        };
        let reason = format!("{}; requeue failed: {}", send_error, queue_error);
        if let Err(e) = acks.reopen(id, &reason).await {
            error!(message_id = %id, error = %e, "Failed to reopen outbox row");
        }
    }

    pub fn start(self, poll_interval: Duration) -> JoinHandle<()> {
        info!(?poll_interval, "Starting invoice dispatcher");
        tokio::spawn(async move {
            loop {
                match self.process_next().await {
                    Ok(true) => continue,
                    Ok(false) => {}
                    Err(e) => warn!("Invoice dispatcher: {}", e),
                }
                tokio::time::sleep(poll_interval).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_queue::{InMemoryMessageQueue, Message};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FlakySender {
        failures_left: AtomicU32,
        sent: AtomicU32,
    }

    #[async_trait]
    impl InvoiceSender for FlakySender {
        async fn send(&self, _invoice: &InvoiceRequest) -> Result<(), NotificationError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(NotificationError::Rejected(503));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn invoice_message(max_retries: u32) -> Message {
        Message::new(
            INVOICE_TOPIC,
            json!({
                "order": { "id": "3f0c9a52-1111-4222-8333-444455556666" },
                "user": { "email": "asha@example.com", "name": "Asha" }
            }),
            max_retries,
        )
    }

    #[test]
    fn signature_is_hex_sha256() {
        let generator = SignatureGenerator::new("test_secret".to_string());
        let sig = generator
            .sign_payload("2025-01-01T00:00:00Z", r#"{"order":{}}"#)
            .unwrap();
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn failed_delivery_is_requeued_then_sent() {
        let queue = Arc::new(InMemoryMessageQueue::default());
        queue.publish(invoice_message(3)).await.unwrap();
        let sender = Arc::new(FlakySender {
            failures_left: AtomicU32::new(1),
            sent: AtomicU32::new(0),
        });
        let dispatcher = InvoiceDispatcher::new(queue.clone(), sender.clone());

        assert!(dispatcher.process_next().await.is_err());
        assert_eq!(queue.len(INVOICE_TOPIC), 1);

        assert!(dispatcher.process_next().await.unwrap());
        assert_eq!(sender.sent.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.process_next().await.unwrap());
    }

    #[tokio::test]
    async fn message_is_dropped_after_max_retries() {
        let queue = Arc::new(InMemoryMessageQueue::default());
        queue.publish(invoice_message(1)).await.unwrap();
        let sender = Arc::new(FlakySender {
            failures_left: AtomicU32::new(10),
            sent: AtomicU32::new(0),
        });
        let dispatcher = InvoiceDispatcher::new(queue.clone(), sender.clone());

        assert!(dispatcher.process_next().await.is_err());
        // Second failure exhausts the single retry and drops the message
        assert!(dispatcher.process_next().await.unwrap());
        assert_eq!(queue.len(INVOICE_TOPIC), 0);
        assert_eq!(sender.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn webhook_sender_signs_requests() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoices"))
            .and(header("Content-Type", "application/json"))
            .and(header_exists("Timestamp"))
            .and(header_exists("Signature"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sender = WebhookInvoiceSender::new(
            format!("{}/invoices", server.uri()),
            Some("whsec".to_string()),
            Duration::from_secs(2),
        )
        .unwrap();
        let invoice: InvoiceRequest = serde_json::from_value(invoice_message(0).payload).unwrap();

        sender.send(&invoice).await.unwrap();
    }
}
