//! Transactional outbox.
//!
//! Services call [`enqueue`] inside the transaction that makes a state change.
//! [`OutboxRelay`] later publishes committed rows to the message queue and
//! marks them `published`. A row only becomes `delivered` once the consumer
//! acknowledges it through [`OutboxAcks`]; unacknowledged rows are relayed
//! again after the redelivery window, so a restart never loses an event.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::NotificationConfig;
use crate::entities::outbox_event::{self, Column, Entity as OutboxEvent, OutboxStatus};
use crate::message_queue::{Message, MessageQueue, INVOICE_TOPIC};

pub const INVOICE_REQUESTED: &str = "InvoiceRequested";

const BASE_BACKOFF_SECS: i64 = 2;
const MAX_BACKOFF_SECS: i64 = 300;

/// Writes an outbox row using the caller's connection or transaction
pub async fn enqueue<C: ConnectionTrait>(
    db: &C,
    aggregate_type: &str,
    aggregate_id: Option<Uuid>,
    event_type: &str,
    payload: Value,
) -> Result<Uuid, DbErr> {
    let now = Utc::now();
    let id = Uuid::new_v4();

    outbox_event::ActiveModel {
        id: Set(id),
        aggregate_type: Set(aggregate_type.to_string()),
        aggregate_id: Set(aggregate_id),
        event_type: Set(event_type.to_string()),
        payload: Set(payload),
        status: Set(OutboxStatus::Pending),
        attempts: Set(0),
        available_at: Set(now),
        last_error: Set(None),
        processed_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await?;

    debug!(%id, event_type, aggregate_type, "Enqueued outbox event");
    Ok(id)
}

/// Queue topic an outbox event type is relayed to
pub fn topic_for(event_type: &str) -> Option<&'static str> {
    match event_type {
        INVOICE_REQUESTED => Some(INVOICE_TOPIC),
        _ => None,
    }
}

fn retry_delay(attempts: i32) -> ChronoDuration {
    let exp = u32::try_from(attempts).unwrap_or(0);
    ChronoDuration::seconds(BASE_BACKOFF_SECS.saturating_pow(exp).min(MAX_BACKOFF_SECS))
}

/// Publishes pending outbox rows to the message queue
pub struct OutboxRelay {
    db: Arc<DatabaseConnection>,
    queue: Arc<dyn MessageQueue>,
    batch_size: u64,
    max_attempts: i32,
    message_max_retries: u32,
    redelivery: ChronoDuration,
}

impl OutboxRelay {
    pub fn new(
        db: Arc<DatabaseConnection>,
        queue: Arc<dyn MessageQueue>,
        config: &NotificationConfig,
    ) -> Self {
        Self {
            db,
            queue,
            batch_size: config.outbox_batch_size,
            max_attempts: config.outbox_max_attempts,
            message_max_retries: config.invoice_max_retries,
            redelivery: ChronoDuration::from_std(config.outbox_redelivery())
                .unwrap_or_else(|_| ChronoDuration::days(1)),
        }
    }

    /// Relays one batch of due events: pending rows plus published rows whose
    /// acknowledgement is overdue. Returns how many were published.
    pub async fn drain_once(&self) -> Result<usize, DbErr> {
        let db = &*self.db;
        let now = Utc::now();

        let batch = OutboxEvent::find()
            .filter(Column::Status.is_in([OutboxStatus::Pending, OutboxStatus::Published]))
            .filter(Column::AvailableAt.lte(now))
            .order_by_asc(Column::CreatedAt)
            .limit(self.batch_size)
            .all(db)
            .await?;

        let mut published = 0;
        for event in batch {
            if event.status == OutboxStatus::Published {
                warn!(id = %event.id, "Outbox event was never acknowledged; relaying again");
            }
            let attempts = event.attempts + 1;

            let outcome = match topic_for(&event.event_type) {
                Some(topic) => {
                    let mut message =
                        Message::new(topic, event.payload.clone(), self.message_max_retries);
                    message.id = event.id;
                    self.queue.publish(message).await.map_err(|e| e.to_string())
                }
                None => Err(format!("no route for event type {}", event.event_type)),
            };

            let mut row: outbox_event::ActiveModel = event.clone().into();
            row.attempts = Set(attempts);
            row.updated_at = Set(Utc::now());

            match outcome {
                Ok(()) => {
                    row.status = Set(OutboxStatus::Published);
                    row.available_at = Set(Utc::now() + self.redelivery);
                    row.last_error = Set(None);
                    published += 1;
                    metrics::counter!("outbox.relayed", 1);
                }
                Err(reason) if attempts >= self.max_attempts => {
                    error!(id = %event.id, attempts, %reason, "Outbox event failed permanently");
                    row.status = Set(OutboxStatus::Failed);
                    row.last_error = Set(Some(reason));
                    metrics::counter!("outbox.failed", 1);
                }
                Err(reason) => {
                    warn!(id = %event.id, attempts, %reason, "Outbox publish failed; will retry");
                    row.available_at = Set(Utc::now() + retry_delay(attempts));
                    row.last_error = Set(Some(reason));
                }
            }

            row.update(db).await?;
        }

        Ok(published)
    }

    pub fn start(self, poll_interval: Duration) -> JoinHandle<()> {
        info!(?poll_interval, "Starting outbox relay");
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.drain_once().await {
                    error!("Outbox relay error: {}", e);
                }
                sleep(poll_interval).await;
            }
        })
    }
}

/// Consumer-side acknowledgements for relayed outbox rows
#[derive(Clone)]
pub struct OutboxAcks {
    db: Arc<DatabaseConnection>,
}

impl OutboxAcks {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// The consumer handled the event; it is never relayed again
    pub async fn delivered(&self, id: Uuid) -> Result<bool, DbErr> {
        self.settle(id, OutboxStatus::Delivered, None, Utc::now()).await
    }

    /// The consumer gave up on the event
    pub async fn failed(&self, id: Uuid, reason: &str) -> Result<bool, DbErr> {
        self.settle(id, OutboxStatus::Failed, Some(reason), Utc::now()).await
    }

    /// The event fell off the queue; the relay picks it up again after a
    /// short backoff
    pub async fn reopen(&self, id: Uuid, reason: &str) -> Result<bool, DbErr> {
        self.settle(
            id,
            OutboxStatus::Pending,
            Some(reason),
            Utc::now() + retry_delay(1),
        )
        .await
    }

    async fn settle(
        &self,
        id: Uuid,
        status: OutboxStatus,
        reason: Option<&str>,
        available_at: DateTime<Utc>,
    ) -> Result<bool, DbErr> {
        let now = Utc::now();
        let processed_at = match status {
            OutboxStatus::Delivered | OutboxStatus::Failed => Some(now),
            OutboxStatus::Pending | OutboxStatus::Published => None,
        };
        let result = OutboxEvent::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::ProcessedAt, Expr::value(processed_at))
            .col_expr(Column::LastError, Expr::value(reason.map(str::to_string)))
            .col_expr(Column::AvailableAt, Expr::value(available_at))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.is_in([OutboxStatus::Pending, OutboxStatus::Published]))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_events_route_to_invoice_topic() {
        assert_eq!(topic_for(INVOICE_REQUESTED), Some(INVOICE_TOPIC));
        assert_eq!(topic_for("Unknown"), None);
    }

    #[test]
    fn retry_delay_grows_and_caps() {
        assert_eq!(retry_delay(1), ChronoDuration::seconds(2));
        assert_eq!(retry_delay(3), ChronoDuration::seconds(8));
        assert_eq!(retry_delay(30), ChronoDuration::seconds(MAX_BACKOFF_SECS));
    }
}
