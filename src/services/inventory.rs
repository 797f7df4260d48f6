//! Expiry of stock reservations held by unpaid orders.

use chrono::{DateTime, Utc};
use sea_orm::{DatabaseConnection, TransactionTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::repositories::{OrderRepository, ReservationRepository};

/// Orders handled per sweep
const SWEEP_BATCH: u64 = 100;

/// A capture claim older than this belongs to a confirm that never finished
const STALE_CLAIM_SECS: i64 = 3600;

#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DatabaseConnection>,
    orders: Arc<OrderRepository>,
    reservations: Arc<ReservationRepository>,
    event_sender: Option<Arc<EventSender>>,
}

impl InventoryService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            orders: Arc::new(OrderRepository::new(db.clone())),
            reservations: Arc::new(ReservationRepository::new(db.clone())),
            db,
            event_sender,
        }
    }

    /// Releases every hold that expired by `now` and cancels its order if it is
    /// still pending. Holds claimed by an in-flight capture are skipped until
    /// the claim goes stale. Returns the number of orders processed.
    #[instrument(skip(self))]
    pub async fn release_expired(&self, now: DateTime<Utc>) -> Result<usize, ServiceError> {
        let stale_claims_before = now - chrono::Duration::seconds(STALE_CLAIM_SECS);
        let order_ids = self
            .reservations
            .find_lapsed_order_ids(now, stale_claims_before, SWEEP_BATCH)
            .await?;

        let mut processed = 0;
        for order_id in order_ids {
            match self.release_order(order_id, now, stale_claims_before).await {
                Ok((0, _)) => {}
                Ok((released, cancelled)) => {
                    processed += 1;
                    metrics::counter!("reservations.expired", released as u64);
                    info!(%order_id, released, cancelled, "Released expired reservations");
                    self.emit(Event::ReservationsExpired { order_id, released })
                        .await;
                    if cancelled {
                        self.emit(Event::OrderCancelled {
                            order_id,
                            reason: "reservation expired".to_string(),
                        })
                        .await;
                    }
                }
                // a concurrent confirm or sweep won the rows; skip this order
                Err(e) => warn!(%order_id, error = %e, "Skipping expired reservations"),
            }
        }
        Ok(processed)
    }

    async fn release_order(
        &self,
        order_id: Uuid,
        now: DateTime<Utc>,
        stale_claims_before: DateTime<Utc>,
    ) -> Result<(usize, bool), ServiceError> {
        let txn = self.db.begin().await?;
        let released = self
            .reservations
            .release_lapsed_for_order(&txn, order_id, now, stale_claims_before)
            .await?;
        if released == 0 {
            return Ok((0, false));
        }
        let still_held = self.reservations.find_held_for_order(&txn, order_id).await?;
        let cancelled = if still_held.is_empty() {
            self.orders.cancel_if_pending(&txn, order_id).await?
        } else {
            false
        };
        txn.commit().await?;
        Ok((released, cancelled))
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }

    /// Runs [`Self::release_expired`] every `interval` until the runtime shuts down
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.release_expired(Utc::now()).await {
                    error!(error = %e, "Reservation sweep failed");
                }
            }
        })
    }
}
