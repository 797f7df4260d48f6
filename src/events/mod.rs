use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::order::LogisticsStatus;

pub mod outbox;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends without failing the caller; a closed channel is only logged
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("{}", e);
        }
    }
}

/// In-process domain events emitted after state changes commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderInitiated {
        order_id: Uuid,
        consumer_id: Uuid,
        gateway_order_id: String,
    },
    OrderConfirmed {
        order_id: Uuid,
        consumer_id: Uuid,
    },
    OrderCancelled {
        order_id: Uuid,
        reason: String,
    },
    LogisticsStatusChanged {
        order_id: Uuid,
        farmer_id: Uuid,
        status: LogisticsStatus,
    },
    ReservationsExpired {
        order_id: Uuid,
        released: usize,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderInitiated { .. } => "order_initiated",
            Event::OrderConfirmed { .. } => "order_confirmed",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::LogisticsStatusChanged { .. } => "logistics_status_changed",
            Event::ReservationsExpired { .. } => "reservations_expired",
        }
    }
}

pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        metrics::counter!("events.processed", 1, "event" => event.name());

        match &event {
            Event::OrderInitiated {
                order_id,
                consumer_id,
                gateway_order_id,
            } => {
                info!(%order_id, %consumer_id, %gateway_order_id, "Order awaiting payment");
            }
            Event::OrderConfirmed {
                order_id,
                consumer_id,
            } => {
                info!(%order_id, %consumer_id, "Order confirmed");
            }
            Event::OrderCancelled { order_id, reason } => {
                warn!(%order_id, %reason, "Order cancelled");
            }
            Event::LogisticsStatusChanged {
                order_id,
                farmer_id,
                status,
            } => {
                info!(%order_id, %farmer_id, ?status, "Logistics status changed");
            }
            Event::ReservationsExpired { order_id, released } => {
                info!(%order_id, released, "Expired reservations released");
            }
        }
    }

    warn!("Event processing loop has ended");
}
