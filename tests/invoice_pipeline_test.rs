//! Confirmed orders flow through the outbox into the invoice sender.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use agrimart_api::{
    config::NotificationConfig,
    entities::{
        outbox_event::{self, OutboxStatus},
        user::UserRole,
    },
    events::outbox::{OutboxAcks, OutboxRelay, INVOICE_REQUESTED},
    message_queue::{InMemoryMessageQueue, Message, MessageQueue, MessageQueueError, INVOICE_TOPIC},
    notifications::{InvoiceDispatcher, InvoiceRequest, InvoiceSender, NotificationError},
};
use async_trait::async_trait;
use chrono::Utc;
use common::{delivery_address, TestApp};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use uuid::Uuid;

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<InvoiceRequest>>,
}

#[async_trait]
impl InvoiceSender for RecordingSender {
    async fn send(&self, invoice: &InvoiceRequest) -> Result<(), NotificationError> {
        self.sent.lock().unwrap().push(invoice.clone());
        Ok(())
    }
}

/// Rejects sends until `recovered` is set
#[derive(Default)]
struct DownSender {
    recovered: AtomicBool,
}

#[async_trait]
impl InvoiceSender for DownSender {
    async fn send(&self, _invoice: &InvoiceRequest) -> Result<(), NotificationError> {
        if self.recovered.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NotificationError::Rejected(503))
        }
    }
}

/// In-memory queue that can be told to refuse new messages
#[derive(Default)]
struct ClosableQueue {
    inner: InMemoryMessageQueue,
    closed: AtomicBool,
}

#[async_trait]
impl MessageQueue for ClosableQueue {
    async fn publish(&self, message: Message) -> Result<(), MessageQueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessageQueueError::QueueFull);
        }
        self.inner.publish(message).await
    }

    async fn subscribe(&self, topic: &str) -> Result<Option<Message>, MessageQueueError> {
        self.inner.subscribe(topic).await
    }
}

async fn outbox_row(app: &TestApp, id: Uuid) -> outbox_event::Model {
    outbox_event::Entity::find_by_id(id)
        .one(app.db.as_ref())
        .await
        .unwrap()
        .unwrap()
}

/// Checks out and confirms one order for a fresh consumer
async fn confirmed_order(app: &TestApp) -> (Uuid, agrimart_api::entities::user::Model) {
    let farmer = app.seed_user("Ravi", UserRole::Farmer).await;
    let consumer = app.seed_user("Meera", UserRole::Consumer).await;
    let tomato = app.seed_product(&farmer, "Tomato", dec!(50), 10).await;
    app.seed_cart(&consumer, &[(tomato.id, 2)]).await;

    let created = app
        .state
        .services
        .checkout
        .initiate_order(consumer.id, delivery_address())
        .await
        .unwrap();
    app.state
        .services
        .checkout
        .confirm_order(
            &app.caller(&consumer),
            created.order_id,
            &created.gateway_order_id,
        )
        .await
        .unwrap();
    (created.order_id, consumer)
}

#[tokio::test]
async fn confirmed_order_produces_exactly_one_invoice() {
    let app = TestApp::new().await;
    let (order_id, consumer) = confirmed_order(&app).await;

    let rows = outbox_event::Entity::find()
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_type, INVOICE_REQUESTED);
    assert_eq!(rows[0].aggregate_id, Some(order_id));

    let queue = Arc::new(InMemoryMessageQueue::default());
    let relay = OutboxRelay::new(app.db.clone(), queue.clone(), &NotificationConfig::default());
    assert_eq!(relay.drain_once().await.unwrap(), 1);
    assert_eq!(queue.len(INVOICE_TOPIC), 1);
    // published rows are not relayed twice inside the redelivery window
    assert_eq!(relay.drain_once().await.unwrap(), 0);

    let row = outbox_row(&app, rows[0].id).await;
    assert_eq!(row.status, OutboxStatus::Published);
    assert!(row.processed_at.is_none());

    let sender = Arc::new(RecordingSender::default());
    let dispatcher = InvoiceDispatcher::new(queue.clone() as Arc<dyn MessageQueue>, sender.clone())
        .with_outbox_acks(OutboxAcks::new(app.db.clone()));
    assert!(dispatcher.process_next().await.unwrap());
    assert!(!dispatcher.process_next().await.unwrap());

    let row = outbox_row(&app, rows[0].id).await;
    assert_eq!(row.status, OutboxStatus::Delivered);
    assert!(row.processed_at.is_some());

    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let invoice = &sent[0];
    assert_eq!(invoice.user.email, consumer.email);
    assert_eq!(invoice.user.name, consumer.name);
    assert_eq!(invoice.order["id"], order_id.to_string());
    assert_eq!(invoice.order["orderStatus"], "Confirmed");
    assert_eq!(
        invoice.order["orderItems"][0]["product"]["category"],
        "Tomato"
    );
}

#[tokio::test]
async fn failed_capture_writes_no_invoice() {
    let app = TestApp::new().await;
    let farmer = app.seed_user("Ravi", UserRole::Farmer).await;
    let consumer = app.seed_user("Meera", UserRole::Consumer).await;
    let tomato = app.seed_product(&farmer, "Tomato", dec!(50), 10).await;
    app.seed_cart(&consumer, &[(tomato.id, 1)]).await;

    let created = app
        .state
        .services
        .checkout
        .initiate_order(consumer.id, delivery_address())
        .await
        .unwrap();
    app.gateway.fail_capture(true);
    assert!(app
        .state
        .services
        .checkout
        .confirm_order(
            &app.caller(&consumer),
            created.order_id,
            &created.gateway_order_id,
        )
        .await
        .is_err());

    let rows = outbox_event::Entity::find()
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn unacknowledged_invoice_is_relayed_again_after_restart() {
    let app = TestApp::new().await;
    let (order_id, _) = confirmed_order(&app).await;
    let config = NotificationConfig {
        outbox_redelivery_secs: 1,
        ..NotificationConfig::default()
    };

    // the process dies with the invoice still on the in-memory queue
    let lost_queue = Arc::new(InMemoryMessageQueue::default());
    let relay = OutboxRelay::new(app.db.clone(), lost_queue.clone(), &config);
    assert_eq!(relay.drain_once().await.unwrap(), 1);
    drop(lost_queue);

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

    let queue = Arc::new(InMemoryMessageQueue::default());
    let relay = OutboxRelay::new(app.db.clone(), queue.clone(), &config);
    assert_eq!(relay.drain_once().await.unwrap(), 1);

    let sender = Arc::new(RecordingSender::default());
    let dispatcher = InvoiceDispatcher::new(queue.clone() as Arc<dyn MessageQueue>, sender.clone())
        .with_outbox_acks(OutboxAcks::new(app.db.clone()));
    assert!(dispatcher.process_next().await.unwrap());

    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].order["id"], order_id.to_string());
    drop(sent);

    let rows = outbox_event::Entity::find()
        .all(app.db.as_ref())
        .await
        .unwrap();
    assert_eq!(rows[0].status, OutboxStatus::Delivered);
}

#[tokio::test]
async fn refused_requeue_leaves_the_outbox_row_retryable() {
    let app = TestApp::new().await;
    confirmed_order(&app).await;

    let queue = Arc::new(ClosableQueue::default());
    let relay = OutboxRelay::new(app.db.clone(), queue.clone(), &NotificationConfig::default());
    assert_eq!(relay.drain_once().await.unwrap(), 1);

    let sender = Arc::new(DownSender::default());
    let dispatcher = InvoiceDispatcher::new(queue.clone() as Arc<dyn MessageQueue>, sender.clone())
        .with_outbox_acks(OutboxAcks::new(app.db.clone()));

    queue.closed.store(true, Ordering::SeqCst);
    let err = dispatcher.process_next().await.unwrap_err();
    assert!(matches!(err, NotificationError::Rejected(503)));
    assert_eq!(queue.inner.len(INVOICE_TOPIC), 0);

    let rows = outbox_event::Entity::find()
        .all(app.db.as_ref())
        .await
        .unwrap();
    let row = &rows[0];
    assert_eq!(row.status, OutboxStatus::Pending);
    assert!(row.processed_at.is_none());
    let reason = row.last_error.as_deref().unwrap_or_default();
    assert!(reason.contains("503"));
    assert!(reason.contains("Queue is full"));
    assert!(row.available_at > Utc::now());

    // once the backoff passes the relay publishes it again and the send succeeds
    tokio::time::sleep(std::time::Duration::from_millis(2100)).await;
    queue.closed.store(false, Ordering::SeqCst);
    sender.recovered.store(true, Ordering::SeqCst);
    assert_eq!(relay.drain_once().await.unwrap(), 1);
    assert!(dispatcher.process_next().await.unwrap());

    let row = outbox_row(&app, row.id).await;
    assert_eq!(row.status, OutboxStatus::Delivered);
}
