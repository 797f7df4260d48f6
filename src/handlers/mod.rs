pub mod orders;

use sea_orm::DatabaseConnection;
use std::sync::Arc;

use crate::clients::currency::CurrencyConverter;
use crate::clients::payments::PaymentGateway;
use crate::events::EventSender;
use crate::services::checkout::{CheckoutService, CheckoutSettings};
use crate::services::inventory::InventoryService;
use crate::services::order_queries::OrderQueryService;
use crate::services::order_status::OrderStatusService;
use crate::services::pricing::ShippingRateProvider;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Services layer used by the HTTP handlers and background workers
#[derive(Clone)]
pub struct AppServices {
    pub checkout: Arc<CheckoutService>,
    pub queries: Arc<OrderQueryService>,
    pub order_status: Arc<OrderStatusService>,
    pub inventory: Arc<InventoryService>,
}

impl AppServices {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        converter: Arc<dyn CurrencyConverter>,
        shipping: Arc<dyn ShippingRateProvider>,
        settings: CheckoutSettings,
        event_sender: Option<Arc<EventSender>>,
    ) -> Self {
        let mut checkout = CheckoutService::new(db.clone(), gateway, converter, shipping, settings);
        if let Some(sender) = &event_sender {
            checkout = checkout.with_event_sender(sender.clone());
        }
        let orders = Arc::new(crate::repositories::OrderRepository::new(db.clone()));

        Self {
            checkout: Arc::new(checkout),
            queries: Arc::new(OrderQueryService::new(orders)),
            order_status: Arc::new(OrderStatusService::new(db.clone(), event_sender.clone())),
            inventory: Arc::new(InventoryService::new(db, event_sender)),
        }
    }
}
