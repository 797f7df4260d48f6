//! Checkout orchestration: cart → pending order with reserved stock → gateway
//! order, then capture → confirmed order, committed stock and an invoice
//! request in the outbox.

use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{DatabaseConnection, Set, TransactionTrait};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::clients::currency::CurrencyConverter;
use crate::clients::payments::{CreatePaymentOrder, GatewayOrder, PaymentGateway};
use crate::config::AppConfig;
use crate::entities::order::{
    self, FarmDetails, FarmerRef, OrderStatus, ShipmentStatus, ShippingDetail, ShippingInfo,
};
use crate::entities::product::Model as ProductModel;
use crate::entities::user::Model as UserModel;
use crate::errors::ServiceError;
use crate::events::outbox::{self, INVOICE_REQUESTED};
use crate::events::{Event, EventSender};
use crate::notifications::{InvoiceRecipient, InvoiceRequest};
use crate::repositories::{
    CaptureClaim, CartRepository, OrderRepository, ProductRepository, ReservationRepository,
};
use crate::services::order_queries::OrderQueryService;
use crate::services::pricing::{
    format_amount, settlement_amount, subtotal, weight_label, PricedLine, ShippingRateProvider,
};

const CREATE_FAILED: &str = "Failed to create order.";
const CAPTURE_FAILED: &str = "Failed to capture order.";

/// Body returned by order initiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InitiateOrderResponse {
    pub gateway_order_id: String,
    pub status: String,
    pub order_id: Uuid,
    #[schema(value_type = String)]
    pub delivery_fee: Decimal,
    /// Goods plus delivery, in the base currency
    #[schema(value_type = String)]
    pub total_price: Decimal,
    #[schema(value_type = String)]
    pub settlement_amount: Decimal,
    pub settlement_currency: String,
    #[schema(value_type = Object)]
    pub gateway: Value,
}

/// Currency and reservation settings for checkout
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub base_currency: String,
    pub settlement_currency: String,
    pub reservation_ttl: Duration,
}

impl CheckoutSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_currency: config.currency.base_currency.clone(),
            settlement_currency: config.currency.settlement_currency.clone(),
            reservation_ttl: config.checkout.reservation_ttl(),
        }
    }
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            base_currency: "INR".to_string(),
            settlement_currency: "USD".to_string(),
            reservation_ttl: Duration::from_secs(900),
        }
    }
}

/// A cart line resolved against the catalog
struct CheckoutLine {
    product: ProductModel,
    farmer: Option<UserModel>,
    quantity: i32,
}

impl CheckoutLine {
    fn priced(&self) -> PricedLine {
        PricedLine {
            unit_price: self.product.price,
            quantity: self.quantity,
        }
    }

    fn shipping_detail(&self) -> ShippingDetail {
        ShippingDetail {
            product_id: self.product.id,
            order_item: self.product.category.clone(),
            pickup_address: self.product.address.clone(),
            weight: weight_label(self.quantity, self.product.size, &self.product.unit_of_size),
            farm_details: FarmDetails {
                farm_name: self.product.farm_name.clone(),
                farmer: FarmerRef {
                    id: self.product.farmer_id,
                    name: self
                        .farmer
                        .as_ref()
                        .map(|f| f.name.clone())
                        .unwrap_or_default(),
                },
            },
            status: ShipmentStatus::Pending,
            delivery_address: None,
        }
    }
}

fn out_of_stock(product: &ProductModel) -> ServiceError {
    ServiceError::ValidationError(format!("{} is out of stock", product.label()))
}

/// Sums duplicate cart lines per product, keeping first-seen order
fn merge_lines(items: impl IntoIterator<Item = (Uuid, i32)>) -> Vec<(Uuid, i32)> {
    let mut merged: Vec<(Uuid, i32)> = Vec::new();
    for (product_id, quantity) in items {
        match merged.iter_mut().find(|(id, _)| *id == product_id) {
            Some((_, total)) => *total = total.saturating_add(quantity),
            None => merged.push((product_id, quantity)),
        }
    }
    merged
}

/// Every shipment stamped `confirmed` with the address the gateway collected
fn confirmed_shipping(info: &ShippingInfo, delivery_address: Option<Value>) -> ShippingInfo {
    ShippingInfo(
        info.0
            .iter()
            .cloned()
            .map(|mut detail| {
                detail.status = ShipmentStatus::Confirmed;
                if delivery_address.is_some() {
                    detail.delivery_address = delivery_address.clone();
                }
                detail
            })
            .collect(),
    )
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    carts: Arc<CartRepository>,
    products: Arc<ProductRepository>,
    orders: Arc<OrderRepository>,
    reservations: Arc<ReservationRepository>,
    queries: OrderQueryService,
    gateway: Arc<dyn PaymentGateway>,
    converter: Arc<dyn CurrencyConverter>,
    shipping: Arc<dyn ShippingRateProvider>,
    settings: CheckoutSettings,
    event_sender: Option<Arc<EventSender>>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        gateway: Arc<dyn PaymentGateway>,
        converter: Arc<dyn CurrencyConverter>,
        shipping: Arc<dyn ShippingRateProvider>,
        settings: CheckoutSettings,
    ) -> Self {
        let orders = Arc::new(OrderRepository::new(db.clone()));
        Self {
            carts: Arc::new(CartRepository::new(db.clone())),
            products: Arc::new(ProductRepository::new(db.clone())),
            reservations: Arc::new(ReservationRepository::new(db.clone())),
            queries: OrderQueryService::new(orders.clone()),
            orders,
            db,
            gateway,
            converter,
            shipping,
            settings,
            event_sender: None,
        }
    }

    pub fn with_event_sender(mut self, event_sender: Arc<EventSender>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    /// Turns the consumer's cart into a pending order and a gateway order.
    #[instrument(skip(self, delivery_address), fields(consumer_id = %consumer_id))]
    pub async fn initiate_order(
        &self,
        consumer_id: Uuid,
        delivery_address: Value,
    ) -> Result<InitiateOrderResponse, ServiceError> {
        let lines = self.resolve_cart(consumer_id).await?;

        let priced: Vec<PricedLine> = lines.iter().map(CheckoutLine::priced).collect();
        let delivery_fee = self.shipping.delivery_fee(&priced);
        let total_price = subtotal(&priced) + delivery_fee;

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(self.settings.reservation_ttl)
                .map_err(|e| ServiceError::InternalError(e.to_string()))?;

        let txn = self.db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start checkout transaction");
            ServiceError::from(e)
        })?;

        let order = order::ActiveModel {
            id: Set(order_id),
            consumer_id: Set(consumer_id),
            shipping_info: Set(ShippingInfo(
                lines.iter().map(CheckoutLine::shipping_detail).collect(),
            )),
            delivery_info: Set(delivery_address),
            shipping_price: Set(total_price),
            order_status: Set(OrderStatus::Pending),
            logistics_status: Set(None),
            gateway_order_id: Set(None),
            payment_info: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        let items: Vec<(Uuid, i32)> = lines.iter().map(|l| (l.product.id, l.quantity)).collect();
        self.orders.insert_with_items(&txn, order, &items).await?;

        for line in &lines {
            let held = self
                .reservations
                .reserve(&txn, order_id, line.product.id, line.quantity, expires_at)
                .await?;
            if !held {
                // dropping the transaction rolls back the order and earlier holds
                return Err(out_of_stock(&line.product));
            }
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit checkout transaction");
            ServiceError::from(e)
        })?;

        info!(order_id = %order_id, total = %total_price, "Pending order created");

        let (amount, gateway_order) = match self.create_gateway_order(order_id, total_price).await
        {
            Ok(created) => created,
            Err(reason) => {
                // the reservation lapses at expiry and the sweeper cancels the order
                error!(order_id = %order_id, %reason, "Gateway order creation failed");
                counter!("checkout.initiate_failed", 1);
                return Err(ServiceError::UpstreamError(CREATE_FAILED.to_string()));
            }
        };

        if let Err(e) = self
            .orders
            .set_gateway_order_id(order_id, &gateway_order.id)
            .await
        {
            // confirm still works without it; only the id cross-check is skipped
            error!(error = %e, order_id = %order_id, "Failed to store gateway order id");
        }

        counter!("checkout.initiated", 1);
        info!(
            order_id = %order_id,
            gateway = self.gateway.name(),
            gateway_order_id = %gateway_order.id,
            "Gateway order created"
        );
        self.emit(Event::OrderInitiated {
            order_id,
            consumer_id,
            gateway_order_id: gateway_order.id.clone(),
        })
        .await;

        Ok(InitiateOrderResponse {
            gateway_order_id: gateway_order.id,
            status: gateway_order.status,
            order_id,
            delivery_fee,
            total_price,
            settlement_amount: amount,
            settlement_currency: self.settings.settlement_currency.clone(),
            gateway: gateway_order.payload,
        })
    }

    /// Captures payment for a pending order and finalizes it.
    ///
    /// The order's stock holds are claimed before the gateway call so the
    /// expiry sweeper cannot cancel the order mid-capture. Returns the
    /// gateway's capture payload.
    #[instrument(skip(self, caller), fields(consumer_id = %caller.user_id, order_id = %order_id))]
    pub async fn confirm_order(
        &self,
        caller: &AuthUser,
        order_id: Uuid,
        gateway_order_id: &str,
    ) -> Result<Value, ServiceError> {
        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .filter(|o| o.consumer_id == caller.user_id)
            .ok_or_else(|| ServiceError::ValidationError("Order not found".to_string()))?;

        if order.payment_info.is_some() {
            return Err(ServiceError::Conflict("Order already captured".to_string()));
        }
        if order.order_status != OrderStatus::Pending {
            return Err(ServiceError::Conflict(format!(
                "Order is {}, not Pending",
                order.order_status
            )));
        }
        if let Some(stored) = order.gateway_order_id.as_deref() {
            if stored != gateway_order_id {
                return Err(ServiceError::ValidationError(
                    "Gateway order id does not match this order".to_string(),
                ));
            }
        }

        self.claim_for_capture(order_id).await?;

        let capture = match self
            .gateway
            .capture_order(gateway_order_id, &order_id.to_string())
            .await
        {
            Ok(capture) => capture,
            Err(e) => {
                error!(error = %e, "Payment capture failed");
                self.cancel_and_release(order_id, "capture failed").await;
                return Err(ServiceError::UpstreamError(CAPTURE_FAILED.to_string()));
            }
        };

        match self.finalize(caller, order, &capture).await {
            Ok(()) => {
                counter!("checkout.confirmed", 1);
                info!("Order confirmed");
                self.emit(Event::OrderConfirmed {
                    order_id,
                    consumer_id: caller.user_id,
                })
                .await;
                Ok(capture.payload)
            }
            Err(e) => {
                // TODO: refund the captured payment once the gateway client supports refunds
                error!(error = %e, "Payment captured but the order could not be finalized");
                counter!("checkout.finalize_failed", 1);
                self.cancel_and_release(order_id, "finalize failed").await;
                if let Err(e) = self.orders.record_capture(order_id, capture.payload).await {
                    error!(error = %e, "Failed to keep the capture payload");
                }
                Err(ServiceError::UpstreamError(CAPTURE_FAILED.to_string()))
            }
        }
    }

    /// Moves the order's holds to `capturing` in its own transaction
    async fn claim_for_capture(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let claim = self
            .reservations
            .claim_for_capture(&txn, order_id, Utc::now())
            .await?;
        match claim {
            CaptureClaim::Claimed => {
                txn.commit().await?;
                Ok(())
            }
            CaptureClaim::InProgress => Err(ServiceError::Conflict(
                "Order is already being captured".to_string(),
            )),
            CaptureClaim::Lapsed => {
                drop(txn);
                self.cancel_and_release(order_id, "reservation expired").await;
                Err(ServiceError::Conflict("Order reservation has expired".to_string()))
            }
        }
    }

    /// Loads the cart, merges duplicate lines and checks stock
    async fn resolve_cart(&self, consumer_id: Uuid) -> Result<Vec<CheckoutLine>, ServiceError> {
        let items = match self.carts.find_by_owner(consumer_id).await? {
            Some((_, items)) if !items.is_empty() => items,
            _ => return Err(ServiceError::ValidationError("Cart is empty".to_string())),
        };

        let merged = merge_lines(items.into_iter().map(|i| (i.product_id, i.quantity)));
        let ids = merged.iter().map(|(id, _)| *id).collect();
        let mut catalog: HashMap<Uuid, (ProductModel, Option<UserModel>)> = self
            .products
            .find_with_farmers(self.db.as_ref(), ids)
            .await?
            .into_iter()
            .map(|(p, f)| (p.id, (p, f)))
            .collect();

        let mut lines = Vec::with_capacity(merged.len());
        for (product_id, quantity) in merged {
            let (product, farmer) = catalog.remove(&product_id).ok_or_else(|| {
                ServiceError::ValidationError(format!("Product {} no longer exists", product_id))
            })?;
            if quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid quantity for {}",
                    product.label()
                )));
            }
            if quantity > product.available() {
                return Err(out_of_stock(&product));
            }
            lines.push(CheckoutLine {
                product,
                farmer,
                quantity,
            });
        }
        Ok(lines)
    }

    /// Converts the total and opens a gateway order. Errors carry the reason only.
    async fn create_gateway_order(
        &self,
        order_id: Uuid,
        total_price: Decimal,
    ) -> Result<(Decimal, GatewayOrder), String> {
        let converted = self
            .converter
            .convert(
                total_price,
                &self.settings.base_currency,
                &self.settings.settlement_currency,
            )
            .await
            .map_err(|e| e.to_string())?;
        let amount = settlement_amount(converted);

        let created = self
            .gateway
            .create_order(CreatePaymentOrder {
                reference_id: order_id.to_string(),
                amount: format_amount(amount),
                currency: self.settings.settlement_currency.clone(),
            })
            .await
            .map_err(|e| e.to_string())?;

        Ok((amount, created))
    }

    /// Commits stock, drops the cart, confirms the order and queues the invoice
    /// in one transaction.
    async fn finalize(
        &self,
        caller: &AuthUser,
        order: order::Model,
        capture: &GatewayOrder,
    ) -> Result<(), ServiceError> {
        let order_id = order.id;
        let consumer_id = order.consumer_id;
        let shipping_info = confirmed_shipping(&order.shipping_info, capture.shipping_address());

        // build the invoice view before the transaction holds a connection
        let confirmed = order::Model {
            order_status: OrderStatus::Confirmed,
            payment_info: Some(capture.payload.clone()),
            shipping_info: shipping_info.clone(),
            updated_at: Utc::now(),
            ..order
        };
        let detail = self.queries.detail_of(confirmed).await?;
        let expected_holds = detail.order_items.len();
        let recipient = match &detail.consumer {
            Some(contact) => InvoiceRecipient {
                email: contact.email.clone(),
                name: contact.name.clone(),
            },
            None => InvoiceRecipient {
                email: caller.email.clone().unwrap_or_default(),
                name: caller.name.clone().unwrap_or_default(),
            },
        };
        let invoice = serde_json::to_value(InvoiceRequest {
            order: serde_json::to_value(&detail)?,
            user: recipient,
        })?;

        let txn = self.db.begin().await?;

        if !self
            .orders
            .mark_confirmed(&txn, order_id, capture.payload.clone(), shipping_info)
            .await?
        {
            return Err(ServiceError::InternalError(format!(
                "Order {} left Pending during capture",
                order_id
            )));
        }
        let committed = self.reservations.commit_for_order(&txn, order_id).await?;
        if committed != expected_holds {
            // dropping the transaction rolls back the holds committed so far
            return Err(ServiceError::InternalError(format!(
                "Order {} has {} stock holds for {} items",
                order_id, committed, expected_holds
            )));
        }
        self.carts.delete_for_owner(&txn, consumer_id).await?;
        outbox::enqueue(&txn, "order", Some(order_id), INVOICE_REQUESTED, invoice).await?;

        txn.commit().await?;
        Ok(())
    }

    /// `Pending → Cancelled` plus release of the order's stock holds.
    /// Failures are logged; the caller already has an error to report.
    async fn cancel_and_release(&self, order_id: Uuid, reason: &str) {
        let result: Result<Option<usize>, ServiceError> = async {
            let txn = self.db.begin().await?;
            if !self.orders.cancel_if_pending(&txn, order_id).await? {
                return Ok(None);
            }
            let released = self.reservations.release_for_order(&txn, order_id).await?;
            txn.commit().await?;
            Ok(Some(released))
        }
        .await;

        match result {
            Ok(Some(released)) => {
                counter!("checkout.cancelled", 1);
                warn!(order_id = %order_id, released, reason, "Order cancelled");
                self.emit(Event::OrderCancelled {
                    order_id,
                    reason: reason.to_string(),
                })
                .await;
            }
            Ok(None) => {
                warn!(order_id = %order_id, reason, "Order was no longer pending; left as is");
            }
            Err(e) => {
                error!(error = %e, order_id = %order_id, "Failed to cancel order");
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.send_or_log(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_cart_lines_are_summed_in_first_seen_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let merged = merge_lines(vec![(a, 2), (b, 1), (a, 3)]);
        assert_eq!(merged, vec![(a, 5), (b, 1)]);
    }

    #[test]
    fn confirmed_shipping_stamps_status_and_address() {
        let farmer = FarmerRef {
            id: Uuid::new_v4(),
            name: "Ravi".to_string(),
        };
        let info = ShippingInfo(vec![ShippingDetail {
            product_id: Uuid::new_v4(),
            order_item: "Tomato".to_string(),
            pickup_address: None,
            weight: "10kg".to_string(),
            farm_details: FarmDetails {
                farm_name: "Sunrise".to_string(),
                farmer,
            },
            status: ShipmentStatus::Pending,
            delivery_address: None,
        }]);
        let address = serde_json::json!({ "postal_code": "560001" });

        let stamped = confirmed_shipping(&info, Some(address.clone()));
        assert_eq!(stamped.0[0].status, ShipmentStatus::Confirmed);
        assert_eq!(stamped.0[0].delivery_address, Some(address));

        let unchanged_address = confirmed_shipping(&info, None);
        assert_eq!(unchanged_address.0[0].delivery_address, None);
    }
}
