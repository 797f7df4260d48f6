//! Read projections over orders for consumers, farmers and admins.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::entities::order::{LogisticsStatus, Model as OrderModel, OrderStatus, ShippingDetail};
use crate::entities::user::Model as UserModel;
use crate::errors::ServiceError;
use crate::repositories::{OrderLine, OrderRepository, OrderWithLines};
use crate::services::pricing::PricedLine;

/// Contact details of the consumer who placed an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContactView {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

impl From<&UserModel> for ContactView {
    fn from(user: &UserModel) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            email: user.email.clone(),
            phone: user.phone.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FarmerView {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProductView {
    pub id: Uuid,
    pub category: String,
    pub farm_name: String,
    #[schema(value_type = String)]
    pub price: Decimal,
    #[schema(value_type = String)]
    pub size: Decimal,
    pub unit_of_size: String,
    #[schema(value_type = Object)]
    pub images: serde_json::Value,
    #[schema(value_type = Option<Object>)]
    pub address: Option<serde_json::Value>,
    pub farmer: Option<FarmerView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemView {
    pub product_id: Uuid,
    pub quantity: i32,
    /// `None` when the product has since been removed from the catalog
    pub product: Option<ProductView>,
}

/// One row of an order list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderSummary {
    pub id: Uuid,
    pub consumer: Option<ContactView>,
    pub order_status: OrderStatus,
    pub logistics_status: Option<LogisticsStatus>,
    pub item_count: usize,
    #[schema(value_type = String)]
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full single-order view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OrderDetail {
    pub id: Uuid,
    pub consumer: Option<ContactView>,
    pub order_items: Vec<OrderItemView>,
    pub shipping_info: Vec<ShippingDetail>,
    #[schema(value_type = Object)]
    pub delivery_info: serde_json::Value,
    #[schema(value_type = String)]
    pub shipping_price: Decimal,
    pub order_status: OrderStatus,
    pub logistics_status: Option<LogisticsStatus>,
    #[schema(value_type = Option<Object>)]
    pub payment_info: Option<serde_json::Value>,
    #[schema(value_type = String)]
    pub total_amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Σ price × quantity over lines whose product still resolves
pub fn total_amount(lines: &[OrderLine]) -> Decimal {
    lines
        .iter()
        .filter_map(|line| {
            line.product.as_ref().map(|p| {
                PricedLine {
                    unit_price: p.price,
                    quantity: line.item.quantity,
                }
                .total()
            })
        })
        .sum()
}

fn item_view(line: &OrderLine) -> OrderItemView {
    OrderItemView {
        product_id: line.item.product_id,
        quantity: line.item.quantity,
        product: line.product.as_ref().map(|p| ProductView {
            id: p.id,
            category: p.category.clone(),
            farm_name: p.farm_name.clone(),
            price: p.price,
            size: p.size,
            unit_of_size: p.unit_of_size.clone(),
            images: p.images.clone(),
            address: p.address.clone(),
            farmer: line.farmer.as_ref().map(|f| FarmerView {
                id: f.id,
                name: f.name.clone(),
                phone: f.phone.clone(),
                avatar: f.avatar.clone(),
            }),
        }),
    }
}

fn summary(order: &OrderModel, consumer: Option<&UserModel>, lines: &[OrderLine]) -> OrderSummary {
    OrderSummary {
        id: order.id,
        consumer: consumer.map(ContactView::from),
        order_status: order.order_status,
        logistics_status: order.logistics_status,
        item_count: lines.len(),
        total_amount: total_amount(lines),
        created_at: order.created_at,
        updated_at: order.updated_at,
    }
}

fn detail(
    order: &OrderModel,
    consumer: Option<&UserModel>,
    lines: &[OrderLine],
    shipping: Vec<ShippingDetail>,
) -> OrderDetail {
    OrderDetail {
        id: order.id,
        consumer: consumer.map(ContactView::from),
        order_items: lines.iter().map(item_view).collect(),
        shipping_info: shipping,
        delivery_info: order.delivery_info.clone(),
        shipping_price: order.shipping_price,
        order_status: order.order_status,
        logistics_status: order.logistics_status,
        payment_info: order.payment_info.clone(),
        total_amount: total_amount(lines),
        created_at: order.created_at,
        updated_at: order.updated_at,
    }
}

fn farmer_lines(lines: Vec<OrderLine>, farmer_id: Uuid) -> Vec<OrderLine> {
    lines
        .into_iter()
        .filter(|line| line.belongs_to_farmer(farmer_id))
        .collect()
}

#[derive(Clone)]
pub struct OrderQueryService {
    orders: Arc<OrderRepository>,
}

impl OrderQueryService {
    pub fn new(orders: Arc<OrderRepository>) -> Self {
        Self { orders }
    }

    /// The caller's paid orders, newest first
    #[instrument(skip(self))]
    pub async fn consumer_orders(
        &self,
        consumer_id: Uuid,
    ) -> Result<Vec<OrderSummary>, ServiceError> {
        let orders = self.orders.find_for_consumer(consumer_id).await?;
        let joined = self.orders.load_lines(orders).await?;

        Ok(joined
            .iter()
            .map(|o| summary(&o.order, o.consumer.as_ref(), &o.lines))
            .collect())
    }

    /// Orders containing the farmer's products, reduced to those products.
    /// Orders with nothing left after filtering are omitted.
    #[instrument(skip(self))]
    pub async fn farmer_orders(&self, farmer_id: Uuid) -> Result<Vec<OrderSummary>, ServiceError> {
        let orders = self.orders.find_for_farmer(farmer_id).await?;
        let joined = self.orders.load_lines(orders).await?;

        Ok(joined
            .into_iter()
            .filter_map(|o| {
                let lines = farmer_lines(o.lines, farmer_id);
                if lines.is_empty() {
                    None
                } else {
                    Some(summary(&o.order, o.consumer.as_ref(), &lines))
                }
            })
            .collect())
    }

    /// Single order as seen by its owner or an admin
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn order_for_consumer(
        &self,
        caller: &AuthUser,
        order_id: Uuid,
    ) -> Result<OrderDetail, ServiceError> {
        let joined = self.load(order_id).await?;
        if joined.order.consumer_id != caller.user_id && !caller.is_admin() {
            return Err(order_not_found());
        }

        Ok(detail(
            &joined.order,
            joined.consumer.as_ref(),
            &joined.lines,
            joined.order.shipping_info.0.clone(),
        ))
    }

    /// Single order reduced to the farmer's own items
    #[instrument(skip(self))]
    pub async fn order_for_farmer(
        &self,
        farmer_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderDetail, ServiceError> {
        let joined = self.load(order_id).await?;
        let lines = farmer_lines(joined.lines, farmer_id);
        if lines.is_empty() {
            return Err(order_not_found());
        }

        let shipping = joined
            .order
            .shipping_info
            .for_farmer(farmer_id)
            .cloned()
            .collect();
        Ok(detail(&joined.order, joined.consumer.as_ref(), &lines, shipping))
    }

    /// Unfiltered view of an order model that may not be persisted yet
    pub async fn detail_of(&self, order: OrderModel) -> Result<OrderDetail, ServiceError> {
        let joined = self
            .orders
            .load_lines(vec![order])
            .await?
            .pop()
            .ok_or_else(order_not_found)?;

        Ok(detail(
            &joined.order,
            joined.consumer.as_ref(),
            &joined.lines,
            joined.order.shipping_info.0.clone(),
        ))
    }

    /// The order with its joined lines, or `NotFound`
    pub(crate) async fn load(&self, order_id: Uuid) -> Result<OrderWithLines, ServiceError> {
        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(order_not_found)?;

        self.orders
            .load_lines(vec![order])
            .await?
            .pop()
            .ok_or_else(order_not_found)
    }
}

fn order_not_found() -> ServiceError {
    ServiceError::NotFound("Order not found".to_string())
}
