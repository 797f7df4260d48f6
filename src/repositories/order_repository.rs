use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value as Json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::order::{
    ActiveModel as OrderActiveModel, Column, Entity as Order, LogisticsStatus, Model as OrderModel,
    OrderStatus, ShippingInfo,
};
use crate::entities::order_item::{self, Entity as OrderItem, Model as OrderItemModel};
use crate::entities::product::{self, Model as ProductModel};
use crate::entities::user::Model as UserModel;
use crate::repositories::{Repository, UserRepository};

use super::BaseRepository;

/// One order line joined with its product and the product's farmer.
/// `product` is `None` when the product row has since been removed.
#[derive(Debug, Clone)]
pub struct OrderLine {
    pub item: OrderItemModel,
    pub product: Option<ProductModel>,
    pub farmer: Option<UserModel>,
}

impl OrderLine {
    pub fn belongs_to_farmer(&self, farmer_id: Uuid) -> bool {
        self.product
            .as_ref()
            .is_some_and(|p| p.farmer_id == farmer_id)
    }
}

/// An order with its consumer and joined lines
#[derive(Debug, Clone)]
pub struct OrderWithLines {
    pub order: OrderModel,
    pub consumer: Option<UserModel>,
    pub lines: Vec<OrderLine>,
}

/// Repository for order operations
#[derive(Debug, Clone)]
pub struct OrderRepository {
    base: BaseRepository,
    users: UserRepository,
}

impl OrderRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            users: UserRepository::new(db.clone()),
            base: BaseRepository::new(db),
        }
    }

    /// Find an order by ID
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<OrderModel>, DbErr> {
        Order::find_by_id(id).one(self.base.get_db()).await
    }

    /// Paid orders placed by `consumer_id`, newest first
    pub async fn find_for_consumer(&self, consumer_id: Uuid) -> Result<Vec<OrderModel>, DbErr> {
        Order::find()
            .filter(Column::ConsumerId.eq(consumer_id))
            .filter(Column::OrderStatus.is_not_in([OrderStatus::Pending, OrderStatus::Cancelled]))
            .order_by_desc(Column::CreatedAt)
            .all(self.base.get_db())
            .await
    }

    /// Non-cancelled orders containing at least one of the farmer's products, newest first
    pub async fn find_for_farmer(&self, farmer_id: Uuid) -> Result<Vec<OrderModel>, DbErr> {
        let db = self.base.get_db();
        let order_ids: Vec<Uuid> = OrderItem::find()
            .select_only()
            .column(order_item::Column::OrderId)
            .inner_join(product::Entity)
            .filter(product::Column::FarmerId.eq(farmer_id))
            .distinct()
            .into_tuple()
            .all(db)
            .await?;

        if order_ids.is_empty() {
            return Ok(Vec::new());
        }

        Order::find()
            .filter(Column::Id.is_in(order_ids))
            .filter(Column::OrderStatus.ne(OrderStatus::Cancelled))
            .order_by_desc(Column::CreatedAt)
            .all(db)
            .await
    }

    /// Joins each order with its consumer and its lines' products and farmers.
    /// Output keeps the input order.
    pub async fn load_lines(&self, orders: Vec<OrderModel>) -> Result<Vec<OrderWithLines>, DbErr> {
        if orders.is_empty() {
            return Ok(Vec::new());
        }
        let db = self.base.get_db();
        let order_ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();

        let rows = OrderItem::find()
            .filter(order_item::Column::OrderId.is_in(order_ids))
            .find_also_related(product::Entity)
            .all(db)
            .await?;

        let mut user_ids: HashSet<Uuid> = orders.iter().map(|o| o.consumer_id).collect();
        user_ids.extend(rows.iter().filter_map(|(_, p)| p.as_ref().map(|p| p.farmer_id)));

        let users: HashMap<Uuid, UserModel> = self
            .users
            .find_by_ids(user_ids.into_iter().collect())
            .await?
            .into_iter()
            .map(|u| (u.id, u))
            .collect();

        let mut lines_by_order: HashMap<Uuid, Vec<OrderLine>> = HashMap::new();
        for (item, product) in rows {
            let farmer = product
                .as_ref()
                .and_then(|p| users.get(&p.farmer_id).cloned());
            lines_by_order
                .entry(item.order_id)
                .or_default()
                .push(OrderLine {
                    item,
                    product,
                    farmer,
                });
        }

        Ok(orders
            .into_iter()
            .map(|order| OrderWithLines {
                consumer: users.get(&order.consumer_id).cloned(),
                lines: lines_by_order.remove(&order.id).unwrap_or_default(),
                order,
            })
            .collect())
    }

    /// Inserts an order together with its line items
    pub async fn insert_with_items<C: ConnectionTrait>(
        &self,
        conn: &C,
        order: OrderActiveModel,
        items: &[(Uuid, i32)],
    ) -> Result<OrderModel, DbErr> {
        let order = order.insert(conn).await?;

        for (product_id, quantity) in items {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order.id),
                product_id: Set(*product_id),
                quantity: Set(*quantity),
            }
            .insert(conn)
            .await?;
        }

        Ok(order)
    }

    pub async fn set_gateway_order_id(
        &self,
        id: Uuid,
        gateway_order_id: &str,
    ) -> Result<(), DbErr> {
        Order::update_many()
            .set(OrderActiveModel {
                gateway_order_id: Set(Some(gateway_order_id.to_string())),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(Column::Id.eq(id))
            .exec(self.base.get_db())
            .await?;
        Ok(())
    }

    /// `Pending` and uncaptured to `Confirmed`. Returns `false` when another
    /// request already moved the order.
    pub async fn mark_confirmed<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
        payment_info: Json,
        shipping_info: ShippingInfo,
    ) -> Result<bool, DbErr> {
        let result = Order::update_many()
            .set(OrderActiveModel {
                order_status: Set(OrderStatus::Confirmed),
                payment_info: Set(Some(payment_info)),
                shipping_info: Set(shipping_info),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(Column::Id.eq(id))
            .filter(Column::OrderStatus.eq(OrderStatus::Pending))
            .filter(Column::PaymentInfo.is_null())
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Keeps the gateway's capture payload on an order whose confirmation
    /// failed after the money moved. Never overwrites an earlier payload.
    pub async fn record_capture(&self, id: Uuid, payment_info: Json) -> Result<bool, DbErr> {
        let result = Order::update_many()
            .set(OrderActiveModel {
                payment_info: Set(Some(payment_info)),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(Column::Id.eq(id))
            .filter(Column::PaymentInfo.is_null())
            .exec(self.base.get_db())
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// `Pending` to `Cancelled`; no-op for any other state
    pub async fn cancel_if_pending<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
    ) -> Result<bool, DbErr> {
        let result = Order::update_many()
            .set(OrderActiveModel {
                order_status: Set(OrderStatus::Cancelled),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(Column::Id.eq(id))
            .filter(Column::OrderStatus.eq(OrderStatus::Pending))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }

    /// Applies a logistics update to a confirmed order, provided the row is
    /// still at the `loaded_at` version the caller read. Returns `false`
    /// otherwise.
    pub async fn update_logistics<C: ConnectionTrait>(
        &self,
        conn: &C,
        id: Uuid,
        loaded_at: DateTime<Utc>,
        status: LogisticsStatus,
        shipping_info: ShippingInfo,
    ) -> Result<bool, DbErr> {
        let result = Order::update_many()
            .set(OrderActiveModel {
                logistics_status: Set(Some(status)),
                shipping_info: Set(shipping_info),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(Column::Id.eq(id))
            .filter(Column::OrderStatus.eq(OrderStatus::Confirmed))
            .filter(Column::UpdatedAt.eq(loaded_at))
            .exec(conn)
            .await?;
        Ok(result.rows_affected == 1)
    }
}

impl Repository for OrderRepository {
    fn get_db(&self) -> &DatabaseConnection {
        self.base.get_db()
    }
}
