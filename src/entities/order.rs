use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Marketplace order.
///
/// `shipping_info` keeps one [`ShippingDetail`] per purchased product, snapshotted at
/// checkout so later catalog edits do not rewrite order history.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub consumer_id: Uuid,
    #[sea_orm(column_type = "Json")]
    pub shipping_info: ShippingInfo,
    #[sea_orm(column_type = "Json")]
    pub delivery_info: Json,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_price: Decimal,
    pub order_status: OrderStatus,
    #[sea_orm(nullable)]
    pub logistics_status: Option<LogisticsStatus>,
    #[sea_orm(nullable)]
    pub gateway_order_id: Option<String>,
    #[sea_orm(column_type = "Json", nullable)]
    pub payment_info: Option<Json>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::ConsumerId",
        to = "super::user::Column::Id"
    )]
    Consumer,
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::stock_reservation::Entity")]
    Reservations,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Consumer.def()
    }
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::stock_reservation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Reservations.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum OrderStatus {
    #[sea_orm(string_value = "Pending")]
    Pending,
    #[sea_orm(string_value = "Confirmed")]
    Confirmed,
    #[sea_orm(string_value = "Cancelled")]
    Cancelled,
}

/// Fulfilment progress reported by farmers once an order is paid
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    ToSchema,
    strum::Display,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum LogisticsStatus {
    #[sea_orm(string_value = "Processing")]
    Processing,
    #[sea_orm(string_value = "Packed")]
    Packed,
    #[sea_orm(string_value = "Shipped")]
    Shipped,
    #[sea_orm(string_value = "OutForDelivery")]
    OutForDelivery,
    #[sea_orm(string_value = "Delivered")]
    Delivered,
}

/// Per-product shipment state stored inside `shipping_info`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    Pending,
    Confirmed,
    Processing,
    Packed,
    Shipped,
    OutForDelivery,
    Delivered,
}

impl From<LogisticsStatus> for ShipmentStatus {
    fn from(status: LogisticsStatus) -> Self {
        match status {
            LogisticsStatus::Processing => ShipmentStatus::Processing,
            LogisticsStatus::Packed => ShipmentStatus::Packed,
            LogisticsStatus::Shipped => ShipmentStatus::Shipped,
            LogisticsStatus::OutForDelivery => ShipmentStatus::OutForDelivery,
            LogisticsStatus::Delivered => ShipmentStatus::Delivered,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FarmerRef {
    pub id: Uuid,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FarmDetails {
    pub farm_name: String,
    pub farmer: FarmerRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShippingDetail {
    pub product_id: Uuid,
    /// Product category, e.g. `Tomato`
    pub order_item: String,
    #[schema(value_type = Option<Object>)]
    pub pickup_address: Option<serde_json::Value>,
    /// Quantity times pack size with unit, e.g. `10kg`
    pub weight: String,
    pub farm_details: FarmDetails,
    pub status: ShipmentStatus,
    #[schema(value_type = Option<Object>)]
    pub delivery_address: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct ShippingInfo(pub Vec<ShippingDetail>);

impl ShippingInfo {
    pub fn for_farmer(&self, farmer_id: Uuid) -> impl Iterator<Item = &ShippingDetail> {
        self.0
            .iter()
            .filter(move |detail| detail.farm_details.farmer.id == farmer_id)
    }
}
