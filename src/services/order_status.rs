use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    entities::order::{LogisticsStatus, OrderStatus, ShipmentStatus, ShippingInfo},
    entities::user::UserRole,
    errors::ServiceError,
    events::{Event, EventSender},
    repositories::OrderRepository,
    services::order_queries::{OrderDetail, OrderQueryService},
};

/// Reload-and-reapply rounds before a logistics update gives up
const UPDATE_ATTEMPTS: u32 = 5;

/// Farmer-driven logistics updates on paid orders
#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    orders: Arc<OrderRepository>,
    queries: OrderQueryService,
    event_sender: Option<Arc<EventSender>>,
}

impl OrderStatusService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Option<Arc<EventSender>>) -> Self {
        let orders = Arc::new(OrderRepository::new(db.clone()));
        Self {
            db,
            queries: OrderQueryService::new(orders.clone()),
            orders,
            event_sender,
        }
    }

    /// Sets the order's logistics status and stamps the caller's shipments with it.
    /// Returns the order as the farmer sees it.
    #[instrument(
        skip(self, caller),
        fields(farmer_id = %caller.user_id, order_id = %order_id, ?status)
    )]
    pub async fn update_logistics_status(
        &self,
        caller: &AuthUser,
        order_id: Uuid,
        status: LogisticsStatus,
    ) -> Result<OrderDetail, ServiceError> {
        caller.require_role(UserRole::Farmer)?;
        let farmer_id = caller.user_id;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let joined = self.queries.load(order_id).await?;
            if !joined.lines.iter().any(|l| l.belongs_to_farmer(farmer_id)) {
                return Err(ServiceError::NotFound("Order not found".to_string()));
            }
            if joined.order.order_status != OrderStatus::Confirmed {
                return Err(ServiceError::ValidationError(format!(
                    "Logistics status can only change on confirmed orders; this one is {}",
                    joined.order.order_status
                )));
            }

            let stamped =
                stamp_farmer_shipments(&joined.order.shipping_info, farmer_id, status.into());
            let updated = self
                .orders
                .update_logistics(
                    self.db.as_ref(),
                    order_id,
                    joined.order.updated_at,
                    status,
                    stamped,
                )
                .await?;
            if updated {
                break;
            }
            // another writer changed the row since it was loaded
            if attempt >= UPDATE_ATTEMPTS {
                warn!(attempt, "Logistics update kept losing to concurrent writers");
                return Err(ServiceError::Conflict(
                    "Order was modified concurrently, try again".to_string(),
                ));
            }
        }

        info!("Logistics status updated");
        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::LogisticsStatusChanged {
                    order_id,
                    farmer_id,
                    status,
                })
                .await;
        }

        self.queries.order_for_farmer(farmer_id, order_id).await
    }
}

fn stamp_farmer_shipments(
    info: &ShippingInfo,
    farmer_id: Uuid,
    status: ShipmentStatus,
) -> ShippingInfo {
    ShippingInfo(
        info.0
            .iter()
            .cloned()
            .map(|mut detail| {
                if detail.farm_details.farmer.id == farmer_id {
                    detail.status = status;
                }
                detail
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::order::{FarmDetails, FarmerRef, ShippingDetail};

    fn shipment(farmer_id: Uuid) -> ShippingDetail {
        ShippingDetail {
            product_id: Uuid::new_v4(),
            order_item: "Potato".to_string(),
            pickup_address: None,
            weight: "5kg".to_string(),
            farm_details: FarmDetails {
                farm_name: "Hill Farm".to_string(),
                farmer: FarmerRef {
                    id: farmer_id,
                    name: "Asha".to_string(),
                },
            },
            status: ShipmentStatus::Confirmed,
            delivery_address: None,
        }
    }

    #[test]
    fn only_the_callers_shipments_change() {
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let info = ShippingInfo(vec![shipment(me), shipment(other)]);

        let stamped = stamp_farmer_shipments(&info, me, ShipmentStatus::Shipped);
        assert_eq!(stamped.0[0].status, ShipmentStatus::Shipped);
        assert_eq!(stamped.0[1].status, ShipmentStatus::Confirmed);
    }
}
