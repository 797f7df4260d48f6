use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::entities::order::LogisticsStatus;
use crate::services::checkout::InitiateOrderResponse;
use crate::services::order_queries::{OrderDetail, OrderSummary};
use crate::{auth::AuthUser, errors::ServiceError, ApiResponse, ApiResult, AppState};

/// Where the consumer wants the order delivered
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "has_any_address_field"))]
pub struct InitiateOrderRequest {
    #[validate(length(max = 100))]
    pub name: Option<String>,
    #[validate(length(min = 7, max = 20))]
    pub phone: Option<String>,
    #[validate(length(max = 200))]
    pub address_line1: Option<String>,
    #[validate(length(max = 200))]
    pub address_line2: Option<String>,
    #[validate(length(max = 100))]
    pub city: Option<String>,
    #[validate(length(max = 100))]
    pub state: Option<String>,
    #[validate(length(max = 20))]
    pub postal_code: Option<String>,
    #[validate(length(max = 60))]
    pub country: Option<String>,
}

fn has_any_address_field(address: &InitiateOrderRequest) -> Result<(), ValidationError> {
    let fields = [
        &address.name,
        &address.phone,
        &address.address_line1,
        &address.address_line2,
        &address.city,
        &address.state,
        &address.postal_code,
        &address.country,
    ];
    if fields
        .iter()
        .any(|f| f.as_deref().is_some_and(|v| !v.trim().is_empty()))
    {
        Ok(())
    } else {
        Err(ValidationError::new("delivery_address_empty"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmOrderRequest {
    pub order_id: Uuid,
    #[validate(length(min = 1, max = 64, message = "gatewayOrderId is required"))]
    pub gateway_order_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderStatusRequest {
    pub order_id: Uuid,
    pub status: LogisticsStatus,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderList {
    pub orders: Vec<OrderSummary>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderEnvelope {
    pub order: OrderDetail,
}

/// Unwraps a JSON body, reporting malformed input as a 400
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ServiceError::ValidationError(rejection.body_text()))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Start checkout",
    description = "Turn the caller's cart into a pending order and a payment gateway order",
    request_body = InitiateOrderRequest,
    responses(
        (status = 200, description = "Gateway order created", body = ApiResponse<InitiateOrderResponse>,
            headers(("X-Request-Id" = String, description = "Unique request id"))
        ),
        (status = 400, description = "Empty cart, out of stock or invalid address", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 500, description = "Gateway or store failure", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn initiate_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    payload: Result<Json<InitiateOrderRequest>, JsonRejection>,
) -> ApiResult<InitiateOrderResponse> {
    let request = json_body(payload)?;
    request.validate()?;

    let delivery_address = serde_json::to_value(&request)?;
    let created = state
        .services
        .checkout
        .initiate_order(auth_user.user_id, strip_nulls(delivery_address))
        .await?;

    Ok(Json(ApiResponse::success(created)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/confirm",
    summary = "Capture payment",
    description = "Capture the approved gateway order and confirm the internal order",
    request_body = ConfirmOrderRequest,
    responses(
        (status = 200, description = "Envelope carrying the gateway capture payload", body = Object),
        (status = 400, description = "Unknown order, already captured, not pending or mismatched gateway id", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 500, description = "Capture failed; the order was cancelled", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn confirm_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    payload: Result<Json<ConfirmOrderRequest>, JsonRejection>,
) -> ApiResult<Value> {
    let request = json_body(payload)?;
    request.validate()?;

    let capture = state
        .services
        .checkout
        .confirm_order(&auth_user, request.order_id, &request.gateway_order_id)
        .await?;

    Ok(Json(ApiResponse::success(capture)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/mine",
    summary = "My orders",
    description = "Paid orders placed by the caller, newest first",
    responses(
        (status = 200, description = "Orders", body = ApiResponse<OrderList>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn my_orders(State(state): State<AppState>, auth_user: AuthUser) -> ApiResult<OrderList> {
    let orders = state
        .services
        .queries
        .consumer_orders(auth_user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(OrderList { orders })))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/farmer",
    summary = "Farmer orders",
    description = "Orders containing the calling farmer's products, reduced to those products",
    responses(
        (status = 200, description = "Orders", body = ApiResponse<OrderList>),
        (status = 401, description = "Caller is not a farmer", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn farmer_orders(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<OrderList> {
    let orders = state
        .services
        .queries
        .farmer_orders(auth_user.user_id)
        .await?;
    Ok(Json(ApiResponse::success(OrderList { orders })))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/farmer/{id}",
    summary = "Farmer order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order", body = ApiResponse<OrderEnvelope>),
        (status = 401, description = "Caller is not a farmer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn farmer_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<OrderEnvelope> {
    let order = state
        .services
        .queries
        .order_for_farmer(auth_user.user_id, id)
        .await?;
    Ok(Json(ApiResponse::success(OrderEnvelope { order })))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    description = "Full order view for its consumer or an admin",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order", body = ApiResponse<OrderEnvelope>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn get_order(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Path(id): Path<Uuid>,
) -> ApiResult<OrderEnvelope> {
    let order = state
        .services
        .queries
        .order_for_consumer(&auth_user, id)
        .await?;
    Ok(Json(ApiResponse::success(OrderEnvelope { order })))
}

#[utoipa::path(
    patch,
    path = "/api/v1/orders/status",
    summary = "Update logistics status",
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Updated order", body = ApiResponse<OrderEnvelope>),
        (status = 400, description = "Order is not confirmed", body = crate::errors::ErrorResponse),
        (status = 401, description = "Caller is not a farmer", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    auth_user: AuthUser,
    payload: Result<Json<UpdateOrderStatusRequest>, JsonRejection>,
) -> ApiResult<OrderEnvelope> {
    let request = json_body(payload)?;

    let order = state
        .services
        .order_status
        .update_logistics_status(&auth_user, request.order_id, request.status)
        .await?;
    Ok(Json(ApiResponse::success(OrderEnvelope { order })))
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_address() -> InitiateOrderRequest {
        InitiateOrderRequest {
            name: None,
            phone: None,
            address_line1: None,
            address_line2: None,
            city: None,
            state: None,
            postal_code: None,
            country: None,
        }
    }

    #[test]
    fn address_needs_at_least_one_field() {
        assert!(empty_address().validate().is_err());

        let blank = InitiateOrderRequest {
            city: Some("  ".to_string()),
            ..empty_address()
        };
        assert!(blank.validate().is_err());

        let ok = InitiateOrderRequest {
            city: Some("Pune".to_string()),
            ..empty_address()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn stored_address_omits_missing_fields() {
        let address = InitiateOrderRequest {
            city: Some("Pune".to_string()),
            postal_code: Some("411001".to_string()),
            ..empty_address()
        };
        let stored = strip_nulls(serde_json::to_value(&address).unwrap());
        assert_eq!(
            stored,
            serde_json::json!({ "city": "Pune", "postalCode": "411001" })
        );
    }
}
