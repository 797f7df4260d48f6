use axum::{routing::get, Json, Router};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Agrimart API",
        version = "1.0.0",
        description = r#"
# Agrimart checkout API

Checkout, payment capture and order tracking for a farm-produce marketplace.

## Authentication

Every `/api/v1` endpoint requires a bearer token:

```
Authorization: Bearer <your-jwt-token>
```

## Error Handling

Errors share one body shape:

```json
{
  "error": "Bad Request",
  "message": "Cart is empty",
  "request_id": "6f1c…",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Orders", description = "Checkout and order tracking endpoints")
    ),
    paths(
        crate::handlers::orders::initiate_order,
        crate::handlers::orders::confirm_order,
        crate::handlers::orders::my_orders,
        crate::handlers::orders::farmer_orders,
        crate::handlers::orders::farmer_order,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_order_status,
    ),
    components(
        schemas(
            crate::handlers::orders::InitiateOrderRequest,
            crate::handlers::orders::ConfirmOrderRequest,
            crate::handlers::orders::UpdateOrderStatusRequest,
            crate::handlers::orders::OrderList,
            crate::handlers::orders::OrderEnvelope,
            crate::services::checkout::InitiateOrderResponse,
            crate::services::order_queries::OrderSummary,
            crate::services::order_queries::OrderDetail,
            crate::entities::order::OrderStatus,
            crate::entities::order::LogisticsStatus,
            crate::entities::order::ShipmentStatus,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&BearerAuth)
)]
pub struct ApiDocV1;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

/// Serves the generated document at `/api-docs/openapi.json`
pub fn docs_router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDocV1::openapi()) }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_checkout_paths_and_bearer_scheme() {
        let json = serde_json::to_string(&ApiDocV1::openapi()).unwrap();
        assert!(json.contains("Agrimart API"));
        assert!(json.contains("/api/v1/orders/confirm"));
        assert!(json.contains("/api/v1/orders/farmer/{id}"));
        assert!(json.contains("\"Bearer\""));
    }
}
