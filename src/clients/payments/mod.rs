//! Payment gateway client.
//!
//! [`PaymentGateway`] is the seam the checkout service talks to. [`PaypalGateway`]
//! speaks the PayPal Orders v2 REST API; [`mock::MockPaymentGateway`] backs tests.

mod error;
pub mod mock;
mod types;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::config::PaymentConfig;
use crate::middleware_helpers::{with_retry, RetryConfig};

pub use self::error::PaymentError;
use self::types::{Amount, OrderRequestBody, PurchaseUnit, TokenResponse};
pub use self::types::{CreatePaymentOrder, GatewayOrder};

const IDEMPOTENCY_HEADER: &str = "PayPal-Request-Id";
/// Tokens are refreshed this long before the gateway says they expire
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[async_trait]
pub trait PaymentGateway: Send + Sync + 'static {
    /// Short gateway name reported to API clients
    fn name(&self) -> &'static str;

    /// Creates a capture-intent order for the given amount
    async fn create_order(&self, order: CreatePaymentOrder) -> Result<GatewayOrder, PaymentError>;

    /// Captures funds for a previously approved order
    async fn capture_order(
        &self,
        gateway_order_id: &str,
        idempotency_key: &str,
    ) -> Result<GatewayOrder, PaymentError>;
}

#[async_trait]
impl<T: ?Sized + PaymentGateway> PaymentGateway for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn create_order(&self, order: CreatePaymentOrder) -> Result<GatewayOrder, PaymentError> {
        (**self).create_order(order).await
    }

    async fn capture_order(
        &self,
        gateway_order_id: &str,
        idempotency_key: &str,
    ) -> Result<GatewayOrder, PaymentError> {
        (**self).capture_order(gateway_order_id, idempotency_key).await
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// PayPal Orders v2 client with a cached client-credentials token.
///
/// Build once at startup and share; the reqwest pool and token are reused
/// across requests.
pub struct PaypalGateway {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    retry: RetryConfig,
    token: RwLock<Option<CachedToken>>,
}

impl PaypalGateway {
    pub fn new(config: &PaymentConfig) -> Result<Self, PaymentError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            retry: RetryConfig::single_retry(config.retry_backoff()),
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, PaymentError> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let mut slot = self.token.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(token) = slot.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        debug!("Requesting payment gateway access token");
        let response = self
            .http
            .post(format!("{}/v1/oauth2/token", self.base_url))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Unauthorized(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::MalformedResponse(e.to_string()))?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);

        *slot = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    /// One authenticated POST; no retry
    async fn post_once(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: &str,
    ) -> Result<GatewayOrder, PaymentError> {
        let token = self.access_token().await?;

        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(token)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .header("Prefer", "return=representation")
            .header(header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
            return Err(PaymentError::TokenRejected);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), path, "Payment gateway call failed");
            return Err(PaymentError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| PaymentError::MalformedResponse(e.to_string()))?;

        GatewayOrder::from_payload(payload)
            .ok_or_else(|| PaymentError::MalformedResponse("missing order id".to_string()))
    }

    async fn post(
        &self,
        path: &str,
        body: &Value,
        idempotency_key: &str,
    ) -> Result<GatewayOrder, PaymentError> {
        with_retry(
            &self.retry,
            |e: &PaymentError| e.is_transient(),
            || self.post_once(path, body, idempotency_key),
        )
        .await
    }
}

#[async_trait]
impl PaymentGateway for PaypalGateway {
    fn name(&self) -> &'static str {
        "paypal"
    }

    #[instrument(skip(self, order), fields(reference_id = %order.reference_id))]
    async fn create_order(&self, order: CreatePaymentOrder) -> Result<GatewayOrder, PaymentError> {
        let body = serde_json::to_value(OrderRequestBody {
            intent: "CAPTURE",
            purchase_units: vec![PurchaseUnit {
                reference_id: &order.reference_id,
                amount: Amount {
                    currency_code: &order.currency,
                    value: &order.amount,
                },
            }],
        })
        .map_err(|e| PaymentError::Internal(e.to_string()))?;

        let created = self
            .post("/v2/checkout/orders", &body, &order.reference_id)
            .await?;
        info!(gateway_order_id = %created.id, status = %created.status, "Gateway order created");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn capture_order(
        &self,
        gateway_order_id: &str,
        idempotency_key: &str,
    ) -> Result<GatewayOrder, PaymentError> {
        let captured = self
            .post(
                &format!("/v2/checkout/orders/{}/capture", gateway_order_id),
                &Value::Object(Default::default()),
                idempotency_key,
            )
            .await?;
        info!(status = %captured.status, "Gateway order captured");
        Ok(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> PaymentConfig {
        PaymentConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            base_url: Some(server.uri()),
            timeout_secs: 2,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    async fn mount_token(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "A21AA-token",
                "token_type": "Bearer",
                "expires_in": 32400
            })))
            .expect(1)
            .mount(server)
            .await;
    }

    fn order() -> CreatePaymentOrder {
        CreatePaymentOrder {
            reference_id: "b7a4c1d2-0000-4000-8000-000000000001".to_string(),
            amount: "2.40".to_string(),
            currency: "USD".to_string(),
        }
    }

    #[tokio::test]
    async fn create_order_sends_amount_and_idempotency_key() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders"))
            .and(header("Authorization", "Bearer A21AA-token"))
            .and(header(IDEMPOTENCY_HEADER, "b7a4c1d2-0000-4000-8000-000000000001"))
            .and(body_partial_json(json!({
                "intent": "CAPTURE",
                "purchase_units": [{ "amount": { "currency_code": "USD", "value": "2.40" } }]
            })))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"id": "5O190127TN364715T", "status": "CREATED"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let gateway = PaypalGateway::new(&config_for(&server)).unwrap();
        let created = gateway.create_order(order()).await.unwrap();

        assert_eq!(created.id, "5O190127TN364715T");
        assert_eq!(created.status, "CREATED");
    }

    #[tokio::test]
    async fn server_error_is_retried_once() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders/ORDER-1/capture"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders/ORDER-1/capture"))
            .respond_with(
                ResponseTemplate::new(201)
                    .set_body_json(json!({"id": "ORDER-1", "status": "COMPLETED"})),
            )
            .with_priority(2)
            .mount(&server)
            .await;

        let gateway = PaypalGateway::new(&config_for(&server)).unwrap();
        let captured = gateway.capture_order("ORDER-1", "key-1").await.unwrap();

        assert_eq!(captured.status, "COMPLETED");
    }

    #[tokio::test]
    async fn client_error_is_not_retried() {
        let server = MockServer::start().await;
        mount_token(&server).await;

        Mock::given(method("POST"))
            .and(path("/v2/checkout/orders/ORDER-2/capture"))
            .respond_with(ResponseTemplate::new(422).set_body_string("ORDER_NOT_APPROVED"))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = PaypalGateway::new(&config_for(&server)).unwrap();
        let err = gateway.capture_order("ORDER-2", "key-2").await.unwrap_err();

        assert!(matches!(err, PaymentError::Api { status: 422, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn bad_credentials_surface_as_unauthorized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth2/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let gateway = PaypalGateway::new(&config_for(&server)).unwrap();
        let err = gateway.create_order(order()).await.unwrap_err();

        assert!(matches!(err, PaymentError::Unauthorized(_)));
    }

    #[test]
    fn shipping_address_is_read_from_first_purchase_unit() {
        let order = GatewayOrder::from_payload(json!({
            "id": "X",
            "status": "COMPLETED",
            "purchase_units": [{ "shipping": { "address": { "postal_code": "422001" } } }]
        }))
        .unwrap();

        assert_eq!(
            order.shipping_address(),
            Some(json!({ "postal_code": "422001" }))
        );
    }
}
