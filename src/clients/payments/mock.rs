use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{CreatePaymentOrder, GatewayOrder, PaymentError, PaymentGateway};

#[derive(Default)]
struct State {
    fail_create: bool,
    fail_capture: bool,
    capture_delay: Option<Duration>,
    created: Vec<CreatePaymentOrder>,
    /// `(gateway order id, idempotency key)`
    captured: Vec<(String, String)>,
}

/// In-memory gateway that approves everything unless told otherwise
#[derive(Clone, Default)]
pub struct MockPaymentGateway {
    state: Arc<Mutex<State>>,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn fail_capture(&self, fail: bool) {
        self.state().fail_capture = fail;
    }

    /// Holds every capture for `delay` before answering
    pub fn delay_capture(&self, delay: Duration) {
        self.state().capture_delay = Some(delay);
    }

    pub fn created_orders(&self) -> Vec<CreatePaymentOrder> {
        self.state().created.clone()
    }

    pub fn captures(&self) -> Vec<(String, String)> {
        self.state().captured.clone()
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_order(&self, order: CreatePaymentOrder) -> Result<GatewayOrder, PaymentError> {
        let mut state = self.state();
        if state.fail_create {
            return Err(PaymentError::Api {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }

        let id = format!("MOCK-{}", order.reference_id);
        let payload = json!({
            "id": id,
            "status": "CREATED",
            "purchase_units": [{
                "reference_id": order.reference_id,
                "amount": { "currency_code": order.currency, "value": order.amount }
            }]
        });
        state.created.push(order);

        Ok(GatewayOrder {
            id,
            status: "CREATED".to_string(),
            payload,
        })
    }

    async fn capture_order(
        &self,
        gateway_order_id: &str,
        idempotency_key: &str,
    ) -> Result<GatewayOrder, PaymentError> {
        let delay = self.state().capture_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_capture {
            return Err(PaymentError::Api {
                status: 422,
                body: "INSTRUMENT_DECLINED".to_string(),
            });
        }
        state
            .captured
            .push((gateway_order_id.to_string(), idempotency_key.to_string()));

        Ok(GatewayOrder {
            id: gateway_order_id.to_string(),
            status: "COMPLETED".to_string(),
            payload: json!({
                "id": gateway_order_id,
                "status": "COMPLETED",
                "purchase_units": [{
                    "reference_id": idempotency_key,
                    "shipping": {
                        "address": {
                            "address_line_1": "12 Mandi Road",
                            "admin_area_2": "Nashik",
                            "postal_code": "422001",
                            "country_code": "IN"
                        }
                    }
                }]
            }),
        })
    }
}
