use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input for creating a capture-intent gateway order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatePaymentOrder {
    /// Internal order id; doubles as the idempotency key
    pub reference_id: String,
    /// Two-decimal amount string, e.g. `12.05`
    pub amount: String,
    pub currency: String,
}

/// A gateway order as returned by create or capture
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayOrder {
    pub id: String,
    pub status: String,
    /// Full gateway response body
    pub payload: Value,
}

impl GatewayOrder {
    pub fn from_payload(payload: Value) -> Option<Self> {
        let id = payload.get("id")?.as_str()?.to_string();
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(Self {
            id,
            status,
            payload,
        })
    }

    /// Buyer shipping address reported on the first purchase unit
    pub fn shipping_address(&self) -> Option<Value> {
        self.payload
            .pointer("/purchase_units/0/shipping/address")
            .cloned()
    }
}

#[derive(Serialize)]
pub(super) struct OrderRequestBody<'a> {
    pub intent: &'static str,
    pub purchase_units: Vec<PurchaseUnit<'a>>,
}

#[derive(Serialize)]
pub(super) struct PurchaseUnit<'a> {
    pub reference_id: &'a str,
    pub amount: Amount<'a>,
}

#[derive(Serialize)]
pub(super) struct Amount<'a> {
    pub currency_code: &'a str,
    pub value: &'a str,
}

#[derive(Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: u64,
}
