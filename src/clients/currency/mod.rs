//! Currency conversion between the catalog currency and the settlement currency.

mod error;
pub mod mock;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::CurrencyConfig;
use crate::middleware_helpers::{with_retry, RetryConfig};

pub use self::error::CurrencyError;

#[async_trait]
pub trait CurrencyConverter: Send + Sync + 'static {
    /// Converts `amount` from `from` into `to`. The result is unrounded.
    async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Decimal, CurrencyError>;
}

#[async_trait]
impl<T: ?Sized + CurrencyConverter> CurrencyConverter for Arc<T> {
    async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Decimal, CurrencyError> {
        (**self).convert(amount, from, to).await
    }
}

#[derive(Deserialize)]
struct ConvertResponse {
    converted: Value,
}

/// Client for an anyapi-style `GET /api/v1/exchange/convert` endpoint
pub struct HttpCurrencyConverter {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    retry: RetryConfig,
}

impl HttpCurrencyConverter {
    pub fn new(config: &CurrencyConfig) -> Result<Self, CurrencyError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            retry: RetryConfig::single_retry(config.retry_backoff()),
        })
    }

    async fn convert_once(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Decimal, CurrencyError> {
        let amount = amount.to_string();
        let response = self
            .http
            .get(format!("{}/api/v1/exchange/convert", self.api_url))
            .query(&[
                ("base", from),
                ("to", to),
                ("amount", amount.as_str()),
                ("apiKey", self.api_key.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CurrencyError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: ConvertResponse = response
            .json()
            .await
            .map_err(|e| CurrencyError::MalformedResponse(e.to_string()))?;

        parse_amount(&body.converted)
    }
}

#[async_trait]
impl CurrencyConverter for HttpCurrencyConverter {
    #[instrument(skip(self))]
    async fn convert(
        &self,
        amount: Decimal,
        from: &str,
        to: &str,
    ) -> Result<Decimal, CurrencyError> {
        let converted = with_retry(
            &self.retry,
            |e: &CurrencyError| e.is_transient(),
            || self.convert_once(amount, from, to),
        )
        .await?;
        debug!(%converted, "Converted amount");
        Ok(converted)
    }
}

/// Accepts the converted amount as a JSON number or numeric string
fn parse_amount(value: &Value) -> Result<Decimal, CurrencyError> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        other => {
            return Err(CurrencyError::MalformedResponse(format!(
                "converted is not numeric: {}",
                other
            )))
        }
    };

    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| CurrencyError::MalformedResponse(format!("{}: {}", text, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(server: &MockServer) -> CurrencyConfig {
        CurrencyConfig {
            api_url: server.uri(),
            api_key: "test-key".to_string(),
            timeout_secs: 2,
            retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn converts_through_the_exchange_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/exchange/convert"))
            .and(query_param("base", "INR"))
            .and(query_param("to", "USD"))
            .and(query_param("amount", "200"))
            .and(query_param("apiKey", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "base": "INR", "to": "USD", "amount": 200, "converted": 2.4035
            })))
            .expect(1)
            .mount(&server)
            .await;

        let converter = HttpCurrencyConverter::new(&config_for(&server)).unwrap();
        let converted = converter.convert(dec!(200), "INR", "USD").await.unwrap();

        assert_eq!(converted, dec!(2.4035));
    }

    #[tokio::test]
    async fn gives_up_after_one_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/exchange/convert"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&server)
            .await;

        let converter = HttpCurrencyConverter::new(&config_for(&server)).unwrap();
        let err = converter
            .convert(dec!(10), "INR", "USD")
            .await
            .unwrap_err();

        assert!(matches!(err, CurrencyError::Api { status: 502, .. }));
    }

    #[test]
    fn parses_numeric_strings_and_rejects_objects() {
        assert_eq!(parse_amount(&json!("12.5")).unwrap(), dec!(12.5));
        assert!(parse_amount(&json!({"value": 1})).is_err());
    }
}
