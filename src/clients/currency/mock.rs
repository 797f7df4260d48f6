use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{CurrencyConverter, CurrencyError};

/// Converts at a constant rate regardless of the currency pair
#[derive(Clone)]
pub struct FixedRateConverter {
    rate: Decimal,
    fail: Arc<AtomicBool>,
}

impl FixedRateConverter {
    pub fn new(rate: Decimal) -> Self {
        Self {
            rate,
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CurrencyConverter for FixedRateConverter {
    async fn convert(
        &self,
        amount: Decimal,
        _from: &str,
        _to: &str,
    ) -> Result<Decimal, CurrencyError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CurrencyError::Api {
                status: 503,
                body: "rate source unavailable".to_string(),
            });
        }
        Ok(amount * self.rate)
    }
}
