//! Order arithmetic: line totals, delivery fees, weight labels and settlement rounding.

use rust_decimal::{Decimal, RoundingStrategy};

/// Price and quantity of one order line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricedLine {
    pub unit_price: Decimal,
    pub quantity: i32,
}

impl PricedLine {
    pub fn total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Delivery fee charged on top of the goods subtotal
pub trait ShippingRateProvider: Send + Sync {
    fn delivery_fee(&self, lines: &[PricedLine]) -> Decimal;
}

/// Same fee for every order
#[derive(Debug, Clone)]
pub struct FlatRateShipping {
    fee: Decimal,
}

impl FlatRateShipping {
    pub fn new(fee: Decimal) -> Self {
        Self { fee }
    }
}

impl ShippingRateProvider for FlatRateShipping {
    fn delivery_fee(&self, _lines: &[PricedLine]) -> Decimal {
        self.fee
    }
}

pub fn subtotal(lines: &[PricedLine]) -> Decimal {
    lines.iter().map(PricedLine::total).sum()
}

/// Quantity times pack size followed by the unit, e.g. `10kg` or `2.5l`
pub fn weight_label(quantity: i32, size: Decimal, unit: &str) -> String {
    format!("{}{}", (Decimal::from(quantity) * size).normalize(), unit)
}

/// Rounds a converted amount to cents, halves away from zero
pub fn settlement_amount(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Two-decimal string without grouping, as gateways expect (`1234.50`)
pub fn format_amount(amount: Decimal) -> String {
    format!("{:.2}", settlement_amount(amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn subtotal_plus_flat_fee() {
        let lines = [PricedLine {
            unit_price: dec!(50),
            quantity: 2,
        }];
        let fee = FlatRateShipping::new(dec!(100)).delivery_fee(&lines);
        assert_eq!(subtotal(&lines) + fee, dec!(200));
    }

    #[test]
    fn weight_label_drops_trailing_zeros() {
        assert_eq!(weight_label(2, dec!(5.00), "kg"), "10kg");
        assert_eq!(weight_label(3, dec!(0.5), "l"), "1.5l");
    }

    #[test]
    fn settlement_rounds_half_away_from_zero() {
        assert_eq!(settlement_amount(dec!(2.405)), dec!(2.41));
        assert_eq!(settlement_amount(dec!(2.404)), dec!(2.40));
        assert_eq!(format_amount(dec!(1234.5)), "1234.50");
        assert_eq!(format_amount(dec!(3)), "3.00");
    }
}
