//! Outbound HTTP clients: the payment gateway and the currency converter.

pub mod currency;
pub mod payments;
