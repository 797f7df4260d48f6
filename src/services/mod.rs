pub mod checkout;
pub mod inventory;
pub mod order_queries;
pub mod order_status;
pub mod pricing;
