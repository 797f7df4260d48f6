//! sea-orm entities for the marketplace schema.

pub mod cart;
pub mod cart_item;
pub mod order;
pub mod order_item;
pub mod outbox_event;
pub mod product;
pub mod stock_reservation;
pub mod user;
