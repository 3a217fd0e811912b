pub mod cart_item;
pub mod order;
pub mod order_item;
pub mod pending_payment;
pub mod product;
