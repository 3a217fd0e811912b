pub mod cart;
pub mod catalog;
pub mod checkout;
pub mod expiry;
pub mod inventory;
pub mod orders;
pub mod reconciliation;
pub mod verification;
