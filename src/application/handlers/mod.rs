pub mod health;
pub mod orders;
pub mod performance;
pub mod products;
