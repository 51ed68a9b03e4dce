pub mod order;

pub use order::{Entity, Order, OrderStatus, Product};
