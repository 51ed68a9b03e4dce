pub mod entities;
pub mod unit_of_work;

pub use entities::{Entity, Order, OrderStatus, Product};
pub use unit_of_work::{AbortReason, TransactionOutcome, UnitOfWork, WriteOperation, WriteResult};
