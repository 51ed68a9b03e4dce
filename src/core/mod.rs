//! Cross-cutting runtime services

// Operation timing and performance reports
pub mod monitoring;

pub use monitoring::OperationMonitor;
