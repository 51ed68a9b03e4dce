pub mod operation_monitor;

pub use operation_monitor::{
    OperationError, OperationMonitor, OperationRecord, PerformanceReport, PerformanceStats,
};
