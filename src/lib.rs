//! replica-store-service - connection lifecycle and transactional consistency
//! over a replicated MongoDB deployment.
//!
//! The library holds the connection supervisor, the transaction coordinator,
//! health and performance reporting, and the replica set bootstrap used by the
//! `replica-init` binary.

use std::sync::Arc;

pub mod application;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod presentation;

// Re-export commonly used types
pub use error::{AppError, Result};

use crate::application::services::OrderService;
use crate::core::OperationMonitor;
use crate::infrastructure::database::{ConnectionSupervisor, HealthReporter, TransactionCoordinator};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub env: Arc<config::Config>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub health: HealthReporter,
    pub orders: OrderService,
    pub transactions: Arc<TransactionCoordinator>,
    pub monitor: Arc<OperationMonitor>,
}

impl AppState {
    /// Wires the coordinator, monitor and services around a started supervisor.
    pub fn new(env: Arc<config::Config>, supervisor: Arc<ConnectionSupervisor>) -> Self {
        let monitor = Arc::new(OperationMonitor::new());
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&supervisor),
            env.transactions.clone(),
        ));

        Self {
            health: HealthReporter::new(Arc::clone(&supervisor)),
            orders: OrderService::new(
                Arc::clone(&supervisor),
                Arc::clone(&coordinator),
                Arc::clone(&monitor),
            ),
            transactions: coordinator,
            env,
            supervisor,
            monitor,
        }
    }
}
