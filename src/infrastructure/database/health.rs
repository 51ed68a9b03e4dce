use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::supervisor::{ConnectionState, ConnectionSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Ok,
}

/// Point-in-time view of process and store health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub process_status: ProcessStatus,
    pub store_state: ConnectionState,
    pub timestamp: DateTime<Utc>,
}

impl HealthSnapshot {
    /// `"connected"` only while the supervisor reports Connected.
    pub fn db_status(&self) -> &'static str {
        if self.store_state == ConnectionState::Connected {
            "connected"
        } else {
            "disconnected"
        }
    }

    /// Body served by `GET /health`.
    pub fn to_json(&self) -> Value {
        json!({
            "status": "ok",
            "db": self.db_status(),
            "state": self.store_state.as_str(),
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

/// Builds health snapshots from cached supervisor state; never touches the store.
#[derive(Clone)]
pub struct HealthReporter {
    supervisor: Arc<ConnectionSupervisor>,
}

impl HealthReporter {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self { supervisor }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            process_status: ProcessStatus::Ok,
            store_state: self.supervisor.current_state(),
            timestamp: Utc::now(),
        }
    }
}
