use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Acknowledgment level a write needs before it counts as successful.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteConcernPolicy {
    Majority { timeout: Duration },
    Nodes { count: u32, timeout: Duration },
}

impl WriteConcernPolicy {
    pub fn timeout(&self) -> Duration {
        match self {
            WriteConcernPolicy::Majority { timeout } => *timeout,
            WriteConcernPolicy::Nodes { timeout, .. } => *timeout,
        }
    }

    /// Parses `majority` or a node count such as `1`.
    pub fn parse(value: &str, timeout: Duration) -> Result<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("majority") {
            return Ok(WriteConcernPolicy::Majority { timeout });
        }

        match value.parse::<u32>() {
            Ok(count) if count > 0 => Ok(WriteConcernPolicy::Nodes { count, timeout }),
            _ => Err(AppError::ConfigurationError(format!(
                "Invalid write concern '{}': expected 'majority' or a positive node count",
                value
            ))),
        }
    }
}

/// Which replica set members may serve reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadPreferencePolicy {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl FromStr for ReadPreferencePolicy {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim() {
            "primary" => Ok(ReadPreferencePolicy::Primary),
            "primaryPreferred" => Ok(ReadPreferencePolicy::PrimaryPreferred),
            "secondary" => Ok(ReadPreferencePolicy::Secondary),
            "secondaryPreferred" => Ok(ReadPreferencePolicy::SecondaryPreferred),
            "nearest" => Ok(ReadPreferencePolicy::Nearest),
            other => Err(AppError::ConfigurationError(format!(
                "Invalid read preference '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Unique,
    Ttl { expire_after: Duration },
}

/// Index the supervisor ensures after every successful connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub collection: String,
    pub field: String,
    pub kind: IndexKind,
}

impl IndexSpec {
    pub fn unique(collection: &str, field: &str) -> Self {
        Self {
            collection: collection.to_string(),
            field: field.to_string(),
            kind: IndexKind::Unique,
        }
    }

    pub fn ttl(collection: &str, field: &str, expire_after: Duration) -> Self {
        Self {
            collection: collection.to_string(),
            field: field.to_string(),
            kind: IndexKind::Ttl { expire_after },
        }
    }
}

/// Immutable description of how to reach and use the replicated store.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub uri: String,
    pub database_name: String,
    pub replica_set: String,
    pub connect_timeout: Duration,
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
    pub write_concern: WriteConcernPolicy,
    pub read_preference: ReadPreferencePolicy,
    pub shutdown_timeout: Duration,
    pub indexes: Vec<IndexSpec>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://mongo1:27017,mongo2:27017,mongo3:27017/?replicaSet=rs0".to_string(),
            database_name: "app".to_string(),
            replica_set: "rs0".to_string(),
            connect_timeout: Duration::from_millis(10_000),
            retry_interval: Duration::from_millis(1_000),
            max_retry_interval: Duration::from_millis(30_000),
            write_concern: WriteConcernPolicy::Majority {
                timeout: Duration::from_millis(3_000),
            },
            read_preference: ReadPreferencePolicy::Primary,
            shutdown_timeout: Duration::from_millis(10_000),
            indexes: Vec::new(),
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.uri.starts_with("mongodb://") && !self.uri.starts_with("mongodb+srv://") {
            return Err(AppError::ConfigurationError(format!(
                "Connection URI must start with mongodb:// or mongodb+srv://, got '{}'",
                self.uri
            )));
        }
        if self.database_name.is_empty() {
            return Err(AppError::ConfigurationError(
                "Database name must not be empty".to_string(),
            ));
        }
        if self.retry_interval.is_zero() {
            return Err(AppError::ConfigurationError(
                "Retry interval must be greater than zero".to_string(),
            ));
        }
        if self.max_retry_interval < self.retry_interval {
            return Err(AppError::ConfigurationError(format!(
                "Max retry interval ({:?}) is smaller than retry interval ({:?})",
                self.max_retry_interval, self.retry_interval
            )));
        }
        Ok(())
    }
}
