mod connection;

pub use connection::{
    ConnectionConfig, IndexKind, IndexSpec, ReadPreferencePolicy, WriteConcernPolicy,
};

use crate::error::{AppError, Result};
use crate::infrastructure::database::{ReplicaInitConfig, TransactionCoordinatorConfig};
use dotenv::dotenv;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub connection: ConnectionConfig,
    pub transactions: TransactionCoordinatorConfig,
    pub replica_init: ReplicaInitConfig,
    pub performance_report_path: String,
}

impl Config {
    /// Loads `.env` (if present) and reads the process environment.
    pub fn init() -> Result<Config> {
        match dotenv() {
            Ok(_) => info!("✅ Loaded .env file"),
            Err(_) => debug!("No .env file found, using system environment variables"),
        }

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let uri = lookup("MONGODB_URI")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AppError::ConfigurationError("MONGODB_URI must be set".to_string()))?;

        let replica_set = lookup("MONGODB_REPLICA_SET").unwrap_or_else(|| "rs0".to_string());

        let write_concern_timeout = millis(&lookup, "DB_WRITE_CONCERN_TIMEOUT_MS", 3_000)?;
        let write_concern = WriteConcernPolicy::parse(
            &lookup("DB_WRITE_CONCERN").unwrap_or_else(|| "majority".to_string()),
            write_concern_timeout,
        )?;
        let read_preference = lookup("DB_READ_PREFERENCE")
            .unwrap_or_else(|| "primary".to_string())
            .parse::<ReadPreferencePolicy>()?;

        let connection = ConnectionConfig {
            uri,
            database_name: lookup("MONGODB_DATABASE").unwrap_or_else(|| "app".to_string()),
            replica_set: replica_set.clone(),
            connect_timeout: millis(&lookup, "DB_CONNECT_TIMEOUT_MS", 10_000)?,
            retry_interval: millis(&lookup, "DB_RETRY_INTERVAL_MS", 1_000)?,
            max_retry_interval: millis(&lookup, "DB_MAX_RETRY_INTERVAL_MS", 30_000)?,
            write_concern,
            read_preference,
            shutdown_timeout: millis(&lookup, "SHUTDOWN_TIMEOUT_MS", 10_000)?,
            indexes: vec![
                IndexSpec::unique("products", "name"),
                IndexSpec::ttl("sessions", "expiresAt", Duration::ZERO),
            ],
        };
        connection.validate()?;

        let transactions = TransactionCoordinatorConfig {
            default_timeout: millis(&lookup, "TRANSACTION_TIMEOUT_MS", 5_000)?,
            max_attempts: parse(&lookup, "TRANSACTION_MAX_ATTEMPTS", 3u32)?,
            ..TransactionCoordinatorConfig::default()
        };
        if transactions.max_attempts == 0 {
            return Err(AppError::ConfigurationError(
                "TRANSACTION_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let nodes: Vec<String> = lookup("REPLICA_NODES")
            .unwrap_or_else(|| "mongo1:27017,mongo2:27017,mongo3:27017".to_string())
            .split(',')
            .map(|node| node.trim().to_string())
            .filter(|node| !node.is_empty())
            .collect();
        if nodes.is_empty() {
            return Err(AppError::ConfigurationError(
                "REPLICA_NODES must list at least one host".to_string(),
            ));
        }

        let replica_init = ReplicaInitConfig {
            replica_set,
            nodes,
            max_retries: parse(&lookup, "REPLICA_INIT_MAX_RETRIES", 30u32)?,
            retry_delay: millis(&lookup, "REPLICA_INIT_RETRY_DELAY_MS", 5_000)?,
        };

        Ok(Config {
            port: parse(&lookup, "PORT", 3000u16)?,
            connection,
            transactions,
            replica_init,
            performance_report_path: lookup("PERFORMANCE_REPORT_PATH")
                .unwrap_or_else(|| "performance-report.json".to_string()),
        })
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            AppError::ConfigurationError(format!("{} has an invalid value: '{}'", key, raw))
        }),
        None => Ok(default),
    }
}

fn millis<F>(lookup: &F, key: &str, default_ms: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse(lookup, key, default_ms).map(Duration::from_millis)
}
