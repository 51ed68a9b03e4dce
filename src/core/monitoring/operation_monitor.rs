use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::path::Path;
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;

/// One measured call. Records are only ever appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRecord {
    pub id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    /// Milliseconds
    pub duration: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub total_operations: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    /// Percentage of successful operations, 0.0 when nothing was recorded
    pub success_rate: f64,
    pub average_response_time: f64,
    pub max_response_time: f64,
    pub min_response_time: f64,
    pub total_duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationError {
    pub name: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub timestamp: DateTime<Utc>,
    pub stats: PerformanceStats,
    pub operations: Vec<OperationRecord>,
    pub errors: Vec<OperationError>,
}

/// Times arbitrary async work and keeps a log of the results.
#[derive(Debug, Default)]
pub struct OperationMonitor {
    records: RwLock<Vec<OperationRecord>>,
}

impl OperationMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Awaits `work` and records its duration and outcome. The result is
    /// handed back untouched.
    ///
    /// Exactly one record is written per call, including when the returned
    /// future is dropped before `work` finishes.
    pub async fn measure<T, E, F>(&self, name: &str, work: F) -> std::result::Result<T, E>
    where
        E: Display,
        F: Future<Output = std::result::Result<T, E>>,
    {
        let mut measurement = Measurement::start(self, name);
        let result = work.await;
        measurement.finish(result.as_ref().err().map(|e| e.to_string()));
        result
    }

    pub fn records(&self) -> Vec<OperationRecord> {
        self.read().clone()
    }

    pub fn summarize(&self) -> PerformanceStats {
        summarize(&self.read())
    }

    pub fn report(&self) -> PerformanceReport {
        let operations = self.records();
        let errors = operations
            .iter()
            .filter_map(|record| {
                record.error.as_ref().map(|error| OperationError {
                    name: record.name.clone(),
                    error: error.clone(),
                    timestamp: record.started_at,
                })
            })
            .collect();

        PerformanceReport {
            timestamp: Utc::now(),
            stats: summarize(&operations),
            operations,
            errors,
        }
    }

    /// Writes the current report as pretty-printed JSON.
    pub async fn save_report(&self, path: impl AsRef<Path>) -> Result<PerformanceReport> {
        let report = self.report();
        let body = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(path.as_ref(), body).await?;

        info!(
            path = %path.as_ref().display(),
            operations = report.stats.total_operations,
            "📊 Performance report saved"
        );
        Ok(report)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<OperationRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, record: OperationRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// An in-progress `measure` call; writes its record when dropped.
struct Measurement<'a> {
    monitor: &'a OperationMonitor,
    name: &'a str,
    started_at: DateTime<Utc>,
    start: Instant,
    /// `None` until the work finishes, then the error if any.
    outcome: Option<Option<String>>,
}

impl<'a> Measurement<'a> {
    fn start(monitor: &'a OperationMonitor, name: &'a str) -> Self {
        Self {
            monitor,
            name,
            started_at: Utc::now(),
            start: Instant::now(),
            outcome: None,
        }
    }

    fn finish(&mut self, error: Option<String>) {
        self.outcome = Some(error);
    }
}

impl Drop for Measurement<'_> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let error = match self.outcome.take() {
            Some(error) => error,
            None => Some("cancelled before completion".to_string()),
        };

        match &error {
            None => debug!(operation = self.name, "Completed in {:?}", duration),
            Some(e) => warn!(operation = self.name, "Failed after {:?}: {}", duration, e),
        }

        self.monitor.push(OperationRecord {
            id: Uuid::new_v4(),
            name: self.name.to_string(),
            started_at: self.started_at,
            duration: millis(duration),
            success: error.is_none(),
            error,
        });
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn summarize(records: &[OperationRecord]) -> PerformanceStats {
    if records.is_empty() {
        return PerformanceStats::default();
    }

    let total = records.len();
    let successful = records.iter().filter(|r| r.success).count();
    let total_duration: f64 = records.iter().map(|r| r.duration).sum();
    let max = records.iter().map(|r| r.duration).fold(f64::MIN, f64::max);
    let min = records.iter().map(|r| r.duration).fold(f64::MAX, f64::min);

    PerformanceStats {
        total_operations: total,
        successful_operations: successful,
        failed_operations: total - successful,
        success_rate: successful as f64 / total as f64 * 100.0,
        average_response_time: total_duration / total as f64,
        max_response_time: max,
        min_response_time: min,
        total_duration,
    }
}
