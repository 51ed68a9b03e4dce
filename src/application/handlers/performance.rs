use axum::{extract::State, response::Json};
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    core::monitoring::PerformanceReport, error::Result,
    infrastructure::database::TransactionStats, AppState,
};

/// Operation timings together with the transaction counters.
#[derive(Debug, Serialize)]
pub struct PerformanceResponse {
    #[serde(flatten)]
    pub report: PerformanceReport,
    pub transactions: TransactionStats,
}

pub async fn get_performance_report(State(state): State<AppState>) -> Json<PerformanceResponse> {
    Json(PerformanceResponse {
        report: state.monitor.report(),
        transactions: state.transactions.stats(),
    })
}

/// Writes the report to the configured path and returns a short summary.
pub async fn save_performance_report(State(state): State<AppState>) -> Result<Json<Value>> {
    let path = &state.env.performance_report_path;
    let report = state.monitor.save_report(path).await?;

    Ok(Json(json!({
        "status": "success",
        "path": path,
        "totalOperations": report.stats.total_operations,
        "transactions": state.transactions.stats(),
        "timestamp": report.timestamp.to_rfc3339(),
    })))
}
