use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::store::StoreTransaction;
use super::supervisor::{AdmissionGuard, ConnectionState, ConnectionSupervisor, GuardSignal};
use crate::domain::{AbortReason, TransactionOutcome, UnitOfWork, WriteOperation, WriteResult};
use crate::error::{AppError, Result};

/// Upper bound on the best-effort abort issued after a failed attempt.
const ABORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for transaction coordination
#[derive(Debug, Clone)]
pub struct TransactionCoordinatorConfig {
    /// Deadline for units of work that do not carry their own
    pub default_timeout: Duration,
    /// Attempts per unit of work, including the first
    pub max_attempts: u32,
    /// Pause between attempts after a retryable failure
    pub retry_delay: Duration,
}

impl Default for TransactionCoordinatorConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Transaction statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionStats {
    pub committed: u64,
    pub aborted: u64,
    pub timed_out: u64,
    pub commit_unknown: u64,
    pub retries: u64,
}

#[derive(Default)]
struct StatCounters {
    committed: AtomicU64,
    aborted: AtomicU64,
    timed_out: AtomicU64,
    commit_unknown: AtomicU64,
    retries: AtomicU64,
}

enum Interrupt {
    Deadline,
    Cancelled,
    Disrupted,
}

impl Interrupt {
    /// The error left behind when a commit in flight is interrupted.
    fn commit_error(&self) -> AppError {
        match self {
            Interrupt::Deadline => {
                AppError::Timeout("deadline passed while the commit was in flight".to_string())
            }
            Interrupt::Cancelled => AppError::NotReady(
                "store shutdown cancelled the commit while it was in flight".to_string(),
            ),
            Interrupt::Disrupted => AppError::ConnectionError(
                "store topology changed while the commit was in flight".to_string(),
            ),
        }
    }
}

enum Attempt {
    Committed(Vec<WriteResult>),
    Failed(AbortReason),
    CommitUnknown(AppError),
    TimedOut,
}

/// Runs units of work as all-or-nothing store transactions.
pub struct TransactionCoordinator {
    supervisor: Arc<ConnectionSupervisor>,
    config: TransactionCoordinatorConfig,
    counters: StatCounters,
}

impl TransactionCoordinator {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, config: TransactionCoordinatorConfig) -> Self {
        Self {
            supervisor,
            config,
            counters: StatCounters::default(),
        }
    }

    /// Executes `unit` in one transaction.
    ///
    /// Returns `Err` only when the unit is malformed or the connection is not
    /// usable; every other failure is reported through the outcome. Failures
    /// before commit are retried as a whole. A commit that fails without a
    /// transient-transaction label is never re-run and ends as
    /// `CommitUnknown`.
    pub async fn run(&self, unit: UnitOfWork) -> Result<TransactionOutcome> {
        unit.validate()?;
        let mut guard = self.supervisor.admit().await?;

        let budget = unit.deadline().unwrap_or(self.config.default_timeout);
        let started = Instant::now();
        let deadline = started + budget;
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!(label = unit.label(), attempt = attempts, "Starting transaction");

            let reason = match self.attempt(&mut guard, &unit, deadline).await {
                Attempt::Committed(results) => {
                    self.counters.committed.fetch_add(1, Ordering::Relaxed);
                    info!(
                        label = unit.label(),
                        operations = results.len(),
                        attempts,
                        "Transaction committed in {:?}",
                        started.elapsed()
                    );
                    return Ok(TransactionOutcome::Committed { results, attempts });
                }
                Attempt::CommitUnknown(error) => {
                    self.counters.commit_unknown.fetch_add(1, Ordering::Relaxed);
                    error!(
                        label = unit.label(),
                        attempts,
                        "Commit was not acknowledged, result unknown: {}",
                        error
                    );
                    return Ok(TransactionOutcome::CommitUnknown { error, attempts });
                }
                Attempt::TimedOut => return Ok(self.timed_out(&unit, started)),
                Attempt::Failed(reason) => reason,
            };

            let retry = reason.error.is_retryable()
                && attempts < self.config.max_attempts
                && self.supervisor.current_state() == ConnectionState::Connected;

            if !retry {
                return Ok(self.aborted(&unit, reason, attempts));
            }

            self.counters.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                label = unit.label(),
                attempt = attempts,
                max_attempts = self.config.max_attempts,
                "Retryable transaction failure, retrying: {}",
                reason
            );

            match bounded(sleep(self.config.retry_delay), deadline, &mut guard, true).await {
                Ok(()) => {}
                Err(Interrupt::Deadline) => return Ok(self.timed_out(&unit, started)),
                Err(Interrupt::Cancelled) => {
                    return Ok(self.aborted(&unit, cancelled_reason(), attempts))
                }
                Err(Interrupt::Disrupted) => {
                    return Ok(self.aborted(&unit, disrupted_reason(), attempts))
                }
            }
        }
    }

    pub fn stats(&self) -> TransactionStats {
        TransactionStats {
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            commit_unknown: self.counters.commit_unknown.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &TransactionCoordinatorConfig {
        &self.config
    }

    fn aborted(&self, unit: &UnitOfWork, reason: AbortReason, attempts: u32) -> TransactionOutcome {
        self.counters.aborted.fetch_add(1, Ordering::Relaxed);
        warn!(label = unit.label(), attempts, "Transaction aborted: {}", reason);
        TransactionOutcome::Aborted { reason, attempts }
    }

    fn timed_out(&self, unit: &UnitOfWork, started: Instant) -> TransactionOutcome {
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        let elapsed = started.elapsed();
        warn!(label = unit.label(), "Transaction exceeded its deadline after {:?}", elapsed);
        TransactionOutcome::TimedOut { elapsed }
    }

    async fn attempt(
        &self,
        guard: &mut AdmissionGuard,
        unit: &UnitOfWork,
        deadline: Instant,
    ) -> Attempt {
        let store = Arc::clone(guard.store());

        let mut txn = match bounded(store.begin_transaction(), deadline, guard, true).await {
            Ok(Ok(txn)) => txn,
            Ok(Err(error)) => {
                return Attempt::Failed(AbortReason {
                    operation_index: None,
                    error,
                })
            }
            Err(interrupt) => return interrupted(interrupt),
        };

        let applied = bounded(apply_all(txn.as_mut(), unit), deadline, guard, true).await;
        let failure = match applied {
            Ok(Ok(results)) => {
                // Once the commit is sent only a shutdown or the deadline may stop it.
                match bounded(txn.commit(), deadline, guard, false).await {
                    Ok(Ok(())) => return Attempt::Committed(results),
                    // A transient label means the server rolled the commit back.
                    Ok(Err(error @ AppError::TransactionConflict(_))) => Ok(AbortReason {
                        operation_index: None,
                        error,
                    }),
                    Ok(Err(error)) => return Attempt::CommitUnknown(error),
                    Err(interrupt) => return Attempt::CommitUnknown(interrupt.commit_error()),
                }
            }
            Ok(Err(reason)) => Ok(reason),
            Err(interrupt) => Err(interrupt),
        };

        match timeout(ABORT_TIMEOUT, txn.abort()).await {
            Ok(Ok(())) => debug!(label = unit.label(), "Transaction rolled back"),
            Ok(Err(e)) => debug!(label = unit.label(), "Abort after failure reported: {}", e),
            Err(_) => error!(label = unit.label(), "Abort did not finish within {:?}", ABORT_TIMEOUT),
        }

        match failure {
            Ok(reason) => Attempt::Failed(reason),
            Err(interrupt) => interrupted(interrupt),
        }
    }
}

async fn apply_all(
    txn: &mut dyn StoreTransaction,
    unit: &UnitOfWork,
) -> std::result::Result<Vec<WriteResult>, AbortReason> {
    let mut results = Vec::with_capacity(unit.len());

    for (index, operation) in unit.operations().iter().enumerate() {
        let result = txn.apply(operation).await.map_err(|error| AbortReason {
            operation_index: Some(index),
            error,
        })?;

        if let (
            WriteOperation::Update {
                require_match: true,
                collection,
                ..
            },
            WriteResult::Updated { matched: 0, .. },
        ) = (operation, &result)
        {
            return Err(AbortReason {
                operation_index: Some(index),
                error: AppError::ValidationError(format!(
                    "no document in '{}' matched the guarded update",
                    collection
                )),
            });
        }

        debug!(
            label = unit.label(),
            index,
            kind = operation.kind(),
            collection = operation.collection(),
            "Applied operation"
        );
        results.push(result);
    }

    Ok(results)
}

/// Races `work` against the deadline, a shutdown force-cancel and, when
/// `watch_topology` is set, the connection leaving Connected.
async fn bounded<F: Future>(
    work: F,
    deadline: Instant,
    guard: &mut AdmissionGuard,
    watch_topology: bool,
) -> std::result::Result<F::Output, Interrupt> {
    tokio::select! {
        output = work => Ok(output),
        _ = sleep_until(deadline) => Err(Interrupt::Deadline),
        signal = guard.interrupted(watch_topology) => match signal {
            GuardSignal::Cancelled => Err(Interrupt::Cancelled),
            GuardSignal::Disrupted => Err(Interrupt::Disrupted),
        },
    }
}

/// Maps an interrupt before commit to the attempt's result.
fn interrupted(interrupt: Interrupt) -> Attempt {
    match interrupt {
        Interrupt::Deadline => Attempt::TimedOut,
        Interrupt::Cancelled => Attempt::Failed(cancelled_reason()),
        Interrupt::Disrupted => Attempt::Failed(disrupted_reason()),
    }
}

fn cancelled_reason() -> AbortReason {
    AbortReason {
        operation_index: None,
        error: AppError::NotReady("cancelled by store shutdown".to_string()),
    }
}

fn disrupted_reason() -> AbortReason {
    AbortReason {
        operation_index: None,
        error: AppError::ConnectionError(
            "store topology changed while the transaction was open".to_string(),
        ),
    }
}
