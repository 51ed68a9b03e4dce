use mongodb::bson::{Bson, Document};
use serde::Serialize;
use std::time::Duration;

use crate::domain::entities::Entity;
use crate::error::{AppError, Result};

/// A single write applied inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOperation {
    Insert {
        collection: String,
        document: Document,
    },
    Update {
        collection: String,
        filter: Document,
        update: Document,
        /// Fail the unit when the filter matches nothing (e.g. a stock guard).
        require_match: bool,
    },
    Delete {
        collection: String,
        filter: Document,
    },
}

impl WriteOperation {
    pub fn collection(&self) -> &str {
        match self {
            WriteOperation::Insert { collection, .. }
            | WriteOperation::Update { collection, .. }
            | WriteOperation::Delete { collection, .. } => collection,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WriteOperation::Insert { .. } => "insert",
            WriteOperation::Update { .. } => "update",
            WriteOperation::Delete { .. } => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WriteResult {
    Inserted { id: Bson },
    Updated { matched: u64, modified: u64 },
    Deleted { deleted: u64 },
}

/// An ordered batch of writes that commit or abort together.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    label: String,
    operations: Vec<WriteOperation>,
    deadline: Option<Duration>,
}

impl UnitOfWork {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            operations: Vec::new(),
            deadline: None,
        }
    }

    /// Inserts a validated entity into its own collection.
    pub fn insert<E: Entity>(self, entity: &E) -> Result<Self> {
        let document = entity.to_document()?;
        Ok(self.push(WriteOperation::Insert {
            collection: E::COLLECTION.to_string(),
            document,
        }))
    }

    pub fn insert_document(self, collection: &str, document: Document) -> Self {
        self.push(WriteOperation::Insert {
            collection: collection.to_string(),
            document,
        })
    }

    pub fn update(self, collection: &str, filter: Document, update: Document) -> Self {
        self.push(WriteOperation::Update {
            collection: collection.to_string(),
            filter,
            update,
            require_match: false,
        })
    }

    pub fn update_matching(self, collection: &str, filter: Document, update: Document) -> Self {
        self.push(WriteOperation::Update {
            collection: collection.to_string(),
            filter,
            update,
            require_match: true,
        })
    }

    pub fn delete(self, collection: &str, filter: Document) -> Self {
        self.push(WriteOperation::Delete {
            collection: collection.to_string(),
            filter,
        })
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn push(mut self, operation: WriteOperation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn operations(&self) -> &[WriteOperation] {
        &self.operations
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Structural checks done before any session is opened.
    pub fn validate(&self) -> Result<()> {
        if self.operations.is_empty() {
            return Err(AppError::ValidationError(format!(
                "Unit of work '{}' has no operations",
                self.label
            )));
        }

        for (index, operation) in self.operations.iter().enumerate() {
            if operation.collection().trim().is_empty() {
                return Err(AppError::ValidationError(format!(
                    "Operation {} of '{}' has no target collection",
                    index, self.label
                )));
            }
            if let WriteOperation::Update { update, .. } = operation {
                if update.is_empty() || !update.keys().all(|k| k.starts_with('$')) {
                    return Err(AppError::ValidationError(format!(
                        "Operation {} of '{}' must be an update-operator document",
                        index, self.label
                    )));
                }
            }
        }

        if matches!(self.deadline, Some(d) if d.is_zero()) {
            return Err(AppError::ValidationError(format!(
                "Unit of work '{}' has a zero deadline",
                self.label
            )));
        }

        Ok(())
    }
}

/// Why a unit of work did not commit.
#[derive(Debug, Clone, PartialEq)]
pub struct AbortReason {
    /// Index of the failing operation, if the failure came from one.
    pub operation_index: Option<usize>,
    pub error: AppError,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.operation_index {
            Some(index) => write!(f, "operation {} failed: {}", index, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Final result of running a unit of work. `Committed` means every effect
/// is visible; `Aborted` and `TimedOut` mean none is.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionOutcome {
    Committed {
        results: Vec<WriteResult>,
        attempts: u32,
    },
    Aborted {
        reason: AbortReason,
        attempts: u32,
    },
    TimedOut {
        elapsed: Duration,
    },
    /// The commit was sent but never acknowledged. The writes may be
    /// visible, so the unit is not re-run.
    CommitUnknown {
        error: AppError,
        attempts: u32,
    },
}

impl TransactionOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, TransactionOutcome::Committed { .. })
    }

    /// Collapses the outcome into a `Result` for callers that only care
    /// whether the writes landed.
    pub fn into_result(self) -> Result<Vec<WriteResult>> {
        match self {
            TransactionOutcome::Committed { results, .. } => Ok(results),
            TransactionOutcome::Aborted { reason, .. } => match reason.error {
                AppError::ValidationError(_) | AppError::DuplicateKey(_) => Err(reason.error),
                _ => Err(AppError::TransactionAborted(reason.to_string())),
            },
            TransactionOutcome::TimedOut { elapsed } => Err(AppError::Timeout(format!(
                "transaction exceeded its deadline after {:?}",
                elapsed
            ))),
            TransactionOutcome::CommitUnknown { error, .. } => match error {
                AppError::CommitUnknown(_) => Err(error),
                other => Err(AppError::CommitUnknown(other.to_string())),
            },
        }
    }
}
