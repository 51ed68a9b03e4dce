use async_trait::async_trait;
use mongodb::bson::Document;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{ConnectionConfig, IndexSpec};
use crate::domain::{WriteOperation, WriteResult};
use crate::error::Result;

/// Replica set topology changes reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// A member became primary.
    PrimaryElected { address: String },
    /// The previous primary stepped down or vanished.
    PrimaryLost { address: String },
    /// A heartbeat to a member failed.
    NodeUnreachable { address: String, reason: String },
}

impl TopologyEvent {
    /// Whether the event invalidates the current connection.
    pub fn is_disruptive(&self) -> bool {
        !matches!(self, TopologyEvent::PrimaryElected { .. })
    }
}

pub type TopologyEventSender = mpsc::UnboundedSender<TopologyEvent>;
pub type TopologyEventReceiver = mpsc::UnboundedReceiver<TopologyEvent>;

/// Opens the logical connection to the store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    /// Establishes a connection and confirms at least one usable member.
    /// Topology events observed afterwards are pushed to `events`.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: TopologyEventSender,
    ) -> Result<Arc<dyn DocumentStore>>;
}

/// The logical connection. Implementations pool physical links internally.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Round trip to a usable member.
    async fn ping(&self) -> Result<()>;

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>>;

    /// Reads honour the configured read preference.
    async fn find_one(&self, collection: &str, filter: Document) -> Result<Option<Document>>;

    async fn count_documents(&self, collection: &str, filter: Document) -> Result<u64>;

    /// Single-document write outside any transaction.
    async fn insert_one(&self, collection: &str, document: Document) -> Result<WriteResult>;

    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> Result<()>;

    async fn close(&self);
}

/// A session-scoped transaction. Dropping it without `commit` discards
/// every staged write.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn apply(&mut self, operation: &WriteOperation) -> Result<WriteResult>;

    async fn commit(&mut self) -> Result<()>;

    async fn abort(&mut self) -> Result<()>;
}
