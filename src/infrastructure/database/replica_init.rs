//! One-shot replica set bootstrap.
//!
//! Runs at cluster bring-up, before any application process connects: waits
//! for every node to answer, then initiates the member set unless the seed
//! node already reports one.

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaMember {
    pub id: u32,
    pub host: String,
    pub priority: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSetStatus {
    pub set_name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Initiated,
    AlreadyInitialized,
}

#[derive(Debug, Clone)]
pub struct ReplicaInitConfig {
    pub replica_set: String,
    pub nodes: Vec<String>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl ReplicaInitConfig {
    /// The first node is the preferred primary; the rest get half its priority.
    pub fn members(&self) -> Vec<ReplicaMember> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, host)| ReplicaMember {
                id: index as u32,
                host: host.clone(),
                priority: if index == 0 { 1.0 } else { 0.5 },
            })
            .collect()
    }
}

/// Administrative commands against individual replica set nodes.
#[async_trait]
pub trait ReplicaAdmin: Send + Sync {
    async fn ping_node(&self, host: &str) -> Result<()>;

    /// `None` when the node has no replica set configuration yet.
    async fn replica_set_status(&self, seed: &str) -> Result<Option<ReplicaSetStatus>>;

    /// Reports `AlreadyInitialized` instead of failing when a configuration exists.
    async fn initiate(
        &self,
        seed: &str,
        replica_set: &str,
        members: &[ReplicaMember],
    ) -> Result<InitOutcome>;
}

pub struct ReplicaTopologyInitializer {
    admin: Arc<dyn ReplicaAdmin>,
    config: ReplicaInitConfig,
}

impl ReplicaTopologyInitializer {
    pub fn new(admin: Arc<dyn ReplicaAdmin>, config: ReplicaInitConfig) -> Self {
        Self { admin, config }
    }

    /// Idempotent: a second run against an initialized set is a no-op.
    pub async fn ensure_initialized(&self, members: &[ReplicaMember]) -> Result<InitOutcome> {
        let seed = members.first().ok_or_else(|| {
            AppError::ConfigurationError("replica set needs at least one member".to_string())
        })?;

        info!(
            replica_set = %self.config.replica_set,
            members = members.len(),
            "Waiting for replica set nodes..."
        );
        let checks = join_all(members.iter().map(|m| self.wait_for_node(&m.host))).await;
        for check in checks {
            check?;
        }

        if let Some(status) = self.admin.replica_set_status(&seed.host).await? {
            info!(
                replica_set = %status.set_name,
                members = ?status.members,
                "Replica set is already initialized"
            );
            return Ok(InitOutcome::AlreadyInitialized);
        }

        info!(seed = %seed.host, "Initiating replica set {}", self.config.replica_set);
        let outcome = self
            .admin
            .initiate(&seed.host, &self.config.replica_set, members)
            .await?;

        match outcome {
            InitOutcome::Initiated => info!("✅ Replica set {} initiated", self.config.replica_set),
            InitOutcome::AlreadyInitialized => {
                info!("Replica set {} was initialized concurrently", self.config.replica_set)
            }
        }
        Ok(outcome)
    }

    async fn wait_for_node(&self, host: &str) -> Result<()> {
        let attempts = self.config.max_retries.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.admin.ping_node(host).await {
                Ok(()) => {
                    debug!(host, attempt, "Node reachable");
                    return Ok(());
                }
                Err(e) if attempt == attempts => {
                    return Err(AppError::ConnectionError(format!(
                        "node {} unreachable after {} attempts: {}",
                        host, attempts, e
                    )));
                }
                Err(e) => {
                    warn!(host, attempt, "Node not reachable yet: {}", e);
                    sleep(self.config.retry_delay).await;
                }
            }
        }
    }
}
