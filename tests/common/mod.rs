#![allow(dead_code)]

use mongodb::bson::{doc, oid::ObjectId};
use replica_store::{
    config::{ConnectionConfig, IndexSpec},
    infrastructure::database::{ConnectionState, ConnectionSupervisor},
};
use std::sync::Arc;
use std::time::Duration;

// Test utilities and common setup
pub mod mocks;

pub use mocks::*;

/// Connection settings with timings short enough for tests.
pub fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout: Duration::from_millis(500),
        retry_interval: Duration::from_millis(10),
        max_retry_interval: Duration::from_millis(40),
        shutdown_timeout: Duration::from_millis(300),
        indexes: vec![
            IndexSpec::unique("products", "name"),
            IndexSpec::ttl("sessions", "expiresAt", Duration::ZERO),
        ],
        ..ConnectionConfig::default()
    }
}

/// Starts a supervisor over `store` and waits until it is Connected.
pub async fn connected_supervisor(
    store: Arc<MockStore>,
) -> (Arc<ConnectionSupervisor>, Arc<MockConnector>) {
    let connector = MockConnector::new(store);
    let supervisor = ConnectionSupervisor::start(test_connection_config(), connector.clone());
    assert!(
        supervisor
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(2))
            .await,
        "supervisor never connected"
    );
    (supervisor, connector)
}

/// Seeds a product with the given stock and returns its id.
pub fn seed_product(store: &MockStore, name: &str, stock: i32) -> ObjectId {
    let id = ObjectId::new();
    store.seed(
        "products",
        doc! {
            "_id": id,
            "name": name,
            "price": 9.99,
            "stock": stock,
            "created_at": chrono::Utc::now().to_rfc3339(),
        },
    );
    id
}

pub fn stock_of(store: &MockStore, product_id: ObjectId) -> Option<i32> {
    store
        .documents("products")
        .into_iter()
        .find(|d| d.get_object_id("_id").ok() == Some(product_id))
        .and_then(|d| d.get_i32("stock").ok())
}
