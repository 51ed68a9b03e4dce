mod common;

use common::*;
use replica_store::{
    error::AppError,
    infrastructure::database::{InitOutcome, ReplicaInitConfig, ReplicaTopologyInitializer},
};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn init_config() -> ReplicaInitConfig {
    ReplicaInitConfig {
        replica_set: "rs0".to_string(),
        nodes: vec![
            "mongo1:27017".to_string(),
            "mongo2:27017".to_string(),
            "mongo3:27017".to_string(),
        ],
        max_retries: 5,
        retry_delay: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn test_initiates_once_then_reports_already_initialized() {
    let admin = MockReplicaAdmin::new();
    let config = init_config();
    let members = config.members();
    let initializer = ReplicaTopologyInitializer::new(admin.clone(), config);

    let first = initializer.ensure_initialized(&members).await.unwrap();
    let membership = admin.status().unwrap();
    let second = initializer.ensure_initialized(&members).await.unwrap();

    assert_eq!(first, InitOutcome::Initiated);
    assert_eq!(second, InitOutcome::AlreadyInitialized);
    assert_eq!(admin.status().unwrap(), membership);
    assert_eq!(membership.set_name, "rs0");
    assert_eq!(
        membership.members,
        vec!["mongo1:27017", "mongo2:27017", "mongo3:27017"]
    );
    assert_eq!(admin.initiate_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_waits_for_slow_nodes() {
    let admin = MockReplicaAdmin::new();
    admin.unreachable_for("mongo3:27017", 3);
    let config = init_config();
    let members = config.members();

    let outcome = ReplicaTopologyInitializer::new(admin.clone(), config)
        .ensure_initialized(&members)
        .await
        .unwrap();

    assert_eq!(outcome, InitOutcome::Initiated);
    // Three successful pings plus three failures
    assert_eq!(admin.pings.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_gives_up_on_unreachable_node() {
    let admin = MockReplicaAdmin::new();
    admin.unreachable_for("mongo2:27017", 100);
    let config = init_config();
    let members = config.members();

    let result = ReplicaTopologyInitializer::new(admin.clone(), config)
        .ensure_initialized(&members)
        .await;

    assert!(matches!(result, Err(AppError::ConnectionError(_))));
    assert!(admin.status().is_none());
    assert_eq!(admin.initiate_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_requires_members() {
    let admin = MockReplicaAdmin::new();
    let result = ReplicaTopologyInitializer::new(admin, init_config())
        .ensure_initialized(&[])
        .await;

    assert!(matches!(result, Err(AppError::ConfigurationError(_))));
}
