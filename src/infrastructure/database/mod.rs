pub mod health;
pub mod mongo;
pub mod replica_init;
pub mod store;
pub mod supervisor;
pub mod transaction_coordinator;

pub use health::{HealthReporter, HealthSnapshot, ProcessStatus};
pub use mongo::{classify_mongo_error, MongoConnector, MongoReplicaAdmin};
pub use replica_init::{
    InitOutcome, ReplicaAdmin, ReplicaInitConfig, ReplicaMember, ReplicaSetStatus,
    ReplicaTopologyInitializer,
};
pub use store::{
    DocumentStore, StoreConnector, StoreTransaction, TopologyEvent, TopologyEventReceiver,
    TopologyEventSender,
};
pub use supervisor::{
    AdmissionGuard, Backoff, ConnectionState, ConnectionSupervisor, GuardSignal, ShutdownReport,
};
pub use transaction_coordinator::{
    TransactionCoordinator, TransactionCoordinatorConfig, TransactionStats,
};
