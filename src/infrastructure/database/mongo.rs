//! MongoDB implementations of the store traits.

use async_trait::async_trait;
use mongodb::{
    bson::{doc, Bson, Document},
    error::{
        Error as MongoError, ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    event::sdam::{SdamEventHandler, ServerDescriptionChangedEvent, ServerHeartbeatFailedEvent},
    options::{
        Acknowledgment, ClientOptions, IndexOptions, ReadConcern, ReadPreference,
        ReadPreferenceOptions, SelectionCriteria, TransactionOptions, WriteConcern,
    },
    Client, ClientSession, Database, IndexModel, ServerType,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::replica_init::{InitOutcome, ReplicaAdmin, ReplicaMember, ReplicaSetStatus};
use super::store::{
    DocumentStore, StoreConnector, StoreTransaction, TopologyEvent, TopologyEventSender,
};
use crate::config::{
    ConnectionConfig, IndexKind, IndexSpec, ReadPreferencePolicy, WriteConcernPolicy,
};
use crate::domain::{WriteOperation, WriteResult};
use crate::error::{AppError, Result};

/// How often a commit with an unknown result is re-sent on the same session.
const COMMIT_RETRY_LIMIT: u32 = 3;

/// Maps a driver error onto the crate's error taxonomy.
pub fn classify_mongo_error(err: MongoError) -> AppError {
    let message = err.to_string();

    if err.contains_label(TRANSIENT_TRANSACTION_ERROR) {
        return AppError::TransactionConflict(message);
    }

    match err.kind.as_ref() {
        ErrorKind::Authentication { .. } | ErrorKind::InvalidArgument { .. } => {
            AppError::ConfigurationError(message)
        }
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::DnsResolve { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => AppError::ConnectionError(message),
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            classify_server_code(write_error.code, message)
        }
        ErrorKind::Write(WriteFailure::WriteConcernError(concern_error)) => {
            classify_server_code(concern_error.code, message)
        }
        ErrorKind::Command(command_error) => classify_server_code(command_error.code, message),
        _ => AppError::DatabaseError(message),
    }
}

/// Server error codes that matter to the coordinator and supervisor.
pub fn classify_server_code(code: i32, message: String) -> AppError {
    match code {
        11000 | 11001 => AppError::DuplicateKey(message),
        112 => AppError::TransactionConflict(message),
        64 => AppError::WriteConcernTimeout(message),
        121 => AppError::ValidationError(message),
        13 | 18 => AppError::ConfigurationError(message),
        // Interrupted by shutdown/step-down, or the member is no longer primary.
        91 | 189 | 10107 | 11600 | 11602 | 13435 | 13436 => AppError::ConnectionError(message),
        _ => AppError::DatabaseError(message),
    }
}

fn write_concern(policy: &WriteConcernPolicy) -> WriteConcern {
    let acknowledgment = match policy {
        WriteConcernPolicy::Majority { .. } => Acknowledgment::Majority,
        WriteConcernPolicy::Nodes { count, .. } => Acknowledgment::Nodes(*count),
    };
    WriteConcern::builder()
        .w(acknowledgment)
        .w_timeout(policy.timeout())
        .build()
}

fn read_preference(policy: ReadPreferencePolicy) -> ReadPreference {
    let options = ReadPreferenceOptions::default();
    match policy {
        ReadPreferencePolicy::Primary => ReadPreference::Primary,
        ReadPreferencePolicy::PrimaryPreferred => ReadPreference::PrimaryPreferred { options },
        ReadPreferencePolicy::Secondary => ReadPreference::Secondary { options },
        ReadPreferencePolicy::SecondaryPreferred => ReadPreference::SecondaryPreferred { options },
        ReadPreferencePolicy::Nearest => ReadPreference::Nearest { options },
    }
}

/// Translates driver SDAM callbacks into [`TopologyEvent`]s.
struct TopologyListener {
    events: TopologyEventSender,
}

impl SdamEventHandler for TopologyListener {
    fn handle_server_description_changed_event(&self, event: ServerDescriptionChangedEvent) {
        let was_primary = event.previous_description.server_type() == ServerType::RsPrimary;
        let is_primary = event.new_description.server_type() == ServerType::RsPrimary;
        let address = event.address.to_string();

        let topology_event = match (was_primary, is_primary) {
            (false, true) => TopologyEvent::PrimaryElected { address },
            (true, false) => TopologyEvent::PrimaryLost { address },
            _ => return,
        };
        let _ = self.events.send(topology_event);
    }

    fn handle_server_heartbeat_failed_event(&self, event: ServerHeartbeatFailedEvent) {
        let _ = self.events.send(TopologyEvent::NodeUnreachable {
            address: event.server_address.to_string(),
            reason: event.failure.to_string(),
        });
    }
}

#[derive(Debug, Default, Clone)]
pub struct MongoConnector;

#[async_trait]
impl StoreConnector for MongoConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: TopologyEventSender,
    ) -> Result<Arc<dyn DocumentStore>> {
        info!("🔄 Connecting to MongoDB replica set {}...", config.replica_set);

        let mut client_options = ClientOptions::parse(&config.uri)
            .await
            .map_err(classify_mongo_error)?;

        client_options.app_name = Some("replica-store-service".to_string());
        client_options.repl_set_name = Some(config.replica_set.clone());
        client_options.connect_timeout = Some(config.connect_timeout);
        client_options.server_selection_timeout = Some(config.connect_timeout);
        client_options.write_concern = Some(write_concern(&config.write_concern));
        client_options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            read_preference(config.read_preference),
        ));
        client_options.sdam_event_handler = Some(Arc::new(TopologyListener { events }));

        let client = Client::with_options(client_options).map_err(classify_mongo_error)?;
        let database = client.database(&config.database_name);

        // Send a ping to confirm a usable member
        database
            .run_command(doc! {"ping": 1}, None)
            .await
            .map_err(classify_mongo_error)?;

        info!("✅ Successfully connected to MongoDB!");

        let transaction_options = TransactionOptions::builder()
            .read_concern(ReadConcern::snapshot())
            .write_concern(write_concern(&config.write_concern))
            .selection_criteria(SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .build();

        Ok(Arc::new(MongoStore {
            client,
            database,
            transaction_options,
        }))
    }
}

pub struct MongoStore {
    client: Client,
    database: Database,
    transaction_options: TransactionOptions,
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn ping(&self) -> Result<()> {
        self.database
            .run_command(
                doc! {"ping": 1},
                SelectionCriteria::ReadPreference(ReadPreference::Primary),
            )
            .await
            .map_err(classify_mongo_error)?;
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>> {
        let mut session = self
            .client
            .start_session(None)
            .await
            .map_err(classify_mongo_error)?;

        session
            .start_transaction(self.transaction_options.clone())
            .await
            .map_err(classify_mongo_error)?;

        Ok(Box::new(MongoTransaction {
            database: self.database.clone(),
            session,
        }))
    }

    async fn find_one(&self, collection: &str, filter: Document) -> Result<Option<Document>> {
        self.database
            .collection::<Document>(collection)
            .find_one(filter, None)
            .await
            .map_err(classify_mongo_error)
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> Result<u64> {
        self.database
            .collection::<Document>(collection)
            .count_documents(filter, None)
            .await
            .map_err(classify_mongo_error)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<WriteResult> {
        let result = self
            .database
            .collection::<Document>(collection)
            .insert_one(document, None)
            .await
            .map_err(classify_mongo_error)?;

        Ok(WriteResult::Inserted {
            id: result.inserted_id,
        })
    }

    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> Result<()> {
        for spec in indexes {
            let options = match &spec.kind {
                IndexKind::Unique => IndexOptions::builder().unique(true).build(),
                IndexKind::Ttl { expire_after } => {
                    IndexOptions::builder().expire_after(*expire_after).build()
                }
            };
            let mut keys = Document::new();
            keys.insert(spec.field.clone(), 1);
            let model = IndexModel::builder()
                .keys(keys)
                .options(options)
                .build();

            self.database
                .collection::<Document>(&spec.collection)
                .create_index(model, None)
                .await
                .map_err(classify_mongo_error)?;

            debug!(collection = %spec.collection, field = %spec.field, "Index ensured");
        }
        Ok(())
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

struct MongoTransaction {
    database: Database,
    session: ClientSession,
}

#[async_trait]
impl StoreTransaction for MongoTransaction {
    async fn apply(&mut self, operation: &WriteOperation) -> Result<WriteResult> {
        let collection = self
            .database
            .collection::<Document>(operation.collection());

        match operation {
            WriteOperation::Insert { document, .. } => {
                let result = collection
                    .insert_one_with_session(document.clone(), None, &mut self.session)
                    .await
                    .map_err(classify_mongo_error)?;
                Ok(WriteResult::Inserted {
                    id: result.inserted_id,
                })
            }
            WriteOperation::Update { filter, update, .. } => {
                let result = collection
                    .update_one_with_session(filter.clone(), update.clone(), None, &mut self.session)
                    .await
                    .map_err(classify_mongo_error)?;
                Ok(WriteResult::Updated {
                    matched: result.matched_count,
                    modified: result.modified_count,
                })
            }
            WriteOperation::Delete { filter, .. } => {
                let result = collection
                    .delete_one_with_session(filter.clone(), None, &mut self.session)
                    .await
                    .map_err(classify_mongo_error)?;
                Ok(WriteResult::Deleted {
                    deleted: result.deleted_count,
                })
            }
        }
    }

    /// Errors without the transient-transaction label leave the commit
    /// result unknown to the caller.
    async fn commit(&mut self) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(e) if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                    && attempt < COMMIT_RETRY_LIMIT =>
                {
                    warn!(attempt, "Commit result unknown, re-sending commit: {}", e);
                }
                Err(e) => return Err(classify_mongo_error(e)),
            }
        }
    }

    async fn abort(&mut self) -> Result<()> {
        self.session
            .abort_transaction()
            .await
            .map_err(classify_mongo_error)
    }
}

/// Runs admin commands against single nodes with a direct connection.
///
/// One client is kept per host for the life of the admin; `close` shuts
/// them all down.
#[derive(Debug, Clone)]
pub struct MongoReplicaAdmin {
    connect_timeout: Duration,
    clients: Arc<Mutex<HashMap<String, Client>>>,
}

impl MongoReplicaAdmin {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn admin_database(&self, host: &str) -> Result<Database> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(host) {
            return Ok(client.database("admin"));
        }

        let uri = format!("mongodb://{}/?directConnection=true", host);
        let mut client_options = ClientOptions::parse(&uri)
            .await
            .map_err(classify_mongo_error)?;
        client_options.connect_timeout = Some(self.connect_timeout);
        client_options.server_selection_timeout = Some(self.connect_timeout);

        let client = Client::with_options(client_options).map_err(classify_mongo_error)?;
        debug!(host, "Opened admin connection");
        let admin = client.database("admin");
        clients.insert(host.to_string(), client);
        Ok(admin)
    }

    /// Shuts down every cached admin client.
    pub async fn close(&self) {
        let clients: Vec<(String, Client)> = self.clients.lock().await.drain().collect();
        for (host, client) in clients {
            client.shutdown().await;
            debug!(host = %host, "Closed admin connection");
        }
    }
}

fn server_code(err: &MongoError) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command_error) => Some(command_error.code),
        _ => None,
    }
}

const NOT_YET_INITIALIZED: i32 = 94;
const ALREADY_INITIALIZED: i32 = 23;

#[async_trait]
impl ReplicaAdmin for MongoReplicaAdmin {
    async fn ping_node(&self, host: &str) -> Result<()> {
        self.admin_database(host)
            .await?
            .run_command(doc! {"ping": 1}, None)
            .await
            .map_err(classify_mongo_error)?;
        Ok(())
    }

    async fn replica_set_status(&self, seed: &str) -> Result<Option<ReplicaSetStatus>> {
        let admin = self.admin_database(seed).await?;

        match admin.run_command(doc! {"replSetGetStatus": 1}, None).await {
            Ok(status) => {
                let set_name = status.get_str("set").unwrap_or_default().to_string();
                let members = status
                    .get_array("members")
                    .map(|members| {
                        members
                            .iter()
                            .filter_map(Bson::as_document)
                            .filter_map(|member| member.get_str("name").ok())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Some(ReplicaSetStatus { set_name, members }))
            }
            Err(e) if server_code(&e) == Some(NOT_YET_INITIALIZED) => Ok(None),
            Err(e) => Err(classify_mongo_error(e)),
        }
    }

    async fn initiate(
        &self,
        seed: &str,
        replica_set: &str,
        members: &[ReplicaMember],
    ) -> Result<InitOutcome> {
        let admin = self.admin_database(seed).await?;
        let members: Vec<Bson> = members
            .iter()
            .map(|member| {
                Bson::Document(doc! {
                    "_id": member.id as i32,
                    "host": member.host.clone(),
                    "priority": member.priority,
                })
            })
            .collect();

        let command = doc! {
            "replSetInitiate": {
                "_id": replica_set,
                "members": members,
            }
        };

        match admin.run_command(command, None).await {
            Ok(_) => Ok(InitOutcome::Initiated),
            Err(e) if server_code(&e) == Some(ALREADY_INITIALIZED) => {
                Ok(InitOutcome::AlreadyInitialized)
            }
            Err(e) => Err(classify_mongo_error(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_code_classification() {
        let msg = || "server said no".to_string();
        assert!(matches!(classify_server_code(11000, msg()), AppError::DuplicateKey(_)));
        assert!(matches!(classify_server_code(112, msg()), AppError::TransactionConflict(_)));
        assert!(matches!(classify_server_code(64, msg()), AppError::WriteConcernTimeout(_)));
        assert!(matches!(classify_server_code(121, msg()), AppError::ValidationError(_)));
        assert!(matches!(classify_server_code(18, msg()), AppError::ConfigurationError(_)));
        assert!(matches!(classify_server_code(10107, msg()), AppError::ConnectionError(_)));
        assert!(matches!(classify_server_code(2, msg()), AppError::DatabaseError(_)));
    }

    #[test]
    fn test_write_concern_mapping() {
        let concern = write_concern(&WriteConcernPolicy::Majority {
            timeout: Duration::from_millis(3000),
        });
        assert_eq!(concern.w, Some(Acknowledgment::Majority));
        assert_eq!(concern.w_timeout, Some(Duration::from_millis(3000)));

        let concern = write_concern(&WriteConcernPolicy::Nodes {
            count: 2,
            timeout: Duration::from_millis(500),
        });
        assert_eq!(concern.w, Some(Acknowledgment::Nodes(2)));
    }

    #[test]
    fn test_read_preference_mapping() {
        assert!(matches!(
            read_preference(ReadPreferencePolicy::Primary),
            ReadPreference::Primary
        ));
        assert!(matches!(
            read_preference(ReadPreferencePolicy::SecondaryPreferred),
            ReadPreference::SecondaryPreferred { .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_uri_is_a_configuration_error() {
        let config = ConnectionConfig {
            uri: "mongodb://".to_string(),
            ..ConnectionConfig::default()
        };
        let (events, _rx) = tokio::sync::mpsc::unbounded_channel();
        let result = MongoConnector.connect(&config, events).await;
        assert!(matches!(result, Err(AppError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn test_admin_reuses_one_client_per_host() {
        let admin = MongoReplicaAdmin::new(Duration::from_millis(100));

        admin.admin_database("mongo1:27017").await.unwrap();
        admin.admin_database("mongo1:27017").await.unwrap();
        admin.admin_database("mongo2:27017").await.unwrap();
        assert_eq!(admin.clients.lock().await.len(), 2);

        admin.close().await;
        assert!(admin.clients.lock().await.is_empty());
    }
}
