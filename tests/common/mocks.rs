use async_trait::async_trait;
use mongodb::bson::{oid::ObjectId, Bson, Document};
use replica_store::{
    config::{ConnectionConfig, IndexKind, IndexSpec},
    domain::{WriteOperation, WriteResult},
    error::{AppError, Result},
    infrastructure::database::{
        DocumentStore, InitOutcome, ReplicaAdmin, ReplicaMember, ReplicaSetStatus,
        StoreConnector, StoreTransaction, TopologyEvent, TopologyEventSender,
    },
};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

type Collections = HashMap<String, Vec<Document>>;

#[derive(Default)]
struct StoreData {
    collections: Collections,
    /// Bumped on every commit; a transaction that began on an older version
    /// and touches the same collections conflicts.
    versions: HashMap<String, u64>,
}

#[derive(Default)]
struct StoreInner {
    data: Mutex<StoreData>,
    indexes: Mutex<Vec<IndexSpec>>,
    ping_fails: AtomicBool,
    conflicts_to_inject: AtomicU32,
    fail_on_apply: Mutex<Option<(usize, AppError)>>,
    fail_after_commit: Mutex<Option<AppError>>,
    apply_delay: Mutex<Option<Duration>>,
    commits: AtomicU32,
    aborts: AtomicU32,
    pings: AtomicU32,
    closed: AtomicBool,
}

impl StoreInner {
    fn unique_fields(&self, collection: &str) -> Vec<String> {
        self.indexes
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.collection == collection && spec.kind == IndexKind::Unique)
            .map(|spec| spec.field.clone())
            .collect()
    }
}

/// In-memory document store with snapshot transactions and failure injection.
#[derive(Default)]
pub struct MockStore {
    inner: Arc<StoreInner>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn commits(&self) -> u32 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> u32 {
        self.inner.aborts.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> u32 {
        self.inner.pings.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn seed(&self, collection: &str, document: Document) {
        let mut data = self.inner.data.lock().unwrap();
        data.collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .data
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn ensured_indexes(&self) -> Vec<IndexSpec> {
        self.inner.indexes.lock().unwrap().clone()
    }

    pub fn set_ping_fails(&self, fails: bool) {
        self.inner.ping_fails.store(fails, Ordering::SeqCst);
    }

    /// The next `count` commits fail with a write conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.inner.conflicts_to_inject.store(count, Ordering::SeqCst);
    }

    /// The operation at `index` of every transaction fails with `error`.
    pub fn fail_on_apply(&self, index: usize, error: AppError) {
        *self.inner.fail_on_apply.lock().unwrap() = Some((index, error));
    }

    /// The next commit publishes its writes, then reports `error` anyway.
    pub fn fail_after_next_commit(&self, error: AppError) {
        *self.inner.fail_after_commit.lock().unwrap() = Some(error);
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        *self.inner.apply_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl DocumentStore for MockStore {
    async fn ping(&self) -> Result<()> {
        self.inner.pings.fetch_add(1, Ordering::SeqCst);
        if self.inner.ping_fails.load(Ordering::SeqCst) {
            return Err(AppError::ConnectionError("no primary available".to_string()));
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction>> {
        let data = self.inner.data.lock().unwrap();
        Ok(Box::new(MockTransaction {
            store: Arc::clone(&self.inner),
            staged: data.collections.clone(),
            versions: data.versions.clone(),
            touched: Vec::new(),
            applied: 0,
            finished: false,
        }))
    }

    async fn find_one(&self, collection: &str, filter: Document) -> Result<Option<Document>> {
        Ok(self
            .documents(collection)
            .into_iter()
            .find(|document| matches_filter(document, &filter)))
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> Result<u64> {
        Ok(self
            .documents(collection)
            .iter()
            .filter(|document| matches_filter(document, &filter))
            .count() as u64)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> Result<WriteResult> {
        let unique = self.inner.unique_fields(collection);
        let mut data = self.inner.data.lock().unwrap();
        let documents = data.collections.entry(collection.to_string()).or_default();
        let result = insert(documents, document, &unique)?;
        *data.versions.entry(collection.to_string()).or_default() += 1;
        Ok(result)
    }

    async fn ensure_indexes(&self, indexes: &[IndexSpec]) -> Result<()> {
        let mut ensured = self.inner.indexes.lock().unwrap();
        for spec in indexes {
            if !ensured.contains(spec) {
                ensured.push(spec.clone());
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// Works on a private copy of the collections; commit publishes it.
struct MockTransaction {
    store: Arc<StoreInner>,
    staged: Collections,
    versions: HashMap<String, u64>,
    touched: Vec<String>,
    applied: usize,
    finished: bool,
}

#[async_trait]
impl StoreTransaction for MockTransaction {
    async fn apply(&mut self, operation: &WriteOperation) -> Result<WriteResult> {
        let store = Arc::clone(&self.store);
        let index = self.applied;
        self.applied += 1;

        let delay = *store.apply_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let injected = store.fail_on_apply.lock().unwrap().clone();
        if let Some((fail_index, error)) = injected {
            if fail_index == index {
                return Err(error);
            }
        }

        let collection = operation.collection().to_string();
        if !self.touched.contains(&collection) {
            self.touched.push(collection.clone());
        }
        let documents = self.staged.entry(collection.clone()).or_default();

        match operation {
            WriteOperation::Insert { document, .. } => {
                insert(documents, document.clone(), &store.unique_fields(&collection))
            }
            WriteOperation::Update { filter, update, .. } => {
                let Some(target) = documents.iter_mut().find(|d| matches_filter(d, filter)) else {
                    return Ok(WriteResult::Updated {
                        matched: 0,
                        modified: 0,
                    });
                };
                let before = target.clone();
                apply_update(target, update)?;
                Ok(WriteResult::Updated {
                    matched: 1,
                    modified: u64::from(*target != before),
                })
            }
            WriteOperation::Delete { filter, .. } => {
                let before = documents.len();
                if let Some(position) = documents.iter().position(|d| matches_filter(d, filter)) {
                    documents.remove(position);
                }
                Ok(WriteResult::Deleted {
                    deleted: (before - documents.len()) as u64,
                })
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let store = Arc::clone(&self.store);

        let injected = store
            .conflicts_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(AppError::TransactionConflict(
                "WriteConflict: injected".to_string(),
            ));
        }

        let mut data = store.data.lock().unwrap();
        for collection in &self.touched {
            let seen = self.versions.get(collection).copied().unwrap_or(0);
            let current = data.versions.get(collection).copied().unwrap_or(0);
            if seen != current {
                return Err(AppError::TransactionConflict(format!(
                    "WriteConflict on '{}'",
                    collection
                )));
            }
        }

        for collection in &self.touched {
            let staged = self.staged.remove(collection).unwrap_or_default();
            data.collections.insert(collection.clone(), staged);
            *data.versions.entry(collection.clone()).or_default() += 1;
        }
        drop(data);
        self.finished = true;
        store.commits.fetch_add(1, Ordering::SeqCst);

        let pending = store.fail_after_commit.lock().unwrap().take();
        match pending {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn abort(&mut self) -> Result<()> {
        if !self.finished {
            self.finished = true;
            self.store.aborts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn insert(documents: &mut Vec<Document>, mut document: Document, unique: &[String]) -> Result<WriteResult> {
    if !document.contains_key("_id") {
        document.insert("_id", ObjectId::new());
    }
    let id = document.get("_id").cloned().unwrap_or(Bson::Null);

    if documents.iter().any(|d| d.get("_id") == Some(&id)) {
        return Err(AppError::DuplicateKey(format!("E11000 duplicate key _id: {}", id)));
    }
    for field in unique {
        if let Some(value) = document.get(field) {
            if documents.iter().any(|d| d.get(field) == Some(value)) {
                return Err(AppError::DuplicateKey(format!(
                    "E11000 duplicate key {}: {}",
                    field, value
                )));
            }
        }
    }

    documents.push(document);
    Ok(WriteResult::Inserted { id })
}

fn as_number(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// Equality per field plus `$gte`.
pub fn matches_filter(document: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, expected)| {
        let actual = document.get(key);
        match expected {
            Bson::Document(condition) if condition.contains_key("$gte") => {
                match (actual.and_then(as_number), condition.get("$gte").and_then(as_number)) {
                    (Some(actual), Some(bound)) => actual >= bound,
                    _ => false,
                }
            }
            _ => actual == Some(expected),
        }
    })
}

/// Supports `$set` and `$inc`.
fn apply_update(document: &mut Document, update: &Document) -> Result<()> {
    for (operator, fields) in update {
        let Bson::Document(fields) = fields else {
            return Err(AppError::ValidationError(format!("{} needs a document", operator)));
        };
        for (field, value) in fields {
            match operator.as_str() {
                "$set" => {
                    document.insert(field.clone(), value.clone());
                }
                "$inc" => {
                    let updated = match (document.get(field), value) {
                        (Some(Bson::Int32(a)), Bson::Int32(b)) => Bson::Int32(a + b),
                        (Some(Bson::Int64(a)), Bson::Int32(b)) => Bson::Int64(a + i64::from(*b)),
                        (None, delta) => delta.clone(),
                        (Some(current), delta) => match (as_number(current), as_number(delta)) {
                            (Some(a), Some(b)) => Bson::Double(a + b),
                            _ => {
                                return Err(AppError::ValidationError(format!(
                                    "cannot $inc non-numeric field '{}'",
                                    field
                                )))
                            }
                        },
                    };
                    document.insert(field.clone(), updated);
                }
                other => {
                    return Err(AppError::ValidationError(format!(
                        "unsupported update operator {}",
                        other
                    )))
                }
            }
        }
    }
    Ok(())
}

/// Hands out a [`MockStore`] after a scripted number of failures.
pub struct MockConnector {
    store: Arc<MockStore>,
    failures_before_success: AtomicU32,
    fatal: Mutex<Option<AppError>>,
    connect_delay: Mutex<Option<Duration>>,
    events: Mutex<Option<TopologyEventSender>>,
    pub attempts: AtomicU32,
}

impl MockConnector {
    pub fn new(store: Arc<MockStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            failures_before_success: AtomicU32::new(0),
            fatal: Mutex::new(None),
            connect_delay: Mutex::new(None),
            events: Mutex::new(None),
            attempts: AtomicU32::new(0),
        })
    }

    pub fn failing_first(store: Arc<MockStore>, failures: u32) -> Arc<Self> {
        let connector = Self::new(store);
        connector
            .failures_before_success
            .store(failures, Ordering::SeqCst);
        connector
    }

    pub fn fatal(store: Arc<MockStore>, error: AppError) -> Arc<Self> {
        let connector = Self::new(store);
        *connector.fatal.lock().unwrap() = Some(error);
        connector
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    /// Emits a topology event the way the driver callback would.
    pub fn emit(&self, event: TopologyEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl StoreConnector for MockConnector {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
        events: TopologyEventSender,
    ) -> Result<Arc<dyn DocumentStore>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self.fatal.lock().unwrap().clone() {
            return Err(error);
        }

        let scripted_failure = self
            .failures_before_success
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(AppError::ConnectionError("connection refused".to_string()));
        }

        *self.events.lock().unwrap() = Some(events);
        Ok(Arc::clone(&self.store) as Arc<dyn DocumentStore>)
    }
}

/// Replica set admin that remembers whether it was initiated.
#[derive(Default)]
pub struct MockReplicaAdmin {
    status: Mutex<Option<ReplicaSetStatus>>,
    ping_failures: Mutex<HashMap<String, u32>>,
    pub pings: AtomicU32,
    pub initiate_calls: AtomicU32,
}

impl MockReplicaAdmin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `host` fails its first `count` pings.
    pub fn unreachable_for(&self, host: &str, count: u32) {
        self.ping_failures
            .lock()
            .unwrap()
            .insert(host.to_string(), count);
    }

    pub fn status(&self) -> Option<ReplicaSetStatus> {
        self.status.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplicaAdmin for MockReplicaAdmin {
    async fn ping_node(&self, host: &str) -> Result<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.ping_failures.lock().unwrap();
        match failures.get_mut(host) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(AppError::ConnectionError(format!("{} refused connection", host)))
            }
            _ => Ok(()),
        }
    }

    async fn replica_set_status(&self, _seed: &str) -> Result<Option<ReplicaSetStatus>> {
        Ok(self.status())
    }

    async fn initiate(
        &self,
        _seed: &str,
        replica_set: &str,
        members: &[ReplicaMember],
    ) -> Result<InitOutcome> {
        self.initiate_calls.fetch_add(1, Ordering::SeqCst);
        let mut status = self.status.lock().unwrap();
        if status.is_some() {
            return Ok(InitOutcome::AlreadyInitialized);
        }
        *status = Some(ReplicaSetStatus {
            set_name: replica_set.to_string(),
            members: members.iter().map(|m| m.host.clone()).collect(),
        });
        Ok(InitOutcome::Initiated)
    }
}
