//! Connection supervision for the replicated store.
//!
//! The supervisor owns the single logical connection and its state machine.
//! A background task connects with exponential backoff, reacts to topology
//! events by suspending admission until a usable member answers again, and
//! stops when `shutdown` is called. Other components only see the state and
//! an [`AdmissionGuard`] handed out while the connection is usable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch, Mutex, Notify, RwLock},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, error, info, warn};

use super::store::{
    DocumentStore, StoreConnector, TopologyEvent, TopologyEventReceiver, TopologyEventSender,
};
use crate::config::ConnectionConfig;
use crate::error::{AppError, Result};

/// How long force-cancelled operations get to abort before the store closes.
const FORCE_CANCEL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Outcome of `ConnectionSupervisor::shutdown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight operation finished before the deadline.
    pub drained: bool,
    /// Operations still running when the deadline passed.
    pub force_cancelled: usize,
}

struct SupervisorShared {
    config: ConnectionConfig,
    state_tx: watch::Sender<ConnectionState>,
    store: RwLock<Option<Arc<dyn DocumentStore>>>,
    in_flight: AtomicUsize,
    drained: Notify,
    draining: AtomicBool,
    cancel_tx: watch::Sender<bool>,
}

impl SupervisorShared {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn transition(&self, next: ConnectionState) -> bool {
        let mut previous = None;
        let changed = self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                previous = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });

        match previous {
            Some(from) if from != next => {
                info!(from = %from, to = %next, "Store connection state changed");
            }
            Some(_) => {}
            None => {
                warn!(
                    from = %self.state(),
                    to = %next,
                    "Rejected illegal connection state transition"
                );
            }
        }
        changed
    }

    async fn wait_for_drain(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Counts an admitted operation until dropped.
struct InFlight {
    shared: Arc<SupervisorShared>,
}

impl InFlight {
    fn register(shared: &Arc<SupervisorShared>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.shared.drained.notify_waiters();
        }
    }
}

/// Why an admitted operation was told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardSignal {
    /// Shutdown passed its deadline with the operation still running.
    Cancelled,
    /// The connection left Connected while the operation was running.
    Disrupted,
}

/// Permission to use the store for one logical operation.
///
/// Shutdown waits for every guard to be dropped, and signals
/// [`AdmissionGuard::cancelled`] once its deadline passes. A topology change
/// that suspends admission is reported through [`AdmissionGuard::disrupted`].
pub struct AdmissionGuard {
    store: Arc<dyn DocumentStore>,
    cancel_rx: watch::Receiver<bool>,
    state_rx: watch::Receiver<ConnectionState>,
    _in_flight: InFlight,
}

impl AdmissionGuard {
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Resolves when shutdown force-cancels in-flight work.
    pub async fn cancelled(&mut self) {
        wait_until(&mut self.cancel_rx, |cancelled| *cancelled).await
    }

    /// Resolves once the connection is no longer Connected.
    pub async fn disrupted(&mut self) {
        wait_until(&mut self.state_rx, |state| *state != ConnectionState::Connected).await
    }

    /// Resolves with the first stop signal.
    ///
    /// Connection state is only watched when `watch_topology` is set.
    pub async fn interrupted(&mut self, watch_topology: bool) -> GuardSignal {
        let Self {
            cancel_rx,
            state_rx,
            ..
        } = self;

        tokio::select! {
            _ = wait_until(cancel_rx, |cancelled| *cancelled) => GuardSignal::Cancelled,
            _ = wait_until(state_rx, |state| *state != ConnectionState::Connected), if watch_topology => {
                GuardSignal::Disrupted
            }
        }
    }
}

/// Waits for `condition`; never resolves once the sender is gone.
async fn wait_until<T>(rx: &mut watch::Receiver<T>, condition: impl FnMut(&T) -> bool) {
    let reached = rx.wait_for(condition).await.is_ok();
    if !reached {
        std::future::pending::<()>().await;
    }
}

pub struct ConnectionSupervisor {
    shared: Arc<SupervisorShared>,
    events_tx: TopologyEventSender,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    shutdown_called: AtomicBool,
}

impl ConnectionSupervisor {
    /// Spawns the supervision task and returns immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ConnectionConfig, connector: Arc<dyn StoreConnector>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (cancel_tx, _) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(SupervisorShared {
            config,
            state_tx,
            store: RwLock::new(None),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            draining: AtomicBool::new(false),
            cancel_tx,
        });

        let task = tokio::spawn(supervise(
            Arc::clone(&shared),
            connector,
            events_tx.clone(),
            events_rx,
            shutdown_rx,
        ));

        Arc::new(Self {
            shared,
            events_tx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
            shutdown_called: AtomicBool::new(false),
        })
    }

    pub fn current_state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until the state equals `target`, giving up after `limit`.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut rx = self.subscribe();
        let reached = matches!(
            timeout(limit, rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Feeds a driver topology event to the supervision task.
    pub fn on_topology_change(&self, event: TopologyEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("Supervision task has stopped, topology event dropped");
        }
    }

    /// Admits one operation if the connection is usable.
    pub async fn admit(&self) -> Result<AdmissionGuard> {
        let in_flight = InFlight::register(&self.shared);

        if self.shared.draining.load(Ordering::SeqCst) {
            return Err(AppError::NotReady("store connection is shutting down".to_string()));
        }

        let state = self.current_state();
        if state != ConnectionState::Connected {
            return Err(AppError::NotReady(format!("store connection is {}", state)));
        }

        let store = self
            .shared
            .store
            .read()
            .await
            .clone()
            .ok_or_else(|| AppError::NotReady("store connection is not established".to_string()))?;

        Ok(AdmissionGuard {
            store,
            cancel_rx: self.shared.cancel_tx.subscribe(),
            state_rx: self.subscribe(),
            _in_flight: in_flight,
        })
    }

    /// Drains in-flight work, closes the store and moves to Disconnected.
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            warn!("Store connection shutdown already requested");
            return Ok(ShutdownReport {
                drained: true,
                force_cancelled: 0,
            });
        }

        info!("⏹️ Shutting down store connection...");
        self.shared.draining.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Supervision task ended abnormally: {}", e);
            }
        }

        let shutdown_timeout = self.shared.config.shutdown_timeout;
        let drained = timeout(shutdown_timeout, self.shared.wait_for_drain())
            .await
            .is_ok();

        let mut force_cancelled = 0;
        if !drained {
            force_cancelled = self.in_flight();
            warn!(
                in_flight = force_cancelled,
                "Shutdown deadline of {:?} passed, cancelling in-flight operations", shutdown_timeout
            );
            let _ = self.shared.cancel_tx.send(true);
            let _ = timeout(FORCE_CANCEL_GRACE, self.shared.wait_for_drain()).await;
        }

        let store = self.shared.store.write().await.take();
        if let Some(store) = store {
            store.close().await;
        }

        self.shared.transition(ConnectionState::Disconnected);
        info!("✅ Store connection closed");

        Ok(ShutdownReport {
            drained,
            force_cancelled,
        })
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

enum Recovery {
    Restored,
    Fatal(AppError),
    Shutdown,
}

async fn supervise(
    shared: Arc<SupervisorShared>,
    connector: Arc<dyn StoreConnector>,
    events_tx: TopologyEventSender,
    mut events_rx: TopologyEventReceiver,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let config = shared.config.clone();
    let mut backoff = Backoff::new(config.retry_interval, config.max_retry_interval);

    let store = loop {
        shared.transition(ConnectionState::Connecting);

        if let Err(e) = config.validate() {
            error!("Invalid store configuration: {}", e);
            shared.transition(ConnectionState::Failed);
            return;
        }

        let attempt = tokio::select! {
            result = timeout(config.connect_timeout, connector.connect(&config, events_tx.clone())) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(AppError::ConnectionError(format!(
                        "connect attempt timed out after {:?}",
                        config.connect_timeout
                    ))),
                }
            }
            _ = shutdown_rx.changed() => return,
        };

        match attempt {
            Ok(store) => break store,
            Err(e) if e.is_fatal() => {
                error!("Store connection failed permanently: {}", e);
                shared.transition(ConnectionState::Failed);
                return;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(retry_in_ms = delay.as_millis() as u64, "Store connection failed: {}", e);
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown_rx.changed() => return,
                }
            }
        }
    };

    if !config.indexes.is_empty() {
        if let Err(e) = store.ensure_indexes(&config.indexes).await {
            warn!("Failed to ensure indexes: {}", e);
        }
    }

    *shared.store.write().await = Some(Arc::clone(&store));
    // Events raised while connecting describe a topology we no longer care about.
    while events_rx.try_recv().is_ok() {}
    shared.transition(ConnectionState::Connected);
    info!("✅ Connected to replica set {}", config.replica_set);
    backoff.reset();

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { return };

                if !event.is_disruptive() {
                    debug!(?event, "Topology event");
                    continue;
                }
                if shared.state() != ConnectionState::Connected {
                    continue;
                }

                warn!(?event, "Topology changed, suspending admission");
                shared.transition(ConnectionState::Reconnecting);

                match recover(&shared, &store, &mut backoff, &mut events_rx, &mut shutdown_rx).await {
                    Recovery::Restored => {
                        shared.transition(ConnectionState::Connected);
                        backoff.reset();
                    }
                    Recovery::Fatal(e) => {
                        error!("Store connection failed permanently: {}", e);
                        shared.transition(ConnectionState::Failed);
                        return;
                    }
                    Recovery::Shutdown => return,
                }
            }
            _ = shutdown_rx.changed() => return,
        }
    }
}

/// Pings the store until a usable member answers.
async fn recover(
    shared: &SupervisorShared,
    store: &Arc<dyn DocumentStore>,
    backoff: &mut Backoff,
    events_rx: &mut TopologyEventReceiver,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Recovery {
    let ping_timeout = shared.config.connect_timeout;

    loop {
        match timeout(ping_timeout, store.ping()).await {
            Ok(Ok(())) => return Recovery::Restored,
            Ok(Err(e)) if e.is_fatal() => return Recovery::Fatal(e),
            Ok(Err(e)) => debug!("Store ping failed: {}", e),
            Err(_) => debug!("Store ping timed out after {:?}", ping_timeout),
        }

        let delay = backoff.next_delay();
        debug!(retry_in_ms = delay.as_millis() as u64, "Waiting for a usable member");

        let wait = sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                event = events_rx.recv() => match event {
                    Some(TopologyEvent::PrimaryElected { address }) => {
                        info!(primary = %address, "New primary elected, pinging immediately");
                        break;
                    }
                    Some(_) => continue,
                    None => break,
                },
                _ = shutdown_rx.changed() => return Recovery::Shutdown,
            }
        }
    }
}
