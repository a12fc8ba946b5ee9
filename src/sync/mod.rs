//! Live synchronization against a MeshCore companion radio.
//!
//! A [`LiveSession`] owns one [`StateStore`] and the three tasks that feed it:
//!
//! - the [`Supervisor`](supervisor::Supervisor), which connects, reconnects
//!   and pumps radio pushes into the store;
//! - the [`RefreshScheduler`](refresh::RefreshScheduler), which re-reads
//!   channel and contact metadata on an interval;
//! - per-message send tasks started by the [`SendCoordinator`](sender::SendCoordinator).
//!
//! Consumers read through [`LiveSession::snapshot`] and the store's update
//! stream; they never hold a reference into the logs themselves.

pub mod feed;
pub mod refresh;
pub mod sender;
pub mod store;
pub mod supervisor;

use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::SyncError;
use crate::meshcore::{CompanionTarget, Connector};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::model::{ConnectionState, ConversationId, MessageKey, Snapshot};

pub use feed::{FailureNotice, FeedEvent, ProviderKind, Subscription};
pub use refresh::{RefreshOutcome, RefreshScheduler};
pub use sender::{AckRegistry, SendCoordinator, SendPolicy};
pub use store::{Change, StateStore, StoreUpdate, SyncEvent};
pub use supervisor::{Backoff, ConnectionEvent, ConnectionMonitor};

const NOTICE_BUFFER: usize = 64;

/// Timing and limits for one live session, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub reconnect_jitter: f64,
    pub reconnect_max_attempts: Option<u32>,
    pub liveness_interval: Duration,
    pub liveness_timeout: Duration,
    pub refresh_interval: Duration,
    pub drain_limit: usize,
    pub stale_after: chrono::Duration,
    pub send: SendPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reconnect_initial: Duration::from_millis(config.reconnect.initial_delay_ms),
            reconnect_max: Duration::from_millis(config.reconnect.max_delay_ms),
            reconnect_jitter: config.reconnect.jitter,
            reconnect_max_attempts: config.reconnect.max_attempts,
            liveness_interval: config.companion.liveness_interval(),
            liveness_timeout: config.companion.liveness_timeout(),
            refresh_interval: config.companion.refresh_interval(),
            drain_limit: config.sync.drain_limit,
            stale_after: chrono::Duration::hours(config.sync.stale_after_hours as i64),
            send: SendPolicy::from_config(&config.send),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct LiveSession {
    connector: Arc<dyn Connector>,
    target: CompanionTarget,
    settings: SessionSettings,
    store: Arc<StateStore>,
    monitor: ConnectionMonitor,
    acks: AckRegistry,
    sender: SendCoordinator,
    notices: broadcast::Sender<FailureNotice>,
    metrics: Arc<SyncMetrics>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveSession {
    /// Spawn the supervisor and refresh tasks. Returns immediately; watch
    /// [`LiveSession::monitor`] for the outcome of the first connect.
    /// `settings` stay fixed for the life of the session.
    pub fn start(
        connector: Arc<dyn Connector>,
        target: CompanionTarget,
        settings: SessionSettings,
    ) -> Self {
        let metrics = Arc::new(SyncMetrics::new());
        let store = Arc::new(StateStore::new(metrics.clone()));
        let monitor = ConnectionMonitor::new();
        let acks = AckRegistry::new();
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let cancel = CancellationToken::new();

        let sender = SendCoordinator::new(
            store.clone(),
            monitor.clone(),
            acks.clone(),
            notices.clone(),
            settings.send.clone(),
        );
        let refresh = RefreshScheduler::new(
            store.clone(),
            monitor.clone(),
            settings.refresh_interval,
            settings.drain_limit,
            settings.stale_after,
        );
        info!("Starting live session for {}", target);
        let session = Self {
            connector,
            target,
            settings,
            store,
            monitor,
            acks,
            sender,
            notices,
            metrics,
            cancel: cancel.clone(),
            tasks: Mutex::new(vec![refresh.spawn(cancel.child_token())]),
        };
        session.monitor.transition(ConnectionState::Connecting);
        let handle = session.spawn_supervisor();
        session.lock_tasks().push(handle);
        session
    }

    fn spawn_supervisor(&self) -> JoinHandle<()> {
        let supervisor = supervisor::Supervisor {
            connector: self.connector.clone(),
            target: self.target.clone(),
            store: self.store.clone(),
            monitor: self.monitor.clone(),
            acks: self.acks.clone(),
            metrics: self.metrics.clone(),
            settings: self.settings.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(supervisor.run())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Start over from `Failed` with a fresh backoff. Returns false in any
    /// other state or after [`LiveSession::stop`].
    pub fn reconnect(&self) -> bool {
        // Held across the check and the spawn so concurrent callers start
        // at most one supervisor.
        let mut tasks = self.lock_tasks();
        if self.cancel.is_cancelled() || self.monitor.state() != ConnectionState::Failed {
            return false;
        }
        tasks.retain(|task| !task.is_finished());
        info!("Retrying companion {} after failure", self.target);
        self.monitor.transition(ConnectionState::Connecting);
        tasks.push(self.spawn_supervisor());
        true
    }

    /// Background tasks still running (refresh plus the active supervisor).
    pub fn running_tasks(&self) -> usize {
        self.lock_tasks().iter().filter(|task| !task.is_finished()).count()
    }

    pub fn target(&self) -> &CompanionTarget {
        &self.target
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.monitor.state()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn send(&self, conversation: &ConversationId, body: &str) -> Result<MessageKey, SyncError> {
        self.sender.send(conversation, body)
    }

    pub fn set_focus(&self, focus: Option<ConversationId>) {
        self.store.set_focus(focus);
    }

    pub fn notices(&self) -> broadcast::Receiver<FailureNotice> {
        self.notices.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop all tasks and close the link. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                debug!("Session task ended abnormally: {}", e);
            }
        }
        self.monitor.transition(ConnectionState::Disconnected);
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
