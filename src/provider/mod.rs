//! The single data source consumers talk to.
//!
//! [`DataProvider`] fronts either a [`LiveSession`] or the
//! [`SimulatedProvider`]. One background task watches the live connection
//! state, flips the active source when the rules say so, and forwards the
//! active source's events into one feed. A flip is announced with exactly one
//! [`FeedEvent::ProviderChanged`]; the two sources never share data.

pub mod simulated;

use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::SyncError;
use crate::meshcore::io::DeviceConnector;
use crate::meshcore::link::LinkOptions;
use crate::meshcore::{CompanionTarget, TransportKind};
use crate::metrics::MetricsSnapshot;
use crate::model::{ConnectionState, ConversationId, MessageKey, Snapshot};
use crate::sync::{
    ConnectionEvent, FailureNotice, FeedEvent, LiveSession, ProviderKind, SessionSettings,
    StoreUpdate, Subscription,
};

pub use simulated::SimulatedProvider;

const FEED_BUFFER: usize = 256;

/// The source currently backing the facade.
enum ActiveSource<'a> {
    Live(&'a LiveSession),
    Simulated(&'a SimulatedProvider),
}

impl ActiveSource<'_> {
    fn snapshot(&self) -> Snapshot {
        match self {
            ActiveSource::Live(live) => live.snapshot(),
            ActiveSource::Simulated(sim) => sim.snapshot(),
        }
    }

    fn send(&self, conversation: &ConversationId, body: &str) -> Result<MessageKey, SyncError> {
        match self {
            ActiveSource::Live(live) => live.send(conversation, body),
            ActiveSource::Simulated(sim) => sim.send(conversation, body),
        }
    }

    fn set_focus(&self, focus: Option<ConversationId>) {
        match self {
            ActiveSource::Live(live) => live.set_focus(focus),
            ActiveSource::Simulated(sim) => sim.set_focus(focus),
        }
    }
}

struct Shared {
    live: Option<LiveSession>,
    simulated: Arc<SimulatedProvider>,
    kind: Mutex<ProviderKind>,
    live_disabled: AtomicBool,
    feed: broadcast::Sender<FeedEvent>,
    cancel: CancellationToken,
}

impl Shared {
    fn kind(&self) -> ProviderKind {
        *self.kind.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn source(&self) -> ActiveSource<'_> {
        match (self.kind(), &self.live) {
            (ProviderKind::Live, Some(live)) => ActiveSource::Live(live),
            _ => ActiveSource::Simulated(&self.simulated),
        }
    }

    /// Returns whether the active source changed.
    fn switch_to(&self, next: ProviderKind) -> bool {
        let live_usable = self.live.is_some() && !self.live_disabled.load(Ordering::SeqCst);
        if next == ProviderKind::Live && !live_usable {
            return false;
        }
        let mut kind = self.kind.lock().unwrap_or_else(|p| p.into_inner());
        if *kind == next {
            return false;
        }
        info!("Data provider switching {} -> {}", *kind, next);
        *kind = next;
        self.simulated.set_active(next == ProviderKind::Simulated);
        let _ = self.feed.send(FeedEvent::ProviderChanged(next));
        true
    }

    fn on_live_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Failed => {
                self.switch_to(ProviderKind::Simulated);
            }
            ConnectionState::Connected => {
                self.switch_to(ProviderKind::Live);
            }
            _ => {}
        }
    }

    fn forward(&self, from: ProviderKind, event: Result<FeedEvent, RecvError>) -> bool {
        let event = match event {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("Provider forwarder lagged by {} {} event(s)", n, from);
                FeedEvent::Resync
            }
            Err(RecvError::Closed) => return false,
        };
        if self.kind() == from {
            let _ = self.feed.send(event);
        }
        true
    }
}

async fn recv_or_pending<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Receivers for every upstream stream, taken before any event can fire.
struct Upstream {
    live_state: Option<watch::Receiver<ConnectionState>>,
    live_updates: Option<broadcast::Receiver<StoreUpdate>>,
    live_connection: Option<broadcast::Receiver<ConnectionEvent>>,
    live_notices: Option<broadcast::Receiver<FailureNotice>>,
    sim_updates: Option<broadcast::Receiver<StoreUpdate>>,
}

impl Upstream {
    fn subscribe(live: Option<&LiveSession>, simulated: &SimulatedProvider) -> Self {
        Self {
            live_state: live.map(|l| l.monitor().watch()),
            live_updates: live.map(|l| l.store().subscribe()),
            live_connection: live.map(|l| l.monitor().subscribe()),
            live_notices: live.map(|l| l.notices()),
            sim_updates: Some(simulated.store().subscribe()),
        }
    }
}

/// Watch the live state and forward events from whichever source is active.
async fn run_forwarder(shared: Arc<Shared>, upstream: Upstream) {
    let Upstream {
        live_state: mut state_rx,
        mut live_updates,
        mut live_connection,
        mut live_notices,
        mut sim_updates,
    } = upstream;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            changed = async {
                match state_rx.as_mut() {
                    Some(rx) => rx.changed().await.map(|_| *rx.borrow_and_update()),
                    None => std::future::pending().await,
                }
            } => match changed {
                Ok(state) => shared.on_live_state(state),
                Err(_) => state_rx = None,
            },
            update = recv_or_pending(&mut live_updates) => {
                if !shared.forward(ProviderKind::Live, update.map(FeedEvent::State)) {
                    live_updates = None;
                }
            }
            notice = recv_or_pending(&mut live_notices) => {
                if !shared.forward(ProviderKind::Live, notice.map(FeedEvent::Notice)) {
                    live_notices = None;
                }
            }
            event = recv_or_pending(&mut live_connection) => match event {
                // Radio status stays visible while the simulator is in front.
                Ok(event) => {
                    let _ = shared.feed.send(FeedEvent::Connection(event));
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => live_connection = None,
            },
            update = recv_or_pending(&mut sim_updates) => {
                if !shared.forward(ProviderKind::Simulated, update.map(FeedEvent::State)) {
                    sim_updates = None;
                }
            }
        }
    }
}

pub struct DataProvider {
    shared: Arc<Shared>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl DataProvider {
    /// Front `live` (if any) with `simulated` as the fallback.
    pub fn new(live: Option<LiveSession>, simulated: SimulatedProvider) -> Self {
        let initial = match &live {
            Some(live) if live.connection_state() != ConnectionState::Failed => ProviderKind::Live,
            _ => ProviderKind::Simulated,
        };
        let (feed, _) = broadcast::channel(FEED_BUFFER);
        let shared = Arc::new(Shared {
            live,
            simulated: Arc::new(simulated),
            kind: Mutex::new(initial),
            live_disabled: AtomicBool::new(false),
            feed,
            cancel: CancellationToken::new(),
        });
        shared.simulated.set_active(initial == ProviderKind::Simulated);
        info!("Data provider starting with {} source", initial);
        let upstream = Upstream::subscribe(shared.live.as_ref(), &shared.simulated);
        let forwarder = tokio::spawn(run_forwarder(shared.clone(), upstream));
        Self {
            shared,
            forwarder: Mutex::new(Some(forwarder)),
        }
    }

    /// Live session over the configured transport, or simulation only when
    /// the transport is `fake` or unusable.
    pub fn from_config(config: &Config) -> Self {
        let simulated = SimulatedProvider::from_config(&config.simulator);
        let live = match CompanionTarget::from_config(&config.companion) {
            Ok(target) if target.kind == TransportKind::Fake => {
                info!("Transport 'fake' selected; running on simulated data");
                None
            }
            Ok(target) => {
                let connector = DeviceConnector::new(LinkOptions {
                    command_timeout: config.companion.command_timeout(),
                    log_packets: config.companion.log_packets,
                });
                Some(LiveSession::start(
                    Arc::new(connector),
                    target,
                    SessionSettings::from_config(config),
                ))
            }
            Err(e) => {
                warn!("Companion transport unusable ({}); running on simulated data", e);
                None
            }
        };
        Self::new(live, simulated)
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.shared.feed.subscribe())
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.shared.kind()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.source().snapshot()
    }

    pub fn send(&self, conversation: &ConversationId, body: &str) -> Result<MessageKey, SyncError> {
        self.shared.source().send(conversation, body)
    }

    pub fn set_focus(&self, focus: Option<ConversationId>) {
        self.shared.source().set_focus(focus);
    }

    /// State of the radio link; `Disconnected` when there is no live session.
    pub fn connection_state(&self) -> ConnectionState {
        self.shared
            .live
            .as_ref()
            .map(|l| l.connection_state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn live(&self) -> Option<&LiveSession> {
        self.shared.live.as_ref()
    }

    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.shared.live.as_ref().map(|l| l.metrics())
    }

    /// Ask a failed live session to try again. The facade moves back to live
    /// data once it connects.
    pub fn reconnect_live(&self) -> bool {
        if self.shared.live_disabled.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.live.as_ref().map(|l| l.reconnect()).unwrap_or(false)
    }

    /// Drop to simulated data and shut the live session down.
    pub async fn disable_live(&self) {
        self.shared.live_disabled.store(true, Ordering::SeqCst);
        self.shared.switch_to(ProviderKind::Simulated);
        if let Some(live) = &self.shared.live {
            live.stop().await;
        }
    }

    pub async fn shutdown(&self) {
        if let Some(live) = &self.shared.live {
            live.stop().await;
        }
        self.shared.simulated.stop();
        self.shared.cancel.cancel();
        let forwarder = self.forwarder.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = forwarder {
            let _ = handle.await;
        }
    }
}

impl Drop for DataProvider {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.simulated.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeliveryState;
    use crate::sync::Change;
    use std::time::Duration;

    #[tokio::test]
    async fn without_live_session_simulation_is_active() {
        let provider = DataProvider::new(None, SimulatedProvider::new(Duration::ZERO));
        assert_eq!(provider.provider_kind(), ProviderKind::Simulated);
        assert_eq!(provider.connection_state(), ConnectionState::Disconnected);
        assert!(provider.snapshot().channel("#bot").is_some());

        let mut feed = provider.subscribe();
        let key = provider.send(&ConversationId::channel("public"), "hi sim").unwrap();
        let acknowledged = Change::Delivery {
            key,
            state: DeliveryState::Acknowledged,
        };
        loop {
            match feed.recv().await {
                Some(FeedEvent::State(update)) if update.changes.contains(&acknowledged) => break,
                Some(_) => continue,
                None => panic!("feed closed"),
            }
        }
        provider.disable_live().await;
        assert_eq!(provider.provider_kind(), ProviderKind::Simulated);
        provider.shutdown().await;
    }

    #[tokio::test]
    async fn fake_transport_config_runs_simulated() {
        let mut config = Config::default();
        config.companion.transport = "fake".into();
        config.simulator.interval_seconds = 0;
        let provider = DataProvider::from_config(&config);
        assert!(provider.live().is_none());
        assert_eq!(provider.provider_kind(), ProviderKind::Simulated);
        provider.shutdown().await;
    }
}
