//! Connection lifecycle: connect, initial sync, liveness, reconnect with backoff.
//!
//! The supervisor is the only writer of [`ConnectionState`]. Everything else
//! observes it through a [`ConnectionMonitor`], which also hands out the
//! current link and lets send tasks report that the link is gone.

use log::{debug, error, info, trace, warn};
use rand::Rng;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::refresh::collect_sync_batch;
use super::sender::AckRegistry;
use super::store::{StateStore, SyncEvent};
use super::SessionSettings;
use crate::logutil::preview;
use crate::meshcore::{CompanionTarget, Connection, Connector, RadioEvent, RadioLink};
use crate::metrics::SyncMetrics;
use crate::model::ConnectionState;

const EVENT_BUFFER: usize = 64;

/// Exponential backoff with bounded, non-decreasing, jittered delays.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    attempts: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            jitter: if jitter.is_nan() { 0.0 } else { jitter.clamp(0.0, 1.0) },
            attempts: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next retry. `nominal = min(max, initial * 2^n)` plus up
    /// to `jitter * nominal`, capped at `max` and never below the previous delay.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts.min(31)).unwrap_or(u32::MAX);
        let nominal = self.initial.saturating_mul(factor).min(self.max);
        let spread = nominal.mul_f64(self.jitter);
        let extra = if spread.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=spread)
        };
        let delay = nominal.saturating_add(extra).min(self.max).max(self.last);
        self.last = delay;
        self.attempts += 1;
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last = Duration::ZERO;
    }
}

/// Broadcast on every connection-level change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    RetryScheduled {
        attempt: u32,
        delay: Duration,
    },
}

struct ActiveLink {
    link: Arc<dyn RadioLink>,
    lost: CancellationToken,
}

struct MonitorInner {
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    active: RwLock<Option<ActiveLink>>,
}

/// Read side of the connection lifecycle, cheap to clone.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(MonitorInner {
                state,
                events,
                active: RwLock::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// The open link, only while Connected.
    pub fn link(&self) -> Option<Arc<dyn RadioLink>> {
        if self.state() != ConnectionState::Connected {
            return None;
        }
        self.read_active().as_ref().map(|a| a.link.clone())
    }

    /// Tell the supervisor the current link is unusable.
    pub fn report_link_lost(&self, reason: &str) {
        if let Some(active) = self.read_active().as_ref() {
            if !active.lost.is_cancelled() {
                warn!("Companion link reported lost: {}", reason);
                active.lost.cancel();
            }
        }
    }

    pub(crate) fn transition(&self, to: ConnectionState) {
        let from = self.inner.state.send_replace(to);
        if from != to {
            info!("Connection state: {} -> {}", from, to);
            let _ = self
                .inner
                .events
                .send(ConnectionEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.inner.events.send(event);
    }

    fn install(&self, link: Arc<dyn RadioLink>) -> CancellationToken {
        let lost = CancellationToken::new();
        *self.write_active() = Some(ActiveLink {
            link,
            lost: lost.clone(),
        });
        lost
    }

    fn clear(&self) {
        *self.write_active() = None;
    }

    fn read_active(&self) -> std::sync::RwLockReadGuard<'_, Option<ActiveLink>> {
        self.inner.active.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, Option<ActiveLink>> {
        self.inner.active.write().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct Supervisor {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) target: CompanionTarget,
    pub(crate) store: Arc<StateStore>,
    pub(crate) monitor: ConnectionMonitor,
    pub(crate) acks: AckRegistry,
    pub(crate) metrics: Arc<SyncMetrics>,
    pub(crate) settings: SessionSettings,
    pub(crate) cancel: CancellationToken,
}

impl Supervisor {
    /// Drive the connection until stopped or the retry ceiling is hit.
    pub async fn run(self) {
        let mut backoff = Backoff::new(
            self.settings.reconnect_initial,
            self.settings.reconnect_max,
            self.settings.reconnect_jitter,
        );
        self.monitor.transition(ConnectionState::Connecting);
        info!("Connecting to MeshCore companion via {}", self.target);

        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(&self.target) => result,
            };
            match attempt {
                Ok(connection) => {
                    let reason = self.serve(connection, &mut backoff).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!("Companion link lost: {}", reason);
                }
                Err(e) => warn!("Connect to {} failed: {}", self.target, e),
            }
            self.monitor.transition(ConnectionState::Reconnecting);

            if let Some(ceiling) = self.settings.reconnect_max_attempts {
                if backoff.attempts() >= ceiling {
                    error!(
                        "Giving up on {} after {} reconnect attempts",
                        self.target,
                        backoff.attempts()
                    );
                    // Release precedes Failed; reconnect() only starts from Failed.
                    self.connector.release(&self.target).await;
                    self.monitor.transition(ConnectionState::Failed);
                    return;
                }
            }
            let delay = backoff.next_delay();
            self.metrics.inc_reconnect_attempts();
            debug!(
                "Reconnect attempt {} in {} ms",
                backoff.attempts(),
                delay.as_millis()
            );
            self.monitor.emit(ConnectionEvent::RetryScheduled {
                attempt: backoff.attempts(),
                delay,
            });
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.monitor.clear();
        self.monitor.transition(ConnectionState::Disconnected);
        self.connector.release(&self.target).await;
    }

    /// Serve one open connection; returns why it ended.
    ///
    /// The backoff is only reset once the link answers a liveness ping, so a
    /// radio that accepts connections but fails right after still counts
    /// toward the retry ceiling.
    async fn serve(&self, connection: Connection, backoff: &mut Backoff) -> String {
        let Connection {
            link,
            mut events,
            self_info,
        } = connection;
        let lost = self.monitor.install(link.clone());
        self.monitor.transition(ConnectionState::Connected);

        let mut batch = Vec::new();
        if let Some(info) = self_info {
            batch.push(SyncEvent::SelfInfo(info));
        }
        let initial = collect_sync_batch(
            link.as_ref(),
            self.settings.drain_limit,
            self.settings.stale_after,
        );
        let initial = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = initial => Some(result),
        };
        match initial {
            None => {
                self.monitor.clear();
                link.disconnect().await;
                return "stopped".to_string();
            }
            Some(Ok(events)) => batch.extend(events),
            Some(Err(e)) => {
                self.monitor.clear();
                link.disconnect().await;
                return format!("initial sync failed: {}", e);
            }
        }
        let changed = self.store.apply_batch(batch);
        info!("Initial sync applied ({} change(s))", changed);

        let period = self.settings.liveness_interval.max(Duration::from_millis(1));
        let mut liveness = interval_at(Instant::now() + period, period);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = 'serve: loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break 'serve "stopped".to_string(),
                _ = lost.cancelled() => break 'serve "transport reported unreachable".to_string(),
                event = events.recv() => match event {
                    Some(event) => self.handle_event(link.as_ref(), event).await,
                    None => break 'serve "event stream closed".to_string(),
                },
                _ = liveness.tick() => {
                    let check = tokio::select! {
                        _ = self.cancel.cancelled() => break 'serve "stopped".to_string(),
                        check = timeout(self.settings.liveness_timeout, link.ping()) => check,
                    };
                    match check {
                        Ok(Ok(())) => {
                            trace!("Liveness check ok");
                            if backoff.attempts() > 0 {
                                debug!("Link healthy; reconnect backoff reset");
                                backoff.reset();
                            }
                        }
                        Ok(Err(e)) => break 'serve format!("liveness check failed: {}", e),
                        Err(_) => break 'serve "liveness check timed out".to_string(),
                    }
                }
            }
        };

        self.monitor.clear();
        link.disconnect().await;
        reason
    }

    async fn handle_event(&self, link: &dyn RadioLink, event: RadioEvent) {
        match event {
            RadioEvent::Message(text) => {
                debug!("Push message: {}", preview(&text.text, 64));
                self.store.apply(SyncEvent::InboundMessage(text));
            }
            RadioEvent::MessagesWaiting => {
                let drained = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    drained = link.drain_pending(self.settings.drain_limit) => drained,
                };
                match drained {
                    Ok(messages) => {
                        let batch = messages.into_iter().map(SyncEvent::InboundMessage).collect();
                        self.store.apply_batch(batch);
                    }
                    Err(e) => warn!("Pending message drain failed: {}", e),
                }
            }
            RadioEvent::SendConfirmed { ack, round_trip_ms } => {
                if !self.acks.resolve(ack) {
                    debug!("ACK {:08x} ({} ms) had no waiter", ack, round_trip_ms);
                }
            }
            RadioEvent::ContactAdvert(contact) => {
                info!("Discovered contact {} ({})", contact.name, contact.public_key);
                self.store.apply(SyncEvent::ContactMetadata(contact));
            }
            RadioEvent::Seen { public_key } => {
                self.store.apply(SyncEvent::ContactSeen {
                    public_key,
                    at: chrono::Utc::now(),
                });
            }
        }
    }
}
