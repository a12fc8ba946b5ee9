//! Outbound sends: optimistic append, dispatch, ACK wait, bounded retries.
//!
//! `send` returns as soon as the Pending message is in the store; the rest of
//! the life of the message runs on its own task and is reported through
//! `SendResult` events (and a [`FailureNotice`] when it ends in Failed).

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};

use super::feed::FailureNotice;
use super::store::{StateStore, SyncEvent};
use super::supervisor::ConnectionMonitor;
use crate::config::SendConfig;
use crate::error::{SyncError, TransportError};
use crate::logutil::preview;
use crate::meshcore::{SendOutcome, TextTarget};
use crate::metrics::SyncMetrics;
use crate::model::{ConversationId, DeliveryState, MessageKey};
use crate::validation::validate_body;

/// Confirmations that arrived before anyone waited for them.
const EARLY_ACK_LIMIT: usize = 64;

#[derive(Default)]
struct AckTable {
    waiters: HashMap<u32, oneshot::Sender<()>>,
    early: VecDeque<u32>,
}

/// Matches `SEND_CONFIRMED` pushes to the sends waiting on them.
#[derive(Clone, Default)]
pub struct AckRegistry {
    table: Arc<Mutex<AckTable>>,
}

impl AckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `ack`. Resolves immediately if it was already confirmed.
    pub fn register(&self, ack: u32) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();
        if let Some(pos) = table.early.iter().position(|a| *a == ack) {
            table.early.remove(pos);
            let _ = tx.send(());
        } else {
            table.waiters.insert(ack, tx);
        }
        rx
    }

    /// Returns whether a waiter was woken.
    pub fn resolve(&self, ack: u32) -> bool {
        let mut table = self.lock();
        match table.waiters.remove(&ack) {
            Some(tx) => tx.send(()).is_ok(),
            None => {
                if table.early.len() >= EARLY_ACK_LIMIT {
                    table.early.pop_front();
                }
                table.early.push_back(ack);
                false
            }
        }
    }

    pub fn cancel(&self, ack: u32) {
        self.lock().waiters.remove(&ack);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AckTable> {
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendPolicy {
    pub max_attempts: u8,
    pub ack_timeout: Duration,
    /// Delay before each retry; the last entry repeats.
    pub retry_delays: Vec<Duration>,
    pub max_text_bytes: usize,
}

impl SendPolicy {
    pub fn from_config(send: &SendConfig) -> Self {
        Self {
            max_attempts: send.max_attempts.max(1),
            ack_timeout: send.ack_timeout(),
            retry_delays: send
                .retry_backoff_seconds
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            max_text_bytes: send.max_text_bytes,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn retry_delay(&self, retry: u8) -> Duration {
        let idx = (retry.max(1) as usize - 1).min(self.retry_delays.len().saturating_sub(1));
        self.retry_delays
            .get(idx)
            .copied()
            .unwrap_or(Duration::from_secs(4))
    }
}

impl Default for SendPolicy {
    fn default() -> Self {
        Self::from_config(&SendConfig::default())
    }
}

#[derive(Clone)]
pub struct SendCoordinator {
    store: Arc<StateStore>,
    monitor: ConnectionMonitor,
    acks: AckRegistry,
    metrics: Arc<SyncMetrics>,
    notices: broadcast::Sender<FailureNotice>,
    policy: SendPolicy,
}

impl SendCoordinator {
    pub fn new(
        store: Arc<StateStore>,
        monitor: ConnectionMonitor,
        acks: AckRegistry,
        notices: broadcast::Sender<FailureNotice>,
        policy: SendPolicy,
    ) -> Self {
        let metrics = store.metrics().clone();
        Self {
            store,
            monitor,
            acks,
            metrics,
            notices,
            policy,
        }
    }

    /// Queue `body` for `conversation` and start delivering it.
    ///
    /// Validation failures, unknown conversations and a down link are reported
    /// here without touching the store or the radio.
    pub fn send(&self, conversation: &ConversationId, body: &str) -> Result<MessageKey, SyncError> {
        validate_body(body, self.policy.max_text_bytes)?;
        if !self.store.contains(conversation) {
            return Err(SyncError::UnknownConversation(conversation.clone()));
        }
        if self.monitor.link().is_none() {
            return Err(SyncError::NotConnected);
        }
        let key = self.store.queue_outbound(conversation, body)?;
        info!("Queued {} #{}: {}", key.conversation, key.seq, preview(body, 48));
        tokio::spawn(self.clone().deliver(key.clone(), body.to_string()));
        Ok(key)
    }

    async fn deliver(self, key: MessageKey, body: String) {
        let Some(target) = self.store.resolve_target(&key.conversation) else {
            self.fail(
                &key,
                0,
                SyncError::SendRejected(format!("{} has no radio address", key.conversation)),
            );
            return;
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            self.metrics.inc_sends_dispatched();
            if attempt > 1 {
                self.metrics.inc_send_retries();
            }
            let sent_at = Instant::now();
            match self.dispatch(&target, &body, attempt).await {
                Ok(SendOutcome::Accepted) => {
                    self.acknowledged(&key, attempt, sent_at);
                    return;
                }
                Ok(SendOutcome::AwaitAck { ack, timeout }) => {
                    self.mark(&key, DeliveryState::Sent, attempt);
                    let wait = self.policy.ack_timeout.max(timeout);
                    let waiter = self.acks.register(ack);
                    match tokio::time::timeout(wait, waiter).await {
                        Ok(Ok(())) => {
                            self.acknowledged(&key, attempt, sent_at);
                            return;
                        }
                        _ => {
                            self.acks.cancel(ack);
                            debug!("No ACK {:08x} for #{} within {:?}", ack, key.seq, wait);
                        }
                    }
                }
                Err(TransportError::Rejected(reason)) => {
                    self.fail(&key, attempt, SyncError::SendRejected(reason));
                    return;
                }
                Err(e) => {
                    warn!("Send #{} attempt {} failed: {}", key.seq, attempt, e);
                    if matches!(e, TransportError::Unreachable(_)) {
                        self.monitor.report_link_lost("send could not reach the radio");
                    }
                }
            }

            if attempt >= self.policy.max_attempts {
                self.fail(&key, attempt, SyncError::SendTimeoutExhausted { attempts: attempt });
                return;
            }
            let delay = self.policy.retry_delay(attempt);
            debug!(
                "Retrying #{} in {:?} (attempt {}/{})",
                key.seq,
                delay,
                attempt + 1,
                self.policy.max_attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn dispatch(
        &self,
        target: &TextTarget,
        body: &str,
        attempt: u8,
    ) -> Result<SendOutcome, TransportError> {
        match self.monitor.link() {
            Some(link) => link.send_text(target, body, attempt - 1).await,
            None => Err(TransportError::Unreachable("no open companion link".into())),
        }
    }

    fn mark(&self, key: &MessageKey, delivery: DeliveryState, attempts: u8) {
        self.store.apply(SyncEvent::SendResult {
            key: key.clone(),
            delivery,
            attempts,
        });
    }

    fn acknowledged(&self, key: &MessageKey, attempts: u8, sent_at: Instant) {
        self.mark(key, DeliveryState::Acknowledged, attempts);
        self.metrics.inc_sends_acked();
        self.metrics.observe_ack_latency(sent_at);
        info!(
            "Delivered {} #{} attempts={} latency_ms={}",
            key.conversation,
            key.seq,
            attempts,
            sent_at.elapsed().as_millis()
        );
    }

    fn fail(&self, key: &MessageKey, attempts: u8, error: SyncError) {
        self.mark(key, DeliveryState::Failed, attempts);
        self.metrics.inc_sends_failed();
        warn!("Failed {} #{}: {}", key.conversation, key.seq, error);
        let _ = self.notices.send(FailureNotice {
            key: key.clone(),
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn registered_waiter_is_woken_by_its_ack() {
        let acks = AckRegistry::new();
        let mut waiter = task::spawn(acks.register(0xDEAD_BEEF));
        assert_pending!(waiter.poll());
        assert!(!acks.resolve(0x1234));
        assert_pending!(waiter.poll());
        assert!(acks.resolve(0xDEAD_BEEF));
        assert!(waiter.is_woken());
        assert!(assert_ready!(waiter.poll()).is_ok());
    }

    #[test]
    fn ack_arriving_first_is_remembered() {
        let acks = AckRegistry::new();
        assert!(!acks.resolve(7));
        let mut waiter = task::spawn(acks.register(7));
        assert!(assert_ready!(waiter.poll()).is_ok());
        // consumed
        let mut second = task::spawn(acks.register(7));
        assert_pending!(second.poll());
    }

    #[test]
    fn early_acks_are_bounded() {
        let acks = AckRegistry::new();
        for ack in 0..(EARLY_ACK_LIMIT as u32 + 10) {
            acks.resolve(ack);
        }
        let mut oldest = task::spawn(acks.register(0));
        assert_pending!(oldest.poll());
        let mut newest = task::spawn(acks.register(EARLY_ACK_LIMIT as u32 + 9));
        assert!(assert_ready!(newest.poll()).is_ok());
    }

    #[test]
    fn policy_repeats_last_retry_delay() {
        let policy = SendPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_delay(1), Duration::from_secs(4));
        assert_eq!(policy.retry_delay(3), Duration::from_secs(16));
        assert_eq!(policy.retry_delay(9), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn send_checks_body_then_conversation_then_link() {
        let store = Arc::new(StateStore::new(Arc::new(SyncMetrics::new())));
        let (notices, _) = broadcast::channel(8);
        let coordinator = SendCoordinator::new(
            store.clone(),
            ConnectionMonitor::new(),
            AckRegistry::new(),
            notices,
            SendPolicy::default(),
        );
        let public = ConversationId::channel("public");
        assert_eq!(coordinator.send(&public, "   "), Err(SyncError::EmptyMessage));
        assert!(matches!(
            coordinator.send(&public, &"x".repeat(200)),
            Err(SyncError::MessageTooLong { len: 200, .. })
        ));
        assert_eq!(
            coordinator.send(&public, "hello"),
            Err(SyncError::UnknownConversation(public.clone()))
        );
        store.apply(SyncEvent::ChannelMetadata(crate::meshcore::ChannelInfo {
            index: 0,
            name: "public".into(),
            secret: None,
        }));
        assert_eq!(coordinator.send(&public, "hello"), Err(SyncError::NotConnected));
        assert!(store.snapshot().messages(&public).is_empty());
    }
}
