//! Offline stand-in for a companion radio.
//!
//! Seeds a small fixed mesh (five channels, three contacts, a little history)
//! into its own [`StateStore`] and, while active, injects a synthetic message
//! every `interval`. Sends are acknowledged on the spot.

use chrono::Utc;
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::SimulatorConfig;
use crate::error::SyncError;
use crate::meshcore::{ChannelInfo, ContactInfo, IncomingText, TextOrigin};
use crate::metrics::SyncMetrics;
use crate::model::{ConversationId, DeliveryState, MessageKey, SelfInfo, Snapshot};
use crate::sync::{StateStore, SyncEvent};
use crate::validation::{validate_body, DEFAULT_MAX_TEXT_BYTES};

pub const SELF_NAME: &str = "LFPMan";

const CHANNELS: [&str; 5] = ["public", "#bot", "#edm", "#harstine", "FailureToFlood"];

/// (name, key byte) for each simulated contact.
const CONTACTS: [(&str, u8); 3] = [("LFPWoman", 0xb1), ("LFPKid", 0xc2), ("BotBot", 0xd3)];

const CHATTER: [&str; 8] = [
    "ping",
    "Anyone copy?",
    "path",
    "Signal is strong up here",
    "Heading out, 73",
    "Testing the new antenna",
    "Repeater looks healthy",
    "Foo\nBar\nBaz",
];

/// Deterministic 64-hex-char public key for a simulated node.
pub fn simulated_key(byte: u8) -> String {
    format!("{:02x}", byte).repeat(32)
}

pub struct SimulatedProvider {
    store: Arc<StateStore>,
    active: Arc<AtomicBool>,
    clock: Arc<AtomicU32>,
    interval: Duration,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedProvider {
    /// Build and seed. `interval` of zero disables synthetic traffic.
    pub fn new(interval: Duration) -> Self {
        let store = Arc::new(StateStore::new(Arc::new(SyncMetrics::new())));
        let provider = Self {
            store,
            active: Arc::new(AtomicBool::new(false)),
            clock: Arc::new(AtomicU32::new(Utc::now().timestamp().max(600) as u32 - 600)),
            interval,
            cancel: CancellationToken::new(),
            ticker: Mutex::new(None),
        };
        provider.seed();
        provider
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self::new(Duration::from_secs(config.interval_seconds))
    }

    fn seed(&self) {
        let mut batch = vec![SyncEvent::SelfInfo(SelfInfo {
            name: SELF_NAME.to_string(),
            public_key: Some(simulated_key(0xa0)),
        })];
        for (index, name) in CHANNELS.iter().enumerate() {
            batch.push(SyncEvent::ChannelMetadata(ChannelInfo {
                index: index as u8,
                name: name.to_string(),
                secret: None,
            }));
        }
        for (name, byte) in CONTACTS {
            batch.push(SyncEvent::ContactMetadata(ContactInfo {
                public_key: simulated_key(byte),
                name: name.to_string(),
                kind: 1,
                hops: Some(1),
                last_advert: self.clock.load(Ordering::Relaxed),
            }));
        }
        for (index, author, text) in [
            (0u8, "LFPMan", "Test 1"),
            (0, "LFPWoman", "Test 2"),
            (0, "LFPKid", "Test 3"),
            (1, "LFPMan", "T"),
            (1, "BotBot", "ping pong"),
            (1, "LFPKid", "path"),
            (1, "BotBot", "Foo\nBar\nBaz"),
        ] {
            batch.push(SyncEvent::InboundMessage(self.channel_text(index, author, text)));
        }
        batch.push(SyncEvent::InboundMessage(
            self.direct_text(0xc2, "Hello, this is a test"),
        ));
        self.store.apply_batch(batch);

        for (byte, text) in [(0xc2, "Coming through loud and clear"), (0xb1, "Testing from me to you")] {
            let conversation = ConversationId::contact(&simulated_key(byte));
            if let Ok(key) = self.store.queue_outbound(&conversation, text) {
                self.acknowledge(key);
            }
        }
        self.store.set_focus(None);
    }

    fn next_timestamp(&self) -> u32 {
        let now = Utc::now().timestamp().max(0) as u32;
        let prev = self.clock.fetch_max(now, Ordering::Relaxed);
        if prev >= now {
            self.clock.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            now
        }
    }

    fn channel_text(&self, index: u8, author: &str, text: &str) -> IncomingText {
        IncomingText {
            origin: TextOrigin::Channel { index },
            sender_timestamp: self.next_timestamp(),
            text: format!("{}: {}", author, text),
            hops: Some(1),
            snr: None,
        }
    }

    fn direct_text(&self, byte: u8, text: &str) -> IncomingText {
        IncomingText {
            origin: TextOrigin::Contact {
                prefix: simulated_key(byte)[..12].to_string(),
            },
            sender_timestamp: self.next_timestamp(),
            text: text.to_string(),
            hops: Some(1),
            snr: None,
        }
    }

    fn acknowledge(&self, key: MessageKey) {
        self.store.apply(SyncEvent::SendResult {
            key,
            delivery: DeliveryState::Acknowledged,
            attempts: 1,
        });
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn set_focus(&self, focus: Option<ConversationId>) {
        self.store.set_focus(focus);
    }

    /// Append and immediately acknowledge an outbound message.
    pub fn send(&self, conversation: &ConversationId, body: &str) -> Result<MessageKey, SyncError> {
        validate_body(body, DEFAULT_MAX_TEXT_BYTES)?;
        let key = self.store.queue_outbound(conversation, body)?;
        self.acknowledge(key.clone());
        debug!("Simulated send to {} acknowledged", conversation);
        Ok(key)
    }

    /// Inject one synthetic message. Returns false while inactive.
    pub fn tick(&self) -> bool {
        if !self.is_active() {
            return false;
        }
        let text = {
            let mut rng = rand::thread_rng();
            let line = CHATTER.choose(&mut rng).copied().unwrap_or("ping");
            let (name, byte) = CONTACTS[rng.gen_range(0..CONTACTS.len())];
            if rng.gen_bool(0.75) {
                let index = rng.gen_range(0..CHANNELS.len()) as u8;
                self.channel_text(index, name, line)
            } else {
                self.direct_text(byte, line)
            }
        };
        self.store.apply(SyncEvent::InboundMessage(text))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Pause or resume synthetic traffic; the ticker starts on first activation.
    pub fn set_active(self: &Arc<Self>, active: bool) {
        self.active.store(active, Ordering::Relaxed);
        if !active || self.interval.is_zero() {
            return;
        }
        let mut ticker = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if ticker.is_some() {
            return;
        }
        info!("Simulator generating traffic every {:?}", self.interval);
        let provider = Arc::clone(self);
        let cancel = self.cancel.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + provider.interval, provider.interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {
                        provider.tick();
                    }
                }
            }
        }));
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SimulatedProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
