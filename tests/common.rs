//! Test utilities & fixtures.
//! A scripted in-memory companion radio and connector for session-level tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use meshchat::error::TransportError;
use meshchat::meshcore::{
    ChannelInfo, CompanionTarget, Connection, Connector, ContactInfo, IncomingText, Metadata,
    RadioEvent, RadioLink, SendOutcome, TextOrigin, TextTarget, TransportKind,
};
use meshchat::model::SelfInfo;
use meshchat::sync::{SendPolicy, SessionSettings};

/// Records every command and answers from a script.
#[derive(Default)]
pub struct MockRadio {
    pub metadata: Mutex<Metadata>,
    pub pending: Mutex<Vec<IncomingText>>,
    /// Outcomes for successive sends; `Accepted` once empty.
    pub script: Mutex<VecDeque<Result<SendOutcome, TransportError>>>,
    pub sent: Mutex<Vec<(TextTarget, String, u8)>>,
    pub metadata_fetches: AtomicUsize,
    /// Every metadata fetch times out while set.
    pub fail_metadata: AtomicBool,
    /// Added to every metadata fetch.
    pub metadata_delay: Mutex<Duration>,
    /// The next N pings fail.
    pub ping_failures: AtomicUsize,
    /// Added to every ping.
    pub ping_delay: Mutex<Duration>,
    pub pings: AtomicUsize,
}

impl MockRadio {
    pub fn with_channels(names: &[&str]) -> Arc<Self> {
        let radio = MockRadio::default();
        radio.metadata.lock().unwrap().channels = names
            .iter()
            .enumerate()
            .map(|(i, name)| ChannelInfo {
                index: i as u8,
                name: name.to_string(),
                secret: None,
            })
            .collect();
        Arc::new(radio)
    }

    pub fn set_contacts(&self, contacts: Vec<ContactInfo>) {
        self.metadata.lock().unwrap().contacts = contacts;
    }

    pub fn queue_pending(&self, text: IncomingText) {
        self.pending.lock().unwrap().push(text);
    }

    pub fn script(&self, outcomes: Vec<Result<SendOutcome, TransportError>>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn sent(&self) -> Vec<(TextTarget, String, u8)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn set_metadata_delay(&self, delay: Duration) {
        *self.metadata_delay.lock().unwrap() = delay;
    }

    pub fn set_ping_delay(&self, delay: Duration) {
        *self.ping_delay.lock().unwrap() = delay;
    }

    pub fn fail_pings(&self, count: usize) {
        self.ping_failures.store(count, Ordering::SeqCst);
    }

    pub fn fetches(&self) -> usize {
        self.metadata_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioLink for MockRadio {
    async fn send_text(
        &self,
        target: &TextTarget,
        text: &str,
        attempt: u8,
    ) -> Result<SendOutcome, TransportError> {
        self.sent
            .lock()
            .unwrap()
            .push((target.clone(), text.to_string(), attempt));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(SendOutcome::Accepted))
    }

    async fn fetch_metadata(&self) -> Result<Metadata, TransportError> {
        self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.metadata_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout("GET_CONTACTS".into()));
        }
        Ok(self.metadata.lock().unwrap().clone())
    }

    async fn drain_pending(&self, limit: usize) -> Result<Vec<IncomingText>, TransportError> {
        let mut pending = self.pending.lock().unwrap();
        let n = pending.len().min(limit);
        Ok(pending.drain(..n).collect())
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        let delay = *self.ping_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let left = self.ping_failures.load(Ordering::SeqCst);
        if left > 0 {
            if left != usize::MAX {
                self.ping_failures.store(left - 1, Ordering::SeqCst);
            }
            return Err(TransportError::Timeout("DEVICE_QUERY".into()));
        }
        Ok(())
    }

    async fn disconnect(&self) {}
}

/// Fails the first `failures` connects, then hands out `radio`.
pub struct MockConnector {
    pub radio: Arc<MockRadio>,
    failures_left: AtomicUsize,
    pub connects: AtomicUsize,
    pub releases: AtomicUsize,
    events: Mutex<Option<mpsc::UnboundedSender<RadioEvent>>>,
}

impl MockConnector {
    pub fn new(radio: Arc<MockRadio>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            radio,
            failures_left: AtomicUsize::new(failures),
            connects: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            events: Mutex::new(None),
        })
    }

    pub fn unreachable() -> Arc<Self> {
        Self::new(Arc::new(MockRadio::default()), usize::MAX)
    }

    pub fn push(&self, event: RadioEvent) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Close the current event stream, as a dropped link would.
    pub fn drop_link(&self) {
        self.events.lock().unwrap().take();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _target: &CompanionTarget) -> Result<Connection, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            if left != usize::MAX {
                self.failures_left.store(left - 1, Ordering::SeqCst);
            }
            return Err(TransportError::Unreachable("mock radio is off".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        Ok(Connection {
            link: self.radio.clone(),
            events: rx,
            self_info: Some(SelfInfo {
                name: "Mock Companion".into(),
                public_key: None,
            }),
        })
    }

    async fn release(&self, _target: &CompanionTarget) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn target() -> CompanionTarget {
    CompanionTarget {
        kind: TransportKind::Tcp,
        endpoint: "127.0.0.1:5000".into(),
        device: "auto".into(),
        baud_rate: 115200,
    }
}

/// Millisecond-scale timings so sessions settle quickly.
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        reconnect_initial: Duration::from_millis(5),
        reconnect_max: Duration::from_millis(40),
        reconnect_jitter: 0.5,
        reconnect_max_attempts: Some(4),
        liveness_interval: Duration::from_secs(60),
        liveness_timeout: Duration::from_secs(5),
        refresh_interval: Duration::from_secs(3600),
        drain_limit: 50,
        stale_after: chrono::Duration::hours(24),
        send: SendPolicy {
            max_attempts: 3,
            ack_timeout: Duration::from_secs(2),
            retry_delays: vec![Duration::from_millis(5), Duration::from_millis(10)],
            max_text_bytes: 133,
        },
    }
}

pub fn contact_text(prefix: &str, timestamp: u32, text: &str) -> IncomingText {
    IncomingText {
        origin: TextOrigin::Contact {
            prefix: prefix.into(),
        },
        sender_timestamp: timestamp,
        text: text.into(),
        hops: Some(2),
        snr: None,
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
