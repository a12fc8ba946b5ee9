//! The consumer-facing event stream.

use log::warn;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::store::StoreUpdate;
use super::supervisor::ConnectionEvent;
use crate::error::SyncError;
use crate::model::MessageKey;

/// A send that ended in `Failed`, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    pub key: MessageKey,
    pub error: SyncError,
}

/// Which data source the facade is proxying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Live,
    Simulated,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Live => write!(f, "live"),
            ProviderKind::Simulated => write!(f, "simulated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    State(StoreUpdate),
    Connection(ConnectionEvent),
    Notice(FailureNotice),
    ProviderChanged(ProviderKind),
    /// Events were dropped for this subscriber; re-read the snapshot.
    Resync,
}

/// One consumer's view of the feed.
pub struct Subscription {
    rx: broadcast::Receiver<FeedEvent>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<FeedEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the provider is gone.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(n)) => {
                warn!("Feed subscriber lagged by {} event(s); requesting resync", n);
                Some(FeedEvent::Resync)
            }
            Err(RecvError::Closed) => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(n)) => {
                warn!("Feed subscriber lagged by {} event(s); requesting resync", n);
                Some(FeedEvent::Resync)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lagging_subscriber_gets_resync_then_continues() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::new(rx);
        for kind in [ProviderKind::Live, ProviderKind::Simulated, ProviderKind::Live] {
            tx.send(FeedEvent::ProviderChanged(kind)).unwrap();
        }
        assert_eq!(sub.recv().await, Some(FeedEvent::Resync));
        assert_eq!(sub.recv().await, Some(FeedEvent::ProviderChanged(ProviderKind::Simulated)));
        assert_eq!(sub.try_recv(), Some(FeedEvent::ProviderChanged(ProviderKind::Live)));
        assert_eq!(sub.try_recv(), None);
        drop(tx);
        assert_eq!(sub.recv().await, None);
    }
}
