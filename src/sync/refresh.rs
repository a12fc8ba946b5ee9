//! Periodic metadata refresh and pending-message drain.

use chrono::Utc;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::store::{StateStore, SyncEvent};
use super::supervisor::ConnectionMonitor;
use crate::error::TransportError;
use crate::meshcore::RadioLink;
use crate::metrics::SyncMetrics;

/// Everything one sync pass learns from the radio, as a single batch.
pub(crate) async fn collect_sync_batch(
    link: &dyn RadioLink,
    drain_limit: usize,
    stale_after: chrono::Duration,
) -> Result<Vec<SyncEvent>, TransportError> {
    let metadata = link.fetch_metadata().await?;
    let pending = link.drain_pending(drain_limit).await?;
    debug!(
        "Sync pass: {} channel(s), {} contact(s), {} pending message(s)",
        metadata.channels.len(),
        metadata.contacts.len(),
        pending.len()
    );

    let mut batch = Vec::with_capacity(metadata.channels.len() + metadata.contacts.len() + pending.len() + 1);
    batch.extend(metadata.channels.into_iter().map(SyncEvent::ChannelMetadata));
    batch.extend(metadata.contacts.into_iter().map(SyncEvent::ContactMetadata));
    batch.extend(pending.into_iter().map(SyncEvent::InboundMessage));
    batch.push(SyncEvent::StaleSweep {
        now: Utc::now(),
        max_age: stale_after,
    });
    Ok(batch)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Not connected; no transport call was made.
    Skipped,
    /// Applied; carries the number of events that changed state.
    Applied(usize),
    Failed(TransportError),
    /// Stopped mid-pass; nothing was applied.
    Cancelled,
}

pub struct RefreshScheduler {
    store: Arc<StateStore>,
    monitor: ConnectionMonitor,
    metrics: Arc<SyncMetrics>,
    period: Duration,
    drain_limit: usize,
    stale_after: chrono::Duration,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<StateStore>,
        monitor: ConnectionMonitor,
        period: Duration,
        drain_limit: usize,
        stale_after: chrono::Duration,
    ) -> Self {
        let metrics = store.metrics().clone();
        Self {
            store,
            monitor,
            metrics,
            period: period.max(Duration::from_millis(1)),
            drain_limit,
            stale_after,
        }
    }

    /// Run one refresh pass if the link is up.
    pub async fn tick(&self) -> RefreshOutcome {
        self.tick_until(&CancellationToken::new()).await
    }

    /// Like [`RefreshScheduler::tick`], but abandons the pass without
    /// touching the store as soon as `cancel` fires.
    pub async fn tick_until(&self, cancel: &CancellationToken) -> RefreshOutcome {
        let Some(link) = self.monitor.link() else {
            self.metrics.inc_refresh_skipped();
            debug!("Refresh skipped: not connected");
            return RefreshOutcome::Skipped;
        };
        self.metrics.inc_refresh_ticks();
        let collected = tokio::select! {
            _ = cancel.cancelled() => None,
            collected = collect_sync_batch(link.as_ref(), self.drain_limit, self.stale_after) => Some(collected),
        };
        let Some(collected) = collected.filter(|_| !cancel.is_cancelled()) else {
            debug!("Refresh abandoned: session stopping");
            return RefreshOutcome::Cancelled;
        };
        match collected {
            Ok(batch) => RefreshOutcome::Applied(self.store.apply_batch(batch)),
            Err(e) => {
                warn!("Refresh failed: {}", e);
                if matches!(e, TransportError::Unreachable(_)) {
                    self.monitor.report_link_lost("refresh could not reach the radio");
                }
                RefreshOutcome::Failed(e)
            }
        }
    }

    /// Tick every `period` until cancelled. Slow passes skip missed ticks
    /// rather than bunching them up.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if self.tick_until(&cancel).await == RefreshOutcome::Cancelled {
                            break;
                        }
                    }
                }
            }
            debug!("Refresh scheduler stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ConnectionState;

    #[tokio::test]
    async fn tick_is_skipped_while_disconnected() {
        let metrics = Arc::new(SyncMetrics::new());
        let store = Arc::new(StateStore::new(metrics.clone()));
        let monitor = ConnectionMonitor::new();
        let scheduler = RefreshScheduler::new(
            store.clone(),
            monitor.clone(),
            Duration::from_secs(30),
            10,
            chrono::Duration::hours(24),
        );
        assert_eq!(scheduler.tick().await, RefreshOutcome::Skipped);
        monitor.transition(ConnectionState::Reconnecting);
        assert_eq!(scheduler.tick().await, RefreshOutcome::Skipped);
        let snap = metrics.snapshot();
        assert_eq!(snap.refresh_skipped, 2);
        assert_eq!(snap.refresh_ticks, 0);
        assert_eq!(store.revision(), 0);
    }
}
