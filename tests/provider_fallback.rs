//! Facade switching between live and simulated data.

mod common;

use common::{eventually, fast_settings, target, MockConnector, MockRadio};
use meshchat::model::{ConnectionState, ConversationId, DeliveryState};
use meshchat::provider::{DataProvider, SimulatedProvider};
use meshchat::sync::{FeedEvent, LiveSession, ProviderKind, Subscription};
use std::time::Duration;

/// Everything the feed delivers within `window`.
async fn drain(feed: &mut Subscription, window: Duration) -> Vec<FeedEvent> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, feed.recv()).await {
        events.push(event);
    }
    events
}

fn provider_changes(events: &[FeedEvent]) -> Vec<ProviderKind> {
    events
        .iter()
        .filter_map(|e| match e {
            FeedEvent::ProviderChanged(kind) => Some(*kind),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn disabling_live_switches_once_to_simulated() {
    let radio = MockRadio::with_channels(&["public", "#ops"]);
    let connector = MockConnector::new(radio, 0);
    let live = LiveSession::start(connector, target(), fast_settings());
    let provider = DataProvider::new(Some(live), SimulatedProvider::new(Duration::ZERO));
    assert_eq!(provider.provider_kind(), ProviderKind::Live);

    let mut feed = provider.subscribe();
    eventually("live sync", || provider.snapshot().channel("#ops").is_some()).await;

    provider.disable_live().await;
    let events = drain(&mut feed, Duration::from_millis(100)).await;
    assert_eq!(provider_changes(&events), vec![ProviderKind::Simulated]);
    assert_eq!(provider.provider_kind(), ProviderKind::Simulated);

    // Simulated data only; nothing from the live store leaks through.
    let snap = provider.snapshot();
    assert!(snap.channel("#ops").is_none());
    assert!(snap.channel("#harstine").is_some());
    assert_eq!(provider.connection_state(), ConnectionState::Disconnected);
    assert!(!provider.reconnect_live());
    provider.shutdown().await;
}

#[tokio::test]
async fn failed_live_falls_back_then_returns_after_reconnect() {
    let radio = MockRadio::with_channels(&["public"]);
    let connector = MockConnector::new(radio, 2);
    let mut settings = fast_settings();
    settings.reconnect_max_attempts = Some(1);
    let live = LiveSession::start(connector, target(), settings);
    let provider = DataProvider::new(Some(live), SimulatedProvider::new(Duration::ZERO));
    let mut feed = provider.subscribe();

    eventually("fallback", || provider.provider_kind() == ProviderKind::Simulated).await;
    let events = drain(&mut feed, Duration::from_millis(50)).await;
    assert_eq!(provider_changes(&events), vec![ProviderKind::Simulated]);
    assert!(events.iter().any(|e| matches!(
        e,
        FeedEvent::Connection(meshchat::sync::ConnectionEvent::StateChanged {
            to: ConnectionState::Failed,
            ..
        })
    )));

    // Sends go to the simulator while it is in front.
    let key = provider
        .send(&ConversationId::channel("#bot"), "anyone?")
        .unwrap();
    let sim_log = provider.snapshot().messages(&ConversationId::channel("#bot")).to_vec();
    assert_eq!(sim_log.last().map(|m| m.key.clone()), Some(key));
    assert_eq!(sim_log.last().map(|m| m.delivery), Some(DeliveryState::Acknowledged));

    assert!(provider.reconnect_live());
    eventually("back on live", || provider.provider_kind() == ProviderKind::Live).await;
    let events = drain(&mut feed, Duration::from_millis(50)).await;
    assert_eq!(provider_changes(&events), vec![ProviderKind::Live]);
    assert_eq!(provider.connection_state(), ConnectionState::Connected);
    eventually("live sync", || provider.snapshot().channel("public").is_some()).await;
    assert!(provider.snapshot().channel("#bot").is_none());
    provider.shutdown().await;
}
