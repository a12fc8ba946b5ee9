//! Messages from nodes the radio has not described yet, and their later rename.

mod common;

use common::{contact_text, eventually, fast_settings, target, MockConnector, MockRadio};
use meshchat::meshcore::{ChannelInfo, ContactInfo, IncomingText, RadioEvent, TextOrigin};
use meshchat::model::{ConnectionState, ConversationId, Sender};
use meshchat::sync::LiveSession;
use std::time::Duration;

#[tokio::test]
async fn unknown_prefix_becomes_named_contact_without_losing_history() {
    let radio = MockRadio::with_channels(&["public"]);
    radio.queue_pending(contact_text("A1B2", 1_700_000_000, "hi from the hills"));
    let connector = MockConnector::new(radio.clone(), 0);
    let mut settings = fast_settings();
    settings.refresh_interval = Duration::from_millis(10);
    let session = LiveSession::start(connector.clone(), target(), settings);

    let a1b2 = ConversationId::contact("a1b2");
    eventually("placeholder message", || session.snapshot().messages(&a1b2).len() == 1).await;
    let snap = session.snapshot();
    let placeholder = snap.contact("a1b2").expect("placeholder contact");
    assert!(placeholder.placeholder);
    assert_eq!(snap.messages(&a1b2)[0].sender, Sender::Contact("a1b2".into()));
    assert_eq!(snap.messages(&a1b2)[0].hops, Some(2));

    radio.set_contacts(vec![ContactInfo {
        public_key: "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6c7d8e9f0a1b2".into(),
        name: "Hilltop".into(),
        kind: 1,
        hops: Some(2),
        last_advert: 1_700_000_100,
    }]);
    eventually("renamed by refresh", || {
        session
            .snapshot()
            .contact("a1b2")
            .map(|c| c.display_name == "Hilltop" && !c.placeholder)
            .unwrap_or(false)
    })
    .await;

    let snap = session.snapshot();
    assert_eq!(snap.contacts.len(), 1);
    assert_eq!(snap.messages(&a1b2).len(), 1);
    assert_eq!(snap.messages(&a1b2)[0].body, "hi from the hills");

    // Same message pushed again, and later with the full key: still one entry.
    connector.push(RadioEvent::Message(contact_text("a1b2", 1_700_000_000, "hi from the hills")));
    connector.push(RadioEvent::Message(contact_text("a1b2", 1_700_000_050, "still here")));
    eventually("second message", || session.snapshot().messages(&a1b2).len() == 2).await;
    assert_eq!(session.metrics().duplicates_suppressed, 1);
    session.stop().await;
}

#[tokio::test]
async fn channel_slot_without_metadata_gets_placeholder_then_name() {
    let radio = MockRadio::with_channels(&["public"]);
    radio.queue_pending(IncomingText {
        origin: TextOrigin::Channel { index: 3 },
        sender_timestamp: 1_700_000_000,
        text: "Ranger: net starts at 7".into(),
        hops: None,
        snr: Some(6.5),
    });
    let connector = MockConnector::new(radio.clone(), 0);
    let mut settings = fast_settings();
    settings.refresh_interval = Duration::from_millis(10);
    let session = LiveSession::start(connector, target(), settings);

    eventually("placeholder channel", || {
        session.snapshot().channel("Channel 3").is_some()
    })
    .await;
    assert_eq!(session.connection_state(), ConnectionState::Connected);

    radio.metadata.lock().unwrap().channels.push(ChannelInfo {
        index: 3,
        name: "#net".into(),
        secret: None,
    });
    let net = ConversationId::channel("#net");
    eventually("renamed channel", || session.snapshot().messages(&net).len() == 1).await;
    let snap = session.snapshot();
    assert!(snap.channel("Channel 3").is_none());
    assert_eq!(snap.messages(&net)[0].sender, Sender::Remote("Ranger".into()));
    // The old id still resolves for sends and lookups.
    assert!(session.store().contains(&ConversationId::channel("Channel 3")));
    session.stop().await;
}
