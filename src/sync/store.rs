//! Canonical in-memory state: channels, contacts and per-conversation logs.
//!
//! All mutation goes through [`StateStore::apply`], [`StateStore::apply_batch`]
//! or [`StateStore::queue_outbound`]. Each call takes the single state lock,
//! applies its merge, bumps the revision and broadcasts one [`StoreUpdate`]
//! before releasing the lock, so notifications arrive in revision order and a
//! snapshot taken after a notification is never older than it.

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::error::SyncError;
use crate::logutil::preview;
use crate::meshcore::{ChannelInfo, ContactInfo, IncomingText, TextOrigin, TextTarget};
use crate::metrics::SyncMetrics;
use crate::model::{
    normalize_prefix, Channel, Contact, ConversationId, DeliveryState, Direction, Message,
    MessageKey, RadioId, SelfInfo, Sender, Snapshot,
};

const UPDATE_BUFFER: usize = 256;
const UNKNOWN_SENDER: &str = "Unknown sender";

/// Mutations the reconciler understands.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ChannelMetadata(ChannelInfo),
    ContactMetadata(ContactInfo),
    InboundMessage(IncomingText),
    SendResult {
        key: MessageKey,
        delivery: DeliveryState,
        attempts: u8,
    },
    SelfInfo(SelfInfo),
    /// A node advertised; refreshes `last_seen` of a known contact.
    ContactSeen {
        public_key: String,
        at: DateTime<Utc>,
    },
    /// Flag contacts not seen within `max_age` of `now`.
    StaleSweep {
        now: DateTime<Utc>,
        max_age: chrono::Duration,
    },
}

/// What one revision changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Channels,
    Contacts,
    MessageAdded(MessageKey),
    Delivery {
        key: MessageKey,
        state: DeliveryState,
    },
    SelfInfo,
    Focus(Option<ConversationId>),
}

/// Broadcast after every state-changing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreUpdate {
    pub revision: u64,
    pub changes: Vec<Change>,
}

#[derive(Debug, Default)]
struct ConversationLog {
    messages: Vec<Message>,
    next_seq: u64,
    seen: HashSet<RadioId>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    channels: Vec<Channel>,
    contacts: Vec<Contact>,
    logs: HashMap<ConversationId, ConversationLog>,
    /// Old conversation ids of renamed channels.
    aliases: HashMap<ConversationId, ConversationId>,
    self_info: SelfInfo,
    focus: Option<ConversationId>,
}

pub struct StateStore {
    inner: Mutex<Inner>,
    updates: broadcast::Sender<StoreUpdate>,
    metrics: Arc<SyncMetrics>,
}

impl StateStore {
    pub fn new(metrics: Arc<SyncMetrics>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            inner: Mutex::new(Inner::default()),
            updates,
            metrics,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreUpdate> {
        self.updates.subscribe()
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking writer leaves whole merges behind; the data stays usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, inner: &mut Inner, changes: Vec<Change>) -> u64 {
        inner.revision += 1;
        let _ = self.updates.send(StoreUpdate {
            revision: inner.revision,
            changes,
        });
        inner.revision
    }

    /// Apply one event. Returns whether anything changed.
    pub fn apply(&self, event: SyncEvent) -> bool {
        let mut inner = self.lock();
        let mut changes = Vec::new();
        merge(&mut inner, event, &mut changes, &self.metrics);
        if changes.is_empty() {
            return false;
        }
        self.publish(&mut inner, changes);
        true
    }

    /// Apply many events under one lock and publish them as one revision.
    pub fn apply_batch(&self, events: Vec<SyncEvent>) -> usize {
        let mut inner = self.lock();
        let mut changes = Vec::new();
        for event in events {
            merge(&mut inner, event, &mut changes, &self.metrics);
        }
        if changes.is_empty() {
            return 0;
        }
        changes.dedup();
        let count = changes.len();
        self.publish(&mut inner, changes);
        count
    }

    /// Append a Pending outbound message to an existing conversation.
    pub fn queue_outbound(
        &self,
        conversation: &ConversationId,
        body: &str,
    ) -> Result<MessageKey, SyncError> {
        let mut inner = self.lock();
        let conversation = canonical(&inner, conversation)
            .ok_or_else(|| SyncError::UnknownConversation(conversation.clone()))?;
        let now = Utc::now();
        touch(&mut inner, &conversation, now, false);
        let log = inner.logs.entry(conversation.clone()).or_default();
        log.next_seq += 1;
        let key = MessageKey {
            conversation,
            seq: log.next_seq,
        };
        log.messages.push(Message {
            key: key.clone(),
            radio_id: None,
            sender: Sender::Local,
            body: body.to_string(),
            timestamp: now,
            direction: Direction::Outbound,
            delivery: DeliveryState::Pending,
            hops: None,
            attempts: 0,
        });
        self.publish(&mut inner, vec![Change::MessageAdded(key.clone())]);
        Ok(key)
    }

    /// Record which conversation the consumer is viewing and clear its unread count.
    pub fn set_focus(&self, focus: Option<ConversationId>) {
        let mut inner = self.lock();
        let focus = focus.map(|c| canonical(&inner, &c).unwrap_or(c));
        if let Some(conversation) = &focus {
            clear_unread(&mut inner, conversation);
        }
        inner.focus = focus.clone();
        self.publish(&mut inner, vec![Change::Focus(focus)]);
    }

    pub fn contains(&self, conversation: &ConversationId) -> bool {
        canonical(&self.lock(), conversation).is_some()
    }

    /// Radio address for a conversation, if the radio can reach it.
    pub fn resolve_target(&self, conversation: &ConversationId) -> Option<TextTarget> {
        let inner = self.lock();
        match canonical(&inner, conversation)? {
            ConversationId::Channel(name) => inner
                .channels
                .iter()
                .find(|c| c.name == name)
                .and_then(|c| c.index)
                .map(|index| TextTarget::Channel { index }),
            ConversationId::Contact(prefix) => {
                let contact = inner.contacts.iter().find(|c| c.prefix == prefix)?;
                Some(TextTarget::Contact {
                    public_key: contact.public_key.clone().unwrap_or_else(|| contact.prefix.clone()),
                })
            }
        }
    }

    pub fn delivery_of(&self, key: &MessageKey) -> Option<DeliveryState> {
        let inner = self.lock();
        find_message(&inner, key).map(|m| m.delivery)
    }

    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    pub fn snapshot(&self) -> Snapshot {
        let inner = self.lock();
        Snapshot {
            revision: inner.revision,
            channels: inner.channels.clone(),
            contacts: inner.contacts.clone(),
            conversations: inner
                .logs
                .iter()
                .map(|(id, log)| (id.clone(), log.messages.clone()))
                .collect(),
            self_info: inner.self_info.clone(),
            focus: inner.focus.clone(),
        }
    }
}

fn merge(inner: &mut Inner, event: SyncEvent, changes: &mut Vec<Change>, metrics: &SyncMetrics) {
    match event {
        SyncEvent::ChannelMetadata(info) => {
            if merge_channel(inner, info) {
                changes.push(Change::Channels);
            }
        }
        SyncEvent::ContactMetadata(info) => {
            if merge_contact(inner, info) {
                changes.push(Change::Contacts);
            }
        }
        SyncEvent::InboundMessage(text) => merge_inbound(inner, text, changes, metrics),
        SyncEvent::SendResult {
            key,
            delivery,
            attempts,
        } => {
            let key = resolve_alias(inner, key);
            let Some(message) = find_message_mut(inner, &key) else {
                debug!("Send result for unknown message {}", key);
                return;
            };
            let mut changed = false;
            if attempts > message.attempts {
                message.attempts = attempts;
                changed = true;
            }
            if message.delivery.can_advance_to(delivery) {
                message.delivery = delivery;
                changes.push(Change::Delivery {
                    key,
                    state: delivery,
                });
            } else if changed {
                changes.push(Change::Delivery {
                    key,
                    state: message.delivery,
                });
            }
        }
        SyncEvent::SelfInfo(info) => {
            if inner.self_info != info {
                inner.self_info = info;
                changes.push(Change::SelfInfo);
            }
        }
        SyncEvent::ContactSeen { public_key, at } => {
            if let Some(contact) = find_contact_mut(inner, &public_key) {
                let fresher = contact.last_seen.map(|seen| at > seen).unwrap_or(true);
                if fresher || contact.stale {
                    contact.last_seen = Some(at.max(contact.last_seen.unwrap_or(at)));
                    contact.stale = false;
                    changes.push(Change::Contacts);
                }
            }
        }
        SyncEvent::StaleSweep { now, max_age } => {
            let mut flipped = 0;
            for contact in inner.contacts.iter_mut() {
                let stale = contact
                    .last_seen
                    .map(|seen| now - seen > max_age)
                    .unwrap_or(false);
                if stale != contact.stale {
                    contact.stale = stale;
                    flipped += 1;
                }
            }
            if flipped > 0 {
                debug!("Stale sweep flipped {} contact(s)", flipped);
                changes.push(Change::Contacts);
            }
        }
    }
}

fn merge_channel(inner: &mut Inner, info: ChannelInfo) -> bool {
    let name = info.name.trim().to_string();
    if name.is_empty() {
        return false;
    }
    if let Some(pos) = inner.channels.iter().position(|c| c.name == name) {
        // Another channel holding this slot loses it; the slot moved.
        for other in inner.channels.iter_mut() {
            if other.name != name && other.index == Some(info.index) {
                other.index = None;
            }
        }
        let channel = &mut inner.channels[pos];
        let changed = channel.index != Some(info.index) || channel.placeholder || channel.label != name;
        channel.index = Some(info.index);
        channel.label = name;
        channel.placeholder = false;
        return changed;
    }
    if let Some(pos) = inner
        .channels
        .iter()
        .position(|c| c.index == Some(info.index))
    {
        let old = ConversationId::channel(inner.channels[pos].name.clone());
        let new = ConversationId::channel(name.clone());
        info!(
            "Channel slot {} renamed '{}' -> '{}'",
            info.index, inner.channels[pos].name, name
        );
        let channel = &mut inner.channels[pos];
        channel.name = name.clone();
        channel.label = name;
        channel.placeholder = false;
        rekey(inner, &old, &new);
        return true;
    }
    inner.channels.push(Channel::new(name, Some(info.index)));
    true
}

/// Move a conversation log to a new id, keeping sequence numbers.
fn rekey(inner: &mut Inner, old: &ConversationId, new: &ConversationId) {
    if let Some(mut log) = inner.logs.remove(old) {
        for message in log.messages.iter_mut() {
            message.key.conversation = new.clone();
        }
        inner.logs.insert(new.clone(), log);
    }
    for target in inner.aliases.values_mut() {
        if target == old {
            *target = new.clone();
        }
    }
    inner.aliases.insert(old.clone(), new.clone());
    if inner.focus.as_ref() == Some(old) {
        inner.focus = Some(new.clone());
    }
}

fn merge_contact(inner: &mut Inner, info: ContactInfo) -> bool {
    let key = normalize_prefix(&info.public_key);
    if key.is_empty() {
        return false;
    }
    let name = if info.name.trim().is_empty() {
        key.chars().take(8).collect()
    } else {
        info.name.trim().to_string()
    };
    let advertised = advert_time(info.last_advert);
    match find_contact_mut(inner, &key) {
        Some(contact) => {
            let before = contact.clone();
            contact.public_key = Some(key);
            contact.display_name = name;
            contact.hops = info.hops;
            contact.placeholder = false;
            if let Some(at) = advertised {
                if contact.last_seen.map(|seen| at > seen).unwrap_or(true) {
                    contact.last_seen = Some(at);
                }
            }
            *contact != before
        }
        None => {
            inner.contacts.push(Contact {
                prefix: key.clone(),
                public_key: Some(key),
                display_name: name,
                last_seen: advertised,
                last_activity: None,
                hops: info.hops,
                stale: false,
                placeholder: false,
                unread: 0,
            });
            true
        }
    }
}

fn merge_inbound(
    inner: &mut Inner,
    text: IncomingText,
    changes: &mut Vec<Change>,
    metrics: &SyncMetrics,
) {
    let radio_id = text.radio_id();
    let now = Utc::now();
    let (conversation, sender) = match &text.origin {
        TextOrigin::Contact { prefix } => {
            let prefix = normalize_prefix(prefix);
            let identity = match find_contact_mut(inner, &prefix) {
                Some(contact) => contact.prefix.clone(),
                None => {
                    info!("Message from unknown node {}; adding placeholder contact", prefix);
                    inner.contacts.push(Contact::placeholder(&prefix));
                    changes.push(Change::Contacts);
                    prefix
                }
            };
            (
                ConversationId::Contact(identity.clone()),
                Sender::Contact(identity),
            )
        }
        TextOrigin::Channel { index } => {
            let name = match inner.channels.iter().find(|c| c.index == Some(*index)) {
                Some(channel) => channel.name.clone(),
                None => {
                    let name = format!("Channel {}", index);
                    info!("Channel info missing for slot {}; created placeholder '{}'", index, name);
                    let mut channel = Channel::new(name.clone(), Some(*index));
                    channel.placeholder = true;
                    inner.channels.push(channel);
                    changes.push(Change::Channels);
                    name
                }
            };
            (ConversationId::Channel(name), channel_sender(&text.text))
        }
    };

    let log = inner.logs.entry(conversation.clone()).or_default();
    if !log.seen.insert(radio_id) {
        metrics.inc_duplicates_suppressed();
        debug!(
            "Duplicate {} on {}: {}",
            radio_id,
            conversation,
            preview(&text.text, 48)
        );
        return;
    }
    log.next_seq += 1;
    let key = MessageKey {
        conversation: conversation.clone(),
        seq: log.next_seq,
    };
    log.messages.push(Message {
        key: key.clone(),
        radio_id: Some(radio_id),
        sender,
        body: text.text,
        timestamp: advert_time(text.sender_timestamp).unwrap_or(now),
        direction: Direction::Inbound,
        delivery: DeliveryState::Acknowledged,
        hops: text.hops,
        attempts: 0,
    });
    let focused = inner.focus.as_ref() == Some(&conversation);
    touch(inner, &conversation, now, !focused);
    if let ConversationId::Contact(prefix) = &conversation {
        if let Some(contact) = inner.contacts.iter_mut().find(|c| &c.prefix == prefix) {
            contact.last_seen = Some(now);
            contact.stale = false;
        }
    }
    changes.push(Change::MessageAdded(key));
}

/// Channel texts carry their author as a leading `name:`.
fn channel_sender(text: &str) -> Sender {
    match text.split_once(':') {
        Some((lead, _)) if !lead.trim().is_empty() && !lead.contains('\n') => {
            Sender::Remote(lead.trim().to_string())
        }
        _ => Sender::Remote(UNKNOWN_SENDER.to_string()),
    }
}

fn advert_time(secs: u32) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs as i64, 0).single()
}

fn touch(inner: &mut Inner, conversation: &ConversationId, at: DateTime<Utc>, unread: bool) {
    match conversation {
        ConversationId::Channel(name) => {
            if let Some(c) = inner.channels.iter_mut().find(|c| &c.name == name) {
                c.last_activity = Some(at);
                if unread {
                    c.unread += 1;
                }
            }
        }
        ConversationId::Contact(prefix) => {
            if let Some(c) = inner.contacts.iter_mut().find(|c| &c.prefix == prefix) {
                c.last_activity = Some(at);
                if unread {
                    c.unread += 1;
                }
            }
        }
    }
}

fn clear_unread(inner: &mut Inner, conversation: &ConversationId) {
    match conversation {
        ConversationId::Channel(name) => {
            if let Some(c) = inner.channels.iter_mut().find(|c| &c.name == name) {
                c.unread = 0;
            }
        }
        ConversationId::Contact(prefix) => {
            if let Some(c) = inner.contacts.iter_mut().find(|c| &c.prefix == prefix) {
                c.unread = 0;
            }
        }
    }
}

/// Existing conversation id for `conversation`, following renames and prefix matches.
fn canonical(inner: &Inner, conversation: &ConversationId) -> Option<ConversationId> {
    let conversation = inner.aliases.get(conversation).unwrap_or(conversation);
    match conversation {
        ConversationId::Channel(name) => inner
            .channels
            .iter()
            .find(|c| &c.name == name)
            .map(|c| ConversationId::Channel(c.name.clone())),
        ConversationId::Contact(prefix) => inner
            .contacts
            .iter()
            .find(|c| &c.prefix == prefix)
            .or_else(|| inner.contacts.iter().find(|c| c.matches(prefix)))
            .map(|c| ConversationId::Contact(c.prefix.clone())),
    }
}

fn resolve_alias(inner: &Inner, key: MessageKey) -> MessageKey {
    match inner.aliases.get(&key.conversation) {
        Some(current) => MessageKey {
            conversation: current.clone(),
            seq: key.seq,
        },
        None => key,
    }
}

/// Exact identity first, then the first prefix match.
fn find_contact_mut<'a>(inner: &'a mut Inner, key: &str) -> Option<&'a mut Contact> {
    let key = normalize_prefix(key);
    let pos = inner
        .contacts
        .iter()
        .position(|c| c.prefix == key || c.public_key.as_deref() == Some(key.as_str()))
        .or_else(|| inner.contacts.iter().position(|c| c.matches(&key)))?;
    inner.contacts.get_mut(pos)
}

fn find_message<'a>(inner: &'a Inner, key: &MessageKey) -> Option<&'a Message> {
    let conversation = inner.aliases.get(&key.conversation).unwrap_or(&key.conversation);
    inner
        .logs
        .get(conversation)?
        .messages
        .iter()
        .find(|m| m.key.seq == key.seq)
}

fn find_message_mut<'a>(inner: &'a mut Inner, key: &MessageKey) -> Option<&'a mut Message> {
    inner
        .logs
        .get_mut(&key.conversation)?
        .messages
        .iter_mut()
        .find(|m| m.key.seq == key.seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::new(Arc::new(SyncMetrics::new()))
    }

    fn channel(index: u8, name: &str) -> SyncEvent {
        SyncEvent::ChannelMetadata(ChannelInfo {
            index,
            name: name.into(),
            secret: None,
        })
    }

    fn contact(key: &str, name: &str) -> SyncEvent {
        SyncEvent::ContactMetadata(ContactInfo {
            public_key: key.into(),
            name: name.into(),
            kind: 1,
            hops: Some(1),
            last_advert: 0,
        })
    }

    fn dm(prefix: &str, ts: u32, text: &str) -> SyncEvent {
        SyncEvent::InboundMessage(IncomingText {
            origin: TextOrigin::Contact {
                prefix: prefix.into(),
            },
            sender_timestamp: ts,
            text: text.into(),
            hops: Some(1),
            snr: None,
        })
    }

    fn chan_msg(index: u8, ts: u32, text: &str) -> SyncEvent {
        SyncEvent::InboundMessage(IncomingText {
            origin: TextOrigin::Channel { index },
            sender_timestamp: ts,
            text: text.into(),
            hops: None,
            snr: None,
        })
    }

    #[test]
    fn duplicate_inbound_is_idempotent() {
        let s = store();
        s.apply(channel(0, "public"));
        assert!(s.apply(chan_msg(0, 100, "Ann: hi")));
        let once = s.snapshot();
        assert!(!s.apply(chan_msg(0, 100, "Ann: hi")));
        let twice = s.snapshot();
        assert_eq!(once.revision, twice.revision);
        assert_eq!(once.channels, twice.channels);
        let id = ConversationId::channel("public");
        assert_eq!(once.messages(&id), twice.messages(&id));
        assert_eq!(twice.messages(&id).len(), 1);
        assert_eq!(s.metrics().snapshot().duplicates_suppressed, 1);
    }

    #[test]
    fn placeholder_contact_is_renamed_by_metadata() {
        let s = store();
        s.apply(dm("a1b2", 10, "first"));
        let snap = s.snapshot();
        assert_eq!(snap.contacts.len(), 1);
        assert!(snap.contacts[0].placeholder);
        assert_eq!(snap.contacts[0].display_name, "a1b2");

        s.apply(contact("a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90", "Ridge"));
        s.apply(dm("a1b2c3d4e5f6", 11, "second"));
        let snap = s.snapshot();
        assert_eq!(snap.contacts.len(), 1);
        let c = &snap.contacts[0];
        assert_eq!(c.display_name, "Ridge");
        assert!(!c.placeholder);
        let log = snap.messages(&ConversationId::contact("a1b2"));
        let bodies: Vec<_> = log.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }

    #[test]
    fn nodes_sharing_a_placeholder_prefix_stay_distinct() {
        let ridge = format!("a1b2{}", "1".repeat(60));
        let valley = format!("a1b2{}", "2".repeat(60));
        let s = store();
        s.apply(dm("a1b2", 10, "who is this"));
        s.apply(contact(&ridge, "Ridge"));
        s.apply(contact(&valley, "Valley"));

        let snap = s.snapshot();
        assert_eq!(snap.contacts.len(), 2);
        assert_eq!(snap.contact("a1b2").map(|c| c.display_name.as_str()), Some("Ridge"));
        assert_eq!(snap.contact(&valley).map(|c| c.display_name.as_str()), Some("Valley"));
        assert_eq!(snap.messages(&ConversationId::contact("a1b2")).len(), 1);

        // Another refresh changes nothing, and each node keeps its own messages.
        s.apply_batch(vec![contact(&ridge, "Ridge"), contact(&valley, "Valley")]);
        s.apply(dm(&valley[..12], 11, "valley here"));
        s.apply(dm(&ridge[..12], 12, "ridge here"));
        let snap = s.snapshot();
        assert_eq!(snap.contacts.len(), 2);
        assert_eq!(snap.contact("a1b2").map(|c| c.display_name.as_str()), Some("Ridge"));
        let valley_log = snap.messages(&ConversationId::contact(&valley));
        assert_eq!(valley_log.len(), 1);
        assert_eq!(valley_log[0].body, "valley here");
        assert_eq!(snap.messages(&ConversationId::contact("a1b2")).len(), 2);
    }

    #[test]
    fn unknown_channel_slot_gets_placeholder_then_rename_keeps_history() {
        let s = store();
        s.apply(chan_msg(3, 5, "Bob: yo"));
        assert!(s.snapshot().channel("Channel 3").unwrap().placeholder);
        s.set_focus(Some(ConversationId::channel("Channel 3")));

        s.apply(channel(3, "#ops"));
        let snap = s.snapshot();
        assert_eq!(snap.channels.len(), 1);
        assert!(snap.channel("Channel 3").is_none());
        let ops = snap.channel("#ops").unwrap();
        assert!(!ops.placeholder);
        let log = snap.messages(&ConversationId::channel("#ops"));
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].key.conversation, ConversationId::channel("#ops"));
        assert_eq!(log[0].sender, Sender::Remote("Bob".into()));
        assert_eq!(snap.focus, Some(ConversationId::channel("#ops")));
        // The old id still resolves.
        assert!(s.contains(&ConversationId::channel("Channel 3")));
    }

    #[test]
    fn metadata_preserves_unread_and_activity() {
        let s = store();
        s.apply(channel(0, "public"));
        s.apply(chan_msg(0, 1, "a: 1"));
        s.apply(chan_msg(0, 2, "a: 2"));
        let before = s.snapshot().channel("public").cloned().unwrap();
        assert_eq!(before.unread, 2);
        s.apply(channel(0, "public"));
        let after = s.snapshot().channel("public").cloned().unwrap();
        assert_eq!(after.unread, 2);
        assert_eq!(after.last_activity, before.last_activity);
    }

    #[test]
    fn focus_suppresses_unread() {
        let s = store();
        s.apply(channel(0, "public"));
        s.apply(chan_msg(0, 1, "a: 1"));
        s.set_focus(Some(ConversationId::channel("public")));
        assert_eq!(s.snapshot().channel("public").unwrap().unread, 0);
        s.apply(chan_msg(0, 2, "a: 2"));
        assert_eq!(s.snapshot().channel("public").unwrap().unread, 0);
    }

    #[test]
    fn delivery_never_regresses() {
        let s = store();
        s.apply(channel(0, "public"));
        let key = s
            .queue_outbound(&ConversationId::channel("public"), "hello")
            .unwrap();
        let result = |d| SyncEvent::SendResult {
            key: key.clone(),
            delivery: d,
            attempts: 1,
        };
        assert!(s.apply(result(DeliveryState::Sent)));
        assert!(s.apply(result(DeliveryState::Acknowledged)));
        assert!(!s.apply(result(DeliveryState::Sent)));
        assert!(!s.apply(result(DeliveryState::Failed)));
        assert_eq!(s.delivery_of(&key), Some(DeliveryState::Acknowledged));
    }

    #[test]
    fn outbound_keys_are_ordered_per_conversation() {
        let s = store();
        s.apply(channel(0, "public"));
        let id = ConversationId::channel("public");
        let keys: Vec<_> = (0..5)
            .map(|i| s.queue_outbound(&id, &format!("m{}", i)).unwrap())
            .collect();
        assert!(keys.windows(2).all(|w| w[0].seq < w[1].seq));
        let log = s.snapshot();
        let bodies: Vec<_> = log.messages(&id).iter().map(|m| m.body.clone()).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(log.messages(&id).iter().all(|m| m.delivery == DeliveryState::Pending));
    }

    #[test]
    fn queue_outbound_rejects_unknown_conversation() {
        let s = store();
        let id = ConversationId::channel("nowhere");
        assert_eq!(
            s.queue_outbound(&id, "x"),
            Err(SyncError::UnknownConversation(id))
        );
    }

    #[test]
    fn batch_publishes_single_revision() {
        let s = store();
        let mut rx = s.subscribe();
        let n = s.apply_batch(vec![
            channel(0, "public"),
            channel(1, "#bot"),
            contact("ffee00112233", "BotBot"),
            chan_msg(1, 9, "BotBot: pong"),
        ]);
        assert!(n > 0);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.revision, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(s.snapshot().revision, 1);
    }

    #[test]
    fn stale_sweep_flags_old_contacts() {
        let s = store();
        let now = Utc::now();
        s.apply(contact("aa11", "Old"));
        s.apply(SyncEvent::ContactSeen {
            public_key: "aa11".into(),
            at: now - chrono::Duration::hours(30),
        });
        s.apply(SyncEvent::StaleSweep {
            now,
            max_age: chrono::Duration::hours(24),
        });
        assert!(s.snapshot().contact("aa11").unwrap().stale);
        s.apply(SyncEvent::ContactSeen {
            public_key: "aa11".into(),
            at: now,
        });
        assert!(!s.snapshot().contact("aa11").unwrap().stale);
    }

    #[test]
    fn resolve_target_uses_slot_and_key() {
        let s = store();
        s.apply(channel(2, "#edm"));
        s.apply(contact("a1b2c3d4e5f6", "LFPKid"));
        assert_eq!(
            s.resolve_target(&ConversationId::channel("#edm")),
            Some(TextTarget::Channel { index: 2 })
        );
        assert_eq!(
            s.resolve_target(&ConversationId::contact("a1b2c3")),
            Some(TextTarget::Contact {
                public_key: "a1b2c3d4e5f6".into()
            })
        );
    }
}
