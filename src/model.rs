//! Canonical domain types shared by the reconciler, the providers and consumers.
//!
//! Everything here is plain data: cloning a [`Snapshot`] hands the consumer an
//! independent copy that can never be used to mutate the live logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Addressable unit of chat: a broadcast channel or a single contact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ConversationId {
    Channel(String),
    Contact(String),
}

impl ConversationId {
    pub fn channel(name: impl Into<String>) -> Self {
        ConversationId::Channel(name.into())
    }

    /// Contact conversations are keyed by lowercase hex prefix.
    pub fn contact(prefix: &str) -> Self {
        ConversationId::Contact(normalize_prefix(prefix))
    }

    pub fn is_channel(&self) -> bool {
        matches!(self, ConversationId::Channel(_))
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationId::Channel(name) => write!(f, "channel:{}", name),
            ConversationId::Contact(prefix) => write!(f, "contact:{}", prefix),
        }
    }
}

/// Lowercase and trim a contact prefix or public key.
pub fn normalize_prefix(prefix: &str) -> String {
    prefix.trim().to_ascii_lowercase()
}

/// Lifecycle of the link to the companion radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub name: String,
    pub label: String,
    /// Slot on the companion radio, when known.
    pub index: Option<u8>,
    pub last_activity: Option<DateTime<Utc>>,
    pub unread: u32,
    /// Created from a message on a slot whose metadata has not arrived yet.
    pub placeholder: bool,
}

impl Channel {
    pub fn new(name: impl Into<String>, index: Option<u8>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            index,
            last_activity: None,
            unread: 0,
            placeholder: false,
        }
    }

    /// Label with the unread count appended, e.g. `#ops (3)`.
    pub fn display_text(&self) -> String {
        display_with_unread(&self.label, self.unread)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    /// Identity: the prefix (or full key) first used for this node.
    pub prefix: String,
    pub public_key: Option<String>,
    pub display_name: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    /// Hop count of the known route; `None` means flood / unknown.
    pub hops: Option<u8>,
    pub stale: bool,
    pub placeholder: bool,
    pub unread: u32,
}

impl Contact {
    pub fn placeholder(prefix: &str) -> Self {
        let prefix = normalize_prefix(prefix);
        Self {
            display_name: prefix.clone(),
            prefix,
            public_key: None,
            last_seen: None,
            last_activity: None,
            hops: None,
            stale: false,
            placeholder: true,
            unread: 0,
        }
    }

    /// True when `key` and this contact's identity share a prefix. Once the
    /// full public key is known only that key is compared, so a resolved
    /// placeholder no longer claims other nodes with the same short prefix.
    pub fn matches(&self, key: &str) -> bool {
        let key = normalize_prefix(key);
        if key.is_empty() {
            return false;
        }
        let shares = |known: &str| known.starts_with(&key) || key.starts_with(known);
        match self.public_key.as_deref() {
            Some(public_key) => shares(public_key),
            None => shares(&self.prefix),
        }
    }

    pub fn display_text(&self) -> String {
        display_with_unread(&self.display_name, self.unread)
    }
}

fn display_with_unread(label: &str, unread: u32) -> String {
    if unread > 0 {
        format!("{} ({})", label, unread)
    } else {
        label.to_string()
    }
}

/// Identity a message carries on the radio side, used for duplicate suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RadioId(pub u32);

impl fmt::Display for RadioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Sent,
    Acknowledged,
    Failed,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Acknowledged | DeliveryState::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Pending → Sent → {Acknowledged | Failed}; skipping Sent is allowed,
    /// going backwards or leaving a terminal state is not.
    pub fn can_advance_to(self, next: DeliveryState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Who authored a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Sender {
    /// The operator's own companion node.
    Local,
    /// A known contact, by identity prefix.
    Contact(String),
    /// A remote participant known only by the name it put in the text.
    Remote(String),
}

/// Local identity of a message: its conversation plus a per-conversation sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageKey {
    pub conversation: ConversationId,
    pub seq: u64,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.conversation, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub key: MessageKey,
    pub radio_id: Option<RadioId>,
    pub sender: Sender,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub delivery: DeliveryState,
    pub hops: Option<u8>,
    pub attempts: u8,
}

/// The companion's own identity as advertised on the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfInfo {
    pub name: String,
    pub public_key: Option<String>,
}

impl Default for SelfInfo {
    fn default() -> Self {
        Self {
            name: "MeshCore Operator".to_string(),
            public_key: None,
        }
    }
}

/// Full copy of the reconciled state at one revision.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub revision: u64,
    pub channels: Vec<Channel>,
    pub contacts: Vec<Contact>,
    pub conversations: HashMap<ConversationId, Vec<Message>>,
    pub self_info: SelfInfo,
    pub focus: Option<ConversationId>,
}

impl Snapshot {
    pub fn messages(&self, conversation: &ConversationId) -> &[Message] {
        self.conversations
            .get(conversation)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn contact(&self, prefix: &str) -> Option<&Contact> {
        let key = normalize_prefix(prefix);
        self.contacts.iter().find(|c| c.prefix == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_state_never_regresses() {
        use DeliveryState::*;
        assert!(Pending.can_advance_to(Sent));
        assert!(Pending.can_advance_to(Acknowledged));
        assert!(Sent.can_advance_to(Failed));
        assert!(!Sent.can_advance_to(Pending));
        assert!(!Sent.can_advance_to(Sent));
        assert!(!Acknowledged.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Acknowledged));
        assert!(!Acknowledged.can_advance_to(Pending));
    }

    #[test]
    fn contact_prefix_matching_is_bidirectional() {
        let mut c = Contact::placeholder("A1B2");
        assert_eq!(c.prefix, "a1b2");
        assert!(c.matches("a1b2c3d4"));
        assert!(c.matches("A1"));
        assert!(!c.matches("ffee"));
        assert!(!c.matches(""));
        c.public_key = Some("a1b2c3d4e5f6".into());
        assert!(c.matches("a1b2c3d4e5"));
        assert!(c.matches("a1b2"));
        // The old short prefix no longer stands in for other nodes.
        assert!(!c.matches("a1b2ffff"));
    }

    #[test]
    fn display_text_shows_unread() {
        let mut ch = Channel::new("#ops", Some(2));
        assert_eq!(ch.display_text(), "#ops");
        ch.unread = 3;
        assert_eq!(ch.display_text(), "#ops (3)");
    }
}
