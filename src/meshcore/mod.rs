//! # MeshCore companion transport
//!
//! Boundary between the synchronization layer and a MeshCore companion radio.
//! The layer only sees the [`Connector`] and [`RadioLink`] traits plus the
//! plain data types in this module; the concrete companion protocol lives in
//! the submodules:
//!
//! - [`framer`] - `<`/`>` length-prefixed framing
//! - [`packets`] - command encoding and response/push decoding
//! - [`link`] - request/response correlation over a byte stream
//! - [`io`] - TCP and serial byte pumps plus the [`io::DeviceConnector`]
//! - [`bluetooth`] - BlueZ helpers and companion selection for Bluetooth targets
//! - `ble` - Nordic UART link over Bluetooth LE (`ble` feature)
//!
//! Tests and the simulated provider substitute their own `Connector`.

use async_trait::async_trait;
use crc::{Crc, CRC_32_ISO_HDLC};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::CompanionConfig;
use crate::error::TransportError;
use crate::model::{RadioId, SelfInfo};

#[cfg(feature = "ble")]
pub mod ble;
pub mod bluetooth;
pub mod framer;
pub mod io;
pub mod link;
pub mod packets;

const FINGERPRINT: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Channel slot as reported by the companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub index: u8,
    pub name: String,
    pub secret: Option<[u8; 16]>,
}

/// Contact record from the companion's contact table or an advert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    /// Full public key, lowercase hex.
    pub public_key: String,
    pub name: String,
    pub kind: u8,
    /// Known route length; `None` when the radio floods to this node.
    pub hops: Option<u8>,
    /// Sender-clock seconds of the last advert.
    pub last_advert: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TextOrigin {
    Contact { prefix: String },
    Channel { index: u8 },
}

/// A text message received from the mesh.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingText {
    pub origin: TextOrigin,
    pub sender_timestamp: u32,
    pub text: String,
    pub hops: Option<u8>,
    pub snr: Option<f32>,
}

impl IncomingText {
    /// Stable fingerprint of origin, sender clock and text. MeshCore carries
    /// no message id, and a re-delivered message yields the same value.
    pub fn radio_id(&self) -> RadioId {
        let mut digest = FINGERPRINT.digest();
        match &self.origin {
            TextOrigin::Contact { prefix } => {
                digest.update(b"c:");
                digest.update(prefix.to_ascii_lowercase().as_bytes());
            }
            TextOrigin::Channel { index } => {
                digest.update(b"g:");
                digest.update(&[*index]);
            }
        }
        digest.update(&self.sender_timestamp.to_le_bytes());
        digest.update(self.text.as_bytes());
        RadioId(digest.finalize())
    }
}

/// Result of one metadata fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub channels: Vec<ChannelInfo>,
    pub contacts: Vec<ContactInfo>,
}

/// Unsolicited events from a live link.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Message(IncomingText),
    /// The radio has queued messages; a drain should follow.
    MessagesWaiting,
    SendConfirmed { ack: u32, round_trip_ms: u32 },
    ContactAdvert(ContactInfo),
    /// A known node advertised or its path changed.
    Seen { public_key: String },
}

/// Where an outbound text goes on the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextTarget {
    Channel { index: u8 },
    Contact { public_key: String },
}

/// How the radio accepted an outbound text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted and final; channel broadcasts are never acknowledged end to end.
    Accepted,
    /// Transmitted; a `SendConfirmed` push with `ack` is expected.
    AwaitAck { ack: u32, timeout: Duration },
}

/// Request/response side of an open companion connection.
#[async_trait]
pub trait RadioLink: Send + Sync {
    async fn send_text(
        &self,
        target: &TextTarget,
        text: &str,
        attempt: u8,
    ) -> Result<SendOutcome, TransportError>;

    async fn fetch_metadata(&self) -> Result<Metadata, TransportError>;

    /// Pull up to `limit` queued messages off the radio.
    async fn drain_pending(&self, limit: usize) -> Result<Vec<IncomingText>, TransportError>;

    async fn ping(&self) -> Result<(), TransportError>;

    async fn disconnect(&self);
}

/// A freshly opened link. The event receiver closes when the link drops.
pub struct Connection {
    pub link: Arc<dyn RadioLink>,
    pub events: mpsc::UnboundedReceiver<RadioEvent>,
    pub self_info: Option<SelfInfo>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &CompanionTarget) -> Result<Connection, TransportError>;

    /// Release OS-level resources after the supervisor stops for good.
    async fn release(&self, _target: &CompanionTarget) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Bluetooth,
    Serial,
    Tcp,
    /// No radio; the simulated provider serves all data.
    Fake,
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bluetooth" | "ble" => Ok(TransportKind::Bluetooth),
            "serial" => Ok(TransportKind::Serial),
            "tcp" => Ok(TransportKind::Tcp),
            "fake" => Ok(TransportKind::Fake),
            other => Err(TransportError::Unreachable(format!(
                "unsupported transport '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Bluetooth => "bluetooth",
            TransportKind::Serial => "serial",
            TransportKind::Tcp => "tcp",
            TransportKind::Fake => "fake",
        })
    }
}

/// Resolved connection target for one companion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionTarget {
    pub kind: TransportKind,
    pub endpoint: String,
    pub device: String,
    pub baud_rate: u32,
}

impl CompanionTarget {
    pub fn from_config(companion: &CompanionConfig) -> Result<Self, TransportError> {
        Ok(Self {
            kind: companion.transport.parse()?,
            endpoint: companion.endpoint.trim().to_string(),
            device: companion.device.trim().to_string(),
            baud_rate: companion.baud_rate,
        })
    }

    /// `host:port` split of the endpoint.
    pub fn tcp_address(&self) -> Result<(String, u16), TransportError> {
        let (host, port) = self
            .endpoint
            .rsplit_once(':')
            .ok_or_else(|| TransportError::Unreachable("TCP endpoint must be host:port".into()))?;
        let port = port.parse::<u16>().map_err(|_| {
            TransportError::Unreachable(format!("invalid TCP port in '{}'", self.endpoint))
        })?;
        if host.is_empty() {
            return Err(TransportError::Unreachable("TCP endpoint must be host:port".into()));
        }
        Ok((host.to_string(), port))
    }

    /// Serial device: `device` unless it is "auto", else `endpoint`.
    pub fn serial_path(&self) -> Option<&str> {
        [self.device.as_str(), self.endpoint.as_str()]
            .into_iter()
            .find(|v| is_concrete(v))
    }

    /// Values from endpoint and device that look like Bluetooth MACs.
    pub fn bluetooth_addresses(&self) -> Vec<String> {
        [&self.endpoint, &self.device]
            .into_iter()
            .filter(|v| is_concrete(v) && looks_like_mac(v))
            .cloned()
            .collect()
    }

    /// Raw device hints, device first.
    pub fn bluetooth_devices(&self) -> Vec<String> {
        [&self.device, &self.endpoint]
            .into_iter()
            .filter(|v| is_concrete(v))
            .cloned()
            .collect()
    }
}

impl fmt::Display for CompanionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TransportKind::Serial => write!(
                f,
                "serial {} @ {}",
                self.serial_path().unwrap_or("<unset>"),
                self.baud_rate
            ),
            TransportKind::Bluetooth if is_concrete(&self.device) => {
                write!(f, "bluetooth {} ({})", self.endpoint, self.device)
            }
            kind => write!(f, "{} {}", kind, self.endpoint),
        }
    }
}

fn is_concrete(value: &str) -> bool {
    let v = value.trim();
    !v.is_empty() && !v.eq_ignore_ascii_case("auto")
}

/// Six or eight colon-separated groups of two or four hex digits.
pub fn looks_like_mac(value: &str) -> bool {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 6 && parts.len() != 8 {
        return false;
    }
    parts
        .iter()
        .all(|p| (p.len() == 2 || p.len() == 4) && p.chars().all(|c| c.is_ascii_hexdigit()))
}
