use thiserror::Error;

use crate::model::ConversationId;

/// Failures reported by a companion transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The companion could not be reached or the link dropped.
    #[error("companion unreachable: {0}")]
    Unreachable(String),

    /// No reply within the allotted time.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// The radio explicitly refused the request.
    #[error("rejected by radio: {0}")]
    Rejected(String),

    /// Malformed or unexpected frame.
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

impl TransportError {
    /// Whether retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_) | TransportError::Timeout(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(e.to_string()),
            _ => TransportError::Unreachable(e.to_string()),
        }
    }
}

#[cfg(feature = "ble")]
impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::TimedOut(_) => TransportError::Timeout(e.to_string()),
            _ => TransportError::Unreachable(format!("bluetooth: {}", e)),
        }
    }
}

/// Errors surfaced to consumers of the synchronization layer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("transport unreachable: {0}")]
    TransportUnreachable(String),

    #[error("transport timeout: {0}")]
    TransportTimeout(String),

    #[error("send rejected: {0}")]
    SendRejected(String),

    #[error("no acknowledgement after {attempts} attempt(s)")]
    SendTimeoutExhausted { attempts: u8 },

    #[error("unknown conversation: {0}")]
    UnknownConversation(ConversationId),

    #[error("not connected to a companion radio")]
    NotConnected,

    #[error("message body is empty")]
    EmptyMessage,

    #[error("message is too long ({len} bytes, maximum {max})")]
    MessageTooLong { len: usize, max: usize },
}

impl From<TransportError> for SyncError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unreachable(s) => SyncError::TransportUnreachable(s),
            TransportError::Timeout(s) => SyncError::TransportTimeout(s),
            TransportError::Rejected(s) => SyncError::SendRejected(s),
            // A garbled reply leaves the link usable but the send unconfirmed.
            TransportError::ProtocolError(s) => SyncError::TransportUnreachable(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_onto_sync_taxonomy() {
        assert_eq!(
            SyncError::from(TransportError::Rejected("no channel".into())),
            SyncError::SendRejected("no channel".into())
        );
        assert_eq!(
            SyncError::from(TransportError::Timeout("ack".into())),
            SyncError::TransportTimeout("ack".into())
        );
        assert!(TransportError::Unreachable("gone".into()).is_transient());
        assert!(!TransportError::Rejected("nope".into()).is_transient());
    }

    #[test]
    fn io_timeouts_become_transport_timeouts() {
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert!(matches!(TransportError::from(e), TransportError::Timeout(_)));
        let e = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(TransportError::from(e), TransportError::Unreachable(_)));
    }
}
