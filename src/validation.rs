//! Input validation for outbound text and operator-supplied addresses.

use crate::error::SyncError;

/// Default ceiling for a single text payload. MeshCore firmware caps text at
/// 160 bytes and channel sends prepend `"<name>: "`.
pub const DEFAULT_MAX_TEXT_BYTES: usize = 133;

/// Address parsing errors for CLI and config input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("contact prefix is empty")]
    EmptyPrefix,

    #[error("contact prefix must be hex, got '{0}'")]
    NotHex(String),

    #[error("contact prefix is too long ({len} hex chars, maximum 64)")]
    PrefixTooLong { len: usize },

    #[error("channel name is empty")]
    EmptyChannel,

    #[error("channel name contains control characters")]
    ControlCharacters,
}

/// Check a message body before it is queued.
///
/// Bodies are trimmed of trailing newlines by the caller's input path; here we
/// only reject what the radio cannot carry.
pub fn validate_body(body: &str, max_bytes: usize) -> Result<(), SyncError> {
    if body.trim().is_empty() {
        return Err(SyncError::EmptyMessage);
    }
    if body.len() > max_bytes {
        return Err(SyncError::MessageTooLong {
            len: body.len(),
            max: max_bytes,
        });
    }
    Ok(())
}

/// Validate and normalize a contact prefix or public key (lowercase hex).
pub fn validate_prefix(prefix: &str) -> Result<String, AddressError> {
    let p = prefix.trim();
    if p.is_empty() {
        return Err(AddressError::EmptyPrefix);
    }
    if p.len() > 64 {
        return Err(AddressError::PrefixTooLong { len: p.len() });
    }
    if !p.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(AddressError::NotHex(p.to_string()));
    }
    Ok(p.to_ascii_lowercase())
}

pub fn validate_channel_name(name: &str) -> Result<String, AddressError> {
    let n = name.trim();
    if n.is_empty() {
        return Err(AddressError::EmptyChannel);
    }
    if n.chars().any(|c| c.is_control()) {
        return Err(AddressError::ControlCharacters);
    }
    Ok(n.to_string())
}

/// Decode a hex string into exactly `N` bytes, taking the leading bytes of
/// longer keys (direct sends address the first 6 bytes of a public key).
pub fn hex_prefix_bytes<const N: usize>(hex: &str) -> Option<[u8; N]> {
    let hex = hex.trim();
    if hex.len() < N * 2 {
        return None;
    }
    let mut out = [0u8; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(out)
}
