//! Logging helpers that keep radio text on a single, bounded log line.
//!
//! Message bodies arrive from arbitrary mesh users and may contain newlines,
//! control characters or very long payloads. Everything user-supplied goes
//! through [`escape_log`] or [`preview`] before it reaches a log macro.

use std::fmt::Write;

const MAX_ESCAPED_CHARS: usize = 300;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
/// - other control characters => `\xNN`
///
/// Output is capped at 300 characters with a trailing ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_ESCAPED_CHARS) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_ESCAPED_CHARS {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Escaped preview limited to `max_bytes` of the original text.
///
/// Never cuts inside a multi-byte character; appends `...` when truncated.
pub fn preview(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return escape_log(input);
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = escape_log(&input[..cut]);
    out.push_str("...");
    out
}

/// Lowercase hex of at most `max` leading bytes, for frame dumps.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let mut out = String::with_capacity(max.min(data.len()) * 2);
    for b in data.iter().take(max) {
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}
