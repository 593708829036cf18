//! Reversible encoding between arbitrary byte strings (archive path
//! components, index-domain member labels) and dot-safe metric-name segments.
//!
//! Alphanumerics, underscore and space pass through unchanged; in the newer
//! tilde mode hyphen and slash pass through as well, since newer dashboards
//! tolerate them.  Every other byte becomes a fixed-width hex escape whose
//! delimiter cannot collide with the pass-through set.  A one-way variant
//! produces a readable label for host-derived archive prefixes.

use serde::{Deserialize, Serialize};

/// Escape style for encoded name segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncodingMode {
    /// `-XX-` escapes; hyphen is reserved as the delimiter.
    Legacy,
    /// `~XX` escapes; hyphen and slash pass through.
    #[default]
    Tilde,
}

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn passes_through(b: u8, mode: EncodingMode) -> bool {
    b.is_ascii_alphanumeric()
        || b == b'_'
        || b == b' '
        || (mode == EncodingMode::Tilde && (b == b'-' || b == b'/'))
}

/// Encode a non-empty byte string into a dot-safe metric-name segment.
///
/// The result never contains `.`, so it can be used as one component of a
/// dot-separated composite name.
pub fn encode(input: &str, mode: EncodingMode) -> String {
    assert!(!input.is_empty(), "cannot encode an empty name segment");
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if passes_through(b, mode) {
            out.push(b as char);
        } else {
            match mode {
                EncodingMode::Legacy => {
                    out.push('-');
                    out.push(HEX[(b >> 4) as usize] as char);
                    out.push(HEX[(b & 15) as usize] as char);
                    out.push('-');
                }
                EncodingMode::Tilde => {
                    out.push('~');
                    out.push(HEX[(b >> 4) as usize] as char);
                    out.push(HEX[(b & 15) as usize] as char);
                }
            }
        }
    }
    out
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode a metric-name segment produced by [`encode`].
///
/// Input originates from untrusted query strings, so decoding failure is
/// possible and is signalled with an empty return string; this never panics.
/// Truncated escapes, non-hex digits, mismatched delimiters, and escapes that
/// decode to invalid UTF-8 all yield the sentinel.
pub fn decode(input: &str, mode: EncodingMode) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match mode {
            EncodingMode::Legacy if c == b'-' => {
                if i + 3 >= bytes.len() {
                    return String::new();
                }
                let hi = match hex_value(bytes[i + 1]) {
                    Some(v) => v,
                    None => return String::new(),
                };
                let lo = match hex_value(bytes[i + 2]) {
                    Some(v) => v,
                    None => return String::new(),
                };
                if bytes[i + 3] != b'-' {
                    return String::new();
                }
                out.push((hi << 4) | lo);
                i += 4;
            }
            EncodingMode::Tilde if c == b'~' => {
                if i + 2 >= bytes.len() {
                    return String::new();
                }
                let hi = match hex_value(bytes[i + 1]) {
                    Some(v) => v,
                    None => return String::new(),
                };
                let lo = match hex_value(bytes[i + 2]) {
                    Some(v) => v,
                    None => return String::new(),
                };
                out.push((hi << 4) | lo);
                i += 3;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    String::from_utf8(out).unwrap_or_default()
}

/// One-way, human-readable encoding: the tilde pass-through set is kept and
/// every other byte collapses to `_`.  Not invertible; used only to derive a
/// readable archive-prefix label from a host name.
pub fn encode_1way(input: &str) -> String {
    input
        .bytes()
        .map(|b| {
            if passes_through(b, EncodingMode::Tilde) {
                b as char
            } else {
                '_'
            }
        })
        .collect()
}
