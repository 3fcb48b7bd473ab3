//! Lower-hex codec for 64-bit identifiers.
//!
//! Parsing is lenient and total: malformed input yields zero, which every
//! caller treats as "absent". Wire-format extraction must never raise on bad
//! peer data, so there is no error type here at all.

use std::fmt::Write;

/// Parses up to 16 lower-hex characters into a `u64`.
///
/// Returns 0 when the input is empty, longer than 16 characters, or contains
/// anything outside `[0-9a-f]`. Upper-case hex is rejected on purpose: the
/// B3 wire format mandates lower-case, and accepting both would make
/// round-trip equality checks lie.
pub(crate) fn parse_lower_hex_u64(src: &str) -> u64 {
    let bytes = src.as_bytes();
    if bytes.is_empty() || bytes.len() > 16 {
        return 0;
    }
    let mut result: u64 = 0;
    for &b in bytes {
        let nibble = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            _ => return 0,
        };
        result = (result << 4) | u64::from(nibble);
    }
    result
}

/// Appends `value` as exactly 16 zero-padded lower-hex characters.
pub(crate) fn push_hex_u64(out: &mut String, value: u64) {
    // Writing to a String cannot fail.
    let _ = write!(out, "{value:016x}");
}

/// Renders a 64- or 128-bit trace id: 32 characters when the high bits are
/// set, 16 otherwise.
pub(crate) fn trace_id_string(trace_id_high: u64, trace_id: u64) -> String {
    let mut out = String::with_capacity(if trace_id_high != 0 { 32 } else { 16 });
    if trace_id_high != 0 {
        push_hex_u64(&mut out, trace_id_high);
    }
    push_hex_u64(&mut out, trace_id);
    out
}
