//! Wire codec for the `KEY=VALUE;` record protocol
//!
//! Outbound records are built in a [`RecordBuf`] that enforces the total
//! record budget field by field. Inbound datagrams (replies and commands)
//! are split into ordered pairs by [`WireFields`].

use std::fmt::Display;

use chrono::{DateTime, Local, Utc};

use crate::{Result, WireError};

/// Upper bound on an outbound record, header included
pub const MAX_RECORD_LENGTH: usize = 511;

/// Upper bound on the fixed record header
pub const MAX_HEADER_LENGTH: usize = 256;

/// Upper bound on an inbound reply or command datagram
pub const MAX_INBOUND_LENGTH: usize = 127;

/// Protocol version echoed in command replies
pub const PROTOCOL_VERSION: &str = "0.5";

// ============================================================================
// Outbound
// ============================================================================

/// A record under construction with a hard length limit.
///
/// Every mandatory field carries a *reserve*: the room that must remain
/// before it is written. A field whose reserve (or actual length, if larger)
/// does not fit fails with [`WireError::FormatTooLong`] and leaves the
/// buffer unchanged.
#[derive(Debug, Clone)]
pub struct RecordBuf {
    text: String,
    limit: usize,
}

impl RecordBuf {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::with_capacity(limit),
            limit,
        }
    }

    /// Start a record with a fixed prefix that counts against the limit
    pub fn with_prefix(prefix: &str, limit: usize) -> Self {
        let mut buf = Self::new(limit);
        buf.text.push_str(prefix);
        buf
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.text.len())
    }

    /// Check that `reserve` bytes remain without writing anything
    pub fn require(&self, field: &'static str, reserve: usize) -> Result<()> {
        let remaining = self.remaining();
        if reserve > remaining {
            return Err(WireError::FormatTooLong {
                field,
                needed: reserve,
                remaining,
            });
        }
        Ok(())
    }

    /// Append pre-rendered text
    pub fn push(&mut self, field: &'static str, reserve: usize, text: &str) -> Result<()> {
        self.require(field, reserve.max(text.len()))?;
        self.text.push_str(text);
        Ok(())
    }

    /// Append `KEY=VALUE;`
    pub fn push_pair(&mut self, key: &'static str, reserve: usize, value: impl Display) -> Result<()> {
        let pair = format!("{key}={value};");
        self.push(key, reserve, &pair)
    }

    /// Append `KEY=VALUE;` only if it fits; returns whether it was written
    pub fn push_optional(&mut self, key: &'static str, value: &str) -> bool {
        let needed = key.len() + value.len() + 2;
        if needed > self.remaining() {
            return false;
        }
        self.text.push_str(key);
        self.text.push('=');
        self.text.push_str(value);
        self.text.push(';');
        true
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }
}

/// `yyyy-mm-dd HH:MM:SS.mmm` in local time
pub fn event_time(timestamp: &DateTime<Utc>) -> String {
    timestamp
        .with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

/// Longest prefix of `text` holding at most `max` characters
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Render a float the way C's `%g` does (six significant digits, shortest form)
pub fn format_g(value: f64) -> String {
    const PRECISION: i32 = 6;

    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let scientific = format!("{:.*e}", (PRECISION - 1) as usize, value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some(parts) => parts,
        None => return scientific,
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= PRECISION {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", strip_fraction_zeros(mantissa), sign, exponent.abs())
    } else {
        let decimals = (PRECISION - 1 - exponent) as usize;
        strip_fraction_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn strip_fraction_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// Ordered `KEY=VALUE` pairs of an inbound datagram
#[derive(Debug, Clone, Default)]
pub struct WireFields<'a> {
    pairs: Vec<(&'a str, &'a str)>,
}

impl<'a> WireFields<'a> {
    /// Split text into pairs. Items without `=` are skipped.
    pub fn parse(text: &'a str) -> Self {
        let pairs = text
            .split(';')
            .map(|item| item.trim_matches(|c: char| c == '\0' || c.is_ascii_whitespace()))
            .filter(|item| !item.is_empty())
            .filter_map(|item| item.split_once('='))
            .collect();
        Self { pairs }
    }

    /// Parse a raw datagram; trailing NUL terminators are ignored
    pub fn from_datagram(datagram: &'a [u8]) -> Result<Self> {
        let text = std::str::from_utf8(datagram)
            .map_err(|e| WireError::malformed(format!("not ASCII text: {e}")))?;
        Ok(Self::parse(text.trim_end_matches('\0')))
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
    }

    /// Correlation id: the leading decimal digits of the `ID` value
    pub fn id(&self) -> Option<u64> {
        let value = self.get("ID")?.trim_start();
        let digits = value
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(idx, _)| &value[..idx])
            .unwrap_or(value);
        digits.parse().ok()
    }

    /// A reply is OK when `REPLY` (or the legacy `STATUS`) is exactly `Ok`
    pub fn reply_ok(&self) -> bool {
        self.pairs
            .iter()
            .any(|(k, v)| (*k == "REPLY" || *k == "STATUS") && *v == "Ok")
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &'a str)> + '_ {
        self.pairs.iter().copied()
    }
}
