//! Shared types for the event-log delivery client
//!
//! This crate provides:
//! - Event / StoredEvent: captured alarm and status transitions of monitored sources
//! - Severity / AlarmStatus: the alarm-state vocabulary and its wire names
//! - CapturedValue: a fixed-size value snapshot with a type tag
//! - wire: bounded `KEY=VALUE;` record building and inbound datagram parsing

pub mod wire;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use wire::{
    event_time, format_g, truncate_chars, RecordBuf, WireFields, MAX_HEADER_LENGTH,
    MAX_INBOUND_LENGTH, MAX_RECORD_LENGTH, PROTOCOL_VERSION,
};

/// Bytes of a source's value captured with each event
pub const VALUE_BYTES: usize = 8;

/// Characters of a source name written to a record
pub const NAME_WIDTH: usize = 29;

/// Characters of a source description written to a record
pub const DESCRIPTION_WIDTH: usize = 29;

/// Characters of a severity or status name written to a record
pub const STATE_NAME_WIDTH: usize = 8;

// ============================================================================
// Alarm State Vocabulary
// ============================================================================

/// Alarm severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    NoAlarm,
    Minor,
    Major,
    Invalid,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::NoAlarm,
        Severity::Minor,
        Severity::Major,
        Severity::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::NoAlarm => "NO_ALARM",
            Severity::Minor => "MINOR",
            Severity::Major => "MAJOR",
            Severity::Invalid => "INVALID",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alarm status (the reason a source is in alarm)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmStatus {
    #[default]
    NoAlarm,
    Read,
    Write,
    #[serde(rename = "HIHI")]
    HiHi,
    High,
    #[serde(rename = "LOLO")]
    LoLo,
    Low,
    State,
    Cos,
    Comm,
    Timeout,
    #[serde(rename = "HWLIMIT")]
    HwLimit,
    Calc,
    Scan,
    Link,
    Soft,
    BadSub,
    Udf,
    Disable,
    Simm,
    ReadAccess,
    WriteAccess,
}

impl AlarmStatus {
    pub const ALL: [AlarmStatus; 22] = [
        AlarmStatus::NoAlarm,
        AlarmStatus::Read,
        AlarmStatus::Write,
        AlarmStatus::HiHi,
        AlarmStatus::High,
        AlarmStatus::LoLo,
        AlarmStatus::Low,
        AlarmStatus::State,
        AlarmStatus::Cos,
        AlarmStatus::Comm,
        AlarmStatus::Timeout,
        AlarmStatus::HwLimit,
        AlarmStatus::Calc,
        AlarmStatus::Scan,
        AlarmStatus::Link,
        AlarmStatus::Soft,
        AlarmStatus::BadSub,
        AlarmStatus::Udf,
        AlarmStatus::Disable,
        AlarmStatus::Simm,
        AlarmStatus::ReadAccess,
        AlarmStatus::WriteAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmStatus::NoAlarm => "NO_ALARM",
            AlarmStatus::Read => "READ",
            AlarmStatus::Write => "WRITE",
            AlarmStatus::HiHi => "HIHI",
            AlarmStatus::High => "HIGH",
            AlarmStatus::LoLo => "LOLO",
            AlarmStatus::Low => "LOW",
            AlarmStatus::State => "STATE",
            AlarmStatus::Cos => "COS",
            AlarmStatus::Comm => "COMM",
            AlarmStatus::Timeout => "TIMEOUT",
            AlarmStatus::HwLimit => "HWLIMIT",
            AlarmStatus::Calc => "CALC",
            AlarmStatus::Scan => "SCAN",
            AlarmStatus::Link => "LINK",
            AlarmStatus::Soft => "SOFT",
            AlarmStatus::BadSub => "BAD_SUB",
            AlarmStatus::Udf => "UDF",
            AlarmStatus::Disable => "DISABLE",
            AlarmStatus::Simm => "SIMM",
            AlarmStatus::ReadAccess => "READ_ACCESS",
            AlarmStatus::WriteAccess => "WRITE_ACCESS",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity and status of a source at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlarmState {
    pub severity: Severity,
    pub status: AlarmStatus,
}

impl AlarmState {
    pub fn new(severity: Severity, status: AlarmStatus) -> Self {
        Self { severity, status }
    }

    pub fn normal() -> Self {
        Self::default()
    }
}

// ============================================================================
// Sources and Captured Values
// ============================================================================

/// Stable identity of a monitored source, used as the collapse key
pub type SourceKey = u32;

/// Static description of a monitored source, supplied by the value source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub key: SourceKey,
    pub name: String,
    pub description: String,
    pub record_type: String,
    /// Labels for enumerated values, indexed by the raw value
    pub enum_labels: Vec<String>,
}

impl SourceDescriptor {
    pub fn new(key: SourceKey, name: impl Into<String>) -> Self {
        Self {
            key,
            name: name.into(),
            description: String::new(),
            record_type: String::new(),
            enum_labels: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_record_type(mut self, record_type: impl Into<String>) -> Self {
        self.record_type = record_type.into();
        self
    }

    pub fn with_enum_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

/// Type tag of a captured value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[default]
    None,
    Float,
    Double,
    String,
    Char,
    UChar,
    Short,
    UShort,
    Long,
    ULong,
    Enum,
}

/// Immutable value snapshot: up to eight raw bytes plus their type tag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapturedValue {
    kind: ValueKind,
    bytes: [u8; VALUE_BYTES],
}

impl CapturedValue {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_raw(kind: ValueKind, bytes: [u8; VALUE_BYTES]) -> Self {
        Self { kind, bytes }
    }

    pub fn float(value: f32) -> Self {
        Self::with_prefix(ValueKind::Float, &value.to_le_bytes())
    }

    pub fn double(value: f64) -> Self {
        Self::from_raw(ValueKind::Double, value.to_le_bytes())
    }

    /// Keeps the first eight bytes of the text
    pub fn string(value: &str) -> Self {
        let raw = value.as_bytes();
        let len = raw.len().min(VALUE_BYTES);
        Self::with_prefix(ValueKind::String, &raw[..len])
    }

    pub fn char(value: i8) -> Self {
        Self::with_prefix(ValueKind::Char, &value.to_le_bytes())
    }

    pub fn uchar(value: u8) -> Self {
        Self::with_prefix(ValueKind::UChar, &[value])
    }

    pub fn short(value: i16) -> Self {
        Self::with_prefix(ValueKind::Short, &value.to_le_bytes())
    }

    pub fn ushort(value: u16) -> Self {
        Self::with_prefix(ValueKind::UShort, &value.to_le_bytes())
    }

    pub fn long(value: i32) -> Self {
        Self::with_prefix(ValueKind::Long, &value.to_le_bytes())
    }

    pub fn ulong(value: u32) -> Self {
        Self::with_prefix(ValueKind::ULong, &value.to_le_bytes())
    }

    pub fn enumerated(index: u16) -> Self {
        Self::with_prefix(ValueKind::Enum, &index.to_le_bytes())
    }

    fn with_prefix(kind: ValueKind, prefix: &[u8]) -> Self {
        let mut bytes = [0u8; VALUE_BYTES];
        bytes[..prefix.len()].copy_from_slice(prefix);
        Self { kind, bytes }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn bytes(&self) -> &[u8; VALUE_BYTES] {
        &self.bytes
    }

    fn half(&self) -> [u8; 2] {
        [self.bytes[0], self.bytes[1]]
    }

    fn word(&self) -> [u8; 4] {
        [self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]]
    }

    /// Render the value as it appears after `VALUE=`.
    ///
    /// `bitwise` selects the grouped binary rendering for unsigned shorts.
    /// Returns `None` when there is nothing to report.
    pub fn render(&self, source: &SourceDescriptor, bitwise: bool) -> Option<String> {
        let text = match self.kind {
            ValueKind::None => return None,
            ValueKind::Float => format_g(f32::from_le_bytes(self.word()) as f64),
            ValueKind::Double => format_g(f64::from_le_bytes(self.bytes)),
            ValueKind::String => {
                let end = self.bytes.iter().position(|b| *b == 0).unwrap_or(VALUE_BYTES);
                String::from_utf8_lossy(&self.bytes[..end]).replace(';', ",")
            }
            ValueKind::Char => (self.bytes[0] as i8).to_string(),
            ValueKind::UChar => self.bytes[0].to_string(),
            ValueKind::Short => i16::from_le_bytes(self.half()).to_string(),
            ValueKind::UShort => {
                let value = u16::from_le_bytes(self.half());
                if bitwise {
                    bit_groups(value)
                } else {
                    value.to_string()
                }
            }
            ValueKind::Long => i32::from_le_bytes(self.word()).to_string(),
            ValueKind::ULong => u32::from_le_bytes(self.word()).to_string(),
            ValueKind::Enum => {
                let index = u16::from_le_bytes(self.half());
                source
                    .enum_labels
                    .get(index as usize)
                    .filter(|label| !label.is_empty())
                    .map(|label| label.replace(';', ","))
                    .unwrap_or_else(|| index.to_string())
            }
        };

        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// 16 binary digits, most significant first, a space after every four
fn bit_groups(value: u16) -> String {
    let mut out = String::with_capacity(19);
    for bit in 0..16 {
        out.push(if value & (0x8000 >> bit) != 0 { '1' } else { '0' });
        if bit == 3 || bit == 7 || bit == 11 {
            out.push(' ');
        }
    }
    out
}

// ============================================================================
// Core Event Types
// ============================================================================

/// Which collapsing policy applies to an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventClass {
    /// Snapshot of a source's current state; always collapsible
    Status,
    /// A state transition that must reach an operator
    Alarm,
}

impl EventClass {
    /// Value of the `TYPE` key for this class
    pub fn wire_type(&self) -> &'static str {
        match self {
            EventClass::Status => "status",
            EventClass::Alarm => "event",
        }
    }
}

/// One captured status or alarm transition. Immutable once captured.
#[derive(Debug, Clone)]
pub struct Event {
    pub source: Arc<SourceDescriptor>,
    pub value: CapturedValue,
    pub old_state: AlarmState,
    pub new_state: AlarmState,
    pub timestamp: DateTime<Utc>,
    pub class: EventClass,
}

impl Event {
    pub fn alarm(
        source: Arc<SourceDescriptor>,
        value: CapturedValue,
        old_state: AlarmState,
        new_state: AlarmState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            value,
            old_state,
            new_state,
            timestamp,
            class: EventClass::Alarm,
        }
    }

    /// A status snapshot reports the same state as old and new
    pub fn status(
        source: Arc<SourceDescriptor>,
        value: CapturedValue,
        state: AlarmState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            value,
            old_state: state,
            new_state: state,
            timestamp,
            class: EventClass::Status,
        }
    }

    pub fn source_key(&self) -> SourceKey {
        self.source.key
    }

    pub fn is_alarm(&self) -> bool {
        self.class == EventClass::Alarm
    }
}

/// An event as handed out by the store, with its collapse bookkeeping
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: Event,
    /// How many newer events for the same source were merged into this one
    pub overwrite_count: u32,
    /// Highest severity seen across the merged events
    pub max_severity: Severity,
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("record too long: {field} needs {needed} bytes, {remaining} remain")]
    FormatTooLong {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("malformed inbound datagram: {0}")]
    MalformedInbound(String),
}

impl WireError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedInbound(message.into())
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
