//! Event record model and canonical serialisation.
//!
//! An [`EventRecord`] is the atomic unit flowing through the fabric: every
//! collector emits one per observation, the journal chains them, the IPC
//! channel frames them, and the analyser fuses them.
//!
//! # Canonical serialisation
//!
//! Chain hashes and frame MACs are computed over a deterministic JSON form
//! produced by [`EventRecord::canonical_json`]:
//!
//! - fields in fixed order: `timestamp`, `sequence`, `source`, `category`,
//!   `severity`, `message`, `attributes`
//! - attributes emitted as an array of `{"key":K,"value":V}` objects sorted
//!   lexicographically by (key, value)
//! - string escaping limited to `\\`, `\"`, `\n`, `\r`, `\t`, and uppercase
//!   `\uXXXX` for any other control byte below 0x20
//! - no whitespace outside string literals
//!
//! Deserialisation is deliberately permissive: a missing `sequence` defaults
//! to 0 (meaning "unassigned"), missing optional fields default to empty,
//! and unknown fields are ignored. The stored attribute order is preserved;
//! only the canonical form sorts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors produced while parsing event material.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EventError {
    /// A timestamp string could not be interpreted.
    #[error("invalid timestamp: {value}")]
    InvalidTimestamp {
        /// The offending timestamp text.
        value: String,
    },

    /// The event JSON itself was malformed.
    #[error("malformed event JSON: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Analyser-facing event categories.
///
/// The named variants are the categories the heuristics and collectors
/// agree on; system-specific categories (for example per-directory crash
/// artifact buckets) round-trip through [`Category::Other`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    /// Platform service state transitions.
    ServiceHealth,
    /// Security product posture.
    Security,
    /// Tracked process lifecycle and memory.
    Process,
    /// CPU / memory / disk utilisation samples.
    Resource,
    /// Pressure stall information.
    Pressure,
    /// Kernel ring messages.
    Kernel,
    /// Kernel message transport (host-side mirror of [`Category::Kernel`]).
    Kmsg,
    /// System journal entries.
    Journal,
    /// Crash dumps appearing in the crash directory.
    Crash,
    /// Power status transitions.
    Power,
    /// Network interface counter anomalies.
    Network,
    /// Structured platform event-log records.
    EventLog,
    /// Crash-artifact directory observations.
    Wer,
    /// Virtualisation stack diagnostic probes.
    WslDiagnostics,
    /// Bridge and channel housekeeping.
    Ipc,
    /// Anything uncategorised.
    #[default]
    General,
    /// A system-specific category outside the named set.
    Other(String),
}

impl Category {
    /// Returns the wire spelling of the category.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ServiceHealth => "ServiceHealth",
            Self::Security => "Security",
            Self::Process => "Process",
            Self::Resource => "Resource",
            Self::Pressure => "Pressure",
            Self::Kernel => "Kernel",
            Self::Kmsg => "Kmsg",
            Self::Journal => "Journal",
            Self::Crash => "Crash",
            Self::Power => "Power",
            Self::Network => "Network",
            Self::EventLog => "EventLog",
            Self::Wer => "WER",
            Self::WslDiagnostics => "WslDiagnostics",
            Self::Ipc => "IPC",
            Self::General => "General",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Category {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ServiceHealth" => Self::ServiceHealth,
            "Security" => Self::Security,
            "Process" => Self::Process,
            "Resource" => Self::Resource,
            "Pressure" => Self::Pressure,
            "Kernel" => Self::Kernel,
            "Kmsg" => Self::Kmsg,
            "Journal" => Self::Journal,
            "Crash" => Self::Crash,
            "Power" => Self::Power,
            "Network" => Self::Network,
            "EventLog" => Self::EventLog,
            "WER" => Self::Wer,
            "WslDiagnostics" => Self::WslDiagnostics,
            "IPC" => Self::Ipc,
            // An empty category means "unset"; the journal substitutes the
            // default on append.
            "" | "General" => Self::General,
            _ => Self::Other(value),
        }
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for Category {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

/// Event severity levels.
///
/// `Verbose` appears only as an input mapping from platform level enums;
/// the health aggregation counts it in the info bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Severity {
    /// Below informational.
    Verbose,
    /// Routine observation.
    #[default]
    Info,
    /// Degraded but operating.
    Warning,
    /// A failure was observed.
    Error,
    /// A failure that threatens the whole channel.
    Critical,
}

impl Severity {
    /// Returns the wire spelling of the severity.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verbose => "Verbose",
            Self::Info => "Info",
            Self::Warning => "Warning",
            Self::Error => "Error",
            Self::Critical => "Critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Severity {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Verbose" => Self::Verbose,
            "Warning" => Self::Warning,
            "Error" => Self::Error,
            "Critical" => Self::Critical,
            // Unknown severities are treated as informational.
            _ => Self::Info,
        }
    }
}

impl From<Severity> for String {
    fn from(value: Severity) -> Self {
        value.as_str().to_string()
    }
}

/// One key/value pair attached to an event.
///
/// Keys are unique within a record; insertion order is preserved on the
/// wire and in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventAttribute {
    /// Attribute key, unique within the record.
    #[serde(default)]
    pub key: String,
    /// Attribute value.
    #[serde(default)]
    pub value: String,
}

impl EventAttribute {
    /// Creates an attribute pair.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// The atomic unit of the fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    /// Wall-clock instant with microsecond precision. The Unix epoch means
    /// "unassigned"; the journal substitutes now on append.
    pub timestamp: DateTime<Utc>,
    /// Monotonic per-journal counter. 0 means "unassigned" and triggers
    /// auto-assignment on append.
    pub sequence: u64,
    /// Short producer identifier, e.g. `"systemd.journal"`.
    pub source: String,
    /// Analyser category.
    pub category: Category,
    /// Severity level.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// Attribute pairs in insertion order.
    pub attributes: Vec<EventAttribute>,
}

impl Default for EventRecord {
    fn default() -> Self {
        Self {
            timestamp: DateTime::UNIX_EPOCH,
            sequence: 0,
            source: String::new(),
            category: Category::default(),
            severity: Severity::default(),
            message: String::new(),
            attributes: Vec::new(),
        }
    }
}

impl EventRecord {
    /// Creates a record with an unassigned timestamp and sequence.
    pub fn new(category: Category, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            ..Self::default()
        }
    }

    /// Returns `true` when the timestamp has not been assigned yet.
    #[must_use]
    pub fn timestamp_unset(&self) -> bool {
        self.timestamp == DateTime::UNIX_EPOCH
    }

    /// Looks up an attribute value by key.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
    }

    /// Sets an attribute, replacing any existing value for the key.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(existing) = self.attributes.iter_mut().find(|attr| attr.key == key) {
            existing.value = value;
        } else {
            self.attributes.push(EventAttribute { key, value });
        }
    }

    /// Adds an attribute only when the key is absent and the value is
    /// non-empty. Used for stamping common attributes without clobbering a
    /// collector's own values.
    pub fn ensure_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if value.is_empty() {
            return;
        }
        if self.attributes.iter().any(|attr| attr.key == key) {
            return;
        }
        self.attributes.push(EventAttribute { key, value });
    }

    /// Emits the deterministic canonical JSON form used as chain-hash and
    /// MAC input.
    #[must_use]
    pub fn canonical_json(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::with_capacity(160 + self.message.len());
        out.push_str("{\"timestamp\":\"");
        escape_into(&mut out, &format_timestamp(self.timestamp));
        out.push_str("\",\"sequence\":");
        let _ = write!(out, "{}", self.sequence);
        out.push_str(",\"source\":\"");
        escape_into(&mut out, &self.source);
        out.push_str("\",\"category\":\"");
        escape_into(&mut out, self.category.as_str());
        out.push_str("\",\"severity\":\"");
        escape_into(&mut out, self.severity.as_str());
        out.push_str("\",\"message\":\"");
        escape_into(&mut out, &self.message);
        out.push_str("\",\"attributes\":[");

        let mut attributes = self.attributes.clone();
        attributes.sort_by(|a, b| a.key.cmp(&b.key).then_with(|| a.value.cmp(&b.value)));
        for (index, attr) in attributes.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push_str("{\"key\":\"");
            escape_into(&mut out, &attr.key);
            out.push_str("\",\"value\":\"");
            escape_into(&mut out, &attr.value);
            out.push_str("\"}");
        }
        out.push_str("]}");
        out
    }

    /// Parses an event from its canonical (or any permissive-compatible)
    /// JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] when the payload is not a JSON
    /// object or carries an unparseable timestamp.
    pub fn from_canonical_json(payload: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Byte-slice variant of [`EventRecord::from_canonical_json`]; UTF-8
    /// validation happens inside the JSON parser.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Malformed`] on invalid UTF-8 or JSON.
    pub fn from_canonical_bytes(payload: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl Serialize for EventRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("EventRecord", 7)?;
        state.serialize_field("timestamp", &format_timestamp(self.timestamp))?;
        state.serialize_field("sequence", &self.sequence)?;
        state.serialize_field("source", &self.source)?;
        state.serialize_field("category", &self.category)?;
        state.serialize_field("severity", &self.severity)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("attributes", &self.attributes)?;
        state.end()
    }
}

/// Permissive mirror of the wire shape; every field is optional.
#[derive(Deserialize)]
struct RawEventRecord {
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    sequence: u64,
    #[serde(default)]
    source: String,
    #[serde(default)]
    category: Category,
    #[serde(default)]
    severity: Severity,
    #[serde(default)]
    message: String,
    #[serde(default)]
    attributes: Vec<EventAttribute>,
}

impl<'de> Deserialize<'de> for EventRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEventRecord::deserialize(deserializer)?;
        let timestamp = if raw.timestamp.is_empty() {
            DateTime::UNIX_EPOCH
        } else {
            parse_timestamp(&raw.timestamp).map_err(serde::de::Error::custom)?
        };
        Ok(Self {
            timestamp,
            sequence: raw.sequence,
            source: raw.source,
            category: raw.category,
            severity: raw.severity,
            message: raw.message,
            attributes: raw.attributes,
        })
    }
}

/// Formats an instant as RFC-3339 UTC with six fractional digits and a
/// trailing `Z`.
#[must_use]
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Parses a timestamp in the canonical form, tolerating a missing fraction
/// or offset.
///
/// # Errors
///
/// Returns [`EventError::InvalidTimestamp`] when no accepted form matches.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, EventError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let trimmed = value.strip_suffix('Z').unwrap_or(value);
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    Err(EventError::InvalidTimestamp {
        value: value.to_string(),
    })
}

fn escape_into(out: &mut String, input: &str) {
    use std::fmt::Write as _;

    for c in input.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04X}", c as u32);
            },
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample_record() -> EventRecord {
        let mut record = EventRecord::new(Category::Kernel, Severity::Warning, "oom killer");
        record.timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 45).unwrap()
            + chrono::Duration::microseconds(123_456);
        record.sequence = 42;
        record.source = "kernel.kmsg".to_string();
        record.set_attribute("zeta", "1");
        record.set_attribute("alpha", "2");
        record
    }

    #[test]
    fn test_canonical_field_order_and_sorted_attributes() {
        let record = sample_record();
        let json = record.canonical_json();
        assert_eq!(
            json,
            "{\"timestamp\":\"2024-03-01T12:30:45.123456Z\",\"sequence\":42,\
             \"source\":\"kernel.kmsg\",\"category\":\"Kernel\",\"severity\":\"Warning\",\
             \"message\":\"oom killer\",\"attributes\":[{\"key\":\"alpha\",\"value\":\"2\"},\
             {\"key\":\"zeta\",\"value\":\"1\"}]}"
        );
    }

    #[test]
    fn test_canonical_epoch_vector() {
        let mut record = EventRecord::new(Category::General, Severity::Info, "m");
        record.sequence = 1;
        record.source = "s".to_string();
        assert_eq!(
            record.canonical_json(),
            "{\"timestamp\":\"1970-01-01T00:00:00.000000Z\",\"sequence\":1,\"source\":\"s\",\
             \"category\":\"General\",\"severity\":\"Info\",\"message\":\"m\",\"attributes\":[]}"
        );
    }

    #[test]
    fn test_escaping() {
        let mut record = EventRecord::new(Category::General, Severity::Info, "a\"b\\c\nd\te\r");
        record.message.push('\u{1}');
        let json = record.canonical_json();
        assert!(json.contains("a\\\"b\\\\c\\nd\\te\\r\\u0001"));
    }

    #[test]
    fn test_roundtrip_modulo_attribute_order() {
        let record = sample_record();
        let parsed = EventRecord::from_canonical_json(&record.canonical_json()).unwrap();
        assert_eq!(parsed.timestamp, record.timestamp);
        assert_eq!(parsed.sequence, record.sequence);
        assert_eq!(parsed.source, record.source);
        assert_eq!(parsed.category, record.category);
        assert_eq!(parsed.severity, record.severity);
        assert_eq!(parsed.message, record.message);
        let mut expected = record.attributes.clone();
        expected.sort_by(|a, b| a.key.cmp(&b.key));
        assert_eq!(parsed.attributes, expected);
    }

    #[test]
    fn test_permissive_deserialisation() {
        let parsed = EventRecord::from_canonical_json(
            "{\"timestamp\":\"2024-01-01T00:00:00Z\",\"message\":\"hello\",\"unknown\":7}",
        )
        .unwrap();
        assert_eq!(parsed.sequence, 0);
        assert_eq!(parsed.source, "");
        assert_eq!(parsed.category, Category::General);
        assert_eq!(parsed.severity, Severity::Info);
        assert_eq!(parsed.message, "hello");
    }

    #[test]
    fn test_missing_timestamp_defaults_to_epoch() {
        let parsed = EventRecord::from_canonical_json("{\"message\":\"x\"}").unwrap();
        assert!(parsed.timestamp_unset());
    }

    #[test]
    fn test_invalid_timestamp_is_rejected() {
        let result = EventRecord::from_canonical_json("{\"timestamp\":\"not-a-time\"}");
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_severity_maps_to_info() {
        let parsed = EventRecord::from_canonical_json(
            "{\"timestamp\":\"2024-01-01T00:00:00Z\",\"severity\":\"Chartreuse\"}",
        )
        .unwrap();
        assert_eq!(parsed.severity, Severity::Info);
    }

    #[test]
    fn test_category_other_roundtrip() {
        let category: Category = "Systemd".parse().unwrap();
        assert_eq!(category, Category::Other("Systemd".to_string()));
        assert_eq!(category.as_str(), "Systemd");
        assert_eq!(Category::from("WER".to_string()), Category::Wer);
        assert_eq!(Category::Wer.as_str(), "WER");
    }

    #[test]
    fn test_set_attribute_replaces() {
        let mut record = EventRecord::default();
        record.set_attribute("pid", "1");
        record.set_attribute("pid", "2");
        assert_eq!(record.attributes.len(), 1);
        assert_eq!(record.attribute("pid"), Some("2"));
    }

    #[test]
    fn test_ensure_attribute_preserves_existing() {
        let mut record = EventRecord::default();
        record.set_attribute("hostname", "guest");
        record.ensure_attribute("hostname", "other");
        record.ensure_attribute("boot_id", "");
        record.ensure_attribute("machine_id", "abc");
        assert_eq!(record.attribute("hostname"), Some("guest"));
        assert_eq!(record.attribute("boot_id"), None);
        assert_eq!(record.attribute("machine_id"), Some("abc"));
    }

    #[test]
    fn test_timestamp_parse_variants() {
        assert!(parse_timestamp("2024-01-01T00:00:00.000001Z").is_ok());
        assert!(parse_timestamp("2024-01-01T00:00:00").is_ok());
        assert!(parse_timestamp("2024-01-01T00:00:00+02:00").is_ok());
        assert!(parse_timestamp("yesterday").is_err());
    }
}
