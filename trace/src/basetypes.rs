use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};

/// TraceID is a 16-byte identifier for a set of transactions and spans.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TraceID(pub [u8; 16]);

/// SpanID is an 8-byte identifier for a single transaction or span.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct SpanID(pub [u8; 8]);

impl TraceID {
    /// from_hex parses a 32 character lowercase hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut buf = [0u8; 16];
        decode_hex(s, &mut buf)?;
        Some(TraceID(buf))
    }

    /// An all-zero trace id is never valid on the wire.
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

impl SpanID {
    /// from_hex parses a 16 character lowercase hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut buf = [0u8; 8];
        decode_hex(s, &mut buf)?;
        Some(SpanID(buf))
    }

    /// An all-zero span id is never valid on the wire.
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

fn decode_hex(s: &str, out: &mut [u8]) -> Option<()> {
    let bytes = s.as_bytes();
    if bytes.len() != out.len() * 2 {
        return None;
    }
    for (i, chunk) in bytes.chunks(2).enumerate() {
        let hi = hex_value(chunk[0])?;
        let lo = hex_value(chunk[1])?;
        out[i] = (hi << 4) | lo;
    }
    Some(())
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

impl fmt::Display for TraceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for val in self.0.iter() {
            write!(f, "{:02x}", val)?;
        }
        Ok(())
    }
}

impl fmt::Display for SpanID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for val in self.0.iter() {
            write!(f, "{:02x}", val)?;
        }
        Ok(())
    }
}

impl Serialize for TraceID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl Serialize for SpanID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome is the final state reported for an ended transaction or span.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
    Unknown,
    /// The segment was force-closed because its parent ended first.
    Unfinished,
}

impl Default for Outcome {
    fn default() -> Outcome {
        Outcome::Unknown
    }
}

/// ErrorDetail describes a failure recorded while a segment was active.
#[derive(Clone, Eq, PartialEq, Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Microseconds since the unix epoch.
    pub timestamp: u64,
}

impl ErrorDetail {
    pub fn new(message: impl Into<String>, kind: Option<String>) -> Self {
        ErrorDetail {
            message: message.into(),
            kind,
            timestamp: epoch_micros(SystemTime::now()),
        }
    }
}

/// Labels are indexed key-value pairs attached to a transaction or span.
pub type Labels = BTreeMap<String, LabelValue>;

/// LabelValues are the values of labels on a transaction or span.
#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(untagged)]
pub enum LabelValue {
    Bool(bool),
    Int64(i64),
    Float(f64),
    String(String),
}

impl From<bool> for LabelValue {
    fn from(v: bool) -> Self {
        LabelValue::Bool(v)
    }
}

impl From<i64> for LabelValue {
    fn from(v: i64) -> Self {
        LabelValue::Int64(v)
    }
}

impl From<f64> for LabelValue {
    fn from(v: f64) -> Self {
        LabelValue::Float(v)
    }
}

impl From<&str> for LabelValue {
    fn from(v: &str) -> Self {
        LabelValue::String(v.to_string())
    }
}

impl From<String> for LabelValue {
    fn from(v: String) -> Self {
        LabelValue::String(v)
    }
}

/// epoch_micros converts a wall-clock time into microseconds since the unix epoch.
pub fn epoch_micros(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TID: TraceID = TraceID([1, 2, 3, 4, 5, 6, 7, 8, 1, 2, 4, 8, 16, 32, 64, 128]);
    const SID: SpanID = SpanID([1, 2, 4, 8, 16, 32, 64, 128]);

    #[test]
    fn id_string_represenation() {
        assert_eq!(format!("{}", TID), "01020304050607080102040810204080");
        assert_eq!(format!("{}", SID), "0102040810204080");
    }

    #[test]
    fn id_from_hex() {
        assert_eq!(
            TraceID::from_hex("01020304050607080102040810204080"),
            Some(TID)
        );
        assert_eq!(SpanID::from_hex("0102040810204080"), Some(SID));
        assert_eq!(SpanID::from_hex("0102040810204O80"), None);
        assert_eq!(SpanID::from_hex("01020408102040"), None);
        // uppercase is rejected by the traceparent grammar
        assert_eq!(SpanID::from_hex("0102040810204A80"), None);
    }

    #[test]
    fn zero_ids_are_invalid() {
        assert!(!TraceID::default().is_valid());
        assert!(!SpanID::default().is_valid());
        assert!(TID.is_valid());
    }

    #[test]
    fn ids_serialize_as_hex_strings() {
        assert_eq!(
            serde_json::to_string(&SID).unwrap(),
            "\"0102040810204080\""
        );
    }

    #[test]
    fn outcome_and_labels_serialize() {
        assert_eq!(
            serde_json::to_string(&Outcome::Unfinished).unwrap(),
            "\"unfinished\""
        );
        let mut labels = Labels::new();
        labels.insert("a".to_string(), LabelValue::from(true));
        labels.insert("b".to_string(), LabelValue::from(3i64));
        labels.insert("c".to_string(), LabelValue::from("x"));
        assert_eq!(
            serde_json::to_string(&labels).unwrap(),
            r#"{"a":true,"b":3,"c":"x"}"#
        );
    }
}
