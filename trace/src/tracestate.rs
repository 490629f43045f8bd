use std::fmt;

use lazy_static::lazy_static;
use regex::{Regex, RegexSet};
use thiserror::Error;

/// Vendor key under which the agent keeps its own trace state.
pub const VENDOR_KEY: &str = "es";
/// Sub-key of the vendor entry holding the upstream sample rate.
const SAMPLE_RATE_FIELD: &str = "s";

const MAX_MEMBERS: usize = 32;
const MAX_KEY_LEN: usize = 256;
const MAX_VALUE_LEN: usize = 256;

lazy_static! {
    static ref MEMBER_KEY: RegexSet = RegexSet::new([
        r"^[a-z][_0-9a-z\-*/]{0,255}$",
        r"^[a-z0-9][_0-9a-z\-*/]{0,240}@[a-z][_0-9a-z\-*/]{0,13}$",
    ])
    .expect("member key patterns compile");
    // printable ascii without ',' and '=', no trailing space
    static ref MEMBER_VALUE: Regex =
        Regex::new(r"^[\x20-\x2b\x2d-\x3c\x3e-\x7e]{0,255}[\x21-\x2b\x2d-\x3c\x3e-\x7e]$")
            .expect("member value pattern compiles");
}

#[derive(Clone, Eq, PartialEq, Debug, Error)]
pub enum TracestateError {
    #[error("tracestate key {0:?} is longer than {MAX_KEY_LEN} bytes")]
    KeyTooLong(String),
    #[error("tracestate key {0:?} has invalid characters")]
    InvalidKey(String),
    #[error("tracestate value for {0:?} is longer than {MAX_VALUE_LEN} bytes")]
    ValueTooLong(String),
    #[error("tracestate value for {0:?} has invalid characters")]
    InvalidValue(String),
    #[error("tracestate member {0:?} has no '='")]
    MissingSeparator(String),
    #[error("tracestate key {0:?} appears twice")]
    DuplicateKey(String),
    #[error("tracestate has more than {MAX_MEMBERS} members")]
    TooManyMembers,
}

/// Member is one validated `key=value` pair of a tracestate list.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Member {
    key: String,
    value: String,
}

impl Member {
    pub fn new(key: &str, value: &str) -> Result<Self, TracestateError> {
        if key.len() > MAX_KEY_LEN {
            return Err(TracestateError::KeyTooLong(key.to_string()));
        }
        if !MEMBER_KEY.is_match(key) {
            return Err(TracestateError::InvalidKey(key.to_string()));
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(TracestateError::ValueTooLong(key.to_string()));
        }
        if !MEMBER_VALUE.is_match(value) {
            return Err(TracestateError::InvalidValue(key.to_string()));
        }
        Ok(Member {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Tracestate is the vendor state carried next to `traceparent`.
///
/// Members are kept in header order, most recently updated first.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct Tracestate {
    members: Vec<Member>,
}

impl Tracestate {
    /// from_header parses a `tracestate` header value. Blank list items are
    /// skipped; anything else that is malformed rejects the whole header.
    pub fn from_header(header: &str) -> Result<Self, TracestateError> {
        let mut members: Vec<Member> = Vec::new();
        for item in header.split(',') {
            let item = item.trim_matches(|c| c == ' ' || c == '\t');
            if item.is_empty() {
                continue;
            }
            let (key, value) = item
                .split_once('=')
                .ok_or_else(|| TracestateError::MissingSeparator(item.to_string()))?;
            let member = Member::new(key, value)?;
            if members.iter().any(|m| m.key == member.key) {
                return Err(TracestateError::DuplicateKey(member.key));
            }
            members.push(member);
        }
        if members.len() > MAX_MEMBERS {
            return Err(TracestateError::TooManyMembers);
        }
        Ok(Tracestate { members })
    }

    pub fn to_header(&self) -> String {
        self.members
            .iter()
            .map(Member::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// upsert moves `member` to the front, replacing any member with the same
    /// key. The oldest member falls off once the list is full.
    pub fn upsert(&mut self, member: Member) {
        self.members.retain(|m| m.key != member.key);
        self.members.insert(0, member);
        self.members.truncate(MAX_MEMBERS);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|m| m.key == key)
            .map(Member::value)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> + '_ {
        self.members.iter()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// sample_rate reads the rate recorded by an upstream agent in the vendor
    /// member, e.g. `es=s:0.25`. Rates outside `[0, 1]` are ignored.
    pub fn sample_rate(&self) -> Option<f64> {
        self.get(VENDOR_KEY)?
            .split(';')
            .filter_map(|field| field.split_once(':'))
            .find(|(name, _)| *name == SAMPLE_RATE_FIELD)
            .and_then(|(_, rate)| rate.parse::<f64>().ok())
            .filter(|rate| (0.0..=1.0).contains(rate))
    }

    /// with_sample_rate records `rate` in the vendor member so downstream
    /// agents can report it.
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        let mut fields: Vec<String> = self
            .get(VENDOR_KEY)
            .map(|value| {
                value
                    .split(';')
                    .filter(|f| !f.starts_with("s:"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        fields.insert(0, format!("{SAMPLE_RATE_FIELD}:{}", format_rate(rate)));
        if let Ok(member) = Member::new(VENDOR_KEY, &fields.join(";")) {
            self.upsert(member);
        }
        self
    }
}

// at most four decimals, no trailing zeros
fn format_rate(rate: f64) -> String {
    let s = format!("{:.4}", rate.clamp(0.0, 1.0));
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys() {
        for key in ["abc", "a_b-c*d/e", "tenant1@vendor", "0tenant@v"] {
            assert!(Member::new(key, "v").is_ok(), "{key:?}");
        }
        for key in ["", "Abc", "1ab", " abc", "a=b", "tenant@1vendor"] {
            assert_eq!(
                Member::new(key, "v"),
                Err(TracestateError::InvalidKey(key.to_string()))
            );
        }
        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert_eq!(
            Member::new(&long, "v"),
            Err(TracestateError::KeyTooLong(long.clone()))
        );
    }

    #[test]
    fn values() {
        assert!(Member::new("k", "s:0.5;x y").is_ok());
        for value in ["", "a,b", "a=b", "trailing "] {
            assert_eq!(
                Member::new("k", value),
                Err(TracestateError::InvalidValue("k".to_string())),
                "{value:?}"
            );
        }
    }

    #[test]
    fn parses_and_renders_in_order() {
        let ts = Tracestate::from_header("es=s:0.5, ,rojo=00f067aa0ba902b7\t").unwrap();
        assert_eq!(ts.len(), 2);
        assert_eq!(ts.get("rojo"), Some("00f067aa0ba902b7"));
        assert_eq!(ts.to_header(), "es=s:0.5,rojo=00f067aa0ba902b7");
    }

    #[test]
    fn malformed_headers_are_rejected() {
        assert_eq!(
            Tracestate::from_header("novalue"),
            Err(TracestateError::MissingSeparator("novalue".to_string()))
        );
        assert_eq!(
            Tracestate::from_header("a=1,b=2,a=3"),
            Err(TracestateError::DuplicateKey("a".to_string()))
        );
        let crowded = (0..=MAX_MEMBERS)
            .map(|i| format!("k{i}=v"))
            .collect::<Vec<_>>()
            .join(",");
        assert_eq!(
            Tracestate::from_header(&crowded),
            Err(TracestateError::TooManyMembers)
        );
    }

    #[test]
    fn upsert_moves_member_to_front() {
        let mut ts = Tracestate::from_header("a=1,b=2").unwrap();
        ts.upsert(Member::new("b", "3").unwrap());
        assert_eq!(ts.to_header(), "b=3,a=1");
    }

    #[test]
    fn sample_rate_in_vendor_member() {
        let ts = Tracestate::from_header("es=x:1;s:0.25,other=1").unwrap();
        assert_eq!(ts.sample_rate(), Some(0.25));
        assert_eq!(Tracestate::from_header("es=s:7").unwrap().sample_rate(), None);
        assert_eq!(Tracestate::default().sample_rate(), None);

        let ts = ts.with_sample_rate(0.1);
        assert_eq!(ts.to_header(), "es=s:0.1;x:1,other=1");
        assert_eq!(Tracestate::default().with_sample_rate(1.0).to_header(), "es=s:1");
    }
}
