use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::basetypes::{SpanID, TraceID};
use crate::trace::TraceOptions;
use crate::tracestate::Tracestate;

/// W3C trace context header.
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Vendor alias of `traceparent` understood by older collectors and agents.
pub const ELASTIC_TRACEPARENT_HEADER: &str = "elastic-apm-traceparent";
/// W3C vendor state header.
pub const TRACESTATE_HEADER: &str = "tracestate";

const TRACEPARENT_LEN: usize = 55;

/// TraceParent is the trace id, parent id and flags triplet carried between
/// processes.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct TraceParent {
    pub trace_id: TraceID,
    pub parent_id: SpanID,
    pub trace_options: TraceOptions,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Error)]
pub enum TraceParentError {
    #[error("traceparent has the wrong length")]
    WrongLength,
    #[error("unsupported traceparent version")]
    UnsupportedVersion,
    #[error("traceparent fields are malformed")]
    Malformed,
    #[error("traceparent trace id is invalid")]
    InvalidTraceId,
    #[error("traceparent parent id is invalid")]
    InvalidParentId,
}

impl TraceParent {
    /// parse reads a `traceparent` header value.
    ///
    /// Versions above 00 are accepted as long as the version 00 prefix parses
    /// and is followed by a `-` delimiter, as the W3C recommendation requires.
    pub fn parse(header: &str) -> Result<Self, TraceParentError> {
        let header = header.trim();
        if header.len() < TRACEPARENT_LEN {
            return Err(TraceParentError::WrongLength);
        }
        let version = header.get(0..2).ok_or(TraceParentError::Malformed)?;
        match version {
            "00" if header.len() != TRACEPARENT_LEN => return Err(TraceParentError::WrongLength),
            "00" => {}
            "ff" => return Err(TraceParentError::UnsupportedVersion),
            _ if u8::from_str_radix(version, 16).is_err() => {
                return Err(TraceParentError::Malformed)
            }
            _ if header.len() > TRACEPARENT_LEN && header.as_bytes()[TRACEPARENT_LEN] != b'-' => {
                return Err(TraceParentError::Malformed)
            }
            _ => {}
        }

        let known = header
            .get(..TRACEPARENT_LEN)
            .ok_or(TraceParentError::Malformed)?;
        let mut fields = known.split('-').skip(1);
        let (trace_id, parent_id, flags) = match (fields.next(), fields.next(), fields.next()) {
            (Some(t), Some(p), Some(f)) => (t, p, f),
            _ => return Err(TraceParentError::Malformed),
        };

        let trace_id = TraceID::from_hex(trace_id)
            .filter(TraceID::is_valid)
            .ok_or(TraceParentError::InvalidTraceId)?;
        let parent_id = SpanID::from_hex(parent_id)
            .filter(SpanID::is_valid)
            .ok_or(TraceParentError::InvalidParentId)?;
        if flags.len() != 2 || flags.bytes().any(|b| !b.is_ascii_hexdigit()) {
            return Err(TraceParentError::Malformed);
        }
        let flags = u8::from_str_radix(flags, 16).map_err(|_| TraceParentError::Malformed)?;

        Ok(TraceParent {
            trace_id,
            parent_id,
            trace_options: TraceOptions(flags),
        })
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "00-{}-{}-{:02x}",
            self.trace_id, self.parent_id, self.trace_options.0
        )
    }
}

const BINARY_VERSION: u8 = 0;
const FIELD_TRACE_ID: u8 = 0;
const FIELD_PARENT_ID: u8 = 1;
const FIELD_OPTIONS: u8 = 2;
/// Length of a fully encoded binary traceparent.
pub const BINARY_LEN: usize = 29;

/// to_binary encodes `tp` for byte oriented carriers such as message queue
/// headers.
///
/// The buffer is a version byte (0) followed by tagged fields in ascending tag
/// order: trace id (tag 0, 16 bytes), parent id (tag 1, 8 bytes), options
/// (tag 2, 1 byte).
pub fn to_binary(tp: &TraceParent) -> Vec<u8> {
    let mut buf = Vec::with_capacity(BINARY_LEN);
    buf.push(BINARY_VERSION);
    buf.push(FIELD_TRACE_ID);
    buf.extend_from_slice(&tp.trace_id.0);
    buf.push(FIELD_PARENT_ID);
    buf.extend_from_slice(&tp.parent_id.0);
    buf.push(FIELD_OPTIONS);
    buf.push(tp.trace_options.0);
    buf
}

// Splits off a field with the given tag and payload length.
fn take_field(buf: &[u8], tag: u8, len: usize) -> Option<(&[u8], &[u8])> {
    match buf.split_first() {
        Some((&t, rest)) if t == tag && rest.len() >= len => Some(rest.split_at(len)),
        _ => None,
    }
}

/// from_binary decodes a buffer written by [`to_binary`].
///
/// The options field may be absent, in which case the trace is unsampled.
/// Other versions, missing ids and all-zero ids give None.
pub fn from_binary(buf: &[u8]) -> Option<TraceParent> {
    let (&version, rest) = buf.split_first()?;
    if version != BINARY_VERSION {
        return None;
    }
    let (trace_bytes, rest) = take_field(rest, FIELD_TRACE_ID, 16)?;
    let (parent_bytes, rest) = take_field(rest, FIELD_PARENT_ID, 8)?;
    let trace_options = take_field(rest, FIELD_OPTIONS, 1)
        .map(|(options, _)| TraceOptions(options[0]))
        .unwrap_or_default();

    let mut trace_id = TraceID::default();
    trace_id.0.copy_from_slice(trace_bytes);
    let mut parent_id = SpanID::default();
    parent_id.0.copy_from_slice(parent_bytes);
    if !trace_id.is_valid() || !parent_id.is_valid() {
        return None;
    }
    Some(TraceParent {
        trace_id,
        parent_id,
        trace_options,
    })
}

/// InboundContext is the distributed tracing state a framework adapter read
/// from an incoming request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundContext {
    pub traceparent: Option<TraceParent>,
    pub tracestate: Option<Tracestate>,
}

impl InboundContext {
    /// from_headers extracts trace headers from name/value pairs.
    ///
    /// Header names are matched case-insensitively. `traceparent` wins over the
    /// vendor alias when both are present. Malformed values are ignored so the
    /// caller falls back to starting a fresh trace.
    pub fn from_headers<'a, I>(headers: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut w3c = None;
        let mut vendor = None;
        let mut state = None;
        for (name, value) in headers {
            if name.eq_ignore_ascii_case(TRACEPARENT_HEADER) {
                w3c = Some(value);
            } else if name.eq_ignore_ascii_case(ELASTIC_TRACEPARENT_HEADER) {
                vendor = Some(value);
            } else if name.eq_ignore_ascii_case(TRACESTATE_HEADER) {
                state = Some(value);
            }
        }

        let traceparent = w3c.or(vendor).and_then(|value| match TraceParent::parse(value) {
            Ok(tp) => Some(tp),
            Err(err) => {
                debug!("ignoring traceparent {value:?}: {err}");
                None
            }
        });
        // tracestate is meaningless without a parent to continue
        let tracestate = traceparent
            .and(state)
            .and_then(|value| match Tracestate::from_header(value) {
                Ok(ts) => Some(ts),
                Err(err) => {
                    debug!("ignoring tracestate {value:?}: {err}");
                    None
                }
            });

        InboundContext {
            traceparent,
            tracestate,
        }
    }

    /// from_binary wraps a binary encoded parent, see [`to_binary`].
    pub fn from_binary(buf: &[u8]) -> Self {
        InboundContext {
            traceparent: from_binary(buf),
            tracestate: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";

    fn parent() -> TraceParent {
        TraceParent {
            trace_id: TraceID([
                0x40, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, 0x4a, 0x4b, 0x4c,
                0x4d, 0x4e, 0x4f,
            ]),
            parent_id: SpanID([0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68]),
            trace_options: TraceOptions(1),
        }
    }

    #[test]
    fn parse_and_format_traceparent() {
        let tp = TraceParent::parse(HEADER).unwrap();
        assert_eq!(tp.trace_id.to_string(), "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(tp.parent_id.to_string(), "b7ad6b7169203331");
        assert!(tp.trace_options.is_sampled());
        assert_eq!(tp.to_string(), HEADER);
    }

    #[test]
    fn reject_malformed_traceparent() {
        let cases = [
            ("", TraceParentError::WrongLength),
            ("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331", TraceParentError::WrongLength),
            ("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-", TraceParentError::WrongLength),
            ("ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01", TraceParentError::UnsupportedVersion),
            ("00-00000000000000000000000000000000-b7ad6b7169203331-01", TraceParentError::InvalidTraceId),
            ("00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01", TraceParentError::InvalidParentId),
            ("00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01", TraceParentError::InvalidTraceId),
            ("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-zz", TraceParentError::Malformed),
            ("zz-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01", TraceParentError::Malformed),
        ];
        for (header, want) in cases.iter() {
            assert_eq!(TraceParent::parse(header), Err(*want), "{header:?}");
        }
    }

    #[test]
    fn future_versions_parse_the_known_prefix() {
        let tp = TraceParent::parse(
            "01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00-extra",
        )
        .unwrap();
        assert!(!tp.trace_options.is_sampled());
    }

    #[test]
    fn binary_round_trip() {
        let b = vec![
            0, 0, 64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 75, 76, 77, 78, 79, 1, 97, 98, 99,
            100, 101, 102, 103, 104, 2, 1,
        ];
        assert_eq!(to_binary(&parent()), b);
        assert_eq!(from_binary(&b), Some(parent()));
    }

    #[test]
    fn from_binary_rejects_bad_input() {
        let mut b = to_binary(&parent());
        b[0] = 1;
        assert_eq!(from_binary(&b), None, "unsupported version");

        let b = vec![0, 1, 97, 98, 99, 100, 101, 102, 103, 104, 2, 1];
        assert_eq!(from_binary(&b), None, "missing trace id");

        assert_eq!(from_binary(&[]), None);
        assert_eq!(from_binary(&[0, 0, 64, 65, 66, 67]), None, "truncated");
    }

    #[test]
    fn from_binary_defaults_missing_options() {
        let b = to_binary(&parent());
        let tp = from_binary(&b[..27]).unwrap();
        assert_eq!(tp.trace_options, TraceOptions(0));
    }

    #[test]
    fn inbound_context_from_headers() {
        let ctx = InboundContext::from_headers(vec![
            ("Content-Type", "text/plain"),
            ("TraceParent", HEADER),
            ("tracestate", "es=s:1"),
        ]);
        assert_eq!(ctx.traceparent, Some(TraceParent::parse(HEADER).unwrap()));
        assert_eq!(ctx.tracestate.unwrap().to_header(), "es=s:1");
    }

    #[test]
    fn inbound_context_prefers_w3c_header() {
        let other = "00-11111111111111111111111111111111-2222222222222222-00";
        let ctx = InboundContext::from_headers(vec![
            (ELASTIC_TRACEPARENT_HEADER, other),
            (TRACEPARENT_HEADER, HEADER),
        ]);
        assert_eq!(ctx.traceparent.unwrap().to_string(), HEADER);

        let ctx = InboundContext::from_headers(vec![(ELASTIC_TRACEPARENT_HEADER, other)]);
        assert_eq!(ctx.traceparent.unwrap().to_string(), other);
    }

    #[test]
    fn inbound_context_ignores_garbage() {
        let ctx = InboundContext::from_headers(vec![
            (TRACEPARENT_HEADER, "garbage"),
            (TRACESTATE_HEADER, "es=s:1"),
        ]);
        assert_eq!(ctx, InboundContext::default());
    }
}
