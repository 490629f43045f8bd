use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::basetypes::{ErrorDetail, Outcome, SpanID, TraceID};
use crate::config::Config;
use crate::stats::{bump, AgentStats};
use crate::trace::SegmentContext;

/// Exporter is a trait for structs that receive ended segments.
///
/// The export method should be safe for concurrent use and should return
/// quickly; it is called on the thread that ended the segment. Any I/O
/// belongs on another thread or in a future.
pub trait Exporter {
    fn export(&self, record: Record);
}

/// Record is one ended segment in wire form. It serializes as a single-key
/// object, `{"transaction": {...}}` or `{"span": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Record {
    Transaction(TransactionRecord),
    Span(SpanRecord),
}

impl Record {
    pub fn id(&self) -> SpanID {
        match self {
            Record::Transaction(tx) => tx.id,
            Record::Span(span) => span.id,
        }
    }

    pub fn trace_id(&self) -> TraceID {
        match self {
            Record::Transaction(tx) => tx.trace_id,
            Record::Span(span) => span.trace_id,
        }
    }

    pub fn parent_id(&self) -> Option<SpanID> {
        match self {
            Record::Transaction(tx) => tx.parent_id,
            Record::Span(span) => span.parent_id,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Default, Serialize)]
pub struct SpanCount {
    pub started: u32,
    pub dropped: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransactionRecord {
    pub id: SpanID,
    pub trace_id: TraceID,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanID>,
    pub name: String,
    #[serde(rename = "type")]
    pub transaction_type: String,
    /// Start time in microseconds since the unix epoch.
    pub timestamp: u64,
    #[serde(rename = "duration")]
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub outcome: Outcome,
    pub sampled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<f64>,
    pub span_count: SpanCount,
    /// Unsampled transactions carry no context.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<SegmentContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpanRecord {
    pub id: SpanID,
    pub trace_id: TraceID,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<SpanID>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<SpanID>,
    pub name: String,
    #[serde(rename = "type")]
    pub span_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub timestamp: u64,
    #[serde(rename = "duration")]
    pub duration_ms: f64,
    pub outcome: Outcome,
    pub sampled: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub orphaned: bool,
    pub context: SegmentContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// Metadata describes the reporting process. It is the first line of every
/// request body sent to the collector.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Metadata {
    pub service: ServiceMetadata,
    pub process: ProcessMetadata,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub agent: NameVersion,
    pub language: NameVersion,
    pub runtime: NameVersion,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<NameVersion>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NameVersion {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessMetadata {
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub argv: Vec<String>,
}

impl Metadata {
    pub fn from_config(config: &Config) -> Self {
        let argv: Vec<String> = std::env::args().collect();
        Metadata {
            service: ServiceMetadata {
                name: config.service_name.clone(),
                version: config.service_version.clone(),
                environment: config.environment.clone(),
                agent: NameVersion {
                    name: "rust".to_string(),
                    version: Some(env!("CARGO_PKG_VERSION").to_string()),
                },
                language: NameVersion {
                    name: "Rust".to_string(),
                    version: None,
                },
                runtime: NameVersion {
                    name: "rustc".to_string(),
                    version: None,
                },
                framework: config.framework_name.clone().map(|name| NameVersion {
                    name,
                    version: config.framework_version.clone(),
                }),
            },
            process: ProcessMetadata {
                pid: std::process::id(),
                title: argv.first().cloned(),
                argv,
            },
            labels: config.global_labels.clone(),
        }
    }
}

#[derive(Serialize)]
struct MetadataLine<'a> {
    metadata: &'a Metadata,
}

/// encode_line appends `value` to `out` as one line of newline delimited json.
pub fn encode_line<T: Serialize>(value: &T, out: &mut Vec<u8>) -> serde_json::Result<()> {
    serde_json::to_writer(&mut *out, value)?;
    out.push(b'\n');
    Ok(())
}

/// encode_metadata returns the metadata line that starts each request body.
pub fn encode_metadata(metadata: &Metadata) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_line(&MetadataLine { metadata }, &mut out)?;
    Ok(out)
}

/// CaptureOnlyExporter is used when the collector cannot be reached by
/// configuration. Segments are still tracked but counted as dropped here.
pub struct CaptureOnlyExporter {
    stats: Arc<AgentStats>,
}

impl CaptureOnlyExporter {
    pub fn new(stats: Arc<AgentStats>) -> Self {
        CaptureOnlyExporter { stats }
    }
}

impl Exporter for CaptureOnlyExporter {
    fn export(&self, _record: Record) {
        bump(&self.stats.capture_only_dropped);
    }
}

/// NoopExporter discards everything.
#[derive(Default)]
pub struct NoopExporter;

impl Exporter for NoopExporter {
    fn export(&self, _record: Record) {}
}
