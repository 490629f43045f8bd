use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use tracing::debug;

use crate::basetypes::{epoch_micros, ErrorDetail, LabelValue, Labels, Outcome, SpanID, TraceID};
use crate::config::UnsampledPolicy;
use crate::context;
use crate::export::{Record, SpanCount, SpanRecord, TransactionRecord};
use crate::propagation::TraceParent;
use crate::stats::bump;
use crate::tracer::TracerShared;
use crate::tracestate::Tracestate;

const ACTIVE: u8 = 1;
const ENDED: u8 = 2;

/// TraceOptions contains the W3C trace flags of a trace.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TraceOptions(pub u8);

impl TraceOptions {
    pub const SAMPLED: TraceOptions = TraceOptions(1);

    /// Whether the trace should be sampled.
    pub fn is_sampled(self) -> bool {
        self.0 & 1 == 1
    }

    pub(crate) fn with_sampled(self, sampled: bool) -> TraceOptions {
        if sampled {
            TraceOptions(self.0 | 1)
        } else {
            TraceOptions(self.0 & !1)
        }
    }
}

/// TraceContext identifies a segment within its trace. It never changes once
/// the segment exists; children derive their own context from it.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct TraceContext {
    /// trace_id is the id of the trace the segment belongs to.
    pub trace_id: TraceID,
    /// span_id is the id of the segment itself.
    pub span_id: SpanID,
    /// parent_span_id is the id of the parent segment, possibly in another process.
    pub parent_span_id: Option<SpanID>,
    pub trace_options: TraceOptions,
    pub trace_state: Option<Tracestate>,
}

impl TraceContext {
    /// is_sampled returns true if the segment will be exported.
    pub fn is_sampled(&self) -> bool {
        self.trace_options.is_sampled()
    }

    /// child derives the context of a segment started under this one.
    pub(crate) fn child(&self, span_id: SpanID) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id,
            span_id,
            parent_span_id: Some(self.span_id),
            trace_options: self.trace_options,
            trace_state: self.trace_state.clone(),
        }
    }

    /// traceparent is the value to send downstream so the next service
    /// continues this trace with this segment as parent.
    pub fn traceparent(&self) -> TraceParent {
        TraceParent {
            trace_id: self.trace_id,
            parent_id: self.span_id,
            trace_options: self.trace_options,
        }
    }
}

/// Request describes the inbound request a transaction handles.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Request {
    pub method: String,
    pub url: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_version: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<Socket>,
}

impl Request {
    /// new describes a request for `full_url`, deriving the url parts and
    /// whether the connection was encrypted.
    pub fn new(method: &str, full_url: &str) -> Self {
        let url = Url::parse(full_url);
        let socket = url.protocol.is_some().then(|| Socket {
            encrypted: url.full.starts_with("https:"),
            remote_address: None,
        });
        Request {
            method: method.to_string(),
            url,
            socket,
            ..Request::default()
        }
    }
}

/// Url is the request url, whole and in parts.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Url {
    pub full: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    /// Application protocol, `HTTP` for both http and https urls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl Url {
    /// parse splits an absolute url. Anything unparsable is kept in `full`
    /// only.
    pub fn parse(full: &str) -> Self {
        let parsed = match reqwest::Url::parse(full) {
            Ok(parsed) => parsed,
            Err(_) => {
                return Url {
                    full: full.to_string(),
                    ..Url::default()
                }
            }
        };
        let web = matches!(parsed.scheme(), "http" | "https");
        Url {
            full: parsed.to_string(),
            hostname: parsed.host_str().map(str::to_string),
            port: parsed.port(),
            pathname: Some(parsed.path().to_string()),
            search: parsed.query().map(str::to_string),
            protocol: web.then(|| "HTTP".to_string()),
        }
    }
}

/// Socket describes the connection a request arrived on.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Socket {
    pub encrypted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_address: Option<String>,
}

/// Response describes the response a transaction produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Response {
    pub status_code: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

/// SegmentContext is the metadata bag carried by a transaction or span.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SegmentContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<Request>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<Response>,
    pub labels: Labels,
    pub custom: BTreeMap<String, serde_json::Value>,
}

/// result_for_status maps an http status code onto a transaction result such
/// as `HTTP 2xx`.
pub fn result_for_status(status_code: u16) -> String {
    format!("HTTP {}xx", status_code / 100)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[derive(Debug)]
struct TransactionData {
    name: String,
    transaction_type: String,
    result: Option<String>,
    outcome: Option<Outcome>,
    context: SegmentContext,
    error: Option<ErrorDetail>,
    duration: Option<Duration>,
    child_ids: Vec<SpanID>,
    spans_started: u32,
    spans_dropped: u32,
}

struct TransactionInner {
    context: TraceContext,
    timestamp: u64,
    start: Instant,
    sample_rate: Option<f64>,
    state: AtomicU8,
    data: RwLock<TransactionData>,
    // spans started directly under the transaction and not yet ended
    active_spans: Mutex<Vec<Span>>,
    shared: Arc<TracerShared>,
}

/// Transaction is the root segment of a trace within this process.
///
/// Transactions are cheap to clone; every clone refers to the same segment.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

impl Transaction {
    pub(crate) fn new(
        context: TraceContext,
        name: &str,
        transaction_type: &str,
        sample_rate: Option<f64>,
        shared: Arc<TracerShared>,
    ) -> Transaction {
        let data = TransactionData {
            name: name.to_string(),
            transaction_type: transaction_type.to_string(),
            result: None,
            outcome: None,
            context: SegmentContext::default(),
            error: None,
            duration: None,
            child_ids: Vec::new(),
            spans_started: 0,
            spans_dropped: 0,
        };
        Transaction {
            inner: Arc::new(TransactionInner {
                context,
                timestamp: epoch_micros(SystemTime::now()),
                start: Instant::now(),
                sample_rate,
                state: AtomicU8::new(ACTIVE),
                data: RwLock::new(data),
                active_spans: Mutex::new(Vec::new()),
                shared,
            }),
        }
    }

    pub fn id(&self) -> SpanID {
        self.inner.context.span_id
    }

    pub fn trace_id(&self) -> TraceID {
        self.inner.context.trace_id
    }

    pub fn trace_context(&self) -> &TraceContext {
        &self.inner.context
    }

    pub fn is_sampled(&self) -> bool {
        self.inner.context.is_sampled()
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == ENDED
    }

    pub fn name(&self) -> String {
        read(&self.inner.data).name.clone()
    }

    /// duration is only known once the transaction has ended.
    pub fn duration(&self) -> Option<Duration> {
        read(&self.inner.data).duration
    }

    pub fn result(&self) -> Option<String> {
        read(&self.inner.data).result.clone()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        read(&self.inner.data).outcome
    }

    /// child_ids lists the spans started under this transaction, in start
    /// order. It holds at most as many ids as the span limit allows.
    pub fn child_ids(&self) -> Vec<SpanID> {
        read(&self.inner.data).child_ids.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.mutate(|data| data.name = name.to_string());
    }

    pub fn set_result(&self, result: &str) {
        self.mutate(|data| data.result = Some(result.to_string()));
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        self.mutate(|data| data.outcome = Some(outcome));
    }

    pub fn set_label(&self, key: &str, value: impl Into<LabelValue>) {
        let value = value.into();
        self.mutate(|data| {
            data.context.labels.insert(key.to_string(), value);
        });
    }

    pub fn set_custom(&self, key: &str, value: serde_json::Value) {
        self.mutate(|data| {
            data.context.custom.insert(key.to_string(), value);
        });
    }

    pub fn set_request(&self, request: Request) {
        self.mutate(|data| data.context.request = Some(request));
    }

    /// set_response records the response and, unless already decided, derives
    /// the outcome from the status code.
    pub fn set_response(&self, response: Response) {
        self.mutate(|data| {
            if data.outcome.is_none() {
                data.outcome = Some(if response.status_code >= 500 {
                    Outcome::Failure
                } else {
                    Outcome::Success
                });
            }
            data.context.response = Some(response);
        });
    }

    /// record_failure attaches an error to the transaction. The transaction
    /// keeps running and is reported with a failure outcome.
    pub fn record_failure(&self, error: ErrorDetail) {
        self.mutate(|data| data.error = Some(error));
    }

    /// start_span starts a span directly under this transaction without
    /// touching the current execution context.
    pub fn start_span(&self, name: &str, span_type: &str) -> Span {
        Span::start(
            Some(&Segment::Transaction(self.clone())),
            SpanArgs::new(name, span_type),
            &self.inner.shared,
        )
    }

    /// end ends the transaction without a result.
    pub fn end(&self) {
        self.end_with_result(None)
    }

    /// end_with_result ends the transaction. Spans still running are closed
    /// with an `unfinished` outcome first. Ending twice is a counted no-op.
    pub fn end_with_result(&self, result: Option<&str>) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(ACTIVE, ENDED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            bump(&inner.shared.stats.double_ends);
            debug!("transaction {} ended twice", inner.context.span_id);
            return;
        }

        let unfinished = std::mem::take(&mut *lock(&inner.active_spans));
        for span in unfinished {
            span.force_close();
        }

        let duration = inner.start.elapsed();
        let record = {
            let mut data = write(&inner.data);
            data.duration = Some(duration);
            if let Some(result) = result {
                data.result = Some(result.to_string());
            }
            let outcome = match (data.outcome, &data.error) {
                (Some(outcome), None) => outcome,
                (_, Some(_)) => Outcome::Failure,
                (None, None) => Outcome::Success,
            };
            data.outcome = Some(outcome);
            self.make_record(&data, duration)
        };

        context::release();
        self.report(record);
    }

    fn make_record(&self, data: &TransactionData, duration: Duration) -> TransactionRecord {
        let ctx = &self.inner.context;
        let sampled = ctx.is_sampled();
        TransactionRecord {
            id: ctx.span_id,
            trace_id: ctx.trace_id,
            parent_id: ctx.parent_span_id,
            name: data.name.clone(),
            transaction_type: data.transaction_type.clone(),
            timestamp: self.inner.timestamp,
            duration_ms: duration_ms(duration),
            result: data.result.clone(),
            outcome: data.outcome.unwrap_or_default(),
            sampled,
            sample_rate: self.inner.sample_rate,
            span_count: SpanCount {
                started: data.spans_started,
                dropped: data.spans_dropped,
            },
            context: if sampled {
                Some(data.context.clone())
            } else {
                None
            },
            error: data.error.clone(),
            tracestate: ctx.trace_state.as_ref().map(Tracestate::to_header),
        }
    }

    fn report(&self, record: TransactionRecord) {
        let shared = &self.inner.shared;
        if !shared.recording {
            return;
        }
        if record.sampled {
            shared.exporter.export(Record::Transaction(record));
            return;
        }
        match shared.unsampled_policy {
            UnsampledPolicy::Marker => shared.exporter.export(Record::Transaction(record)),
            UnsampledPolicy::Drop => bump(&shared.stats.unsampled_dropped),
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut TransactionData)) {
        let mut data = write(&self.inner.data);
        if self.is_ended() {
            debug!("ignoring update to ended transaction {}", self.id());
            return;
        }
        f(&mut data);
    }

    pub fn ptr_eq(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.context.span_id)
            .field("trace_id", &self.inner.context.trace_id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction {} {}", self.id(), read(&self.inner.data).name)
    }
}

/// SpanOrigin names the diagnostic source and operation that opened a span.
#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct SpanOrigin {
    pub(crate) source: String,
    pub(crate) operation: String,
}

/// SpanArgs carries everything needed to open a span.
pub(crate) struct SpanArgs {
    pub(crate) name: String,
    pub(crate) span_type: String,
    pub(crate) origin: Option<SpanOrigin>,
    pub(crate) timestamp: SystemTime,
    pub(crate) labels: Labels,
}

impl SpanArgs {
    pub(crate) fn new(name: &str, span_type: &str) -> Self {
        SpanArgs {
            name: name.to_string(),
            span_type: span_type.to_string(),
            origin: None,
            timestamp: SystemTime::now(),
            labels: Labels::new(),
        }
    }
}

#[derive(Debug)]
struct SpanData {
    name: String,
    span_type: String,
    subtype: Option<String>,
    action: Option<String>,
    outcome: Option<Outcome>,
    context: SegmentContext,
    error: Option<ErrorDetail>,
    duration: Option<Duration>,
}

struct SpanInner {
    context: TraceContext,
    transaction_id: Option<SpanID>,
    transaction: Weak<TransactionInner>,
    parent: Option<Weak<SpanInner>>,
    timestamp: u64,
    start: Instant,
    state: AtomicU8,
    data: RwLock<SpanData>,
    active_children: Mutex<Vec<Span>>,
    orphaned: bool,
    recording: bool,
    origin: Option<SpanOrigin>,
    shared: Arc<TracerShared>,
}

/// Span is a nested unit of work within a transaction.
///
/// A span always ends no later than its parent: ending a parent closes any
/// child still running with an `unfinished` outcome.
#[derive(Clone)]
pub struct Span {
    inner: Arc<SpanInner>,
}

impl Span {
    /// start opens a span under `parent`. Without a live parent the span is
    /// orphaned: it gets its own trace id and is flagged, but still exported.
    pub(crate) fn start(parent: Option<&Segment>, args: SpanArgs, shared: &Arc<TracerShared>) -> Span {
        let span_id = shared.id_generator.new_span_id();
        // The parent's child list is locked while the span is built so that a
        // concurrent end either sees the new span or the span sees the end.
        let attached = match parent {
            Some(Segment::Transaction(tx)) => {
                let mut active = lock(&tx.inner.active_spans);
                if tx.is_ended() {
                    None
                } else {
                    let recording = claim_slot(&tx.inner, span_id, shared);
                    let context = tx.inner.context.child(span_id);
                    let span = Span::build(context, Some(tx), None, false, recording, &args, shared);
                    active.push(span.clone());
                    Some(span)
                }
            }
            Some(Segment::Span(parent)) => {
                let mut active = lock(&parent.inner.active_children);
                if parent.is_ended() {
                    None
                } else {
                    let tx = parent.transaction();
                    let recording = match &tx {
                        Some(tx) => claim_slot(&tx.inner, span_id, shared),
                        None => parent.inner.recording,
                    };
                    let context = parent.inner.context.child(span_id);
                    let orphaned = parent.inner.orphaned;
                    let span =
                        Span::build(context, tx.as_ref(), Some(parent), orphaned, recording, &args, shared);
                    active.push(span.clone());
                    Some(span)
                }
            }
            None => None,
        };
        attached.unwrap_or_else(|| Span::orphan(span_id, &args, shared))
    }

    fn orphan(span_id: SpanID, args: &SpanArgs, shared: &Arc<TracerShared>) -> Span {
        bump(&shared.stats.orphaned_spans);
        debug!("span {:?} has no live parent, starting a new trace", args.name);
        let context = TraceContext {
            trace_id: shared.id_generator.new_trace_id(),
            span_id,
            parent_span_id: None,
            trace_options: TraceOptions::SAMPLED,
            trace_state: None,
        };
        Span::build(context, None, None, true, shared.recording, args, shared)
    }

    fn build(
        context: TraceContext,
        transaction: Option<&Transaction>,
        parent: Option<&Span>,
        orphaned: bool,
        recording: bool,
        args: &SpanArgs,
        shared: &Arc<TracerShared>,
    ) -> Span {
        Span {
            inner: Arc::new(SpanInner {
                context,
                transaction_id: transaction.map(Transaction::id),
                transaction: transaction
                    .map(|tx| Arc::downgrade(&tx.inner))
                    .unwrap_or_default(),
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                timestamp: epoch_micros(args.timestamp),
                start: Instant::now(),
                state: AtomicU8::new(ACTIVE),
                data: RwLock::new(SpanData {
                    name: args.name.clone(),
                    span_type: args.span_type.clone(),
                    subtype: None,
                    action: None,
                    outcome: None,
                    context: SegmentContext {
                        labels: args.labels.clone(),
                        ..SegmentContext::default()
                    },
                    error: None,
                    duration: None,
                }),
                active_children: Mutex::new(Vec::new()),
                orphaned,
                recording,
                origin: args.origin.clone(),
                shared: Arc::clone(shared),
            }),
        }
    }

    pub fn id(&self) -> SpanID {
        self.inner.context.span_id
    }

    pub fn trace_id(&self) -> TraceID {
        self.inner.context.trace_id
    }

    /// parent_id is the id of the transaction or span this span was started
    /// under; None only for orphaned spans.
    pub fn parent_id(&self) -> Option<SpanID> {
        self.inner.context.parent_span_id
    }

    pub fn transaction_id(&self) -> Option<SpanID> {
        self.inner.transaction_id
    }

    pub fn transaction(&self) -> Option<Transaction> {
        self.inner
            .transaction
            .upgrade()
            .map(|inner| Transaction { inner })
    }

    pub fn trace_context(&self) -> &TraceContext {
        &self.inner.context
    }

    pub fn is_sampled(&self) -> bool {
        self.inner.context.is_sampled()
    }

    pub fn is_orphaned(&self) -> bool {
        self.inner.orphaned
    }

    /// is_recording indicates whether the span will be exported when it ends.
    pub fn is_recording(&self) -> bool {
        self.inner.recording
    }

    pub fn is_ended(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == ENDED
    }

    pub fn name(&self) -> String {
        read(&self.inner.data).name.clone()
    }

    pub fn duration(&self) -> Option<Duration> {
        read(&self.inner.data).duration
    }

    pub fn outcome(&self) -> Option<Outcome> {
        read(&self.inner.data).outcome
    }

    pub(crate) fn origin(&self) -> Option<&SpanOrigin> {
        self.inner.origin.as_ref()
    }

    pub fn set_name(&self, name: &str) {
        self.mutate(|data| data.name = name.to_string());
    }

    pub fn set_subtype(&self, subtype: &str, action: Option<&str>) {
        self.mutate(|data| {
            data.subtype = Some(subtype.to_string());
            data.action = action.map(str::to_string);
        });
    }

    pub fn set_outcome(&self, outcome: Outcome) {
        self.mutate(|data| data.outcome = Some(outcome));
    }

    pub fn set_label(&self, key: &str, value: impl Into<LabelValue>) {
        let value = value.into();
        self.mutate(|data| {
            data.context.labels.insert(key.to_string(), value);
        });
    }

    pub fn set_custom(&self, key: &str, value: serde_json::Value) {
        self.mutate(|data| {
            data.context.custom.insert(key.to_string(), value);
        });
    }

    pub fn record_failure(&self, error: ErrorDetail) {
        self.mutate(|data| data.error = Some(error));
    }

    /// start_child starts a span under this one without touching the current
    /// execution context.
    pub fn start_child(&self, name: &str, span_type: &str) -> Span {
        Span::start(
            Some(&Segment::Span(self.clone())),
            SpanArgs::new(name, span_type),
            &self.inner.shared,
        )
    }

    /// end closes the span and exports it if it should be exported. Ending
    /// twice is a counted no-op.
    pub fn end(&self) {
        self.end_internal(false)
    }

    fn force_close(&self) {
        self.end_internal(true)
    }

    fn end_internal(&self, forced: bool) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(ACTIVE, ENDED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if !forced {
                bump(&inner.shared.stats.double_ends);
                debug!("span {} ended twice", inner.context.span_id);
            }
            return;
        }

        let unfinished = std::mem::take(&mut *lock(&inner.active_children));
        for child in unfinished {
            child.force_close();
        }

        let duration = inner.start.elapsed();
        let record = {
            let mut data = write(&inner.data);
            data.duration = Some(duration);
            let outcome = if forced {
                Outcome::Unfinished
            } else {
                match (data.outcome, &data.error) {
                    (Some(outcome), None) => outcome,
                    (_, Some(_)) => Outcome::Failure,
                    (None, None) => Outcome::Success,
                }
            };
            data.outcome = Some(outcome);
            self.make_record(&data, duration)
        };

        self.detach();
        context::release();

        let shared = &inner.shared;
        if !shared.recording {
            return;
        }
        if inner.recording {
            shared.exporter.export(Record::Span(record));
        } else if !self.is_sampled() {
            bump(&shared.stats.unsampled_dropped);
        }
    }

    fn detach(&self) {
        let inner = &self.inner;
        if let Some(parent) = inner.parent.as_ref().and_then(Weak::upgrade) {
            lock(&parent.active_children).retain(|s| !Arc::ptr_eq(&s.inner, inner));
        } else if let Some(tx) = inner.transaction.upgrade() {
            lock(&tx.active_spans).retain(|s| !Arc::ptr_eq(&s.inner, inner));
        }
    }

    fn make_record(&self, data: &SpanData, duration: Duration) -> SpanRecord {
        let inner = &self.inner;
        SpanRecord {
            id: inner.context.span_id,
            trace_id: inner.context.trace_id,
            parent_id: inner.context.parent_span_id,
            transaction_id: inner.transaction_id,
            name: data.name.clone(),
            span_type: data.span_type.clone(),
            subtype: data.subtype.clone(),
            action: data.action.clone(),
            timestamp: inner.timestamp,
            duration_ms: duration_ms(duration),
            outcome: data.outcome.unwrap_or_default(),
            sampled: inner.context.is_sampled(),
            orphaned: inner.orphaned,
            context: SegmentContext {
                request: None,
                response: None,
                labels: data.context.labels.clone(),
                custom: data.context.custom.clone(),
            },
            error: data.error.clone(),
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut SpanData)) {
        let mut data = write(&self.inner.data);
        if self.is_ended() {
            debug!("ignoring update to ended span {}", self.id());
            return;
        }
        f(&mut data);
    }

    pub fn ptr_eq(&self, other: &Span) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// claim_slot registers a new span with its transaction and reports whether
/// the span is recorded. Spans past the per-transaction limit are counted as
/// dropped instead.
fn claim_slot(tx: &TransactionInner, span_id: SpanID, shared: &TracerShared) -> bool {
    let mut data = write(&tx.data);
    if data.child_ids.len() < shared.transaction_max_spans {
        data.child_ids.push(span_id);
    }
    if !tx.context.is_sampled() || !shared.recording {
        return false;
    }
    if data.spans_started as usize >= shared.transaction_max_spans {
        data.spans_dropped += 1;
        bump(&shared.stats.max_spans_dropped);
        return false;
    }
    data.spans_started += 1;
    true
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.inner.context.span_id)
            .field("parent_id", &self.inner.context.parent_span_id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "span {} {}", self.id(), read(&self.inner.data).name)
    }
}

/// Segment is either kind of traced unit of work.
#[derive(Clone, Debug)]
pub enum Segment {
    Transaction(Transaction),
    Span(Span),
}

impl Segment {
    pub fn id(&self) -> SpanID {
        match self {
            Segment::Transaction(tx) => tx.id(),
            Segment::Span(span) => span.id(),
        }
    }

    pub fn trace_id(&self) -> TraceID {
        match self {
            Segment::Transaction(tx) => tx.trace_id(),
            Segment::Span(span) => span.trace_id(),
        }
    }

    pub fn trace_context(&self) -> &TraceContext {
        match self {
            Segment::Transaction(tx) => tx.trace_context(),
            Segment::Span(span) => span.trace_context(),
        }
    }

    pub fn is_ended(&self) -> bool {
        match self {
            Segment::Transaction(tx) => tx.is_ended(),
            Segment::Span(span) => span.is_ended(),
        }
    }

    /// transaction is the root of the trace on this process, if any.
    pub fn transaction(&self) -> Option<Transaction> {
        match self {
            Segment::Transaction(tx) => Some(tx.clone()),
            Segment::Span(span) => span.transaction(),
        }
    }

    pub fn record_failure(&self, error: ErrorDetail) {
        match self {
            Segment::Transaction(tx) => tx.record_failure(error),
            Segment::Span(span) => span.record_failure(error),
        }
    }

    pub fn ptr_eq(&self, other: &Segment) -> bool {
        match (self, other) {
            (Segment::Transaction(a), Segment::Transaction(b)) => a.ptr_eq(b),
            (Segment::Span(a), Segment::Span(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<Transaction> for Segment {
    fn from(tx: Transaction) -> Self {
        Segment::Transaction(tx)
    }
}

impl From<Span> for Segment {
    fn from(span: Span) -> Self {
        Segment::Span(span)
    }
}
