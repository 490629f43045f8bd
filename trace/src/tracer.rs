use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::debug;

use crate::basetypes::{ErrorDetail, Labels, Outcome};
use crate::config::{Config, UnsampledPolicy};
use crate::context;
use crate::export::Exporter;
use crate::id_generator::{default_id_generator, IDGenerator};
use crate::propagation::{InboundContext, TraceParent};
use crate::sampling::{probability_sampler, Sampler, SamplingParameters};
use crate::stats::{bump, AgentStats, StatsSnapshot};
use crate::trace::{Segment, Span, SpanArgs, SpanOrigin, TraceContext, TraceOptions, Transaction};
use crate::tracestate::Tracestate;

/// TransactionHandle is what request adapters hold on to between the start
/// and the end of a request.
pub type TransactionHandle = Transaction;

/// Transactions may record at most this many spans unless configured otherwise.
pub const DEFAULT_TRANSACTION_MAX_SPANS: usize = 500;

pub(crate) struct TracerShared {
    pub(crate) id_generator: Arc<dyn IDGenerator + Send + Sync>,
    pub(crate) sampler: Sampler,
    pub(crate) sample_rate: f64,
    pub(crate) exporter: Arc<dyn Exporter + Send + Sync>,
    pub(crate) stats: Arc<AgentStats>,
    pub(crate) unsampled_policy: UnsampledPolicy,
    pub(crate) transaction_max_spans: usize,
    /// false when the agent is inert: segments are tracked but never reported.
    pub(crate) recording: bool,
}

/// Tracer starts and ends transactions and spans, keeping the current
/// segment of each execution flow up to date.
#[derive(Clone)]
pub struct Tracer {
    shared: Arc<TracerShared>,
}

/// TracerBuilder assembles a [`Tracer`].
pub struct TracerBuilder {
    id_generator: Arc<dyn IDGenerator + Send + Sync>,
    sample_rate: f64,
    sampler: Option<Sampler>,
    exporter: Arc<dyn Exporter + Send + Sync>,
    stats: Arc<AgentStats>,
    unsampled_policy: UnsampledPolicy,
    transaction_max_spans: usize,
    recording: bool,
}

impl TracerBuilder {
    pub fn new(exporter: Arc<dyn Exporter + Send + Sync>) -> Self {
        TracerBuilder {
            id_generator: default_id_generator(),
            sample_rate: 1.0,
            sampler: None,
            exporter,
            stats: Arc::new(AgentStats::default()),
            unsampled_policy: UnsampledPolicy::default(),
            transaction_max_spans: DEFAULT_TRANSACTION_MAX_SPANS,
            recording: true,
        }
    }

    pub fn from_config(config: &Config, exporter: Arc<dyn Exporter + Send + Sync>) -> Self {
        TracerBuilder::new(exporter)
            .sample_rate(config.transaction_sample_rate)
            .unsampled_policy(config.unsampled_policy)
            .transaction_max_spans(config.transaction_max_spans)
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IDGenerator + Send + Sync>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// sample_rate selects a probability sampler keeping `rate` of new traces.
    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = rate;
        self.sampler = None;
        self
    }

    /// sampler replaces the probability sampler. `sample_rate` is still
    /// reported on transactions.
    pub fn sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn stats(mut self, stats: Arc<AgentStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn unsampled_policy(mut self, policy: UnsampledPolicy) -> Self {
        self.unsampled_policy = policy;
        self
    }

    pub fn transaction_max_spans(mut self, max: usize) -> Self {
        self.transaction_max_spans = max;
        self
    }

    pub fn recording(mut self, recording: bool) -> Self {
        self.recording = recording;
        self
    }

    pub fn build(self) -> Tracer {
        let sampler = self
            .sampler
            .unwrap_or_else(|| probability_sampler(self.sample_rate));
        Tracer {
            shared: Arc::new(TracerShared {
                id_generator: self.id_generator,
                sampler,
                sample_rate: self.sample_rate,
                exporter: self.exporter,
                stats: self.stats,
                unsampled_policy: self.unsampled_policy,
                transaction_max_spans: self.transaction_max_spans,
                recording: self.recording,
            }),
        }
    }
}

impl Tracer {
    pub fn builder(exporter: Arc<dyn Exporter + Send + Sync>) -> TracerBuilder {
        TracerBuilder::new(exporter)
    }

    /// begin_transaction starts a transaction and makes it current.
    ///
    /// With an inbound traceparent the transaction joins the caller's trace
    /// and adopts its sampling decision; otherwise a new trace is started and
    /// sampled exactly once, here.
    ///
    /// The transaction stays current until it ends. In async code prefer
    /// [`in_transaction`](Self::in_transaction): outside a task-local scope
    /// the transaction cannot be made current and spans started later become
    /// orphans.
    pub fn begin_transaction(
        &self,
        name: &str,
        transaction_type: &str,
        inbound: Option<&InboundContext>,
    ) -> TransactionHandle {
        let tx = self.create_transaction(name, transaction_type, inbound);
        self.make_current(Segment::Transaction(tx.clone()));
        tx
    }

    /// in_transaction runs the future built by `f` with a new transaction
    /// current for its whole lifetime, across every `await`.
    ///
    /// The transaction is ended when the future completes, unless `f` ended it
    /// already. It is also ended if the future is dropped early or panics, the
    /// latter with a failure outcome.
    pub async fn in_transaction<F, Fut>(
        &self,
        name: &str,
        transaction_type: &str,
        inbound: Option<&InboundContext>,
        f: F,
    ) -> Fut::Output
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future,
    {
        let tx = self.create_transaction(name, transaction_type, inbound);
        let _end = EndOnExit(tx.clone());
        context::scope(tx.clone(), f(tx)).await
    }

    /// with_transaction is [`in_transaction`](Self::in_transaction) for
    /// synchronous handlers.
    pub fn with_transaction<R>(
        &self,
        name: &str,
        transaction_type: &str,
        inbound: Option<&InboundContext>,
        f: impl FnOnce(&Transaction) -> R,
    ) -> R {
        let tx = self.create_transaction(name, transaction_type, inbound);
        let _end = EndOnExit(tx.clone());
        context::sync_scope(tx.clone(), || f(&tx))
    }

    /// create_transaction starts a transaction without making it current.
    /// Use [`context::scope`] to run a future with it as the current segment.
    pub fn create_transaction(
        &self,
        name: &str,
        transaction_type: &str,
        inbound: Option<&InboundContext>,
    ) -> Transaction {
        let shared = &self.shared;
        let span_id = shared.id_generator.new_span_id();
        let upstream = inbound.and_then(|c| c.traceparent.as_ref().map(|tp| (tp, &c.tracestate)));
        let (context, sample_rate) = match upstream {
            Some((traceparent, tracestate)) => (
                TraceContext {
                    trace_id: traceparent.trace_id,
                    span_id,
                    parent_span_id: Some(traceparent.parent_id),
                    trace_options: traceparent.trace_options,
                    trace_state: tracestate.clone(),
                },
                tracestate.as_ref().and_then(Tracestate::sample_rate),
            ),
            None => {
                let trace_id = shared.id_generator.new_trace_id();
                let decision = (shared.sampler)(SamplingParameters {
                    trace_id: &trace_id,
                    name,
                });
                let recorded_rate = if decision.sample {
                    shared.sample_rate
                } else {
                    0.0
                };
                let context = TraceContext {
                    trace_id,
                    span_id,
                    parent_span_id: None,
                    trace_options: TraceOptions::default().with_sampled(decision.sample),
                    trace_state: Some(Tracestate::default().with_sample_rate(recorded_rate)),
                };
                (context, Some(shared.sample_rate))
            }
        };
        Transaction::new(
            context,
            name,
            transaction_type,
            sample_rate,
            Arc::clone(shared),
        )
    }

    /// end_transaction ends `transaction`, optionally recording its result.
    pub fn end_transaction(&self, transaction: &Transaction, result: Option<&str>) {
        transaction.end_with_result(result)
    }

    /// start_span starts a span under the current segment and makes it current.
    pub fn start_span(&self, name: &str, span_type: &str) -> Span {
        self.start_span_with(SpanArgs::new(name, span_type))
    }

    pub(crate) fn start_span_from_source(
        &self,
        name: &str,
        span_type: &str,
        origin: SpanOrigin,
        timestamp: SystemTime,
        labels: Labels,
    ) -> Span {
        self.start_span_with(SpanArgs {
            name: name.to_string(),
            span_type: span_type.to_string(),
            origin: Some(origin),
            timestamp,
            labels,
        })
    }

    fn start_span_with(&self, args: SpanArgs) -> Span {
        let parent = context::current_segment();
        let span = Span::start(parent.as_ref(), args, &self.shared);
        self.make_current(Segment::Span(span.clone()));
        span
    }

    fn make_current(&self, segment: Segment) {
        let id = segment.id();
        if !context::push(segment) {
            bump(&self.shared.stats.unscoped_segments);
            debug!("segment {id} not made current: async code outside a context scope");
        }
    }

    /// capture_error attaches an error to the current segment. Returns false,
    /// and counts the error, when there is no current segment.
    pub fn capture_error(&self, message: &str, kind: Option<&str>) -> bool {
        match context::current_segment() {
            Some(segment) => {
                segment.record_failure(ErrorDetail::new(message, kind.map(str::to_string)));
                true
            }
            None => {
                bump(&self.shared.stats.unmatched_errors);
                debug!("no current segment for error {:?}", message);
                false
            }
        }
    }

    /// outgoing_traceparent is the header value for a request made from the
    /// current segment.
    pub fn outgoing_traceparent(&self) -> Option<TraceParent> {
        context::current_segment().map(|segment| segment.trace_context().traceparent())
    }

    /// outgoing_tracestate is the `tracestate` header value to send along
    /// with [`outgoing_traceparent`](Self::outgoing_traceparent).
    pub fn outgoing_tracestate(&self) -> Option<String> {
        context::current_segment()
            .and_then(|segment| segment.trace_context().trace_state.clone())
            .filter(|state| !state.is_empty())
            .map(|state| state.to_header())
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        context::current_transaction()
    }

    pub fn current_span(&self) -> Option<Span> {
        context::current_span()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub(crate) fn agent_stats(&self) -> &Arc<AgentStats> {
        &self.shared.stats
    }
}

// Ends a scoped transaction on every exit path.
struct EndOnExit(Transaction);

impl Drop for EndOnExit {
    fn drop(&mut self) {
        if self.0.is_ended() {
            return;
        }
        if std::thread::panicking() {
            self.0.set_outcome(Outcome::Failure);
        }
        self.0.end();
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::testing::{test_builder, test_tracer};
    use super::*;
    use crate::basetypes::Outcome;
    use crate::export::Record;
    use crate::trace::{result_for_status, Response};

    fn sleep() {
        std::thread::sleep(Duration::from_millis(1));
    }

    #[test]
    fn nested_spans_link_to_their_parents() {
        let (tracer, exporter) = test_tracer(1.0);
        let tx = tracer.begin_transaction("GET /users", "request", None);
        let a = tracer.start_span("A", "app");
        let b = tracer.start_span("B", "db");
        sleep();
        b.end();
        assert!(tracer.current_span().unwrap().ptr_eq(&a));
        a.end();
        assert!(tracer.current_span().is_none());
        tracer.end_transaction(&tx, Some("HTTP 2xx"));
        assert!(tracer.current_transaction().is_none());

        let records = exporter.records();
        assert_eq!(records.len(), 3);
        match (&records[0], &records[1], &records[2]) {
            (Record::Span(b_rec), Record::Span(a_rec), Record::Transaction(tx_rec)) => {
                assert_eq!(b_rec.parent_id, Some(a.id()));
                assert_eq!(a_rec.parent_id, Some(tx.id()));
                assert_eq!(b_rec.transaction_id, Some(tx.id()));
                assert_eq!(b_rec.trace_id, tx.trace_id());
                assert!(b_rec.duration_ms > 0.0);
                assert!(a_rec.duration_ms >= b_rec.duration_ms);
                assert_eq!(tx_rec.result.as_deref(), Some("HTTP 2xx"));
                assert_eq!(tx_rec.outcome, Outcome::Success);
                assert_eq!(tx_rec.span_count.started, 2);
                assert_eq!(tx_rec.sample_rate, Some(1.0));
            }
            other => panic!("unexpected records {:?}", other),
        }
        assert_eq!(tx.child_ids(), vec![a.id(), b.id()]);
    }

    #[test]
    fn inbound_traceparent_is_continued() {
        let (tracer, exporter) = test_tracer(0.0);
        let inbound = InboundContext::from_headers(vec![(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )]);
        let tx = tracer.begin_transaction("GET /", "request", Some(&inbound));
        assert!(tx.is_sampled());
        assert_eq!(
            tx.trace_id().to_string(),
            "0af7651916cd43dd8448eb211c80319c"
        );
        let outgoing = tracer.outgoing_traceparent().unwrap();
        assert_eq!(outgoing.trace_id, tx.trace_id());
        assert_eq!(outgoing.parent_id, tx.id());
        tx.end();

        match &exporter.records()[0] {
            Record::Transaction(rec) => {
                assert_eq!(rec.parent_id.unwrap().to_string(), "b7ad6b7169203331");
                assert_eq!(rec.sample_rate, None);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn upstream_sample_rate_is_reported() {
        let (tracer, exporter) = test_tracer(1.0);
        let inbound = InboundContext::from_headers(vec![
            (
                "traceparent",
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            ),
            ("tracestate", "es=s:0.5,rojo=00f067aa0ba902b7"),
        ]);
        tracer.begin_transaction("GET /", "request", Some(&inbound)).end();

        match &exporter.records()[0] {
            Record::Transaction(rec) => {
                assert_eq!(rec.sample_rate, Some(0.5));
                assert_eq!(
                    rec.tracestate.as_deref(),
                    Some("es=s:0.5,rojo=00f067aa0ba902b7")
                );
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn unsampled_transactions_are_dropped_by_default() {
        let (tracer, exporter) = test_tracer(0.0);
        let tx = tracer.begin_transaction("GET /", "request", None);
        let span = tracer.start_span("query", "db");
        assert!(!span.is_recording());
        span.end();
        tx.end();
        assert!(exporter.records().is_empty());
        assert_eq!(tracer.stats().unsampled_dropped, 2);
    }

    #[test]
    fn unsampled_marker_policy_reports_the_transaction_only() {
        let (builder, exporter) = test_builder(0.0);
        let tracer = builder.unsampled_policy(UnsampledPolicy::Marker).build();
        let tx = tracer.begin_transaction("GET /", "request", None);
        tx.set_label("user", "alice");
        tracer.start_span("query", "db").end();
        tx.end();

        let records = exporter.records();
        assert_eq!(records.len(), 1);
        match &records[0] {
            Record::Transaction(rec) => {
                assert!(!rec.sampled);
                assert!(rec.context.is_none());
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn ending_a_transaction_closes_running_spans() {
        let (tracer, exporter) = test_tracer(1.0);
        let tx = tracer.begin_transaction("job", "worker", None);
        let outer = tracer.start_span("outer", "app");
        let inner = tracer.start_span("inner", "app");
        tx.end();
        assert!(outer.is_ended());
        assert!(inner.is_ended());
        assert_eq!(inner.outcome(), Some(Outcome::Unfinished));
        assert!(tracer.current_span().is_none());
        assert_eq!(exporter.records().len(), 3);

        // ending it again afterwards is counted, not reported
        let span_duration = inner.duration().unwrap();
        let tx_duration = tx.duration().unwrap();
        sleep();
        inner.end();
        tx.end();
        assert_eq!(inner.duration(), Some(span_duration));
        assert_eq!(tx.duration(), Some(tx_duration));
        assert_eq!(inner.outcome(), Some(Outcome::Unfinished));
        assert_eq!(tracer.stats().double_ends, 2);
        assert_eq!(exporter.records().len(), 3);
    }

    #[test]
    fn second_end_keeps_the_first_duration() {
        let (tracer, exporter) = test_tracer(1.0);
        let tx = tracer.begin_transaction("job", "worker", None);
        let span = tracer.start_span("step", "app");
        sleep();
        span.end();
        let first = span.duration().unwrap();
        sleep();
        span.end();
        assert_eq!(span.duration(), Some(first));

        tracer.end_transaction(&tx, Some("done"));
        let first = tx.duration().unwrap();
        sleep();
        tracer.end_transaction(&tx, Some("again"));
        assert_eq!(tx.duration(), Some(first));
        assert_eq!(tx.result().as_deref(), Some("done"));
        assert_eq!(tracer.stats().double_ends, 2);
        assert_eq!(exporter.records().len(), 2);
    }

    #[test]
    fn spans_without_a_transaction_are_orphaned() {
        let (tracer, exporter) = test_tracer(1.0);
        let orphan = tracer.start_span("cache", "db");
        let child = tracer.start_span("get", "db");
        assert!(orphan.is_orphaned());
        assert!(orphan.parent_id().is_none());
        assert!(child.is_orphaned());
        assert_eq!(child.parent_id(), Some(orphan.id()));
        assert_eq!(child.trace_id(), orphan.trace_id());
        child.end();
        orphan.end();

        assert_eq!(tracer.stats().orphaned_spans, 1);
        assert_eq!(exporter.records().len(), 2);
    }

    #[test]
    fn errors_mark_the_segment_as_failed() {
        let (tracer, exporter) = test_tracer(1.0);
        assert!(!tracer.capture_error("early", None));
        let tx = tracer.begin_transaction("POST /orders", "request", None);
        let span = tracer.start_span("insert", "db");
        assert!(tracer.capture_error("duplicate key", Some("SqlError")));
        span.end();
        tx.set_response(Response {
            status_code: 200,
            ..Response::default()
        });
        tx.end_with_result(Some(&result_for_status(200)));

        let records = exporter.records();
        match (&records[0], &records[1]) {
            (Record::Span(span_rec), Record::Transaction(tx_rec)) => {
                assert_eq!(span_rec.outcome, Outcome::Failure);
                assert_eq!(span_rec.error.as_ref().unwrap().message, "duplicate key");
                assert_eq!(tx_rec.outcome, Outcome::Success);
                assert_eq!(tx_rec.result.as_deref(), Some("HTTP 2xx"));
            }
            other => panic!("unexpected records {:?}", other),
        }
        assert_eq!(tracer.stats().unmatched_errors, 1);
    }

    #[test]
    fn server_errors_fail_the_transaction() {
        let (tracer, exporter) = test_tracer(1.0);
        let tx = tracer.begin_transaction("GET /", "request", None);
        tx.set_response(Response {
            status_code: 503,
            ..Response::default()
        });
        tx.end_with_result(Some(&result_for_status(503)));
        match &exporter.records()[0] {
            Record::Transaction(rec) => {
                assert_eq!(rec.outcome, Outcome::Failure);
                assert_eq!(rec.result.as_deref(), Some("HTTP 5xx"));
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn span_limit_counts_dropped_spans() {
        let (builder, exporter) = test_builder(1.0);
        let tracer = builder.transaction_max_spans(2).build();
        let tx = tracer.begin_transaction("batch", "worker", None);
        for _ in 0..5 {
            tracer.start_span("step", "app").end();
        }
        tx.end();

        assert_eq!(exporter.records().len(), 3);
        assert_eq!(tracer.stats().max_spans_dropped, 3);
        assert_eq!(tx.child_ids().len(), 2);
        match exporter.records().last() {
            Some(Record::Transaction(rec)) => {
                assert_eq!(rec.span_count.started, 2);
                assert_eq!(rec.span_count.dropped, 3);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn child_ids_stop_at_the_span_limit() {
        let (builder, _) = test_builder(0.0);
        let tracer = builder.transaction_max_spans(3).build();
        let tx = tracer.begin_transaction("poll", "worker", None);
        let ids: Vec<_> = (0..50)
            .map(|_| {
                let span = tracer.start_span("tick", "app");
                span.end();
                span.id()
            })
            .collect();
        tx.end();
        assert_eq!(tx.child_ids(), ids[..3].to_vec());
    }

    #[test]
    fn new_traces_send_their_sample_rate() {
        let (tracer, _) = test_tracer(1.0);
        assert_eq!(tracer.outgoing_tracestate(), None);
        let tx = tracer.begin_transaction("GET /", "request", None);
        let span = tracer.start_span("call", "external");
        assert_eq!(tracer.outgoing_tracestate().as_deref(), Some("es=s:1"));

        let traceparent = tracer.outgoing_traceparent().unwrap().to_string();
        let tracestate = tracer.outgoing_tracestate().unwrap();
        let (downstream, exporter) = test_tracer(0.0);
        let inbound = InboundContext::from_headers(vec![
            ("traceparent", traceparent.as_str()),
            ("tracestate", tracestate.as_str()),
        ]);
        downstream.begin_transaction("GET /items", "request", Some(&inbound)).end();
        match &exporter.records()[0] {
            Record::Transaction(rec) => {
                assert_eq!(rec.parent_id, Some(span.id()));
                assert!(rec.sampled);
                assert_eq!(rec.sample_rate, Some(1.0));
            }
            other => panic!("unexpected record {:?}", other),
        }
        span.end();
        tx.end();

        let (unsampled, _) = test_tracer(0.0);
        let tx = unsampled.begin_transaction("GET /", "request", None);
        assert_eq!(unsampled.outgoing_tracestate().as_deref(), Some("es=s:0"));
        tx.end();
    }

    #[test]
    fn with_transaction_ends_and_restores() {
        let (tracer, exporter) = test_tracer(1.0);
        let id = tracer.with_transaction("job", "worker", None, |tx| {
            tracer.start_span("step", "app").end();
            assert!(tracer.current_transaction().unwrap().ptr_eq(tx));
            tx.id()
        });
        assert!(tracer.current_transaction().is_none());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tracer.with_transaction("crash", "worker", None, |_| {
                let _span = tracer.start_span("step", "app");
                panic!("handler failed");
            })
        }));
        assert!(result.is_err());
        assert!(tracer.current_transaction().is_none());
        assert!(tracer.current_span().is_none());

        let records = exporter.records();
        assert_eq!(records.len(), 4);
        match (&records[1], &records[3]) {
            (Record::Transaction(ok), Record::Transaction(crashed)) => {
                assert_eq!(ok.id, id);
                assert_eq!(ok.outcome, Outcome::Success);
                assert_eq!(crashed.outcome, Outcome::Failure);
            }
            other => panic!("unexpected records {:?}", other),
        }
        assert_eq!(tracer.stats().double_ends, 0);
    }

    #[test]
    fn ended_segments_ignore_updates() {
        let (tracer, exporter) = test_tracer(1.0);
        let tx = tracer.begin_transaction("GET /", "request", None);
        tx.end();
        tx.set_name("renamed");
        tx.set_label("late", true);
        assert_eq!(tx.name(), "GET /");
        match &exporter.records()[0] {
            Record::Transaction(rec) => {
                assert!(rec.context.as_ref().unwrap().labels.is_empty())
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn inert_tracer_reports_nothing() {
        let (builder, exporter) = test_builder(1.0);
        let tracer = builder.recording(false).build();
        let tx = tracer.begin_transaction("GET /", "request", None);
        tracer.start_span("query", "db").end();
        tx.end();
        assert!(exporter.records().is_empty());
        assert_eq!(tracer.stats(), StatsSnapshot::default());
    }
}
