/*!
Package apm_trace records distributed traces of a service and reports them to
an APM collector.

The following assumes a basic familiarity with transactions and spans: a
transaction is the top-level unit of work a service performs, for example
handling one request, and spans are the nested operations inside it.

### Starting the Agent

An [`Agent`] is configured once, at startup, and owns everything else. It never
panics on bad configuration; instead it logs the problem and runs in a reduced
[`AgentMode`].

```no_run
use apm_trace::{Agent, Config};

# async fn run() {
let agent = Agent::new(Config::from_env().with_service_name("checkout"));
// ... serve requests ...
let stats = agent.shutdown().await;
println!("sent {} records", stats.sent_records);
# }
```

By default every trace is sampled. Set `ELASTIC_APM_TRANSACTION_SAMPLE_RATE`
to keep a fraction of traces; the decision is made once, when the trace starts,
and carried to downstream services in the `traceparent` header.

### Adding Spans to a Trace

The current segment of each execution flow is tracked for you. Synchronous
code shares one slot per thread. Futures get their own slot when wrapped with
[`context::scope`] or [`context::propagate`], which then follows the task across
worker threads.

```rust
use std::sync::Arc;
use apm_trace::{NoopExporter, Tracer};

let tracer = Tracer::builder(Arc::new(NoopExporter)).build();

let tx = tracer.begin_transaction("GET /users", "request", None);
let span = tracer.start_span("SELECT users", "db");
span.end();
tracer.end_transaction(&tx, Some("HTTP 2xx"));
```

start_span creates an orphaned span with a trace of its own if there is no
current transaction.

Async request handlers should use [`Tracer::in_transaction`]. Tasks on a tokio
worker share its thread, so a transaction is only current inside a task-local
scope:

```no_run
# use apm_trace::Tracer;
# async fn handle(tracer: &Tracer) {
tracer
    .in_transaction("GET /users", "request", None, |tx| async move {
        let span = tracer.start_span("SELECT users", "db");
        // ... await the query ...
        span.end();
        tracer.end_transaction(&tx, Some("HTTP 2xx"));
    })
    .await;
# }
```
*/
#![warn(rust_2018_idioms, clippy::all)]

mod agent;
mod basetypes;
mod config;
/// Current segment tracking
pub mod context;
/// Diagnostic event intake
pub mod diagnostics;
mod error;
mod export;
mod id_generator;
mod pipeline;
/// Trace propagation
pub mod propagation;
/// Trace sampling
pub mod sampling;
mod stats;
mod trace;
mod tracer;
/// W3C tracestate
pub mod tracestate;
mod transport;

pub use crate::agent::{Agent, AgentBuilder};
pub use crate::basetypes::{ErrorDetail, LabelValue, Labels, Outcome, SpanID, TraceID};
pub use crate::config::{AgentMode, Config, UnsampledPolicy};
pub use crate::error::{ConfigError, TransportError};
pub use crate::export::{
    encode_line, encode_metadata, CaptureOnlyExporter, Exporter, Metadata, NameVersion, NoopExporter,
    ProcessMetadata, Record, ServiceMetadata, SpanCount, SpanRecord, TransactionRecord,
};
pub use crate::id_generator::{default_id_generator, IDGenerator, SeededIDGenerator};
pub use crate::pipeline::{ExportPipeline, PipelineConfig};
pub use crate::stats::{AgentStats, StatsSnapshot};
pub use crate::trace::{
    result_for_status, Request, Response, Segment, SegmentContext, Socket, Span, TraceContext,
    TraceOptions, Transaction, Url,
};
pub use crate::tracer::{Tracer, TracerBuilder, TransactionHandle, DEFAULT_TRANSACTION_MAX_SPANS};
pub use crate::tracestate::{Member, Tracestate, TracestateError};
pub use crate::transport::{BackoffConfig, HttpTransport, Transport, INTAKE_PATH};
