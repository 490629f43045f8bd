//! Intake for operation events published by instrumented libraries.
//!
//! A library exposes a [`DiagnosticSource`]. Once registered it receives an
//! [`EventSink`] and reports start, stop and error events for the operations
//! it performs. Starts open a span under the current segment, stops close it
//! again, and errors are attached to whatever segment is current.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use tracing::debug;

use crate::basetypes::{LabelValue, Labels};
use crate::context;
use crate::stats::bump;
use crate::trace::SpanOrigin;
use crate::tracer::Tracer;

/// Correlation keys carrying error details on [`EventKind::Error`] events.
pub const ERROR_MESSAGE_KEY: &str = "error.message";
pub const ERROR_TYPE_KEY: &str = "error.type";

const DEFAULT_CATEGORY: &str = "external";

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub enum EventKind {
    Start,
    Stop,
    Error,
}

/// DiagnosticEvent is one notification from an instrumented library.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DiagnosticEvent {
    pub source_name: String,
    pub kind: EventKind,
    pub operation_name: String,
    /// Span type for the operation, such as `db` or `external`.
    pub category: String,
    pub correlation_context: BTreeMap<String, String>,
    pub timestamp: SystemTime,
}

impl DiagnosticEvent {
    pub fn new(source_name: &str, kind: EventKind, operation_name: &str) -> Self {
        DiagnosticEvent {
            source_name: source_name.to_string(),
            kind,
            operation_name: operation_name.to_string(),
            category: DEFAULT_CATEGORY.to_string(),
            correlation_context: BTreeMap::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_category(mut self, category: &str) -> Self {
        self.category = category.to_string();
        self
    }

    pub fn with_entry(mut self, key: &str, value: &str) -> Self {
        self.correlation_context
            .insert(key.to_string(), value.to_string());
        self
    }
}

/// DiagnosticSource is implemented by libraries that publish events.
pub trait DiagnosticSource: Send + Sync {
    fn name(&self) -> &str;

    /// attach is called when the source is registered. The source should
    /// keep the sink and emit its events through it.
    fn attach(&self, sink: EventSink);

    /// detach is called when the source is unregistered.
    fn detach(&self) {}
}

type Sources = RwLock<Vec<Arc<dyn DiagnosticSource>>>;

struct Intake {
    tracer: Tracer,
    sources: Sources,
}

impl Intake {
    fn is_registered(&self, name: &str) -> bool {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|source| source.name() == name)
    }
}

/// DiagnosticRegistry keeps track of the sources the agent listens to.
#[derive(Clone)]
pub struct DiagnosticRegistry {
    intake: Arc<Intake>,
}

impl DiagnosticRegistry {
    pub fn new(tracer: Tracer) -> Self {
        DiagnosticRegistry {
            intake: Arc::new(Intake {
                tracer,
                sources: RwLock::new(Vec::new()),
            }),
        }
    }

    /// register starts listening to `source`. Registering the same source
    /// twice has no effect.
    pub fn register(&self, source: Arc<dyn DiagnosticSource>) {
        {
            let mut sources = self
                .intake
                .sources
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if sources.iter().any(|s| Arc::ptr_eq(s, &source)) {
                return;
            }
            sources.push(Arc::clone(&source));
        }
        debug!("listening to diagnostic source {}", source.name());
        source.attach(self.sink());
    }

    /// unregister stops listening to `source`. Its later events are counted
    /// as coming from an unknown source.
    pub fn unregister(&self, source: &Arc<dyn DiagnosticSource>) {
        let removed = {
            let mut sources = self
                .intake
                .sources
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let before = sources.len();
            sources.retain(|s| !Arc::ptr_eq(s, source));
            before != sources.len()
        };
        if removed {
            source.detach();
        }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.intake
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|source| source.name().to_string())
            .collect()
    }

    /// sink returns a handle for emitting events directly.
    pub fn sink(&self) -> EventSink {
        EventSink {
            intake: Arc::clone(&self.intake),
        }
    }
}

/// EventSink turns events into spans on the current execution flow.
#[derive(Clone)]
pub struct EventSink {
    intake: Arc<Intake>,
}

impl EventSink {
    pub fn emit(&self, event: DiagnosticEvent) {
        let intake = &self.intake;
        if !intake.is_registered(&event.source_name) {
            bump(&intake.tracer.agent_stats().unknown_source_events);
            debug!("event from unknown source {:?}", event.source_name);
            return;
        }
        match event.kind {
            EventKind::Start => self.on_start(event),
            EventKind::Stop => self.on_stop(event),
            EventKind::Error => self.on_error(event),
        }
    }

    pub fn start(&self, source: &str, operation: &str, category: &str) {
        self.emit(DiagnosticEvent::new(source, EventKind::Start, operation).with_category(category))
    }

    pub fn stop(&self, source: &str, operation: &str) {
        self.emit(DiagnosticEvent::new(source, EventKind::Stop, operation))
    }

    pub fn error(&self, source: &str, operation: &str, message: &str) {
        self.emit(
            DiagnosticEvent::new(source, EventKind::Error, operation)
                .with_entry(ERROR_MESSAGE_KEY, message),
        )
    }

    fn on_start(&self, event: DiagnosticEvent) {
        let labels: Labels = event
            .correlation_context
            .into_iter()
            .map(|(k, v)| (k, LabelValue::String(v)))
            .collect();
        let name = event.operation_name.clone();
        let origin = SpanOrigin {
            source: event.source_name,
            operation: event.operation_name,
        };
        self.intake.tracer.start_span_from_source(
            &name,
            &event.category,
            origin,
            event.timestamp,
            labels,
        );
    }

    fn on_stop(&self, event: DiagnosticEvent) {
        let span = context::current_span().filter(|span| {
            span.origin().map_or(false, |origin| {
                origin.source == event.source_name && origin.operation == event.operation_name
            })
        });
        match span {
            Some(span) => {
                for (key, value) in event.correlation_context {
                    span.set_label(&key, value);
                }
                span.end();
            }
            None => {
                bump(&self.intake.tracer.agent_stats().out_of_order_stops);
                debug!(
                    "stop of {}/{} does not match the current span",
                    event.source_name, event.operation_name
                );
            }
        }
    }

    fn on_error(&self, event: DiagnosticEvent) {
        let message = event
            .correlation_context
            .get(ERROR_MESSAGE_KEY)
            .map(String::as_str)
            .unwrap_or(&event.operation_name);
        let kind = event.correlation_context.get(ERROR_TYPE_KEY).map(String::as_str);
        self.intake.tracer.capture_error(message, kind);
    }
}
