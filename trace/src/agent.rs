use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::{AgentMode, Config};
use crate::diagnostics::DiagnosticRegistry;
use crate::export::{CaptureOnlyExporter, Exporter, NoopExporter};
use crate::id_generator::IDGenerator;
use crate::pipeline::{ExportPipeline, PipelineConfig};
use crate::stats::{AgentStats, StatsSnapshot};
use crate::tracer::{Tracer, TracerBuilder};
use crate::transport::{HttpTransport, Transport};

/// Agent owns everything the process needs for tracing: the tracer, the
/// diagnostic intake and the export pipeline.
///
/// Faults in configuration never stop the host. They select a degraded
/// [`AgentMode`] instead and are logged once, here.
pub struct Agent {
    config: Config,
    mode: AgentMode,
    tracer: Tracer,
    registry: DiagnosticRegistry,
    pipeline: Option<Arc<ExportPipeline>>,
    stats: Arc<AgentStats>,
}

/// AgentBuilder overrides the pieces an [`Agent`] normally builds itself.
pub struct AgentBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    id_generator: Option<Arc<dyn IDGenerator + Send + Sync>>,
}

impl AgentBuilder {
    pub fn new(config: Config) -> Self {
        AgentBuilder {
            config,
            transport: None,
            id_generator: None,
        }
    }

    /// transport replaces the http transport, e.g. to send elsewhere in tests.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn id_generator(mut self, id_generator: Arc<dyn IDGenerator + Send + Sync>) -> Self {
        self.id_generator = Some(id_generator);
        self
    }

    pub fn build(self) -> Agent {
        let config = self.config;
        let (mut mode, errors) = config.resolve_mode();
        for e in &errors {
            error!("apm agent configuration: {e}");
        }

        let transport = match (mode, self.transport) {
            (AgentMode::Active, Some(transport)) => Some(transport),
            (AgentMode::Active, None) => match HttpTransport::new(&config) {
                Ok(transport) => Some(Arc::new(transport) as Arc<dyn Transport>),
                Err(e) => {
                    error!("apm agent transport: {e}");
                    mode = AgentMode::CaptureOnly;
                    None
                }
            },
            _ => None,
        };

        let stats = Arc::new(AgentStats::default());
        let pipeline = transport.map(|transport| {
            Arc::new(ExportPipeline::start(
                PipelineConfig::from_config(&config),
                transport,
                Arc::clone(&stats),
            ))
        });
        let exporter: Arc<dyn Exporter + Send + Sync> = match (&pipeline, mode) {
            (Some(pipeline), _) => pipeline.clone(),
            (None, AgentMode::CaptureOnly) => Arc::new(CaptureOnlyExporter::new(Arc::clone(&stats))),
            (None, _) => Arc::new(NoopExporter),
        };

        let mut builder = TracerBuilder::from_config(&config, exporter)
            .stats(Arc::clone(&stats))
            .recording(mode != AgentMode::Inert);
        if let Some(id_generator) = self.id_generator {
            builder = builder.id_generator(id_generator);
        }
        let tracer = builder.build();
        let registry = DiagnosticRegistry::new(tracer.clone());

        info!(
            "apm agent for {} started in {:?} mode",
            config.service_name, mode
        );
        Agent {
            config,
            mode,
            tracer,
            registry,
            pipeline,
            stats,
        }
    }
}

impl Agent {
    pub fn new(config: Config) -> Self {
        AgentBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    /// from_env configures the agent from `ELASTIC_APM_*` variables.
    pub fn from_env() -> Self {
        Agent::new(Config::from_env())
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn registry(&self) -> &DiagnosticRegistry {
        &self.registry
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// shutdown flushes what it can within the configured shutdown timeout
    /// and returns the final counters.
    pub async fn shutdown(&self) -> StatsSnapshot {
        if let Some(pipeline) = &self.pipeline {
            pipeline.shutdown().await;
        }
        let stats = self.stats.snapshot();
        debug!("apm agent stopped: {stats:?}");
        stats
    }

    /// shutdown_blocking is [`shutdown`](Self::shutdown) for hosts without an
    /// async runtime.
    pub fn shutdown_blocking(&self) -> StatsSnapshot {
        if let Some(pipeline) = &self.pipeline {
            pipeline.shutdown_blocking();
        }
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    #[test]
    #[traced_test]
    fn invalid_sample_rate_makes_the_agent_inert() {
        let agent = Agent::new(Config::default().with_sample_rate(2.0));
        assert_eq!(agent.mode(), AgentMode::Inert);
        assert!(logs_contain("invalid transaction sample rate 2"));

        let tracer = agent.tracer();
        let tx = tracer.begin_transaction("GET /", "request", None);
        tracer.start_span("query", "db").end();
        tx.end();
        assert_eq!(agent.stats(), StatsSnapshot::default());
    }

    #[test]
    #[traced_test]
    fn bad_server_url_only_captures() {
        let agent = Agent::new(Config::default().with_server_url("not a url"));
        assert_eq!(agent.mode(), AgentMode::CaptureOnly);
        assert!(logs_contain("invalid server url"));

        let tracer = agent.tracer();
        let tx = tracer.begin_transaction("GET /", "request", None);
        tracer.start_span("query", "db").end();
        tx.end();
        assert_eq!(agent.stats().capture_only_dropped, 2);
    }

    #[test]
    fn disabled_agent_is_inert() {
        let config = Config {
            enabled: false,
            ..Config::default()
        };
        let agent = Agent::new(config);
        assert_eq!(agent.mode(), AgentMode::Inert);
        assert_eq!(agent.shutdown_blocking(), StatsSnapshot::default());
    }
}
