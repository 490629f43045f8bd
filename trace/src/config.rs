use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;
use crate::sampling::is_valid_ratio;

const DEFAULT_SERVICE_NAME: &str = "unknown-rust-service";
const DEFAULT_SERVER_URL: &str = "http://localhost:8200";

/// Config holds every externally configured option of the agent.
///
/// It is read once at startup; components keep their own copies of the values
/// they need.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub service_name: String,
    pub service_version: Option<String>,
    pub environment: Option<String>,
    /// Web framework reported in the service metadata, set by the adapter.
    pub framework_name: Option<String>,
    pub framework_version: Option<String>,
    /// Base url of the collector, the intake path is appended.
    pub server_url: String,
    pub secret_token: Option<String>,
    pub api_key: Option<String>,
    /// Fraction of new traces to keep, between 0.0 and 1.0.
    pub transaction_sample_rate: f64,
    /// Spans beyond this count in one transaction are counted but not recorded.
    pub transaction_max_spans: usize,
    pub flush_interval: Duration,
    pub max_batch_event_count: usize,
    pub max_batch_bytes: usize,
    pub max_queue_event_count: usize,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub server_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub enabled: bool,
    pub recording: bool,
    pub global_labels: BTreeMap<String, String>,
    pub unsampled_policy: UnsampledPolicy,
}

/// UnsampledPolicy selects what an unsampled transaction leaves behind.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub enum UnsampledPolicy {
    /// Nothing is exported.
    #[default]
    Drop,
    /// A transaction record with `sampled=false` and no context or spans.
    Marker,
}

impl FromStr for UnsampledPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(UnsampledPolicy::Drop),
            "marker" => Ok(UnsampledPolicy::Marker),
            _ => Err(()),
        }
    }
}

/// AgentMode is how much of the agent runs after configuration is validated.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum AgentMode {
    /// Capture and send.
    Active,
    /// Capture segments, never send them. Ended segments are counted as dropped.
    CaptureOnly,
    /// Hand out non-recording segments only.
    Inert,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            service_version: None,
            environment: None,
            framework_name: None,
            framework_version: None,
            server_url: DEFAULT_SERVER_URL.to_string(),
            secret_token: None,
            api_key: None,
            transaction_sample_rate: 1.0,
            transaction_max_spans: 500,
            flush_interval: Duration::from_secs(10),
            max_batch_event_count: 10,
            max_batch_bytes: 768 * 1024,
            max_queue_event_count: 1000,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            server_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            enabled: true,
            recording: true,
            global_labels: BTreeMap::new(),
            unsampled_policy: UnsampledPolicy::Drop,
        }
    }
}

impl Config {
    /// from_env reads `ELASTIC_APM_*` variables from the process environment.
    pub fn from_env() -> Self {
        Config::from_lookup(|key| env::var(key).ok())
    }

    /// from_lookup reads options through `lookup`. Values that do not parse are
    /// reported and the default is kept.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("ELASTIC_APM_SERVICE_NAME") {
            config.service_name = v;
        }
        config.service_version = get("ELASTIC_APM_SERVICE_VERSION");
        config.environment = get("ELASTIC_APM_ENVIRONMENT");
        if let Some(v) = get("ELASTIC_APM_SERVER_URL") {
            config.server_url = v;
        }
        config.secret_token = get("ELASTIC_APM_SECRET_TOKEN");
        config.api_key = get("ELASTIC_APM_API_KEY");

        parse_into(&get, "ELASTIC_APM_TRANSACTION_SAMPLE_RATE", &mut config.transaction_sample_rate);
        parse_into(&get, "ELASTIC_APM_TRANSACTION_MAX_SPANS", &mut config.transaction_max_spans);
        parse_into(&get, "ELASTIC_APM_MAX_BATCH_EVENT_COUNT", &mut config.max_batch_event_count);
        parse_into(&get, "ELASTIC_APM_MAX_BATCH_BYTES", &mut config.max_batch_bytes);
        parse_into(&get, "ELASTIC_APM_MAX_QUEUE_EVENT_COUNT", &mut config.max_queue_event_count);
        parse_into(&get, "ELASTIC_APM_MAX_RETRIES", &mut config.max_retries);
        parse_millis(&get, "ELASTIC_APM_FLUSH_INTERVAL", &mut config.flush_interval);
        parse_millis(&get, "ELASTIC_APM_RETRY_BACKOFF", &mut config.retry_backoff);
        parse_millis(&get, "ELASTIC_APM_SERVER_TIMEOUT", &mut config.server_timeout);
        parse_millis(&get, "ELASTIC_APM_SHUTDOWN_TIMEOUT", &mut config.shutdown_timeout);
        parse_into(&get, "ELASTIC_APM_ENABLED", &mut config.enabled);
        parse_into(&get, "ELASTIC_APM_RECORDING", &mut config.recording);
        parse_into(&get, "ELASTIC_APM_UNSAMPLED_POLICY", &mut config.unsampled_policy);

        if let Some(v) = get("ELASTIC_APM_GLOBAL_LABELS") {
            config.global_labels = parse_labels(&v);
        }
        config
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_framework(mut self, name: &str, version: Option<&str>) -> Self {
        self.framework_name = Some(name.to_string());
        self.framework_version = version.map(str::to_string);
        self
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    pub fn with_secret_token(mut self, token: impl Into<String>) -> Self {
        self.secret_token = Some(token.into());
        self
    }

    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.transaction_sample_rate = rate;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_batch_limits(mut self, events: usize, bytes: usize) -> Self {
        self.max_batch_event_count = events;
        self.max_batch_bytes = bytes;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.max_queue_event_count = capacity;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff = backoff;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_unsampled_policy(mut self, policy: UnsampledPolicy) -> Self {
        self.unsampled_policy = policy;
        self
    }

    /// resolve_mode validates the configuration and picks the mode the agent
    /// runs in, together with every fault found.
    pub fn resolve_mode(&self) -> (AgentMode, Vec<ConfigError>) {
        let mut errors = Vec::new();
        if !is_valid_ratio(self.transaction_sample_rate) {
            errors.push(ConfigError::InvalidSampleRate(self.transaction_sample_rate));
        }
        if let Err(err) = self.validate_server_url() {
            errors.push(err);
        }

        let mode = if !self.enabled || !is_valid_ratio(self.transaction_sample_rate) {
            AgentMode::Inert
        } else if !self.recording || !errors.is_empty() {
            AgentMode::CaptureOnly
        } else {
            AgentMode::Active
        };
        (mode, errors)
    }

    pub(crate) fn validate_server_url(&self) -> Result<reqwest::Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason,
        };
        let url = reqwest::Url::parse(&self.server_url).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "http" | "https" if url.host().is_some() => Ok(url),
            "http" | "https" => Err(invalid("missing host".to_string())),
            other => Err(invalid(format!("unsupported scheme {other}"))),
        }
    }
}

fn parse_into<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = get(key) {
        match raw.parse() {
            Ok(v) => *slot = v,
            Err(_) => warn!("{}", ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        }
    }
}

fn parse_millis(get: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut millis = slot.as_millis() as u64;
    parse_into(get, key, &mut millis);
    *slot = Duration::from_millis(millis);
}

fn parse_labels(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    use tracing_test::traced_test;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_are_active() {
        let config = Config::default();
        assert_eq!(config.resolve_mode(), (AgentMode::Active, vec![]));
        assert_eq!(config.unsampled_policy, UnsampledPolicy::Drop);
    }

    #[test]
    fn reads_environment_values() {
        let config = Config::from_lookup(lookup(&[
            ("ELASTIC_APM_SERVICE_NAME", "checkout"),
            ("ELASTIC_APM_SERVER_URL", "https://apm.example.com:8200"),
            ("ELASTIC_APM_TRANSACTION_SAMPLE_RATE", "0.25"),
            ("ELASTIC_APM_FLUSH_INTERVAL", "250"),
            ("ELASTIC_APM_MAX_QUEUE_EVENT_COUNT", "64"),
            ("ELASTIC_APM_UNSAMPLED_POLICY", "Marker"),
            ("ELASTIC_APM_GLOBAL_LABELS", "region=eu, tier = web,=skipped"),
        ]));

        assert_eq!(config.service_name, "checkout");
        assert_eq!(config.server_url, "https://apm.example.com:8200");
        assert_eq!(config.transaction_sample_rate, 0.25);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.max_queue_event_count, 64);
        assert_eq!(config.unsampled_policy, UnsampledPolicy::Marker);
        assert_eq!(config.global_labels.len(), 2);
        assert_eq!(config.global_labels["tier"], "web");
    }

    #[test]
    #[traced_test]
    fn unparseable_values_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("ELASTIC_APM_MAX_RETRIES", "lots"),
            ("ELASTIC_APM_ENABLED", "   "),
        ]));

        assert_eq!(config.max_retries, 3);
        assert!(config.enabled);
        assert!(logs_contain("invalid value \"lots\" for ELASTIC_APM_MAX_RETRIES"));
    }

    #[test]
    fn bad_sample_rate_makes_the_agent_inert() {
        let (mode, errors) = Config::default().with_sample_rate(2.0).resolve_mode();
        assert_eq!(mode, AgentMode::Inert);
        assert_eq!(errors, vec![ConfigError::InvalidSampleRate(2.0)]);
    }

    #[test]
    fn bad_endpoint_captures_without_sending() {
        for url in ["not a url", "ftp://collector:21", "http://"] {
            let (mode, errors) = Config::default().with_server_url(url).resolve_mode();
            assert_eq!(mode, AgentMode::CaptureOnly, "{url}");
            assert!(matches!(errors[..], [ConfigError::InvalidServerUrl { .. }]));
        }
    }

    #[test]
    fn disabled_and_non_recording() {
        let config = Config {
            enabled: false,
            ..Config::default()
        };
        assert_eq!(config.resolve_mode().0, AgentMode::Inert);

        let config = Config {
            recording: false,
            ..Config::default()
        };
        assert_eq!(config.resolve_mode().0, AgentMode::CaptureOnly);
    }
}
