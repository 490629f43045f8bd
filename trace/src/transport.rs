use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;
use tracing::debug;

use crate::config::Config;
use crate::error::{ConfigError, TransportError};
use crate::export::{encode_metadata, Metadata};

pub const INTAKE_PATH: &str = "intake/v2/events";

/// Transport delivers one batch of newline delimited records to the collector.
#[async_trait]
pub trait Transport: Send + Sync {
    /// `records` holds complete lines only. Implementations add the metadata
    /// line themselves.
    async fn send(&self, records: &[u8]) -> Result<(), TransportError>;
}

/// BackoffConfig spaces out the attempts to deliver a single batch.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth applied to the delay after every failed retry.
    pub factor: f64,
    pub max_backoff: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// delay returns how long to wait before retry number `retry`, counted from 1.
    /// A factor that yields no usable delay falls back to `max_backoff`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let delay = self.base.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(delay)
            .map(|delay| delay.min(self.max_backoff))
            .unwrap_or(self.max_backoff)
    }
}

/// HttpTransport posts gzip compressed batches to the collector intake.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    authorization: Option<String>,
    metadata: Vec<u8>,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let base = config.validate_server_url()?;
        let endpoint = intake_url(&base).map_err(|reason| ConfigError::InvalidServerUrl {
            url: config.server_url.clone(),
            reason,
        })?;
        let client = reqwest::Client::builder()
            .timeout(config.server_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidServerUrl {
                url: config.server_url.clone(),
                reason: e.to_string(),
            })?;
        let authorization = match (&config.secret_token, &config.api_key) {
            (_, Some(key)) => Some(format!("ApiKey {key}")),
            (Some(token), None) => Some(format!("Bearer {token}")),
            (None, None) => None,
        };
        let metadata = encode_metadata(&Metadata::from_config(config)).map_err(|e| {
            ConfigError::InvalidValue {
                key: "metadata".to_string(),
                value: e.to_string(),
            }
        })?;
        Ok(HttpTransport {
            client,
            endpoint,
            authorization,
            metadata,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn compress(&self, records: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.metadata)?;
        encoder.write_all(records)?;
        Ok(encoder.finish()?)
    }
}

fn intake_url(base: &Url) -> Result<Url, String> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(INTAKE_PATH).map_err(|e| e.to_string())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, records: &[u8]) -> Result<(), TransportError> {
        let body = self.compress(records)?;
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/x-ndjson")
            .header(CONTENT_ENCODING, "gzip")
            .body(body);
        if let Some(authorization) = &self.authorization {
            request = request.header(AUTHORIZATION, authorization);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            debug!("collector accepted batch with status {}", status.as_u16());
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Status {
            code: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = BackoffConfig {
            base: Duration::from_millis(100),
            factor: 2.0,
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_millis(500));
        assert_eq!(backoff.delay(400), Duration::from_millis(500));
    }

    #[test]
    fn unusable_factor_waits_the_maximum() {
        let max_backoff = Duration::from_secs(2);
        for factor in [-2.0, f64::NAN, f64::INFINITY] {
            let backoff = BackoffConfig {
                base: Duration::from_millis(100),
                factor,
                max_backoff,
            };
            assert_eq!(backoff.delay(2), max_backoff, "{factor}");
            assert_eq!(backoff.delay(33), max_backoff, "{factor}");
        }
    }

    #[test]
    fn intake_url_keeps_base_path() {
        let url = Url::parse("http://apm.local:8200").unwrap();
        assert_eq!(
            intake_url(&url).unwrap().as_str(),
            "http://apm.local:8200/intake/v2/events"
        );
        let url = Url::parse("https://proxy.local/apm").unwrap();
        assert_eq!(
            intake_url(&url).unwrap().as_str(),
            "https://proxy.local/apm/intake/v2/events"
        );
    }

    #[test]
    fn body_starts_with_metadata() {
        let config = Config::default().with_service_name("billing");
        let transport = HttpTransport::new(&config).unwrap();
        let body = transport.compress(b"{\"span\":{}}\n").unwrap();

        let mut text = String::new();
        GzDecoder::new(&body[..]).read_to_string(&mut text).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("{\"metadata\":"));
        assert!(lines[0].contains("\"billing\""));
        assert_eq!(lines[1], "{\"span\":{}}");
    }

    #[test]
    fn rejects_unusable_url() {
        let config = Config::default().with_server_url("ftp://collector");
        assert!(matches!(
            HttpTransport::new(&config),
            Err(ConfigError::InvalidServerUrl { .. })
        ));
    }
}
