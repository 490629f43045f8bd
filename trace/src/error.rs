use thiserror::Error;

/// Configuration faults. They are reported once when the agent starts and
/// select a degraded [`AgentMode`](crate::config::AgentMode); they never stop
/// the host process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid server url {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("invalid transaction sample rate {0}, expected a value between 0.0 and 1.0")]
    InvalidSampleRate(f64),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

/// Faults raised while delivering a batch to the collector.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector responded {code}: {body}")]
    Status { code: u16, body: String },

    #[error("failed to compress payload: {0}")]
    Encode(#[from] std::io::Error),

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl TransportError {
    /// Client errors other than timeouts and rate limiting will fail the same
    /// way on every attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(_) => true,
            TransportError::Status { code, .. } => {
                *code >= 500 || *code == 408 || *code == 429
            }
            TransportError::Encode(_) | TransportError::Serialize(_) => false,
        }
    }
}
