use thiserror::Error;

/// Core error type for agentfeed.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum AgentFeedError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("rate limited by {endpoint}")]
    RateLimited {
        endpoint: String,
        retry_after: Option<u64>,
    },

    #[error("endpoint unavailable: {endpoint}")]
    Unavailable { endpoint: String },

    #[error("upstream error from {endpoint}: {code} {message}")]
    Upstream {
        endpoint: String,
        code: String,
        message: String,
    },

    /// The byte stream broke after it was opened.
    #[error("transport error on {transport}: {message}")]
    Transport { transport: String, message: String },

    /// Error reported by the producer itself (`type: error`); the content is kept verbatim.
    #[error("producer error: {0}")]
    Producer(String),

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentFeedError {
    /// Whether a push-subscribe connection may try again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. }
                | Self::Unavailable { .. }
                | Self::RateLimited { .. }
                | Self::Io(_)
        )
    }

    /// Short machine-readable tag, used for telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::RateLimited { .. } => "rate_limited",
            Self::Unavailable { .. } => "unavailable",
            Self::Upstream { .. } => "upstream",
            Self::Transport { .. } => "transport",
            Self::Producer(_) => "producer",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, AgentFeedError>;
