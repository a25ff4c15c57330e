use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

use crate::retry::Backoff;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds. Streams are long-lived, so the
    /// default is no timeout at all.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EndpointsCfg {
    pub base_url: String,
    #[serde(default = "default_chat_stream")]
    pub chat_stream: String,
    #[serde(default = "default_testcase_stream")]
    pub testcase_stream: String,
    #[serde(default = "default_testcase_sse")]
    pub testcase_sse: String,
}

impl Default for EndpointsCfg {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_stream: default_chat_stream(),
            testcase_stream: default_testcase_stream(),
            testcase_sse: default_testcase_sse(),
        }
    }
}

impl EndpointsCfg {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".into()
}
fn default_chat_stream() -> String {
    "/api/chat/stream".into()
}
fn default_testcase_stream() -> String {
    "/api/testcase/generate/stream".into()
}
fn default_testcase_sse() -> String {
    "/api/testcase/generate/sse".into()
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Reconnect policy for the push-subscribe transport.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReconnectCfg {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_kind")]
    pub backoff: BackoffKind,
    /// Fixed delay, or the base delay for exponential backoff.
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Cap for exponential backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default)]
    pub jitter: bool,
}

impl Default for ReconnectCfg {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff_kind(),
            delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

impl ReconnectCfg {
    pub fn to_backoff(&self) -> Backoff {
        match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed {
                delay: Duration::from_millis(self.delay_ms),
            },
            BackoffKind::Exponential => Backoff::Exponential {
                base: Duration::from_millis(self.delay_ms),
                factor: 2.0,
                max: Duration::from_millis(self.max_delay_ms),
                jitter: self.jitter,
            },
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_backoff_kind() -> BackoffKind {
    BackoffKind::Fixed
}
fn default_delay_ms() -> u64 {
    3_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ReconcileCfg {
    /// Window in which a repeated final message for the same agent and round
    /// replaces the earlier one instead of being appended.
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
}

impl Default for ReconcileCfg {
    fn default() -> Self {
        Self {
            dedup_window_ms: default_dedup_window_ms(),
        }
    }
}

fn default_dedup_window_ms() -> u64 {
    10_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub endpoints: EndpointsCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub reconnect: ReconnectCfg,
    #[serde(default)]
    pub reconcile: ReconcileCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::AgentFeedError::from)?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| crate::error::AgentFeedError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::AgentFeedError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::AgentFeedError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::AgentFeedError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::AgentFeedError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }
}
