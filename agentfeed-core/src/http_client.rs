use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Serialize;
use tracing::debug;

use crate::config::HttpCfg;
use crate::error::{AgentFeedError, CoreResult};
use crate::stream::ByteStream;

/// Request context carries the tracing id of the logical connection.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
}

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(ms) = cfg.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| AgentFeedError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("agentfeed/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST JSON and return the raw response body as a chunk stream.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ByteStream> {
        let req = self.inner.post(url).json(body);
        self.open_stream(url, req, ctx).await
    }

    /// GET with query parameters and return the raw response body as a chunk stream.
    pub async fn get_stream(
        &self,
        url: &str,
        query: &[(&str, String)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<ByteStream> {
        let req = self.inner.get(url).query(query);
        self.open_stream(url, req, ctx).await
    }

    async fn open_stream(&self, url: &str, req: RequestBuilder, ctx: &RequestCtx<'_>) -> CoreResult<ByteStream> {
        let start = Instant::now();
        let mut req = req
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }

        let resp = req.send().await.map_err(|e| {
            debug!(error = %e, url, "stream request failed");
            AgentFeedError::Unavailable {
                endpoint: endpoint_name(url),
            }
        })?;

        let status = resp.status();
        let headers = resp.headers().clone();
        if !status.is_success() {
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(&endpoint_name(url), status, ra, &body));
        }

        debug!(
            url,
            status = status.as_u16(),
            upstream_request_id = extract_request_id(&headers).as_deref().unwrap_or(""),
            latency_ms = start.elapsed().as_millis() as u64,
            "stream opened"
        );

        let stream = resp.bytes_stream().map(|chunk| {
            chunk.map_err(|e| AgentFeedError::Transport {
                transport: "http".into(),
                message: e.to_string(),
            })
        });
        Ok(stream.boxed())
    }
}

/// Path portion of a URL, used to name the endpoint in errors.
fn endpoint_name(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    match without_scheme.find('/') {
        Some(i) => without_scheme[i..].split('?').next().unwrap_or("/").to_string(),
        None => "/".to_string(),
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-request-id", "request-id", "x-trace-id"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    None
}

fn map_http_error(endpoint: &str, status: StatusCode, retry_after: Option<u64>, body: &str) -> AgentFeedError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => AgentFeedError::RateLimited {
            endpoint: endpoint.to_string(),
            retry_after,
        },
        s if s.is_server_error() => AgentFeedError::Unavailable {
            endpoint: endpoint.to_string(),
        },
        s => AgentFeedError::Upstream {
            endpoint: endpoint.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut t = s[..cut].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
