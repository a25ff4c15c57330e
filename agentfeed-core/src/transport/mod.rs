//! Byte transports for one logical stream.
//!
//! Both variants expose the same `open` / `read` / `cancel` surface; they
//! differ only in how the request is sent and whether the connection manager
//! may reopen them after a failure.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;

use crate::config::Config;
use crate::error::{AgentFeedError, CoreResult};
use crate::http_client::HttpClient;
use crate::model::GenerationRequest;
use crate::stream::ByteStream;

pub mod request_stream;
pub mod subscribe;

pub use request_stream::RequestStreamTransport;
pub use subscribe::SubscribeTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// POST with a JSON body; the response body is the stream. Failures are terminal.
    RequestStream,
    /// GET with query parameters; reopened on failure within the reconnect budget.
    Subscribe,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequestStream => "request_stream",
            Self::Subscribe => "subscribe",
        }
    }

    pub fn reconnects(self) -> bool {
        matches!(self, Self::Subscribe)
    }
}

#[async_trait]
pub trait Transport: Send {
    /// Send the request and wait for response headers. May be called again
    /// after a failure on reconnecting transports.
    async fn open(&mut self) -> CoreResult<()>;

    /// Next body chunk; `Ok(None)` once the producer closed the stream.
    async fn read(&mut self) -> CoreResult<Option<Bytes>>;

    /// Drop the underlying connection. Idempotent.
    fn cancel(&mut self);

    fn kind(&self) -> TransportKind;
}

/// Which backend stream a connection targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTarget {
    Chat,
    Testcase,
    TestcaseSubscribe,
}

impl StreamTarget {
    pub fn kind(self) -> TransportKind {
        match self {
            Self::Chat | Self::Testcase => TransportKind::RequestStream,
            Self::TestcaseSubscribe => TransportKind::Subscribe,
        }
    }
}

/// A generation request bound to its target stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub body: GenerationRequest,
}

impl StreamRequest {
    pub fn new(target: StreamTarget, body: GenerationRequest) -> Self {
        Self { target, body }
    }

    pub fn chat(body: GenerationRequest) -> Self {
        Self::new(StreamTarget::Chat, body)
    }

    pub fn testcase(body: GenerationRequest) -> Self {
        Self::new(StreamTarget::Testcase, body)
    }

    pub fn testcase_subscribe(body: GenerationRequest) -> Self {
        Self::new(StreamTarget::TestcaseSubscribe, body)
    }
}

/// Builds a fresh transport per connection.
pub trait TransportFactory: Send + Sync {
    fn build(&self, connection_id: &str, request: &StreamRequest) -> CoreResult<Box<dyn Transport>>;
}

/// Factory for the real HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    client: HttpClient,
    cfg: Config,
}

impl HttpTransportFactory {
    pub fn new(cfg: &Config) -> CoreResult<Self> {
        Ok(Self {
            client: HttpClient::new(&cfg.http)?,
            cfg: cfg.clone(),
        })
    }
}

impl TransportFactory for HttpTransportFactory {
    fn build(&self, connection_id: &str, request: &StreamRequest) -> CoreResult<Box<dyn Transport>> {
        let ep = &self.cfg.endpoints;
        let client = self.client.clone();
        let body = request.body.clone();
        let id = connection_id.to_string();
        Ok(match request.target {
            StreamTarget::Chat => Box::new(RequestStreamTransport::new(client, ep.url(&ep.chat_stream), body, id)),
            StreamTarget::Testcase => {
                Box::new(RequestStreamTransport::new(client, ep.url(&ep.testcase_stream), body, id))
            }
            StreamTarget::TestcaseSubscribe => {
                Box::new(SubscribeTransport::new(client, ep.url(&ep.testcase_sse), body, id))
            }
        })
    }
}

/// Open response body shared by both HTTP transports.
pub(crate) struct BodyReader {
    kind: TransportKind,
    body: Option<ByteStream>,
}

impl BodyReader {
    pub(crate) fn new(kind: TransportKind) -> Self {
        Self { kind, body: None }
    }

    pub(crate) fn set(&mut self, body: ByteStream) {
        self.body = Some(body);
    }

    pub(crate) fn close(&mut self) {
        self.body = None;
    }

    pub(crate) async fn next(&mut self) -> CoreResult<Option<Bytes>> {
        let Some(body) = self.body.as_mut() else {
            return Err(AgentFeedError::Transport {
                transport: self.kind.as_str().into(),
                message: "read on a closed transport".into(),
            });
        };
        match body.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => {
                self.body = None;
                Err(e)
            }
            None => {
                self.body = None;
                Ok(None)
            }
        }
    }
}
