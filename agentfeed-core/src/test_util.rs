//! Scripted transports, recording sinks and a manual clock for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::error::{AgentFeedError, CoreResult};
use crate::model::ConversationMessage;
use crate::parser::ParseDiagnostic;
use crate::reconcile::Clock;
use crate::sink::{SinkEvent, StreamSink};
use crate::telemetry::{StreamSummary, TelemetrySink};
use crate::transport::{StreamRequest, Transport, TransportFactory, TransportKind};

#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self(AtomicI64::new(start_ms))
    }

    pub fn advance(&self, ms: i64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Keeps every callback in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<SinkEvent>,
}

impl RecordingSink {
    pub fn deltas(&self) -> Vec<(String, String)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Delta { agent_id, cumulative } => Some((agent_id.clone(), cumulative.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<ConversationMessage> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(&'static str, String)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Error { kind, message } => Some((*kind, message.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn completions(&self) -> usize {
        self.events.iter().filter(|e| matches!(e, SinkEvent::Complete)).count()
    }
}

impl StreamSink for RecordingSink {
    fn on_delta(&mut self, agent_id: &str, cumulative: &str) {
        self.events.push(SinkEvent::Delta {
            agent_id: agent_id.into(),
            cumulative: cumulative.into(),
        });
    }
    fn on_message(&mut self, message: &ConversationMessage) {
        self.events.push(SinkEvent::Message(message.clone()));
    }
    fn on_complete(&mut self) {
        self.events.push(SinkEvent::Complete);
    }
    fn on_error(&mut self, error: &AgentFeedError) {
        self.events.push(SinkEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }
    fn on_diagnostic(&mut self, diagnostic: &ParseDiagnostic) {
        self.events.push(SinkEvent::Diagnostic(diagnostic.clone()));
    }
}

/// One step of a scripted read sequence.
#[derive(Debug, Clone)]
pub enum Step {
    Chunk(Bytes),
    /// Read fails with a retryable transport error.
    Fail,
    /// Read never resolves.
    Hang,
}

impl Step {
    pub fn chunk(s: &str) -> Self {
        Self::Chunk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// What one call to `open` does.
#[derive(Debug, Clone)]
pub enum Session {
    /// Open succeeds; reads follow the steps, then EOF.
    Stream(Vec<Step>),
    /// Open fails with a retryable error (endpoint unavailable).
    Refuse,
    /// Open fails with a non-retryable HTTP 400.
    Reject,
}

/// Counters shared between a factory, its transports and the test.
#[derive(Debug, Default)]
pub struct ScriptLog {
    pub builds: AtomicU32,
    pub opens: AtomicU32,
    pub cancels: AtomicU32,
}

impl ScriptLog {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
    pub fn cancels(&self) -> u32 {
        self.cancels.load(Ordering::SeqCst)
    }
    pub fn builds(&self) -> u32 {
        self.builds.load(Ordering::SeqCst)
    }
}

pub struct ScriptedTransport {
    kind: TransportKind,
    sessions: VecDeque<Session>,
    steps: VecDeque<Step>,
    open: bool,
    log: Arc<ScriptLog>,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind, sessions: Vec<Session>) -> Self {
        Self::with_log(kind, sessions, Arc::new(ScriptLog::default()))
    }

    pub fn with_log(kind: TransportKind, sessions: Vec<Session>, log: Arc<ScriptLog>) -> Self {
        Self {
            kind,
            sessions: sessions.into(),
            steps: VecDeque::new(),
            open: false,
            log,
        }
    }

    /// Single session delivering `chunks` then EOF.
    pub fn chunks(kind: TransportKind, chunks: &[&str]) -> Self {
        Self::new(kind, vec![Session::Stream(chunks.iter().map(|c| Step::chunk(c)).collect())])
    }

    pub fn log(&self) -> Arc<ScriptLog> {
        self.log.clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&mut self) -> CoreResult<()> {
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        match self.sessions.pop_front() {
            Some(Session::Stream(steps)) => {
                self.steps = steps.into();
                self.open = true;
                Ok(())
            }
            Some(Session::Reject) => Err(AgentFeedError::Upstream {
                endpoint: "/scripted".into(),
                code: "400".into(),
                message: "bad request".into(),
            }),
            Some(Session::Refuse) | None => Err(AgentFeedError::Unavailable {
                endpoint: "/scripted".into(),
            }),
        }
    }

    async fn read(&mut self) -> CoreResult<Option<Bytes>> {
        if !self.open {
            return Err(AgentFeedError::Transport {
                transport: self.kind.as_str().into(),
                message: "read on a closed transport".into(),
            });
        }
        match self.steps.pop_front() {
            Some(Step::Chunk(b)) => Ok(Some(b)),
            Some(Step::Fail) => {
                self.open = false;
                Err(AgentFeedError::Transport {
                    transport: self.kind.as_str().into(),
                    message: "connection reset".into(),
                })
            }
            Some(Step::Hang) => std::future::pending().await,
            None => {
                self.open = false;
                Ok(None)
            }
        }
    }

    fn cancel(&mut self) {
        self.log.cancels.fetch_add(1, Ordering::SeqCst);
        self.open = false;
        self.steps.clear();
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

/// Hands out one scripted transport per `build`, in order. Builds past the
/// end of the list get an empty script that refuses every open.
pub struct ScriptedFactory {
    scripts: Mutex<VecDeque<Vec<Session>>>,
    pub log: Arc<ScriptLog>,
}

impl ScriptedFactory {
    pub fn new(scripts: Vec<Vec<Session>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            log: Arc::new(ScriptLog::default()),
        }
    }
}

impl TransportFactory for ScriptedFactory {
    fn build(&self, _connection_id: &str, request: &StreamRequest) -> CoreResult<Box<dyn Transport>> {
        self.log.builds.fetch_add(1, Ordering::SeqCst);
        let sessions = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedTransport::with_log(
            request.target.kind(),
            sessions,
            self.log.clone(),
        )))
    }
}

/// Process-wide telemetry capture. Installed on first use.
#[derive(Default)]
pub struct CapturingTelemetry {
    pub summaries: Mutex<Vec<StreamSummary>>,
}

impl TelemetrySink for CapturingTelemetry {
    fn record_stream(&self, summary: StreamSummary) {
        self.summaries.lock().unwrap().push(summary);
    }
}

static TELEMETRY: Lazy<Arc<CapturingTelemetry>> = Lazy::new(|| {
    let sink = Arc::new(CapturingTelemetry::default());
    crate::telemetry::set_telemetry_sink(sink.clone());
    sink
});

/// Shared capture sink; enables capture for the calling thread.
pub fn capture_telemetry() -> Arc<CapturingTelemetry> {
    crate::telemetry::test_set_capture_enabled(true);
    TELEMETRY.clone()
}

impl CapturingTelemetry {
    pub fn for_connection(&self, id: &str) -> Vec<StreamSummary> {
        self.summaries
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.connection_id == id)
            .cloned()
            .collect()
    }
}
