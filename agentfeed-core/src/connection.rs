//! Connection lifecycle: one tokio task per logical stream.
//!
//! `StreamDriver` is the read loop shared by both transports
//! (transport → frame decoder → parser → reconciler → sink).
//! `ConnectionManager` owns the registry of live drivers keyed by id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, field, info, info_span, warn};

use crate::config::Config;
use crate::error::{AgentFeedError, CoreResult};
use crate::frame::{Frame, FrameDecoder};
use crate::model::ConversationMessage;
use crate::normalizer::normalize_request;
use crate::parser::EventParser;
use crate::reconcile::{Clock, Flow, ReconcileState, Reconciler};
use crate::retry::ReconnectPolicy;
use crate::sink::StreamSink;
use crate::telemetry::{self, StreamOutcome, StreamSummary};
use crate::transport::{HttpTransportFactory, StreamRequest, Transport, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Error,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub retry_count: u32,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            retry_count: 0,
        }
    }
}

/// Status shared between a driver task and the registry.
#[derive(Debug, Clone, Default)]
pub struct StatusCell(Arc<Mutex<ConnectionStatus>>);

impl StatusCell {
    pub fn get(&self) -> ConnectionStatus {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, state: ConnectionState, retry_count: u32) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = ConnectionStatus { state, retry_count };
    }
}

/// What a finished stream produced.
#[derive(Debug, Clone)]
pub struct StreamReport {
    pub outcome: StreamOutcome,
    pub messages: Vec<ConversationMessage>,
    pub conversation_id: Option<String>,
    pub reconnects: u32,
}

enum Retry {
    Again,
    Done(StreamOutcome),
}

/// Read loop for one connection.
pub struct StreamDriver {
    id: String,
    transport: Box<dyn Transport>,
    sink: Box<dyn StreamSink>,
    decoder: FrameDecoder,
    parser: EventParser,
    reconciler: Reconciler,
    policy: ReconnectPolicy,
    token: CancellationToken,
    status: StatusCell,
    frames: u64,
    reconnects: u32,
}

impl StreamDriver {
    pub fn new(id: &str, transport: Box<dyn Transport>, sink: Box<dyn StreamSink>, cfg: &Config, round: u32) -> Self {
        let token = CancellationToken::new();
        let policy = if transport.kind().reconnects() {
            ReconnectPolicy::new(cfg.reconnect.max_attempts, cfg.reconnect.to_backoff())
        } else {
            ReconnectPolicy::disabled()
        };
        let mut parser = EventParser::new();
        parser.set_round(round);
        let mut reconciler = Reconciler::new(&cfg.reconcile).with_cancel_token(token.clone());
        reconciler.begin_round(round);
        Self {
            id: id.to_string(),
            transport,
            sink,
            decoder: FrameDecoder::new(),
            parser,
            reconciler,
            policy,
            token,
            status: StatusCell::default(),
            frames: 0,
            reconnects: 0,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.reconciler = self.reconciler.with_clock(clock);
        self
    }

    /// Token that stops this driver; also silences its sink.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn status(&self) -> StatusCell {
        self.status.clone()
    }

    pub async fn run(mut self) -> StreamReport {
        let kind = self.transport.kind();
        let span = info_span!(
            "agentfeed.stream",
            { telemetry::KEY_CONNECTION_ID } = %self.id,
            { telemetry::KEY_TRANSPORT } = kind.as_str(),
            { telemetry::KEY_ROUND } = self.reconciler.round(),
            { telemetry::KEY_CONVERSATION_ID } = field::Empty,
            { telemetry::KEY_FRAMES } = field::Empty,
            { telemetry::KEY_EVENTS } = field::Empty,
            { telemetry::KEY_RECONNECTS } = field::Empty,
            { telemetry::KEY_OUTCOME } = field::Empty,
            { telemetry::KEY_LATENCY_MS } = field::Empty,
            { telemetry::KEY_ERROR_KIND } = field::Empty,
            { telemetry::KEY_ERROR_MESSAGE } = field::Empty,
        );
        let start = Instant::now();
        let outcome = self.drive().instrument(span.clone()).await;
        self.transport.cancel();

        let state = match outcome {
            StreamOutcome::Errored => ConnectionState::Error,
            _ => ConnectionState::Closed,
        };
        self.status.set(state, self.policy.attempts());

        let stats = self.parser.stats();
        let latency_ms = start.elapsed().as_millis() as u64;
        span.record(telemetry::KEY_FRAMES, self.frames);
        span.record(telemetry::KEY_EVENTS, stats.events);
        span.record(telemetry::KEY_RECONNECTS, self.reconnects);
        span.record(telemetry::KEY_OUTCOME, outcome.as_str());
        span.record(telemetry::KEY_LATENCY_MS, latency_ms);
        if let Some(c) = self.reconciler.conversation_id() {
            span.record(telemetry::KEY_CONVERSATION_ID, c);
        }
        span.in_scope(|| info!(outcome = outcome.as_str(), frames = self.frames, "stream finished"));

        let mut summary = StreamSummary::new(&self.id)
            .transport(kind.as_str())
            .conversation_id_opt(self.reconciler.conversation_id())
            .round(self.reconciler.round())
            .counts(self.frames, stats.events, stats.dropped, stats.recovered)
            .reconnects(self.reconnects)
            .messages(self.reconciler.messages().len())
            .outcome(outcome)
            .latency_ms(latency_ms);
        if let Some((err_kind, msg)) = self.reconciler.last_error() {
            span.record(telemetry::KEY_ERROR_KIND, err_kind);
            span.record(telemetry::KEY_ERROR_MESSAGE, msg);
            summary = summary.error(err_kind, msg);
        }
        telemetry::emit_stream(summary);

        StreamReport {
            outcome,
            conversation_id: self.reconciler.conversation_id().map(str::to_string),
            messages: self.reconciler.into_messages(),
            reconnects: self.reconnects,
        }
    }

    async fn drive(&mut self) -> StreamOutcome {
        let token = self.token.clone();
        self.status.set(ConnectionState::Connecting, 0);

        'connect: loop {
            let opened = tokio::select! {
                biased;
                _ = token.cancelled() => return self.cancelled(),
                r = self.transport.open() => r,
            };
            if let Err(e) = opened {
                match self.retry_or_fail(e, &token).await {
                    Retry::Again => continue 'connect,
                    Retry::Done(outcome) => return outcome,
                }
            }
            self.policy.reset();
            self.status.set(ConnectionState::Open, 0);
            info!("stream open");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = token.cancelled() => return self.cancelled(),
                    r = self.transport.read() => r,
                };
                match next {
                    Ok(Some(chunk)) => {
                        for frame in self.decoder.push(&chunk) {
                            if self.handle_frame(&frame) == Flow::Stop {
                                return self.stopped();
                            }
                        }
                    }
                    Ok(None) => {
                        if let Some(frame) = self.decoder.finish() {
                            if self.handle_frame(&frame) == Flow::Stop {
                                return self.stopped();
                            }
                        }
                        self.reconciler.finish_stream(self.sink.as_mut());
                        return match self.reconciler.state() {
                            ReconcileState::Cancelled => StreamOutcome::Cancelled,
                            _ => StreamOutcome::Eof,
                        };
                    }
                    Err(e) => {
                        let dropped = self.decoder.pending();
                        self.decoder.reset();
                        if dropped > 0 {
                            debug!(dropped, "discarded partial frame");
                        }
                        match self.retry_or_fail(e, &token).await {
                            Retry::Again => {
                                self.reconciler.discard_pending();
                                continue 'connect;
                            }
                            Retry::Done(outcome) => return outcome,
                        }
                    }
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: &Frame) -> Flow {
        self.frames += 1;
        let events = self.parser.parse_frame(frame);
        for d in self.parser.take_diagnostics() {
            self.reconciler.report_diagnostic(&d, self.sink.as_mut());
        }
        debug!(events = events.len(), "frame");
        for ev in events {
            if self.reconciler.apply(ev, self.sink.as_mut()) == Flow::Stop {
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    async fn retry_or_fail(&mut self, error: AgentFeedError, token: &CancellationToken) -> Retry {
        if !(self.transport.kind().reconnects() && error.is_retryable()) {
            self.reconciler.fail(error, self.sink.as_mut());
            return Retry::Done(self.stopped());
        }
        let Some(delay) = self.policy.next_delay() else {
            let attempts = self.policy.attempts();
            warn!(attempts, last_error = %error, "reconnect budget exhausted");
            self.reconciler
                .fail(AgentFeedError::ReconnectExhausted { attempts }, self.sink.as_mut());
            return Retry::Done(self.stopped());
        };
        let attempt = self.policy.attempts();
        self.status.set(ConnectionState::Connecting, attempt);
        warn!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "reconnecting");
        tokio::select! {
            biased;
            _ = token.cancelled() => return Retry::Done(self.cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }
        self.reconnects += 1;
        Retry::Again
    }

    fn cancelled(&mut self) -> StreamOutcome {
        debug!("stream cancelled");
        self.reconciler.cancel();
        StreamOutcome::Cancelled
    }

    fn stopped(&self) -> StreamOutcome {
        match self.reconciler.state() {
            ReconcileState::Errored => StreamOutcome::Errored,
            ReconcileState::Cancelled => StreamOutcome::Cancelled,
            _ => StreamOutcome::Completed,
        }
    }
}

/// Resolves when the driver task has exited. Every clone sees the same report.
type TaskDone = Shared<BoxFuture<'static, Option<StreamReport>>>;

struct Entry {
    token: CancellationToken,
    done: TaskDone,
    status: StatusCell,
}

/// Registry of connections, one driver task per id.
///
/// Entries outlive their task: a finished or cancelled connection stays
/// visible through `state` until `disconnect` or `shutdown` removes it.
pub struct ConnectionManager {
    factory: Arc<dyn TransportFactory>,
    cfg: Config,
    registry: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn TransportFactory>, cfg: Config) -> Self {
        Self {
            factory,
            cfg,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Manager backed by the configured HTTP endpoints.
    pub fn http(cfg: Config) -> CoreResult<Self> {
        let factory = HttpTransportFactory::new(&cfg)?;
        Ok(Self::new(Arc::new(factory), cfg))
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a stream under `id`. An existing connection with the same id is
    /// closed first.
    pub async fn connect(&self, id: &str, request: StreamRequest, sink: Box<dyn StreamSink>) -> CoreResult<()> {
        let body = normalize_request(request.body)?;
        let round = body.round_number;
        let request = StreamRequest::new(request.target, body);

        self.disconnect(id).await;

        let transport = self.factory.build(id, &request)?;
        let driver = StreamDriver::new(id, transport, sink, &self.cfg, round);
        let token = driver.cancel_token();
        let status = driver.status();
        let handle = tokio::spawn(driver.run());
        info!(connection = id, target = ?request.target, round, "connection started");

        let conn = id.to_string();
        let done = async move {
            match handle.await {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!(connection = %conn, error = %e, "stream task failed");
                    None
                }
            }
        }
        .boxed()
        .shared();

        let previous = self.registry().insert(id.to_string(), Entry { token, done, status });
        if let Some(prev) = previous {
            // Raced with another connect on the same id.
            Self::stop(prev).await;
        }
        Ok(())
    }

    /// Close and forget a connection. Unknown ids are ignored.
    pub async fn disconnect(&self, id: &str) {
        let entry = self.registry().remove(id);
        if let Some(entry) = entry {
            debug!(connection = id, "disconnecting");
            Self::stop(entry).await;
        }
    }

    /// Stop reading without reporting an error. Once this returns no further
    /// callbacks fire for `id`. The connection stays registered as `Closed`.
    pub async fn cancel(&self, id: &str) {
        let taken = self.registry().get(id).map(|e| {
            e.token.cancel();
            (e.done.clone(), e.status.clone())
        });
        if let Some((done, status)) = taken {
            done.await;
            status.set(ConnectionState::Closed, 0);
        }
    }

    pub fn state(&self, id: &str) -> Option<ConnectionStatus> {
        self.registry().get(id).map(|e| e.status.get())
    }

    pub fn ids(&self) -> Vec<String> {
        self.registry().keys().cloned().collect()
    }

    /// Wait for a connection's task to finish and return what it produced.
    /// Any number of callers may wait, alongside `cancel` or `disconnect`.
    /// Returns `None` for unknown ids or a task that panicked.
    pub async fn join(&self, id: &str) -> Option<StreamReport> {
        let done = self.registry().get(id).map(|e| e.done.clone())?;
        done.await
    }

    /// Disconnect everything.
    pub async fn shutdown(&self) {
        let entries: Vec<Entry> = self.registry().drain().map(|(_, e)| e).collect();
        for e in entries {
            Self::stop(e).await;
        }
    }

    async fn stop(entry: Entry) {
        entry.token.cancel();
        entry.done.await;
    }
}
