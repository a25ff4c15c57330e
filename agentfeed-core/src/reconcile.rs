//! Reconciliation state machine.
//!
//! Applies typed events to conversation state: per-agent delta accumulation,
//! finalization into `ConversationMessage`s with windowed deduplication, and
//! the terminal transitions. Every sink callback is gated on the cancellation
//! token so nothing fires once a stream has been cancelled.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::AgentAccumulator;
use crate::config::ReconcileCfg;
use crate::error::AgentFeedError;
use crate::model::ConversationMessage;
use crate::parser::ParseDiagnostic;
use crate::sink::StreamSink;
use crate::stream::{EventKind, StreamEvent};

/// Millisecond wall clock. Injected so dedup windows can be tested.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    AwaitingFirstEvent,
    Active,
    Completed,
    Errored,
    Cancelled,
}

impl ReconcileState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

/// Whether the read loop should keep going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub struct Reconciler {
    state: ReconcileState,
    round: u32,
    conversation_id: String,
    acc: AgentAccumulator,
    messages: Vec<ConversationMessage>,
    dedup_window_ms: i64,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    seq: u64,
    last_error: Option<(&'static str, String)>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("state", &self.state)
            .field("round", &self.round)
            .field("messages", &self.messages.len())
            .field("pending_agents", &self.acc.agents())
            .finish()
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(&ReconcileCfg::default())
    }
}

impl Reconciler {
    pub fn new(cfg: &ReconcileCfg) -> Self {
        Self {
            state: ReconcileState::AwaitingFirstEvent,
            round: 1,
            conversation_id: String::new(),
            acc: AgentAccumulator::new(),
            messages: Vec::new(),
            dedup_window_ms: i64::try_from(cfg.dedup_window_ms).unwrap_or(i64::MAX),
            clock: Arc::new(SystemClock),
            cancel: CancellationToken::new(),
            seq: 0,
            last_error: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Share a token with the read loop; tripping it silences the sink.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Last non-empty conversation id seen on the wire.
    pub fn conversation_id(&self) -> Option<&str> {
        Some(self.conversation_id.as_str()).filter(|c| !c.is_empty())
    }

    /// Kind tag and message of the error that ended the stream, if any.
    pub fn last_error(&self) -> Option<(&'static str, &str)> {
        self.last_error.as_ref().map(|(k, m)| (*k, m.as_str()))
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<ConversationMessage> {
        self.messages
    }

    /// Text accumulated so far for an agent in the current round.
    pub fn pending(&self, agent_id: &str) -> Option<&str> {
        self.acc.get(agent_id)
    }

    /// Rough completion estimate in percent.
    pub fn progress(&self) -> u8 {
        match self.state {
            ReconcileState::AwaitingFirstEvent => 0,
            ReconcileState::Completed => 100,
            _ => {
                let finalized = self.messages.iter().filter(|m| m.round == self.round).count();
                let streaming = self.acc.agents();
                (5 + finalized * 25 + streaming * 10).min(95) as u8
            }
        }
    }

    /// Start a new round (feedback submission). Finalized messages survive.
    pub fn begin_round(&mut self, round: u32) {
        debug!(from = self.round, to = round, "begin round");
        self.round = round;
        self.acc.clear();
        if !self.cancel.is_cancelled() {
            self.state = ReconcileState::AwaitingFirstEvent;
        }
    }

    /// Forget everything (new conversation).
    pub fn reset(&mut self) {
        self.begin_round(1);
        self.messages.clear();
        self.conversation_id.clear();
        self.last_error = None;
        self.seq = 0;
    }

    /// Drop unflushed deltas of the current round, keeping finalized
    /// messages. A resubscribed stream replays from the start, so partial
    /// buffers from the dead session must not be appended to again.
    pub fn discard_pending(&mut self) {
        if !self.acc.is_empty() {
            debug!(
                agents = self.acc.agents(),
                bytes = self.acc.total_len(),
                "discarding partial deltas"
            );
        }
        self.acc.clear();
    }

    /// Trip the token and stop. No callback fires afterwards.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.mark_cancelled();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Apply one event, in arrival order.
    pub fn apply(&mut self, event: StreamEvent, sink: &mut dyn StreamSink) -> Flow {
        if self.cancel.is_cancelled() {
            self.mark_cancelled();
            return Flow::Stop;
        }
        if self.state.is_terminal() {
            debug!(kind = ?event.kind, agent = %event.agent_id, "ignoring event after terminal state");
            return Flow::Stop;
        }
        if event.round != self.round {
            debug!(from = self.round, to = event.round, "round changed mid-stream");
            self.round = event.round;
            self.acc.clear();
        }
        if !event.conversation_id.is_empty() && event.conversation_id != self.conversation_id {
            self.conversation_id = event.conversation_id.clone();
        }
        self.state = ReconcileState::Active;
        let terminal = event.is_terminal();

        match event.kind {
            EventKind::Delta => {
                let cumulative = self.acc.append(&event.agent_id, &event.content).to_string();
                if self.live() {
                    sink.on_delta(&event.agent_id, &cumulative);
                }
            }
            EventKind::Message => {
                let text = self
                    .acc
                    .take(&event.agent_id)
                    .unwrap_or_else(|| event.content.clone());
                self.finalize(&event.agent_id, text, &event.timestamp, sink);
            }
            EventKind::Result => {
                let own = self
                    .acc
                    .take(&event.agent_id)
                    .or_else(|| Some(event.content.clone()).filter(|c| !c.is_empty()));
                if let Some(text) = own {
                    self.finalize(&event.agent_id, text, &event.timestamp, sink);
                }
            }
            EventKind::Error => {
                self.fail(AgentFeedError::Producer(event.content), sink);
                return Flow::Stop;
            }
        }

        if terminal {
            self.complete(&event.timestamp, sink);
            return Flow::Stop;
        }
        Flow::Continue
    }

    /// Transport ended without a terminal event. Treated as success.
    pub fn finish_stream(&mut self, sink: &mut dyn StreamSink) {
        if self.cancel.is_cancelled() {
            self.mark_cancelled();
            return;
        }
        if self.state.is_terminal() {
            return;
        }
        warn!(
            round = self.round,
            pending_agents = self.acc.agents(),
            "stream ended without a terminal event"
        );
        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        self.complete(&now, sink);
    }

    /// Terminal failure that did not come from the producer (transport,
    /// reconnect exhaustion). Reported once.
    pub fn fail(&mut self, error: AgentFeedError, sink: &mut dyn StreamSink) {
        if self.cancel.is_cancelled() {
            self.mark_cancelled();
            return;
        }
        if self.state.is_terminal() {
            return;
        }
        warn!(error = %error, kind = error.kind(), "stream failed");
        self.state = ReconcileState::Errored;
        self.last_error = Some((error.kind(), error.to_string()));
        sink.on_error(&error);
    }

    pub fn report_diagnostic(&self, diagnostic: &ParseDiagnostic, sink: &mut dyn StreamSink) {
        if self.live() {
            sink.on_diagnostic(diagnostic);
        }
    }

    fn live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    fn mark_cancelled(&mut self) {
        if !matches!(self.state, ReconcileState::Completed | ReconcileState::Errored) {
            self.state = ReconcileState::Cancelled;
        }
    }

    /// Flush every non-empty accumulator and close the stream.
    fn complete(&mut self, timestamp: &str, sink: &mut dyn StreamSink) {
        for (agent, text) in self.acc.drain_non_empty() {
            self.finalize(&agent, text, timestamp, sink);
        }
        if !self.live() {
            self.mark_cancelled();
            return;
        }
        self.state = ReconcileState::Completed;
        info!(round = self.round, messages = self.messages.len(), "stream completed");
        sink.on_complete();
    }

    fn finalize(&mut self, agent_id: &str, content: String, timestamp: &str, sink: &mut dyn StreamSink) {
        if content.is_empty() {
            debug!(agent = %agent_id, "skipping empty final message");
            return;
        }
        let now = self.clock.now_ms();
        let window = self.dedup_window_ms;
        let round = self.round;
        let existing = self.messages.iter().position(|m| {
            m.agent_id == agent_id && m.round == round && now.saturating_sub(m.created_at_ms) <= window
        });

        let idx = match existing {
            Some(i) => {
                debug!(agent = %agent_id, round, "replacing duplicate message");
                let m = &mut self.messages[i];
                m.content = content;
                m.timestamp = timestamp.to_string();
                i
            }
            None => {
                self.seq += 1;
                self.messages.push(ConversationMessage {
                    id: format!("{round}-{agent_id}-{}", self.seq),
                    agent_id: agent_id.to_string(),
                    content,
                    round,
                    timestamp: timestamp.to_string(),
                    created_at_ms: now,
                });
                self.messages.len() - 1
            }
        };
        if self.live() {
            sink.on_message(&self.messages[idx]);
        }
    }
}
