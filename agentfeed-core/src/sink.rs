//! Output side of the reconciler.
//!
//! The reconciler knows nothing about rendering; it reports state changes
//! through `StreamSink`. `ChannelSink` forwards them to another task.

use tokio::sync::mpsc::UnboundedSender;

use crate::error::AgentFeedError;
use crate::model::ConversationMessage;
use crate::parser::ParseDiagnostic;

/// Receiver of reconciled stream state. All methods default to no-ops.
pub trait StreamSink: Send {
    /// Cumulative text of one agent's in-progress output.
    fn on_delta(&mut self, _agent_id: &str, _cumulative: &str) {}

    /// A finalized message. Also fired when deduplication replaces the
    /// content of an earlier message with the same id.
    fn on_message(&mut self, _message: &ConversationMessage) {}

    fn on_complete(&mut self) {}

    fn on_error(&mut self, _error: &AgentFeedError) {}

    fn on_diagnostic(&mut self, _diagnostic: &ParseDiagnostic) {}
}

/// Owned form of one sink callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Delta { agent_id: String, cumulative: String },
    Message(ConversationMessage),
    Complete,
    Error { kind: &'static str, message: String },
    Diagnostic(ParseDiagnostic),
}

/// Forwards callbacks over an unbounded channel. A closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn new(tx: UnboundedSender<SinkEvent>) -> Self {
        Self { tx }
    }

    fn send(&self, ev: SinkEvent) {
        let _ = self.tx.send(ev);
    }
}

impl StreamSink for ChannelSink {
    fn on_delta(&mut self, agent_id: &str, cumulative: &str) {
        self.send(SinkEvent::Delta {
            agent_id: agent_id.to_string(),
            cumulative: cumulative.to_string(),
        });
    }

    fn on_message(&mut self, message: &ConversationMessage) {
        self.send(SinkEvent::Message(message.clone()));
    }

    fn on_complete(&mut self) {
        self.send(SinkEvent::Complete);
    }

    fn on_error(&mut self, error: &AgentFeedError) {
        self.send(SinkEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    fn on_diagnostic(&mut self, diagnostic: &ParseDiagnostic) {
        self.send(SinkEvent::Diagnostic(diagnostic.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn channel_sink_forwards_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx);
        sink.on_delta("A", "He");
        sink.on_error(&AgentFeedError::Producer("boom".into()));
        sink.on_complete();

        assert_eq!(
            rx.try_recv().unwrap(),
            SinkEvent::Delta { agent_id: "A".into(), cumulative: "He".into() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SinkEvent::Error { kind: "producer", message: "producer error: boom".into() }
        );
        assert_eq!(rx.try_recv().unwrap(), SinkEvent::Complete);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_receiver_is_not_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut sink = ChannelSink::new(tx);
        sink.on_complete();
    }
}
