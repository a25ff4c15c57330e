//! Streaming primitives shared by the parser, the reconciler and the transports.
//!
//! Contract:
//! - The producer emits 0..n `Delta` events per agent, optionally closed by a `Message`.
//! - A stream ends with a `Result`, an `Error`, any event carrying `is_final`, or the
//!   transport closing (treated as an implicit success).
//! - Events are consumed exactly once, in arrival order.

use serde::{Deserialize, Serialize};

use crate::error::CoreResult;

/// Classification of one parsed payload line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Incremental fragment of one agent's output (`streaming_chunk`).
    Delta,
    /// Complete output of one agent (`text_message`).
    Message,
    /// Terminal result of the whole run (`task_result`).
    Result,
    /// Producer-reported failure.
    Error,
}

impl EventKind {
    /// Map a wire `type` / `message_type` value. Unknown names return `None`.
    pub fn from_wire(name: &str) -> Option<Self> {
        match name {
            "streaming_chunk" | "delta" => Some(Self::Delta),
            "text_message" | "message" => Some(Self::Message),
            "task_result" | "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One typed event, produced by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub agent_id: String,
    pub content: String,
    pub conversation_id: String,
    pub round: u32,
    /// Set from either `is_final` or `is_complete` on the wire.
    pub is_final: bool,
    /// RFC 3339; filled with the parse time when the producer omits it.
    pub timestamp: String,
}

impl StreamEvent {
    /// Returns true if this event ends the stream (`Result`, `Error`, or flagged final).
    pub fn is_terminal(&self) -> bool {
        self.is_final || matches!(self.kind, EventKind::Result | EventKind::Error)
    }
}

/// Boxed stream of raw body chunks. Transports backed by HTTP produce this.
pub type ByteStream = futures::stream::BoxStream<'static, CoreResult<bytes::Bytes>>;
