use serde::{Deserialize, Serialize};

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamOutcome {
    /// Terminal `result` / `is_final` event.
    Completed,
    /// Transport closed without a terminal event; treated as success.
    Eof,
    Errored,
    Cancelled,
}

impl StreamOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Eof => "eof",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Per-stream summary handed to the telemetry sink when a connection finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StreamSummary {
    pub connection_id: String,
    /// `request_stream` or `subscribe`.
    pub transport: Option<String>,
    pub conversation_id: Option<String>,
    pub round: Option<u32>,

    pub frames: u64,
    pub events: u64,
    /// Payload lines dropped by the parser.
    pub dropped_lines: u64,
    /// Payload lines salvaged by brace extraction.
    pub recovered_lines: u64,
    pub reconnects: u32,
    pub messages: u32,

    pub outcome: Option<StreamOutcome>,
    pub latency_ms: Option<u64>,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl StreamSummary {
    pub fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            ..Default::default()
        }
    }

    pub fn transport(mut self, v: &str) -> Self {
        self.transport = Some(v.to_string());
        self
    }
    pub fn conversation_id_opt(mut self, v: Option<&str>) -> Self {
        self.conversation_id = v.map(|s| s.to_string());
        self
    }
    pub fn round(mut self, v: u32) -> Self {
        self.round = Some(v);
        self
    }
    pub fn counts(mut self, frames: u64, events: u64, dropped: u64, recovered: u64) -> Self {
        self.frames = frames;
        self.events = events;
        self.dropped_lines = dropped;
        self.recovered_lines = recovered;
        self
    }
    pub fn reconnects(mut self, v: u32) -> Self {
        self.reconnects = v;
        self
    }
    pub fn messages(mut self, v: usize) -> Self {
        self.messages = u32::try_from(v).unwrap_or(u32::MAX);
        self
    }
    pub fn outcome(mut self, v: StreamOutcome) -> Self {
        self.outcome = Some(v);
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
    pub fn error(mut self, kind: &str, msg: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(msg.to_string());
        self
    }
}
