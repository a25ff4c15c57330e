/// Span/log attribute keys for stream connections.
/// Keep these stable; changing them is a breaking change for dashboards.
pub const KEY_CONNECTION_ID: &str = "stream.connection_id";
pub const KEY_TRANSPORT: &str = "stream.transport";
pub const KEY_ROUND: &str = "stream.round";
pub const KEY_CONVERSATION_ID: &str = "conversation.id";

pub const KEY_FRAMES: &str = "stream.frames";
pub const KEY_EVENTS: &str = "stream.events";
pub const KEY_RECONNECTS: &str = "stream.reconnects";
pub const KEY_OUTCOME: &str = "stream.outcome";
pub const KEY_LATENCY_MS: &str = "latency.ms";

/// Error-related (if applicable)
pub const KEY_ERROR_KIND: &str = "error.kind";
pub const KEY_ERROR_MESSAGE: &str = "error.message";
