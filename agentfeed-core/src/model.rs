use serde::{Deserialize, Serialize};

/// Body of a generation request (chat or test-case run).
///
/// Sent as JSON for the request-stream transport and flattened into query
/// parameters for the push-subscribe transport.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_paths: Option<Vec<String>>,
    #[serde(default = "default_round")]
    pub round_number: u32,
    #[serde(default = "default_streaming")]
    pub enable_streaming: bool,
    /// Feedback on the previous round; only meaningful when `round_number > 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_feedback: Option<String>,
}

fn default_round() -> u32 {
    1
}
fn default_streaming() -> bool {
    true
}

impl GenerationRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            text_content: Some(text.into()),
            file_paths: None,
            round_number: 1,
            enable_streaming: true,
            user_feedback: None,
        }
    }

    /// Follow-up round on an existing conversation.
    pub fn feedback(conversation_id: impl Into<String>, feedback: impl Into<String>, round: u32) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            text_content: None,
            file_paths: None,
            round_number: round,
            enable_streaming: true,
            user_feedback: Some(feedback.into()),
        }
    }

    /// Query parameters for the push-subscribe variant. Absent fields are skipped;
    /// lists are JSON-encoded.
    pub fn to_query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut q = Vec::with_capacity(6);
        if let Some(id) = &self.conversation_id {
            q.push(("conversation_id", id.clone()));
        }
        if let Some(t) = &self.text_content {
            q.push(("text_content", t.clone()));
        }
        if let Some(files) = &self.file_paths {
            q.push((
                "file_paths",
                serde_json::to_string(files).unwrap_or_else(|_| "[]".into()),
            ));
        }
        q.push(("round_number", self.round_number.to_string()));
        q.push(("enable_streaming", self.enable_streaming.to_string()));
        if let Some(f) = &self.user_feedback {
            q.push(("user_feedback", f.clone()));
        }
        q
    }
}

/// A finalized agent output. Immutable once emitted, except for content
/// replacement by deduplication.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ConversationMessage {
    pub id: String,
    pub agent_id: String,
    pub content: String,
    pub round: u32,
    /// Producer timestamp of the event that finalized the message.
    pub timestamp: String,
    /// Local wall-clock time (ms since epoch) at creation; drives the dedup window.
    pub created_at_ms: i64,
}
