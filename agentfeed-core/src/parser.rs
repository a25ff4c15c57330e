//! Payload line → `StreamEvent`.
//!
//! Everything malformed is handled here: non-payload lines, duplicated `data:`
//! prefixes, non-JSON noise and truncated JSON never reach the reconciler.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::stream::{EventKind, StreamEvent};

const DATA_PREFIX: &str = "data:";
const DEFAULT_AGENT: &str = "unknown";
const SNIPPET_MAX: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// JSON only parsed after trimming to the outermost braces.
    Recovered,
    /// JSON could not be parsed at all; the line was dropped.
    Dropped,
    /// Parsed, but the event type is not one we can reconcile.
    UnknownType,
}

/// Non-fatal parse issue surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDiagnostic {
    pub kind: DiagnosticKind,
    pub detail: String,
    /// Offending line, truncated.
    pub line: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub payload_lines: u64,
    pub events: u64,
    pub duplicated_prefixes: u64,
    pub recovered: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub struct EventParser {
    last_round: u32,
    diagnostics: Vec<ParseDiagnostic>,
    stats: ParseStats,
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

impl EventParser {
    pub fn new() -> Self {
        Self {
            last_round: 1,
            diagnostics: Vec::new(),
            stats: ParseStats::default(),
        }
    }

    /// Round used for events that omit `round_number`.
    pub fn last_round(&self) -> u32 {
        self.last_round
    }

    /// Seed the default round, e.g. when a feedback round starts.
    pub fn set_round(&mut self, round: u32) {
        self.last_round = round;
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    /// Drain diagnostics collected since the last call.
    pub fn take_diagnostics(&mut self) -> Vec<ParseDiagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Parse every payload line of a frame independently. A bad line never
    /// affects its siblings.
    pub fn parse_frame(&mut self, frame: &Frame) -> Vec<StreamEvent> {
        frame.lines().filter_map(|line| self.parse_line(line)).collect()
    }

    /// Parse a single line. Returns `None` for anything that is not a usable event.
    pub fn parse_line(&mut self, line: &str) -> Option<StreamEvent> {
        let line = line.trim();
        let rest = strip_data_prefix(line)?;
        self.stats.payload_lines += 1;

        let mut payload = rest;
        let mut repeats = 0;
        while let Some(inner) = strip_data_prefix(payload) {
            payload = inner;
            repeats += 1;
        }
        if repeats > 0 {
            self.stats.duplicated_prefixes += 1;
            warn!(repeats, "duplicated data prefix on payload line");
        }

        let payload = payload.trim();
        if !payload.starts_with('{') {
            debug!(line = %snippet(payload), "skipping non-JSON payload");
            return None;
        }

        let obj = match serde_json::from_str::<Map<String, Value>>(payload) {
            Ok(obj) => obj,
            Err(first) => match recover_braces(payload) {
                Some(obj) => {
                    self.stats.recovered += 1;
                    warn!(error = %first, "recovered payload by brace extraction");
                    self.diagnose(DiagnosticKind::Recovered, first.to_string(), payload);
                    obj
                }
                None => {
                    self.stats.dropped += 1;
                    warn!(error = %first, line = %snippet(payload), "dropping malformed payload");
                    self.diagnose(DiagnosticKind::Dropped, first.to_string(), payload);
                    return None;
                }
            },
        };

        let event = self.map_event(&obj, payload)?;
        self.stats.events += 1;
        Some(event)
    }

    fn map_event(&mut self, obj: &Map<String, Value>, raw: &str) -> Option<StreamEvent> {
        let type_name = str_field(obj, "type").or_else(|| str_field(obj, "message_type"));
        let complete_flag = bool_field(obj, "is_complete");
        let is_final = bool_field(obj, "is_final").unwrap_or(false) || complete_flag.unwrap_or(false);

        let kind = match type_name {
            Some(name) => match EventKind::from_wire(name) {
                Some(k) => k,
                None if has_streaming_marker(name, obj) => EventKind::Delta,
                None => {
                    self.diagnose(DiagnosticKind::UnknownType, format!("unknown event type '{name}'"), raw);
                    return None;
                }
            },
            // Legacy chat chunks carry only `content` and `is_complete`.
            None => match complete_flag {
                Some(false) => EventKind::Delta,
                Some(true) => EventKind::Result,
                None => {
                    self.diagnose(DiagnosticKind::UnknownType, "payload has no event type".into(), raw);
                    return None;
                }
            },
        };

        if let Some(r) = u32_field(obj, "round_number") {
            self.last_round = r;
        }

        Some(StreamEvent {
            kind,
            agent_id: str_field(obj, "source")
                .or_else(|| str_field(obj, "agent_name"))
                .unwrap_or(DEFAULT_AGENT)
                .to_string(),
            content: content_field(obj),
            conversation_id: str_field(obj, "conversation_id").unwrap_or_default().to_string(),
            round: self.last_round,
            is_final,
            timestamp: str_field(obj, "timestamp")
                .map(str::to_string)
                .unwrap_or_else(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        })
    }

    fn diagnose(&mut self, kind: DiagnosticKind, detail: String, line: &str) {
        self.diagnostics.push(ParseDiagnostic {
            kind,
            detail,
            line: snippet(line),
        });
    }
}

/// Strip one `data:` prefix and the single optional space after it.
fn strip_data_prefix(s: &str) -> Option<&str> {
    let rest = s.strip_prefix(DATA_PREFIX)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Re-parse the substring between the first `{` and the last `}`.
fn recover_braces(s: &str) -> Option<Map<String, Value>> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&s[start..=end]).ok()
}

/// Unknown event types still count as deltas when they clearly stream text.
fn has_streaming_marker(type_name: &str, obj: &Map<String, Value>) -> bool {
    if !matches!(obj.get("content"), Some(Value::String(_))) {
        return false;
    }
    let lowered = type_name.to_ascii_lowercase();
    lowered.contains("chunk")
        || lowered.contains("delta")
        || bool_field(obj, "is_streaming").unwrap_or(false)
        || bool_field(obj, "streaming").unwrap_or(false)
}

fn str_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    obj.get(key).and_then(Value::as_bool)
}

fn u32_field(obj: &Map<String, Value>, key: &str) -> Option<u32> {
    match obj.get(key)? {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn content_field(obj: &Map<String, Value>) -> String {
    match obj.get("content") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn snippet(s: &str) -> String {
    if s.len() <= SNIPPET_MAX {
        return s.to_string();
    }
    let mut cut = SNIPPET_MAX;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_payload() {
        let mut p = EventParser::new();
        let ev = p
            .parse_line(r#"data: {"type":"streaming_chunk","source":"requirement_analyst","content":"Hel","conversation_id":"c1","round_number":2,"is_complete":false,"is_final":false,"timestamp":"2025-06-09T02:14:14Z"}"#)
            .unwrap();
        assert_eq!(ev.kind, EventKind::Delta);
        assert_eq!(ev.agent_id, "requirement_analyst");
        assert_eq!(ev.content, "Hel");
        assert_eq!(ev.conversation_id, "c1");
        assert_eq!(ev.round, 2);
        assert!(!ev.is_final);
        assert_eq!(ev.timestamp, "2025-06-09T02:14:14Z");
    }

    #[test]
    fn duplicated_prefix_parses_like_single_prefix() {
        let mut p = EventParser::new();
        let body = r#"{"type":"task_result","source":"A","content":"done","timestamp":"t"}"#;
        let single = p.parse_line(&format!("data: {body}")).unwrap();
        let double = p.parse_line(&format!("data: data: {body}")).unwrap();
        let triple = p.parse_line(&format!("data: data:data: {body}")).unwrap();
        assert_eq!(single, double);
        assert_eq!(single, triple);
        assert_eq!(p.stats().duplicated_prefixes, 2);
    }

    #[test]
    fn duplicated_prefix_task_result() {
        let mut p = EventParser::new();
        let ev = p.parse_line(r#"data: data: {"type":"task_result","content":"done"}"#).unwrap();
        assert_eq!(ev.kind, EventKind::Result);
        assert_eq!(ev.content, "done");
        assert!(ev.is_terminal());
    }

    #[test]
    fn non_payload_lines_are_skipped() {
        let mut p = EventParser::new();
        assert!(p.parse_line("event: message").is_none());
        assert!(p.parse_line(": keep-alive").is_none());
        assert!(p.parse_line("id: 42").is_none());
        assert!(p.parse_line("retry: 3000").is_none());
        assert!(p.parse_line("data: [DONE]").is_none());
        assert!(p.take_diagnostics().is_empty());
    }

    #[test]
    fn noise_line_does_not_affect_siblings() {
        let mut p = EventParser::new();
        let frame = Frame::new(
            "data: {\"type\":\"streaming_chunk\",\"source\":\"A\",\"content\":\"x\"}\nnot json at all\ndata: {\"type\":\"streaming_chunk\",\"source\":\"B\",\"content\":\"y\"}",
        );
        let events = p.parse_frame(&frame);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].agent_id, "A");
        assert_eq!(events[1].agent_id, "B");
        assert!(p.parse_line("not json at all").is_none());
    }

    #[test]
    fn stray_bytes_are_recovered_by_brace_extraction() {
        let mut p = EventParser::new();
        let ev = p
            .parse_line(r#"data: {"type":"text_message","source":"A","content":"ok"}garbage"#)
            .unwrap();
        assert_eq!(ev.kind, EventKind::Message);
        assert_eq!(ev.content, "ok");
        let diags = p.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::Recovered);
    }

    #[test]
    fn truncated_json_is_dropped_with_diagnostic() {
        let mut p = EventParser::new();
        assert!(p.parse_line(r#"data: {"type":"streaming_chunk","content":"unterminated"#).is_none());
        let diags = p.take_diagnostics();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, DiagnosticKind::Dropped);
        assert_eq!(p.stats().dropped, 1);
        // Parser keeps working afterwards.
        assert!(p.parse_line(r#"data: {"type":"error","content":"boom"}"#).is_some());
    }

    #[test]
    fn missing_round_defaults_to_last_known() {
        let mut p = EventParser::new();
        let a = p.parse_line(r#"data: {"type":"streaming_chunk","content":"a"}"#).unwrap();
        assert_eq!(a.round, 1);
        p.parse_line(r#"data: {"type":"streaming_chunk","content":"b","round_number":3}"#);
        let c = p.parse_line(r#"data: {"type":"streaming_chunk","content":"c"}"#).unwrap();
        assert_eq!(c.round, 3);
    }

    #[test]
    fn missing_timestamp_and_source_are_defaulted() {
        let mut p = EventParser::new();
        let ev = p.parse_line(r#"data: {"type":"text_message","content":"hi"}"#).unwrap();
        assert_eq!(ev.agent_id, "unknown");
        assert!(chrono::DateTime::parse_from_rfc3339(&ev.timestamp).is_ok());
    }

    #[test]
    fn agent_name_and_message_type_are_fallbacks() {
        let mut p = EventParser::new();
        let ev = p
            .parse_line(r#"data: {"message_type":"text_message","agent_name":"testcase_generator","content":"x"}"#)
            .unwrap();
        assert_eq!(ev.kind, EventKind::Message);
        assert_eq!(ev.agent_id, "testcase_generator");
    }

    #[test]
    fn unknown_type_with_streaming_marker_is_delta() {
        let mut p = EventParser::new();
        let a = p
            .parse_line(r#"data: {"type":"ModelClientStreamingChunkEvent","source":"A","content":"x"}"#)
            .unwrap();
        assert_eq!(a.kind, EventKind::Delta);
        let b = p
            .parse_line(r#"data: {"type":"thought","source":"A","content":"y","is_streaming":true}"#)
            .unwrap();
        assert_eq!(b.kind, EventKind::Delta);
    }

    #[test]
    fn unknown_type_without_marker_is_dropped() {
        let mut p = EventParser::new();
        assert!(p.parse_line(r#"data: {"type":"ToolCallRequestEvent","content":"x"}"#).is_none());
        assert!(p.parse_line(r#"data: {"type":"heartbeat_chunk"}"#).is_none());
        let diags = p.take_diagnostics();
        assert_eq!(diags.len(), 2);
        assert!(diags.iter().all(|d| d.kind == DiagnosticKind::UnknownType));
    }

    #[test]
    fn legacy_chat_chunks_use_is_complete() {
        let mut p = EventParser::new();
        let d = p
            .parse_line(r#"data: {"content":"Hi","is_complete":false,"conversation_id":"c"}"#)
            .unwrap();
        assert_eq!(d.kind, EventKind::Delta);
        let r = p
            .parse_line(r#"data: {"content":"","is_complete":true,"conversation_id":"c"}"#)
            .unwrap();
        assert_eq!(r.kind, EventKind::Result);
        assert!(r.is_final);
        assert!(p.parse_line(r#"data: {"content":"orphan"}"#).is_none());
    }

    #[test]
    fn is_complete_marks_any_event_final() {
        let mut p = EventParser::new();
        let ev = p
            .parse_line(r#"data: {"type":"text_message","source":"A","content":"x","is_complete":true}"#)
            .unwrap();
        assert!(ev.is_final);
    }

    #[test]
    fn non_string_content_is_serialized() {
        let mut p = EventParser::new();
        let ev = p
            .parse_line(r#"data: {"type":"task_result","content":{"cases":2}}"#)
            .unwrap();
        assert_eq!(ev.content, r#"{"cases":2}"#);
    }
}
