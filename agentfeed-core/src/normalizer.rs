use crate::error::{AgentFeedError, CoreResult};
use crate::model::GenerationRequest;
use unicode_normalization::UnicodeNormalization;
use std::collections::HashSet;

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

fn clean_opt(s: Option<String>) -> Option<String> {
    s.map(|v| clean_text(&v)).filter(|v| !v.is_empty())
}

/// Canonicalize a request before it goes on the wire.
///
/// Rejects requests that carry nothing for the pipeline to work on.
pub fn normalize_request(mut req: GenerationRequest) -> CoreResult<GenerationRequest> {
    req.text_content = clean_opt(req.text_content);
    req.user_feedback = clean_opt(req.user_feedback);
    req.conversation_id = req
        .conversation_id
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    if let Some(files) = req.file_paths.take() {
        let mut seen = HashSet::new();
        let kept: Vec<String> = files
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .filter(|f| seen.insert(f.clone()))
            .collect();
        if !kept.is_empty() {
            req.file_paths = Some(kept);
        }
    }

    req.round_number = req.round_number.max(1);
    req.enable_streaming = true;

    if req.text_content.is_none() && req.file_paths.is_none() && req.user_feedback.is_none() {
        return Err(AgentFeedError::Validation(
            "request needs text content, files or feedback".into(),
        ));
    }
    Ok(req)
}
