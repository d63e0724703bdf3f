use crate::{
    completion::{ChatMessage, CompletionRequest},
    types::DraftRequest,
};

pub const DRAFT_TEMPERATURE: f32 = 0.7;
pub const ANALYSIS_TEMPERATURE: f32 = 0.3;

const DRAFTER_PROMPT: &str =
    "You are a professional legal assistant that drafts clean, formal legal documents.";

const ANALYST_PROMPT: &str = "You are a legal analyst. Summarize the document below, \
     identify the parties, key obligations, dates and risks, and point out unusual clauses.";

/// Prompt for drafting a new agreement from structured fields.
pub fn draft_request(req: &DraftRequest) -> CompletionRequest {
    let mut prompt = format!(
        "Draft a professional {} legal agreement between {} and {}, \
         effective from {} under {} law. \
         Use clear legal formatting with numbered clauses and structured sections.",
        req.kind.trim(),
        req.party_a.trim(),
        req.party_b.trim(),
        req.effective_date.trim(),
        req.country.trim(),
    );
    if let Some(clauses) = req.clauses.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        prompt.push_str("\nInclude these specific custom clauses: ");
        prompt.push_str(clauses);
    }
    CompletionRequest::new(
        vec![ChatMessage::system(DRAFTER_PROMPT), ChatMessage::user(prompt)],
        DRAFT_TEMPERATURE,
    )
}

/// Prompt for analyzing uploaded text. Only the first `limit` characters
/// are sent.
pub fn analysis_request(text: &str, limit: usize) -> CompletionRequest {
    CompletionRequest::new(
        vec![
            ChatMessage::system(ANALYST_PROMPT),
            ChatMessage::user(truncate_chars(text, limit)),
        ],
        ANALYSIS_TEMPERATURE,
    )
}

fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
