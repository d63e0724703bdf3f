//! Jurisdiction heuristics for the chat loop.
//!
//! The classifier is the completion backend itself: a single low-temperature
//! call asked to name the legal system a question belongs to. Its answer is
//! free-form; [`resolve`] only normalizes it and never checks it against a
//! list of known jurisdictions.

use crate::completion::{ChatMessage, CompletionRequest};

/// Reserved first line of every chat reply: `__JURISDICTION__:<tag>`.
pub const JURISDICTION_MARKER: &str = "__JURISDICTION__";

pub const CLASSIFY_TEMPERATURE: f32 = 0.0;

/// Longest tag echoed back to clients.
const MAX_TAG_CHARS: usize = 64;

pub fn classification_request(question: &str, previous: &str) -> CompletionRequest {
    let prompt = format!(
        "Identify which country's or region's legal system this question most likely relates to. \
         Examples: Pakistan, UK, Australia, India, Canada, USA, EU. \
         Answer with the jurisdiction name only. \
         If unclear, respond '{previous}'.\n\nQuestion: {question}"
    );
    CompletionRequest::new(vec![ChatMessage::system(prompt)], CLASSIFY_TEMPERATURE)
}

/// Turn a classifier answer into a tag, falling back to `previous` when the
/// answer is blank after cleanup.
pub fn resolve(answer: &str, previous: &str) -> String {
    let line = answer
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");

    let line = line
        .strip_prefix("Jurisdiction:")
        .or_else(|| line.strip_prefix("jurisdiction:"))
        .unwrap_or(line);

    let cleaned = line
        .trim()
        .trim_matches(|c: char| matches!(c, '*' | '_' | '`' | '"' | '\'' | '.' | ',' | ';' | ':'))
        .trim();

    // Drop control characters so the tag cannot break the marker line.
    let tag: String = cleaned
        .chars()
        .filter(|c| !c.is_control())
        .take(MAX_TAG_CHARS)
        .collect();
    let tag = tag.trim();

    if tag.is_empty() {
        previous.to_string()
    } else {
        tag.to_string()
    }
}

/// Wrap the user's question with the jurisdiction context and the reply tag
/// directive before it is appended to history.
pub fn contextualize(question: &str, jurisdiction: &str) -> String {
    format!(
        "The user's legal question falls under **{jurisdiction}** law. \
         Start your answer with a short jurisdiction tag like '🇵🇰 Pakistan Law:' or \
         '🇺🇸 United States Law:' accordingly. Provide a professional and up-to-date explanation.\n\n\
         User question: {question}"
    )
}

/// Frame an outbound reply with its machine-readable jurisdiction line.
pub fn encode_reply(jurisdiction: &str, reply: &str) -> String {
    format!("{JURISDICTION_MARKER}:{jurisdiction}\n{reply}")
}
