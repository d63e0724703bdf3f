use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Documents ────────────────────────────────────────────────────────────

/// A stored legal document, optionally signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub signer_name: Option<String>,
    /// Public URL of the uploaded signature image.
    pub signature_url: Option<String>,
    /// Hex-encoded SHA-256 of the signature image bytes.
    pub signature_hash: Option<String>,
    pub signed_pdf_url: Option<String>,
}

/// Character limit of the `VARCHAR(255)` columns: titles, user ids and
/// signer names.
pub const MAX_LABEL_CHARS: usize = 255;
const MAX_THEME_CHARS: usize = 50;

/// Cut `text` to at most `max` characters.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn too_long(value: Option<&str>, max: usize) -> bool {
    value.is_some_and(|v| v.trim().chars().count() > max)
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub title: String,
    pub content: String,
    pub user_id: Option<String>,
}

// ── User Settings ────────────────────────────────────────────────────────

pub const DEFAULT_USER_ID: &str = "default_user";
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_THEME: &str = "dark";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSettings {
    pub user_id: String,
    pub openai_model: String,
    pub theme: String,
    pub api_key: Option<String>,
    pub supabase_url: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl UserSettings {
    /// Copy suitable for returning to clients: the API key is reduced to its
    /// last four characters.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: self.api_key.as_deref().map(mask_secret),
            ..self.clone()
        }
    }
}

fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "*".repeat(chars.len());
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}{tail}", "*".repeat(chars.len() - 4))
}

/// Partial update for [`UserSettings`]. Absent or blank fields leave the
/// stored value untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub user_id: Option<String>,
    pub openai_model: Option<String>,
    pub theme: Option<String>,
    pub api_key: Option<String>,
    pub supabase_url: Option<String>,
}

impl SettingsPatch {
    pub fn user_id(&self) -> &str {
        self.user_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_USER_ID)
    }

    /// Name of the first field that would not fit its column.
    pub fn oversized_field(&self) -> Option<&'static str> {
        [
            ("user_id", self.user_id.as_deref(), MAX_LABEL_CHARS),
            ("openai_model", self.openai_model.as_deref(), MAX_LABEL_CHARS),
            ("theme", self.theme.as_deref(), MAX_THEME_CHARS),
        ]
        .into_iter()
        .find(|(_, value, max)| too_long(*value, *max))
        .map(|(name, _, _)| name)
    }

    /// Drop blank values so they never overwrite stored settings.
    pub fn normalized(self) -> Self {
        fn keep(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        Self {
            user_id: keep(self.user_id),
            openai_model: keep(self.openai_model),
            theme: keep(self.theme),
            api_key: keep(self.api_key),
            supabase_url: keep(self.supabase_url),
        }
    }
}

// ── Drafting ─────────────────────────────────────────────────────────────

/// Structured input for generating an agreement from scratch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DraftRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub party_a: String,
    pub party_b: String,
    pub effective_date: String,
    pub country: String,
    pub clauses: Option<String>,
}
