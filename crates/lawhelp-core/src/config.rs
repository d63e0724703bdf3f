use std::collections::HashMap;

use anyhow::Result;

use crate::chat::system_prompt_for;

/// Full application configuration, read once at startup from the process
/// environment with a `.env` file as fallback.
#[derive(Debug, Clone)]
pub struct Config {
    // Web
    pub web_bind: String,
    pub web_port: u16,
    pub max_upload_mb: u64,

    // Completion backend
    /// "openai" (default) or "ollama".
    pub backend: String,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub model: String,
    pub ollama_url: String,
    pub completion_timeout_s: u64,

    // Chat
    pub assistant_name: String,
    pub ping_interval_s: u64,
    pub law_facts_path: String,

    // Database
    pub database_url: String,
    pub db_pool_size: usize,

    // Object storage
    /// "supabase" (default) or "s3".
    pub storage_backend: String,
    pub supabase_url: String,
    pub supabase_key: String,
    pub storage_bucket: String,
    pub s3_public_base_url: String,

    // Documents
    pub min_document_chars: usize,
    pub analysis_char_limit: usize,
}

fn parse_dotenv() -> HashMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return HashMap::new();
    };
    parse_dotenv_str(&contents)
}

fn parse_dotenv_str(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim();
            let v = v
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(v);
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_usize(key: &str, dotenv: &HashMap<String, String>, default: usize) -> usize {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// System prompt seeded into every chat session.
    pub fn chat_system_prompt(&self) -> String {
        system_prompt_for(&self.assistant_name)
    }

    pub fn has_database(&self) -> bool {
        !self.database_url.is_empty()
    }

    pub fn has_supabase_storage(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_key.is_empty()
    }

    /// Why the configured completion backend cannot be used, if it can't.
    pub fn completion_misconfiguration(&self) -> Option<String> {
        match self.backend.as_str() {
            "openai" if self.openai_api_key.is_empty() => {
                Some("OPENAI_API_KEY is not configured".into())
            }
            "openai" | "ollama" => None,
            other => Some(format!("unknown completion backend {other:?}")),
        }
    }

    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        Ok(Self::from_lookup(&dotenv))
    }

    fn from_lookup(dotenv: &HashMap<String, String>) -> Self {
        // SUPABASE_DB_URL is the historical name; DATABASE_URL wins when both are set.
        let database_url = get("DATABASE_URL", dotenv)
            .filter(|s| !s.is_empty())
            .or_else(|| get("SUPABASE_DB_URL", dotenv))
            .unwrap_or_default();

        Config {
            web_bind: get_str("WEB_BIND", dotenv, "0.0.0.0"),
            web_port: get_u16("PORT", dotenv, 10000),
            max_upload_mb: get_u64("MAX_UPLOAD_MB", dotenv, 20),
            backend: get_str("BACKEND", dotenv, "openai").to_lowercase(),
            openai_api_key: get_str("OPENAI_API_KEY", dotenv, ""),
            openai_base_url: get_str("OPENAI_BASE_URL", dotenv, "https://api.openai.com/v1"),
            model: get_str("MODEL", dotenv, "gpt-4o-mini"),
            ollama_url: get_str("OLLAMA_URL", dotenv, "http://127.0.0.1:11434"),
            completion_timeout_s: get_u64("COMPLETION_TIMEOUT_S", dotenv, 45),
            assistant_name: get_str("ASSISTANT_NAME", dotenv, "LawHelpZone"),
            ping_interval_s: get_u64("PING_INTERVAL_S", dotenv, 60).max(1),
            law_facts_path: get_str("LAW_FACTS_PATH", dotenv, "data/laws/LawFacts.json"),
            database_url,
            db_pool_size: get_usize("DB_POOL_SIZE", dotenv, 8).max(1),
            storage_backend: get_str("STORAGE_BACKEND", dotenv, "supabase").to_lowercase(),
            supabase_url: get_str("SUPABASE_URL", dotenv, "")
                .trim_end_matches('/')
                .to_string(),
            supabase_key: get_str("SUPABASE_KEY", dotenv, ""),
            storage_bucket: get_str("STORAGE_BUCKET", dotenv, "signed_documents"),
            s3_public_base_url: get_str("S3_PUBLIC_BASE_URL", dotenv, ""),
            min_document_chars: get_usize("MIN_DOCUMENT_CHARS", dotenv, 50),
            analysis_char_limit: get_usize("ANALYSIS_CHAR_LIMIT", dotenv, 4000).max(1),
        }
    }
}
