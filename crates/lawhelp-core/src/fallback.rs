use std::collections::HashMap;

use serde::Deserialize;
use tracing::{info, warn};

/// Sent when the backend fails and no reference text exists for the
/// jurisdiction.
pub const UNAVAILABLE_REPLY: &str = "⚖️ Unable to fetch response. Try again later.";

/// Prepended to reference text so it is never mistaken for a live answer.
pub const FALLBACK_NOTICE: &str =
    "⚠️ A live answer is unavailable right now. Here is general reference information instead:";

#[derive(Debug, Clone, Default, Deserialize)]
struct JurisdictionFacts {
    #[serde(default)]
    general: Option<String>,
}

/// Static jurisdiction → reference-text table, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct LawFacts {
    by_jurisdiction: HashMap<String, JurisdictionFacts>,
}

impl LawFacts {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load from a JSON file shaped `{ "<jurisdiction>": { "general": "..." } }`.
    /// A missing or malformed file yields an empty table.
    pub fn load(path: &str) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no law facts at {path}, fallback replies use the canned message");
                return Self::empty();
            }
            Err(e) => {
                warn!("failed to read law facts {path}: {e}");
                return Self::empty();
            }
        };
        match Self::from_json(&contents) {
            Ok(facts) => {
                info!(jurisdictions = facts.len(), "loaded law facts from {path}");
                facts
            }
            Err(e) => {
                warn!("ignoring malformed law facts {path}: {e}");
                Self::empty()
            }
        }
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        let by_jurisdiction = serde_json::from_str(json)?;
        Ok(Self { by_jurisdiction })
    }

    pub fn len(&self) -> usize {
        self.by_jurisdiction.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_jurisdiction.is_empty()
    }

    /// Reference text for a jurisdiction. Exact key first, then a
    /// case-insensitive match.
    pub fn general(&self, jurisdiction: &str) -> Option<&str> {
        let entry = self.by_jurisdiction.get(jurisdiction).or_else(|| {
            self.by_jurisdiction
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(jurisdiction))
                .map(|(_, v)| v)
        })?;
        entry
            .general
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}
