//! Entity routing — maps a message to an entity label when the matched
//! rule does not pin one.
//!
//! Priority order, most authoritative first: sender domain (unambiguously
//! identifies the organisation), then subject/body keywords for
//! cross-domain senders. No hit routes to `UNKNOWN`.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::pipeline::types::Message;

pub const UNKNOWN_ENTITY: &str = "UNKNOWN";

/// Alias configuration, loaded from `entity_aliases.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityAliases {
    /// Sender-domain fragment -> entity label.
    #[serde(default)]
    pub sender_domains: BTreeMap<String, String>,
    /// Subject/body keyword -> entity label.
    #[serde(default)]
    pub keywords: BTreeMap<String, String>,
}

impl EntityAliases {
    /// Load aliases; a missing file yields an empty map with a warning.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(path = %path.display(), "entity alias file not found, routing falls back to UNKNOWN");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let aliases: Self = serde_json::from_str(&text)?;
        Ok(aliases)
    }

    pub fn is_empty(&self) -> bool {
        self.sender_domains.is_empty() && self.keywords.is_empty()
    }
}

/// Route a message to an entity label.
pub fn route_entity(msg: &Message, sender_email: &str, aliases: &EntityAliases) -> String {
    let sender = sender_email.to_lowercase();
    for (domain, entity) in &aliases.sender_domains {
        if sender.contains(domain.to_lowercase().as_str()) {
            debug!(entity = %entity, domain = %domain, "entity routed via sender domain");
            return entity.clone();
        }
    }

    let subject = msg.subject.to_lowercase();
    let body = msg.body.to_lowercase();
    for (keyword, entity) in &aliases.keywords {
        let kw = keyword.to_lowercase();
        if subject.contains(kw.as_str()) || body.contains(kw.as_str()) {
            debug!(entity = %entity, keyword = %keyword, "entity routed via keyword");
            return entity.clone();
        }
    }

    debug!(sender = %sender, "entity route: UNKNOWN");
    UNKNOWN_ENTITY.to_string()
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn aliases() -> EntityAliases {
        let mut a = EntityAliases::default();
        a.sender_domains.insert("acme.com".into(), "Acme".into());
        a.keywords.insert("northwind".into(), "Northwind".into());
        a
    }

    fn msg(subject: &str, body: &str) -> Message {
        Message {
            id: "m1".into(),
            sender_email: "x@other.org".into(),
            sender_name: None,
            subject: subject.into(),
            body: body.into(),
            received_at: Utc::now(),
            source_folder: "inbox".into(),
            attachments: vec![],
        }
    }

    #[test]
    fn sender_domain_wins_over_keyword() {
        let m = msg("Northwind weekly", "");
        let entity = route_entity(&m, "reports@acme.com", &aliases());
        assert_eq!(entity, "Acme");
    }

    #[test]
    fn keyword_fallback_scans_subject_and_body() {
        let m = msg("weekly numbers", "the northwind team reports...");
        assert_eq!(route_entity(&m, "x@other.org", &aliases()), "Northwind");
    }

    #[test]
    fn no_hit_routes_unknown() {
        let m = msg("hello", "world");
        assert_eq!(route_entity(&m, "x@other.org", &aliases()), UNKNOWN_ENTITY);
    }

    #[test]
    fn missing_file_loads_empty() {
        let aliases = EntityAliases::load(Path::new("/nonexistent/aliases.json")).expect("load");
        assert!(aliases.is_empty());
    }
}
