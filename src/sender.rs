//! Sender normalisation — turns Exchange LDAP-style addresses into usable
//! email / domain / stable-id values.
//!
//! Exchange blobs look like:
//! `/O=EXCHANGELABS/OU=EXCHANGE ADMINISTRATIVE GROUP (...)/CN=RECIPIENTS/CN=ABC123...`

use std::sync::LazyLock;

use regex::Regex;

static EXCHANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/O=").expect("static regex"));
static CN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/CN=RECIPIENTS/CN=([^/]+)").expect("static regex"));
static SMTP_IN_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[(<]([A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,})[)>]").expect("static regex")
});

/// Normalised sender identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderIdentity {
    /// Lowercased SMTP address, or best-effort stand-in for Exchange DNs.
    pub email: String,
    /// Domain part, empty when no real SMTP address is known.
    pub domain: String,
    /// Stable id usable as a dedupe key.
    pub id: String,
}

/// True if `raw` looks like an Exchange DN rather than an email address.
pub fn is_exchange_dn(raw: &str) -> bool {
    EXCHANGE_RE.is_match(raw)
}

/// Normalise a raw sender address plus optional display name.
///
/// If `raw_email` is an Exchange DN, a stable id is extracted from the CN
/// segment and the domain is left empty so it never participates in domain
/// matching. A real SMTP address embedded in the display name
/// (`"John Doe (john@example.com)"`) takes precedence.
pub fn normalise_sender(raw_email: &str, sender_name: Option<&str>) -> SenderIdentity {
    let raw_email = raw_email.trim();
    let sender_name = sender_name.unwrap_or("").trim();

    if let Some(caps) = SMTP_IN_NAME_RE.captures(sender_name) {
        return from_smtp(&caps[1]);
    }

    if raw_email.is_empty() || is_exchange_dn(raw_email) {
        let cn_id = CN_RE
            .captures(raw_email)
            .map(|c| c[1].to_lowercase())
            .unwrap_or_default();
        let fallback = if sender_name.is_empty() {
            cn_id.clone()
        } else {
            sender_name.to_lowercase()
        };
        return SenderIdentity {
            email: fallback.clone(),
            domain: String::new(),
            id: if cn_id.is_empty() { fallback } else { cn_id },
        };
    }

    from_smtp(raw_email)
}

fn from_smtp(email: &str) -> SenderIdentity {
    let email = email.trim().to_lowercase();
    let domain = email.rsplit_once('@').map(|(_, d)| d.to_string()).unwrap_or_default();
    SenderIdentity {
        id: email.clone(),
        email,
        domain,
    }
}

/// Heuristic: the local part looks like a newsletter / no-reply / bot sender.
pub fn is_newsletter_sender(email: &str) -> bool {
    let local = email
        .split_once('@')
        .map(|(l, _)| l.to_lowercase())
        .unwrap_or_else(|| email.to_lowercase());
    const PATTERNS: [&str; 13] = [
        "newsletter",
        "no-reply",
        "noreply",
        "no_reply",
        "marketing",
        "info",
        "news",
        "updates",
        "notifications",
        "notify",
        "mailer-daemon",
        "do-not-reply",
        "donotreply",
    ];
    PATTERNS.iter().any(|p| local.contains(p))
}
