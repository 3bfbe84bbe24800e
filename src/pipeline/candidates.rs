//! Candidate filtering — cheap scoring that decides whether a message is
//! worth running through source matching and extraction at all.
//!
//! Scoring:
//!   +3  trusted sender (exact match)
//!   +2  trusted domain
//!   +2  subject pattern hit
//!   +2  body signature (>=2 KPI keywords + >=2 numbers + currency/percent)
//!   +2  people keyword match
//!   +3  has attachments
//!   +4  has KPI-parseable attachment
//!   +2  attachment filename KPI keyword
//!   +1  sent folder baseline / junk rescue
//!   -3  meeting invite or calendar pattern
//!   -5  quarantine digest pattern
//!   -3  newsletter heuristic sender
//!
//! Candidate iff score >= 3. Deny-listed domains are excluded outright
//! (except sent/junk folders, where the deny list does not apply).

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::KeywordConfig;
use crate::sender::{SenderIdentity, is_newsletter_sender, normalise_sender};

use super::gate::GateResult;
use super::types::Message;

const BODY_SCAN_LIMIT: usize = 3000;
const CANDIDATE_THRESHOLD: i32 = 3;

static MEETING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(accepted|declined|tentative|canceled):|read meeting report|invitation:|automatic reply:|meeting request|out of office",
    )
    .expect("static regex")
});

static QUARANTINE_DIGEST_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)quarantined?\s*message\s*report|quarantine\s*digest|spam\s*digest")
        .expect("static regex")
});

static NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{2,}").expect("static regex"));

const FILENAME_KPI_KEYWORDS: [&str; 20] = [
    "report", "financial", "kpi", "dashboard", "weekly", "monthly", "cash", "occupancy",
    "pipeline", "orders", "closings", "revenue", "snapshot", "summary", "daily", "p&l",
    "balance", "income", "statement", "model",
];

/// Candidate verdict plus the normalised sender, which downstream stages
/// reuse so normalisation happens exactly once per message.
#[derive(Debug, Clone)]
pub struct CandidateScore {
    pub candidate: bool,
    pub score: i32,
    pub reasons: Vec<String>,
    pub sender: SenderIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Folder {
    Inbox,
    Sent,
    Junk,
}

fn folder_of(msg: &Message) -> Folder {
    match msg.source_folder.to_lowercase().as_str() {
        "sent items" | "sent" => Folder::Sent,
        "junk email" | "junk" => Folder::Junk,
        _ => Folder::Inbox,
    }
}

/// Score one message. `gate` supplies the attachment classification so the
/// KPI-attachment boost agrees with what the gate actually found.
pub fn score_candidate(msg: &Message, keywords: &KeywordConfig, gate: &GateResult) -> CandidateScore {
    let subject = msg.subject.to_lowercase();
    let body: String = msg.body.to_lowercase().chars().take(BODY_SCAN_LIMIT).collect();
    let folder = folder_of(msg);

    let sender = normalise_sender(&msg.sender_email, msg.sender_name.as_deref());

    // Hard exclusion: deny-listed domain. Sent items we authored ourselves
    // and junk rescues bypass the list.
    if folder == Folder::Inbox
        && !sender.domain.is_empty()
        && keywords.deny_domains.contains(&sender.domain)
    {
        debug!(sender = %sender.email, domain = %sender.domain, "deny domain, excluded");
        return CandidateScore {
            candidate: false,
            score: -5,
            reasons: vec!["deny_domain".into()],
            sender,
        };
    }

    let mut score = 0i32;
    let mut reasons: Vec<String> = Vec::new();

    match folder {
        Folder::Sent => {
            // We are the sender, so sender trust is meaningless; small
            // baseline and let content signals decide.
            score += 1;
            reasons.push("sent_folder".into());
        }
        _ => {
            if keywords.trusted_senders.contains(&sender.email) {
                score += 3;
                reasons.push("allow_sender".into());
            }
            if !sender.domain.is_empty() && keywords.trusted_domains.contains(&sender.domain) {
                score += 2;
                reasons.push("allow_domain".into());
            }
        }
    }
    if folder == Folder::Junk {
        score += 1;
        reasons.push("junk_folder_rescue".into());
    }

    if keywords.subject_patterns.iter().any(|re| re.is_match(&subject)) {
        score += 2;
        reasons.push("subject_hit".into());
    }

    let kw_count = keywords.kpi_terms.iter().filter(|t| body.contains(t.as_str())).count();
    let numeric_count = NUMERIC_RE.find_iter(&body).count();
    let currency_marker = body.contains('$') || body.contains('%');
    if kw_count >= 2 && numeric_count >= 2 && currency_marker {
        score += 2;
        reasons.push("body_signature".into());
    }

    let sender_name_lower = msg.sender_name.as_deref().unwrap_or("").to_lowercase();
    if keywords.people_keywords.iter().any(|pk| {
        sender.email.contains(pk.as_str())
            || sender_name_lower.contains(pk.as_str())
            || subject.contains(pk.as_str())
    }) {
        score += 2;
        reasons.push("people_keyword".into());
    }

    if msg.has_attachments() {
        score += 3;
        reasons.push("has_attachments".into());
    }
    if !gate.kpi_attachment_exts.is_empty() {
        score += 4;
        reasons.push("kpi_attachment".into());
    }

    let att_names = msg.attachment_names().to_lowercase();
    if !att_names.is_empty() && FILENAME_KPI_KEYWORDS.iter().any(|kw| att_names.contains(kw)) {
        score += 2;
        reasons.push("filename_kpi_keyword".into());
    }

    if MEETING_RE.is_match(&subject) {
        score -= 3;
        reasons.push("meeting_invite_penalty".into());
    }
    if QUARANTINE_DIGEST_RE.is_match(&subject) {
        score -= 5;
        reasons.push("quarantine_penalty".into());
    }
    if is_newsletter_sender(&sender.email) {
        score -= 3;
        reasons.push("newsletter_penalty".into());
    }

    let candidate = score >= CANDIDATE_THRESHOLD;
    debug!(
        id = %msg.id,
        sender = %sender.email,
        score,
        candidate,
        reasons = ?reasons,
        "candidate scored"
    );
    CandidateScore {
        candidate,
        score,
        reasons,
        sender,
    }
}
