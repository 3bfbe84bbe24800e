//! Configuration — source rules, keyword lists, and pipeline options.
//!
//! Source rules live in a versioned JSON file (`source_rules.json`), loaded
//! once per run and immutable afterwards. Keyword and allowlist files are
//! plain text, one entry per line, `#` comments ignored. A malformed regex
//! inside a rule disables that signal only; the rule keeps matching on its
//! remaining signals.

use std::collections::HashSet;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigError;

/// Rule file schema version this build understands.
pub const RULE_SCHEMA_VERSION: u32 = 1;

// ── Source rule file ────────────────────────────────────────────────

/// What to do with a message that matches no rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownSourcePolicy {
    /// Hold for manual / LLM triage.
    #[default]
    Quarantine,
    /// Drop silently (counted in the run report).
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleDefaults {
    pub unknown_source_policy: UnknownSourcePolicy,
    /// Fallback match threshold for rules that do not declare their own.
    pub global_reject_threshold: f64,
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            unknown_source_policy: UnknownSourcePolicy::default(),
            global_reject_threshold: 0.45,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchBlock {
    /// Exact sender addresses (lowercased on load).
    pub from_addresses: Vec<String>,
    /// Sender domains (lowercased on load).
    pub from_domains: Vec<String>,
    /// Case-insensitive regex applied to the subject.
    pub subject_regex: Option<String>,
    /// Keywords counted proportionally against the body.
    pub body_contains: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentRule {
    pub allowed_mime_types: Vec<String>,
    pub filename_regex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedKpi {
    pub kpi_key: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceBlock {
    /// Minimum score for this rule to count as matched.
    pub match_threshold: Option<f64>,
    /// Multiplier applied to the raw signal sum.
    pub confidence_weight: f64,
}

impl Default for ConfidenceBlock {
    fn default() -> Self {
        Self {
            match_threshold: None,
            confidence_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsingBlock {
    /// Strategy hint: "attachment_primary" or "body_primary".
    pub strategy: String,
}

impl Default for ParsingBlock {
    fn default() -> Self {
        Self {
            strategy: "attachment_primary".to_string(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// One configured KPI source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRule {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub entity: String,
    #[serde(default)]
    pub report_type: String,
    /// Tie-break when two rules score identically; higher wins.
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "match", default)]
    pub match_block: MatchBlock,
    #[serde(default)]
    pub attachments: Vec<AttachmentRule>,
    #[serde(default)]
    pub expected_kpis: Vec<ExpectedKpi>,
    #[serde(default)]
    pub parsing: ParsingBlock,
    #[serde(default)]
    pub confidence: ConfidenceBlock,
}

impl SourceRule {
    pub fn threshold(&self, defaults: &RuleDefaults) -> f64 {
        self.confidence
            .match_threshold
            .unwrap_or(defaults.global_reject_threshold)
    }

    pub fn required_kpi_keys(&self) -> Vec<&str> {
        self.expected_kpis
            .iter()
            .filter(|k| k.required)
            .map(|k| k.kpi_key.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceRuleFile {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub defaults: RuleDefaults,
    #[serde(default)]
    pub sources: Vec<SourceRule>,
}

/// A rule with its regexes compiled once at load time.
///
/// A regex that fails to compile is logged and dropped; the rule still
/// matches on its other signals.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: SourceRule,
    pub subject_re: Option<Regex>,
    pub filename_re: Option<Regex>,
}

impl CompiledRule {
    fn compile(mut rule: SourceRule) -> Self {
        rule.match_block.from_addresses =
            rule.match_block.from_addresses.iter().map(|a| a.to_lowercase()).collect();
        rule.match_block.from_domains =
            rule.match_block.from_domains.iter().map(|d| d.to_lowercase()).collect();
        rule.match_block.body_contains =
            rule.match_block.body_contains.iter().map(|k| k.to_lowercase()).collect();

        let subject_re = rule
            .match_block
            .subject_regex
            .as_deref()
            .and_then(|p| compile_insensitive(p, &rule.id, "subject_regex"));
        let filename_re = rule
            .attachments
            .first()
            .and_then(|a| a.filename_regex.as_deref())
            .and_then(|p| compile_insensitive(p, &rule.id, "filename_regex"));
        Self {
            rule,
            subject_re,
            filename_re,
        }
    }
}

fn compile_insensitive(pattern: &str, rule_id: &str, which: &str) -> Option<Regex> {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => Some(re),
        Err(e) => {
            warn!(rule = %rule_id, signal = %which, error = %e, "invalid rule regex, signal disabled");
            None
        }
    }
}

/// The loaded, compiled rule set.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub defaults: RuleDefaults,
    pub rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Load rules from a JSON file. A missing file yields an empty set with
    /// matching disabled (everything falls to the unknown-source policy).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!(path = %path.display(), "source rules file not found, source matching disabled");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let file: SourceRuleFile = serde_json::from_str(&raw)?;
        if file.schema_version != RULE_SCHEMA_VERSION {
            return Err(ConfigError::SchemaVersion {
                found: file.schema_version,
                expected: RULE_SCHEMA_VERSION,
            });
        }
        Ok(Self::from_file(file))
    }

    /// Compile an already-parsed rule file (used by tests).
    pub fn from_file(file: SourceRuleFile) -> Self {
        let total = file.sources.len();
        let rules: Vec<CompiledRule> = file
            .sources
            .into_iter()
            .filter(|r| r.enabled)
            .map(CompiledRule::compile)
            .collect();
        info!(total, enabled = rules.len(), "source rules loaded");
        Self {
            defaults: file.defaults,
            rules,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

// ── Keyword / allowlist configuration ───────────────────────────────

/// Keyword lists and sender allow/deny lists used by candidate filtering
/// and the body-signal checks.
///
/// `default()` carries the built-in lists; `load_dir` overlays any text
/// files present in a config directory.
#[derive(Debug, Clone)]
pub struct KeywordConfig {
    pub kpi_terms: Vec<String>,
    pub people_keywords: Vec<String>,
    /// Compiled subject patterns for the candidate filter.
    pub subject_patterns: Vec<Regex>,
    pub trusted_senders: HashSet<String>,
    pub trusted_domains: HashSet<String>,
    pub deny_domains: HashSet<String>,
}

impl Default for KeywordConfig {
    fn default() -> Self {
        let kpi_terms = [
            "revenue", "cash", "occupancy", "pipeline", "closings", "orders",
            "kpi", "report", "snapshot", "balance", "income", "census",
            "month to date", "mtd", "ytd",
        ];
        let subject_patterns = [
            r"daily\s+(kpi|report|snapshot)",
            r"weekly\s+(kpi|report|numbers|update)",
            r"monthly\s+(kpi|report|financials)",
            r"month\s*[- ]?\s*to\s*[- ]?\s*date",
            r"\bkpi\b",
            r"occupancy|census",
            r"cash\s+(position|balance|report)",
            r"pipeline\s+(report|update|summary)",
            r"closings?\s+(report|summary|count)",
        ];
        Self {
            kpi_terms: kpi_terms.iter().map(|s| s.to_string()).collect(),
            people_keywords: Vec::new(),
            subject_patterns: subject_patterns
                .iter()
                .filter_map(|p| RegexBuilder::new(p).case_insensitive(true).build().ok())
                .collect(),
            trusted_senders: HashSet::new(),
            trusted_domains: HashSet::new(),
            deny_domains: HashSet::new(),
        }
    }
}

impl KeywordConfig {
    /// Overlay text files from `dir` onto the built-in defaults.
    ///
    /// Recognised files: `keywords_kpi_terms.txt`, `keywords_people.txt`,
    /// `regex_subject_patterns.txt`, `trusted_senders.txt`,
    /// `trusted_sender_domains.txt`, `deny_sender_domains.txt`.
    pub fn load_dir(dir: &Path) -> Self {
        let mut cfg = Self::default();
        if let Some(lines) = load_lines(&dir.join("keywords_kpi_terms.txt")) {
            cfg.kpi_terms = lines;
        }
        if let Some(lines) = load_lines(&dir.join("keywords_people.txt")) {
            cfg.people_keywords = lines;
        }
        if let Some(lines) = load_lines(&dir.join("regex_subject_patterns.txt")) {
            cfg.subject_patterns = lines
                .iter()
                .filter_map(|p| match RegexBuilder::new(p).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(pattern = %p, error = %e, "invalid subject pattern, skipped");
                        None
                    }
                })
                .collect();
        }
        if let Some(lines) = load_lines(&dir.join("trusted_senders.txt")) {
            cfg.trusted_senders = lines.into_iter().collect();
        }
        if let Some(lines) = load_lines(&dir.join("trusted_sender_domains.txt")) {
            cfg.trusted_domains = lines.into_iter().collect();
        }
        if let Some(lines) = load_lines(&dir.join("deny_sender_domains.txt")) {
            cfg.deny_domains = lines.into_iter().collect();
        }
        cfg
    }

    /// Startup validation pass: log list sizes so misconfigured deployments
    /// are visible in the first lines of a run.
    pub fn log_summary(&self) {
        info!(
            kpi_terms = self.kpi_terms.len(),
            people_keywords = self.people_keywords.len(),
            subject_patterns = self.subject_patterns.len(),
            trusted_senders = self.trusted_senders.len(),
            trusted_domains = self.trusted_domains.len(),
            deny_domains = self.deny_domains.len(),
            "keyword configuration loaded"
        );
    }
}

/// Read one entry per line, lowercased, skipping blanks and `#` comments.
/// Returns `None` when the file does not exist.
fn load_lines(path: &Path) -> Option<Vec<String>> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut lines: Vec<String> = raw
        .lines()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
    lines.sort();
    lines.dedup();
    Some(lines)
}

// ── Pipeline options ────────────────────────────────────────────────

/// Run-level knobs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Scan window in days.
    pub days_back: i64,
    /// Cap on messages per run (None = unlimited).
    pub max_messages: Option<usize>,
    /// Reject records with no populated KPI field.
    pub require_kpi: bool,
    /// Sheet writer batch size.
    pub batch_size: usize,
    /// LLM extraction enabled (degrades to regex-only when off).
    pub llm_enabled: bool,
    /// OCR escalation enabled (Tier-3 documents go straight to Tier 4 when off).
    pub ocr_enabled: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            days_back: 30,
            max_messages: None,
            require_kpi: true,
            batch_size: 200,
            llm_enabled: true,
            ocr_enabled: true,
        }
    }
}

impl PipelineOptions {
    /// Resolve options from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut opts = Self::default();
        if let Ok(v) = std::env::var("KPI_DAYS_BACK") {
            opts.days_back = parse_env("KPI_DAYS_BACK", &v)?;
        }
        if let Ok(v) = std::env::var("KPI_MAX_MESSAGES") {
            opts.max_messages = Some(parse_env("KPI_MAX_MESSAGES", &v)?);
        }
        if let Ok(v) = std::env::var("KPI_REQUIRE_KPI") {
            opts.require_kpi = parse_bool("KPI_REQUIRE_KPI", &v)?;
        }
        if let Ok(v) = std::env::var("KPI_BATCH_SIZE") {
            opts.batch_size = parse_env("KPI_BATCH_SIZE", &v)?;
        }
        if let Ok(v) = std::env::var("KPI_LLM_ENABLED") {
            opts.llm_enabled = parse_bool("KPI_LLM_ENABLED", &v)?;
        }
        if let Ok(v) = std::env::var("KPI_OCR_ENABLED") {
            opts.ocr_enabled = parse_bool("KPI_OCR_ENABLED", &v)?;
        }
        Ok(opts)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{value}'"),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{other}'"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> SourceRuleFile {
        serde_json::from_str(
            r#"{
                "schema_version": 1,
                "defaults": {"unknown_source_policy": "quarantine", "global_reject_threshold": 0.45},
                "sources": [
                    {
                        "id": "acme-daily",
                        "entity": "ACME Title",
                        "report_type": "daily_closings",
                        "priority": 10,
                        "match": {
                            "from_addresses": ["Reports@ACME.com"],
                            "from_domains": ["acme.com"],
                            "subject_regex": "daily (closing|kpi)",
                            "body_contains": ["closings", "orders"]
                        },
                        "attachments": [
                            {"allowed_mime_types": ["text/csv"], "filename_regex": "daily.*\\.csv"}
                        ],
                        "expected_kpis": [
                            {"kpi_key": "closings_count", "required": true},
                            {"kpi_key": "orders_count"}
                        ],
                        "confidence": {"match_threshold": 0.5, "confidence_weight": 1.0}
                    },
                    {"id": "disabled-rule", "enabled": false}
                ]
            }"#,
        )
        .expect("valid test json")
    }

    #[test]
    fn disabled_rules_dropped_and_lists_lowercased() {
        let set = RuleSet::from_file(sample_file());
        assert_eq!(set.rules.len(), 1);
        let rule = &set.rules[0].rule;
        assert_eq!(rule.match_block.from_addresses, vec!["reports@acme.com"]);
        assert!(set.rules[0].subject_re.is_some());
        assert!(set.rules[0].filename_re.is_some());
    }

    #[test]
    fn required_keys_and_threshold() {
        let set = RuleSet::from_file(sample_file());
        let rule = &set.rules[0].rule;
        assert_eq!(rule.required_kpi_keys(), vec!["closings_count"]);
        assert_eq!(rule.threshold(&set.defaults), 0.5);

        let bare = SourceRule {
            id: "bare".into(),
            enabled: true,
            entity: String::new(),
            report_type: String::new(),
            priority: 0,
            match_block: MatchBlock::default(),
            attachments: vec![],
            expected_kpis: vec![],
            parsing: ParsingBlock::default(),
            confidence: ConfidenceBlock::default(),
        };
        assert_eq!(bare.threshold(&set.defaults), 0.45);
    }

    #[test]
    fn bad_regex_disables_signal_not_rule() {
        let mut file = sample_file();
        file.sources[0].match_block.subject_regex = Some("([unclosed".into());
        let set = RuleSet::from_file(file);
        assert_eq!(set.rules.len(), 1);
        assert!(set.rules[0].subject_re.is_none());
        // Filename regex untouched.
        assert!(set.rules[0].filename_re.is_some());
    }

    #[test]
    fn schema_version_mismatch_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("source_rules.json");
        std::fs::write(&path, r#"{"schema_version": 2, "sources": []}"#).expect("write");
        let err = RuleSet::load(&path).expect_err("should reject version 2");
        assert!(matches!(
            err,
            ConfigError::SchemaVersion {
                found: 2,
                expected: 1
            }
        ));
    }

    #[test]
    fn missing_rule_file_yields_empty_set() {
        let set = RuleSet::load(Path::new("/nonexistent/source_rules.json")).expect("ok");
        assert!(set.is_empty());
        assert_eq!(
            set.defaults.unknown_source_policy,
            UnknownSourcePolicy::Quarantine
        );
    }

    #[test]
    fn keyword_dir_overlay() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("trusted_senders.txt"),
            "Reports@ACME.com\n# comment\n\nreports@acme.com\n",
        )
        .expect("write");
        let cfg = KeywordConfig::load_dir(dir.path());
        assert_eq!(cfg.trusted_senders.len(), 1);
        assert!(cfg.trusted_senders.contains("reports@acme.com"));
        // Built-ins survive for files not present.
        assert!(!cfg.kpi_terms.is_empty());
        assert!(!cfg.subject_patterns.is_empty());
    }

    #[test]
    fn bool_env_parsing() {
        assert!(parse_bool("K", "true").expect("ok"));
        assert!(!parse_bool("K", "0").expect("ok"));
        assert!(parse_bool("K", "maybe").is_err());
    }
}
