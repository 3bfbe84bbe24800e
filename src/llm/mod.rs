//! LLM-based KPI extraction.
//!
//! Sits on top of the deterministic pipeline — invoked for Tier-1 documents
//! always and Tier-2 documents where regex extracted at most one KPI. The
//! response is structured JSON per field with a value, an evidence line,
//! and a confidence score; parsing tolerates markdown fences and trailing
//! commas. All provider failures degrade to regex-only extraction upstream.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::kpi::KpiField;

/// Maximum characters of document text sent to the LLM.
pub const TEXT_CHAR_LIMIT: usize = 12_000;

/// LLM values below this confidence are discarded during merge.
pub const MIN_CONFIDENCE: f64 = 0.6;

const SYSTEM_PROMPT: &str = "\
You are a financial-data extraction assistant. Your ONLY job is to pull \
KPI numbers from the text the user provides.

RULES:
1. Extract ONLY values that represent actual, current business operating \
metrics. Ignore legal references (e.g. \"Revenue Code of 1986\"), \
article/slide numbers, footnotes, and marketing copy.
2. For multi-column financial statements pick the MOST RECENT reporting \
period (rightmost or latest-dated column).
3. Monetary values should be plain numbers (no $ sign, no commas). \
Use the full numeric value (e.g. 1200000 not \"1.2M\").
4. Occupancy should be a decimal between 0 and 1 (e.g. 0.92 for 92%).
5. Count fields (closings_count, orders_count) should be integers.
6. Return null for any field where NO legitimate value exists.
7. Provide a brief evidence_line (the exact text snippet) for each value.
8. Provide a confidence score (0.0-1.0) for each extracted value.
9. IGNORE aspirational, target, or goal language. Phrases like \
\"hold 92% occupancy\", \"achieve $X\", \"goal of $X\", \"target NOI\", \
\"we aim to\", or \"budget of $X\" describe PLANS, not actuals. \
Return null for these.
10. IGNORE deal-discussion figures. If the text discusses a company \
being acquired, sold, or evaluated (e.g. \"a company with $600k in \
annual revenue\", \"purchase price $5M\"), those are THIRD-PARTY \
descriptors, NOT the sender's operating metrics. Return null.
11. Only extract values that the sender (or their company) is REPORTING \
as their own actual, realised operating results.

Respond ONLY with valid JSON, no markdown fences, no commentary.";

static FENCE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^```(?:json)?\s*").expect("static regex"));
static FENCE_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*```$").expect("static regex"));
static TRAILING_COMMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([\]}])").expect("static regex"));

/// One field's LLM estimate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldEstimate {
    pub value: Option<f64>,
    pub evidence_line: Option<String>,
    #[serde(default)]
    pub confidence: f64,
}

/// Structured extraction result, one estimate per canonical field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmExtraction {
    pub revenue: FieldEstimate,
    pub cash: FieldEstimate,
    pub pipeline_value: FieldEstimate,
    pub closings_count: FieldEstimate,
    pub orders_count: FieldEstimate,
    pub occupancy: FieldEstimate,
}

impl LlmExtraction {
    pub fn get(&self, field: KpiField) -> &FieldEstimate {
        match field {
            KpiField::Revenue => &self.revenue,
            KpiField::Cash => &self.cash,
            KpiField::PipelineValue => &self.pipeline_value,
            KpiField::ClosingsCount => &self.closings_count,
            KpiField::OrdersCount => &self.orders_count,
            KpiField::Occupancy => &self.occupancy,
        }
    }

    fn get_mut(&mut self, field: KpiField) -> &mut FieldEstimate {
        match field {
            KpiField::Revenue => &mut self.revenue,
            KpiField::Cash => &mut self.cash,
            KpiField::PipelineValue => &mut self.pipeline_value,
            KpiField::ClosingsCount => &mut self.closings_count,
            KpiField::OrdersCount => &mut self.orders_count,
            KpiField::Occupancy => &mut self.occupancy,
        }
    }
}

/// KPI extraction backend.
#[async_trait]
pub trait KpiLlm: Send + Sync {
    /// Extract KPI estimates from document or body text.
    async fn extract(&self, text: &str, doc_type: &str) -> Result<LlmExtraction, LlmError>;

    fn model_name(&self) -> &str;
}

/// Supported backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    OpenAi,
    Anthropic,
}

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

impl LlmConfig {
    /// Resolve from the environment: `OPENAI_API_KEY` or
    /// `ANTHROPIC_API_KEY`, with `KPI_LLM_MODEL` overriding the default
    /// model. Returns `None` when no key is set (LLM layer disabled).
    pub fn from_env() -> Option<Self> {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            return Some(Self {
                backend: LlmBackend::OpenAi,
                api_key: secrecy::SecretString::from(key),
                model: std::env::var("KPI_LLM_MODEL").unwrap_or_else(|_| "gpt-4o".to_string()),
            });
        }
        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
            return Some(Self {
                backend: LlmBackend::Anthropic,
                api_key: secrecy::SecretString::from(key),
                model: std::env::var("KPI_LLM_MODEL")
                    .unwrap_or_else(|_| "claude-3-5-sonnet-latest".to_string()),
            });
        }
        warn!("no LLM API key set, extraction will be regex-only");
        None
    }
}

/// Create an extractor from configuration.
pub fn create_extractor(config: &LlmConfig) -> Result<Arc<dyn KpiLlm>, LlmError> {
    match config.backend {
        LlmBackend::OpenAi => {
            use rig::providers::openai;
            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(config.api_key.expose_secret()).map_err(|e| {
                    LlmError::RequestFailed {
                        provider: "openai".to_string(),
                        reason: format!("failed to create OpenAI client: {e}"),
                    }
                })?;
            let agent = client
                .agent(&config.model)
                .preamble(SYSTEM_PROMPT)
                .temperature(0.0)
                .build();
            info!(model = %config.model, "using OpenAI for KPI extraction");
            Ok(Arc::new(RigExtractor {
                agent,
                provider: "openai",
                model: config.model.clone(),
            }))
        }
        LlmBackend::Anthropic => {
            use rig::providers::anthropic;
            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(config.api_key.expose_secret()).map_err(|e| {
                    LlmError::RequestFailed {
                        provider: "anthropic".to_string(),
                        reason: format!("failed to create Anthropic client: {e}"),
                    }
                })?;
            let agent = client
                .agent(&config.model)
                .preamble(SYSTEM_PROMPT)
                .temperature(0.0)
                .build();
            info!(model = %config.model, "using Anthropic for KPI extraction");
            Ok(Arc::new(RigExtractor {
                agent,
                provider: "anthropic",
                model: config.model.clone(),
            }))
        }
    }
}

struct RigExtractor<M: rig::completion::CompletionModel> {
    agent: rig::agent::Agent<M>,
    provider: &'static str,
    model: String,
}

#[async_trait]
impl<M: rig::completion::CompletionModel> KpiLlm for RigExtractor<M> {
    async fn extract(&self, text: &str, doc_type: &str) -> Result<LlmExtraction, LlmError> {
        let truncated: String = text.chars().take(TEXT_CHAR_LIMIT).collect();
        debug!(chars = truncated.len(), doc_type, "LLM extraction request");
        let prompt = build_user_prompt(&truncated, doc_type);
        let raw = self
            .agent
            .prompt(prompt)
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.provider.to_string(),
                reason: e.to_string(),
            })?;
        parse_llm_response(&raw, self.provider)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

fn build_user_prompt(text: &str, doc_type: &str) -> String {
    format!(
        "Extract KPI values from this {doc_type} document text.\n\n\
         DOCUMENT TEXT (first {TEXT_CHAR_LIMIT} chars):\n---\n{text}\n---\n\n\
         Return a JSON object with this exact structure:\n\
         {{\n\
           \"revenue\":        {{\"value\": <number|null>, \"evidence_line\": \"<string|null>\", \"confidence\": <float>}},\n\
           \"cash\":           {{\"value\": <number|null>, \"evidence_line\": \"<string|null>\", \"confidence\": <float>}},\n\
           \"pipeline_value\": {{\"value\": <number|null>, \"evidence_line\": \"<string|null>\", \"confidence\": <float>}},\n\
           \"closings_count\": {{\"value\": <number|null>, \"evidence_line\": \"<string|null>\", \"confidence\": <float>}},\n\
           \"orders_count\":   {{\"value\": <number|null>, \"evidence_line\": \"<string|null>\", \"confidence\": <float>}},\n\
           \"occupancy\":      {{\"value\": <number|null>, \"evidence_line\": \"<string|null>\", \"confidence\": <float>}}\n\
         }}"
    )
}

/// Parse and normalise a raw LLM response.
///
/// Strips markdown fences, repairs trailing commas, scales occupancy given
/// as a percentage, truncates count fields, and clamps confidence to [0, 1].
pub fn parse_llm_response(raw: &str, provider: &str) -> Result<LlmExtraction, LlmError> {
    let mut cleaned = raw.trim().to_string();
    cleaned = FENCE_OPEN_RE.replace(&cleaned, "").into_owned();
    cleaned = FENCE_CLOSE_RE.replace(&cleaned, "").into_owned();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: "empty response".to_string(),
        });
    }

    let parsed: Result<LlmExtraction, _> = serde_json::from_str(cleaned);
    let mut extraction = match parsed {
        Ok(e) => e,
        Err(_) => {
            let repaired = TRAILING_COMMA_RE.replace_all(cleaned, "$1");
            serde_json::from_str(&repaired).map_err(|e| LlmError::InvalidResponse {
                provider: provider.to_string(),
                reason: format!("cannot parse JSON: {e}"),
            })?
        }
    };

    for field in KpiField::ALL {
        let entry = extraction.get_mut(field);
        entry.confidence = entry.confidence.clamp(0.0, 1.0);
        if field == KpiField::Occupancy {
            if let Some(v) = entry.value {
                let scaled = if v > 1.0 { v / 100.0 } else { v };
                entry.value = if (0.0..=1.0).contains(&scaled) {
                    Some(scaled)
                } else {
                    debug!(value = v, "rejecting LLM occupancy outside 0-1 range");
                    None
                };
            }
        }
        if field.is_count() {
            if let Some(v) = entry.value {
                entry.value = Some(v.trunc());
            }
        }
    }
    Ok(extraction)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_RESPONSE: &str = r#"{
        "revenue": {"value": 125000, "evidence_line": "Revenue: $125,000", "confidence": 0.95},
        "cash": {"value": null, "evidence_line": null, "confidence": 0.0},
        "pipeline_value": {"value": null, "evidence_line": null, "confidence": 0.0},
        "closings_count": {"value": 12.7, "evidence_line": "12 closings", "confidence": 0.8},
        "orders_count": {"value": null, "evidence_line": null, "confidence": 0.0},
        "occupancy": {"value": 92, "evidence_line": "92% occupied", "confidence": 0.9}
    }"#;

    #[test]
    fn parses_and_normalises() {
        let e = parse_llm_response(FULL_RESPONSE, "test").expect("parse");
        assert_eq!(e.revenue.value, Some(125000.0));
        assert_eq!(e.cash.value, None);
        // Counts truncate, occupancy scales down from a percentage.
        assert_eq!(e.closings_count.value, Some(12.0));
        assert_eq!(e.occupancy.value, Some(0.92));
        assert_eq!(e.revenue.confidence, 0.95);
    }

    #[test]
    fn strips_markdown_fences() {
        let wrapped = format!("```json\n{FULL_RESPONSE}\n```");
        let e = parse_llm_response(&wrapped, "test").expect("parse");
        assert_eq!(e.revenue.value, Some(125000.0));
    }

    #[test]
    fn repairs_trailing_commas() {
        let raw = r#"{"revenue": {"value": 500, "confidence": 0.7,},}"#;
        let e = parse_llm_response(raw, "test").expect("parse");
        assert_eq!(e.revenue.value, Some(500.0));
        // Absent fields default to empty estimates.
        assert_eq!(e.cash.value, None);
        assert_eq!(e.cash.confidence, 0.0);
    }

    #[test]
    fn garbage_is_invalid_response() {
        assert!(parse_llm_response("not json at all", "test").is_err());
        assert!(parse_llm_response("", "test").is_err());
    }

    #[test]
    fn absurd_occupancy_rejected() {
        let raw = r#"{"occupancy": {"value": 250, "confidence": 0.9}}"#;
        let e = parse_llm_response(raw, "test").expect("parse");
        assert_eq!(e.occupancy.value, None);
    }

    #[test]
    fn confidence_clamped() {
        let raw = r#"{"revenue": {"value": 1000, "confidence": 3.5}}"#;
        let e = parse_llm_response(raw, "test").expect("parse");
        assert_eq!(e.revenue.confidence, 1.0);
    }
}
