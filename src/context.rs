//! Shared run context — configuration and service handles, built once at
//! startup and threaded through the pipeline.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::{KeywordConfig, PipelineOptions, RuleSet};
use crate::docs::ocr::OcrEngine;
use crate::entity::EntityAliases;
use crate::ledger::Ledger;
use crate::llm::KpiLlm;

/// Everything a run needs besides the messages themselves.
pub struct PipelineContext {
    pub run_id: String,
    pub rules: RuleSet,
    pub keywords: KeywordConfig,
    pub options: PipelineOptions,
    /// Fallback entity routing for rules that do not pin an entity.
    pub entities: EntityAliases,
    pub ledger: Arc<dyn Ledger>,
    /// Absent when no API key is configured; extraction degrades to regex.
    pub llm: Option<Arc<dyn KpiLlm>>,
    /// Absent when the OCR binaries are missing; Tier-3 docs fall to Tier 4.
    pub ocr: Option<Arc<dyn OcrEngine>>,
}

impl PipelineContext {
    pub fn new(
        rules: RuleSet,
        keywords: KeywordConfig,
        options: PipelineOptions,
        ledger: Arc<dyn Ledger>,
    ) -> Self {
        Self {
            run_id: new_run_id(),
            rules,
            keywords,
            options,
            entities: EntityAliases::default(),
            ledger,
            llm: None,
            ocr: None,
        }
    }

    pub fn with_entities(mut self, entities: EntityAliases) -> Self {
        self.entities = entities;
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn KpiLlm>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrEngine>) -> Self {
        self.ocr = Some(ocr);
        self
    }
}

/// Timestamp-prefixed run id; sortable in the artifacts directory.
pub fn new_run_id() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{stamp}-{}", &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique_and_sortable() {
        let a = new_run_id();
        let b = new_run_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), "20260831-120000-".len() + 8);
    }
}
