//! Pipeline orchestrator — runs each message through the full stage chain
//! and drives a whole run end to end.
//!
//! Stage order per message: ledger check, attachment gate, candidate
//! filter, source matching, document decode + suitability (with OCR
//! escalation), cell scan, body regex, LLM merge, validation, record
//! assembly. Every stage exits through `SkipReason` instead of an error;
//! one bad message never aborts the run.

use tracing::{debug, info, warn};

use crate::context::PipelineContext;
use crate::docs::{self, DocumentKind, ocr::DEFAULT_MAX_PAGES};
use crate::entity::route_entity;
use crate::error::Result;
use crate::ledger::ProcessedMessage;
use crate::llm::TEXT_CHAR_LIMIT;
use crate::mailstore::MailStore;
use crate::report::RunReport;
use crate::sheets::short_message_id;
use crate::sheets::writer::{BatchedSheetWriter, RowStatus};

use super::candidates::score_candidate;
use super::extractor::{
    body_has_financial_signal, compute_confidence, extract_from_body, is_deal_discussion_subject,
    merge_llm, scan_rows, should_invoke_llm_for_document,
};
use super::gate;
use super::matcher::{MatchDecision, match_message, validate_extracted_kpis};
use super::suitability::{DocumentHints, Tier, compute_suitability, rescore_after_ocr};
use super::types::{KpiRecord, Message, SkipReason, SourceType};

/// Accepted document carried forward to the LLM stage.
struct AcceptedDoc {
    attachment_name: String,
    tier: Tier,
    text: String,
    doc_type: &'static str,
}

fn doc_type_label(kind: DocumentKind) -> &'static str {
    match kind {
        DocumentKind::Csv => "csv",
        DocumentKind::Xlsx => "xlsx",
        DocumentKind::Xls => "xls",
        DocumentKind::Pdf => "pdf",
    }
}

/// Run one message through the stage chain.
pub async fn process_message(
    ctx: &PipelineContext,
    msg: &Message,
) -> std::result::Result<KpiRecord, SkipReason> {
    match ctx.ledger.is_processed(&msg.id).await {
        Ok(true) => return Err(SkipReason::AlreadyProcessed),
        Ok(false) => {}
        Err(e) => {
            return Err(SkipReason::Failed {
                error: format!("ledger lookup: {e}"),
            });
        }
    }

    // Attachment gate runs before anything content-based; signature-image
    // chatter never reaches rule matching.
    let gate = gate::evaluate(&msg.attachments, &msg.subject);
    if gate.decision.is_noise() {
        debug!(id = %msg.id, decision = gate.decision.label(), "gated as noise");
        return Err(SkipReason::AttachmentNoise {
            decision: gate.decision.label().to_string(),
            detail: gate.reason.clone(),
        });
    }

    let candidate = score_candidate(msg, &ctx.keywords, &gate);
    if !candidate.candidate {
        return Err(SkipReason::NotCandidate {
            score: candidate.score,
            reasons: candidate.reasons.clone(),
        });
    }

    let source = match_message(&ctx.rules, msg, &candidate.sender);
    if !source.matched {
        return Err(match source.decision {
            MatchDecision::Skip => SkipReason::UnknownSourceSkipped {
                top_scores: source.top_scores(3),
            },
            _ => SkipReason::Quarantined {
                top_scores: source.top_scores(3),
            },
        });
    }

    let mut values = crate::kpi::KpiValues::default();
    let mut evidence: Vec<String> = Vec::new();
    let mut primary_doc: Option<AcceptedDoc> = None;

    // Structured formats parse first; a CSV beats a scanned PDF.
    let mut parseable: Vec<(&super::types::AttachmentMeta, DocumentKind)> = msg
        .attachments
        .iter()
        .filter_map(|a| DocumentKind::from_ext(&a.ext).map(|k| (a, k)))
        .collect();
    parseable.sort_by_key(|(_, k)| k.priority());

    for (att, kind) in parseable {
        let Some(path) = att.path.as_ref() else {
            warn!(id = %msg.id, name = %att.name, "attachment bytes not materialized, skipped");
            continue;
        };
        let doc = match docs::decode(path, kind).await {
            Ok(d) => d,
            Err(e) => {
                warn!(id = %msg.id, name = %att.name, error = %e, "attachment decode failed");
                continue;
            }
        };
        let hints = DocumentHints {
            filename: &att.name,
            sheetnames: &doc.sheetnames,
            is_pdf: kind == DocumentKind::Pdf,
            text_is_empty: doc.text.trim().is_empty() || doc.looks_scanned,
        };
        let suit = compute_suitability(&doc.text, &hints);

        if suit.ocr_candidate {
            let Some(engine) = ctx.ocr.as_ref().filter(|_| ctx.options.ocr_enabled) else {
                debug!(name = %att.name, "OCR candidate but OCR disabled, dropped");
                continue;
            };
            let ocr_text = match engine.ocr_pdf(path, DEFAULT_MAX_PAGES).await {
                Ok(t) => t,
                Err(e) => {
                    warn!(name = %att.name, error = %e, "OCR failed");
                    continue;
                }
            };
            let rescored = rescore_after_ocr(&ocr_text, &hints);
            if !rescored.accept {
                debug!(name = %att.name, tier = rescored.tier as i32, "rejected after OCR");
                continue;
            }
            let rows = docs::pdf_text_rows(&ocr_text, &att.name);
            scan_rows(&rows, &mut values, &mut evidence);
            if primary_doc.is_none() {
                primary_doc = Some(AcceptedDoc {
                    attachment_name: att.name.clone(),
                    tier: rescored.tier,
                    text: ocr_text,
                    doc_type: doc_type_label(kind),
                });
            }
            continue;
        }

        if !suit.accept {
            debug!(name = %att.name, tier = suit.tier as i32, score = suit.score, "document rejected");
            continue;
        }

        scan_rows(&doc.rows, &mut values, &mut evidence);
        if primary_doc.is_none() {
            primary_doc = Some(AcceptedDoc {
                attachment_name: att.name.clone(),
                tier: suit.tier,
                text: doc.text,
                doc_type: doc_type_label(kind),
            });
        }
    }

    let regex_kpi_count = values.populated_count();
    extract_from_body(&msg.body, &mut values, &mut evidence);

    let mut llm_used = false;
    if ctx.options.llm_enabled {
        if let Some(llm) = ctx.llm.as_ref() {
            if let Some(doc) = primary_doc.as_ref() {
                if should_invoke_llm_for_document(doc.tier, regex_kpi_count) {
                    let text: String = doc.text.chars().take(TEXT_CHAR_LIMIT).collect();
                    match llm.extract(&text, doc.doc_type).await {
                        Ok(extraction) => {
                            merge_llm(
                                &mut values,
                                &extraction,
                                &mut evidence,
                                &format!("attachment:{}", doc.attachment_name),
                            );
                            llm_used = true;
                        }
                        Err(e) => warn!(id = %msg.id, error = %e, "document LLM extraction failed"),
                    }
                }
            } else if body_has_financial_signal(&msg.body, &ctx.keywords.kpi_terms)
                && !is_deal_discussion_subject(&msg.subject)
            {
                let text: String = msg.body.chars().take(TEXT_CHAR_LIMIT).collect();
                match llm.extract(&text, "body").await {
                    Ok(extraction) => {
                        merge_llm(&mut values, &extraction, &mut evidence, "body");
                        llm_used = true;
                    }
                    Err(e) => warn!(id = %msg.id, error = %e, "body LLM extraction failed"),
                }
            }
        }
    }

    if ctx.options.require_kpi && !values.has_any() {
        return Err(SkipReason::NoKpiValues);
    }

    let validation = validate_extracted_kpis(&values, &source);
    if !validation.valid {
        return Err(SkipReason::MissingRequiredKpis {
            rule_id: source.rule_id.clone(),
            missing: validation.missing_required.clone(),
        });
    }

    // Expected-but-optional KPIs that did not materialise become alerts.
    let alerts = source
        .rule
        .as_ref()
        .map(|rule| {
            rule.expected_kpis
                .iter()
                .filter(|k| !k.required && !validation.present_kpis.contains(&k.kpi_key))
                .map(|k| format!("missing:{}", k.kpi_key))
                .collect::<Vec<_>>()
                .join(";")
        })
        .unwrap_or_default();

    let source_type = if primary_doc.is_some() {
        SourceType::Attachment
    } else {
        SourceType::Body
    };
    let confidence = compute_confidence(&values, source_type, llm_used);

    // Rules normally pin the entity; rules that do not fall back to the
    // alias router.
    let entity = if source.entity.is_empty() {
        route_entity(msg, &candidate.sender.email, &ctx.entities)
    } else {
        source.entity.clone()
    };

    let record = KpiRecord {
        entity,
        date: Some(msg.received_at.date_naive()),
        values,
        alerts: alerts.clone(),
        notes: String::new(),
        run_id: ctx.run_id.clone(),
        message_id: short_message_id(&msg.id).to_string(),
        sender: candidate.sender.email.clone(),
        subject: msg.subject.clone(),
        candidate_score: candidate.score,
        candidate_reasons: candidate.reasons.clone(),
        source_type,
        attachment_name: primary_doc
            .map(|d| d.attachment_name)
            .unwrap_or_default(),
        evidence,
        confidence,
        validation_flags: alerts,
        source_rule_id: source.rule_id.clone(),
        source_match_score: source.match_score,
        source_report_type: source.report_type.clone(),
        source_parse_confidence: validation.parse_confidence,
    };
    info!(
        id = %msg.id,
        rule = %record.source_rule_id,
        entity = %record.entity,
        kpis = record.values.populated_count(),
        confidence = record.confidence,
        llm = llm_used,
        "record extracted"
    );
    Ok(record)
}

/// Whole-run driver: fetch, process, write, commit to the ledger.
pub struct Pipeline {
    pub ctx: PipelineContext,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Process every fetched message and flush the writer once at the end.
    ///
    /// Ledger commits happen after the sheet write: terminal skips are
    /// committed immediately, extracted messages only once their row
    /// actually appended, so failed rows are retried on the next run.
    /// Quarantined and unknown-source mail is never committed; it is
    /// re-classified each run until a rule claims it.
    pub async fn run(
        &self,
        store: &dyn MailStore,
        writer: &mut BatchedSheetWriter,
    ) -> Result<RunReport> {
        let messages = store.fetch(&self.ctx.options).await?;
        let mut report = RunReport::new(self.ctx.run_id.clone());
        let mut extracted: Vec<(Message, KpiRecord)> = Vec::new();

        for msg in messages {
            report.record_scanned();
            match process_message(&self.ctx, &msg).await {
                Ok(record) => {
                    report.record_candidate(&msg);
                    report.record_extracted(&msg, &record);
                    writer.append(&record);
                    extracted.push((msg, record));
                }
                Err(reason) => {
                    // Everything past the candidate filter counts as one.
                    if matches!(
                        reason,
                        SkipReason::Quarantined { .. }
                            | SkipReason::UnknownSourceSkipped { .. }
                            | SkipReason::NoKpiValues
                            | SkipReason::MissingRequiredKpis { .. }
                    ) {
                        report.record_candidate(&msg);
                    }
                    report.record_skip(&msg, &reason);
                    // Unmatched mail stays out of the ledger so a rule
                    // written later can still claim it on the next run.
                    if !matches!(
                        reason,
                        SkipReason::AlreadyProcessed
                            | SkipReason::Quarantined { .. }
                            | SkipReason::UnknownSourceSkipped { .. }
                    ) {
                        self.commit(&msg, reason.label(), 0).await;
                    }
                }
            }
        }

        let results = writer.flush().await;
        report.record_row_results(&results);
        for result in &results {
            if result.status != RowStatus::Appended {
                continue;
            }
            if let Some((msg, _)) = extracted.get(result.row_index) {
                self.commit(msg, "extracted", 1).await;
            }
        }

        report.finish();
        Ok(report)
    }

    async fn commit(&self, msg: &Message, outcome: &str, rows: i64) {
        let entry = ProcessedMessage {
            message_id: msg.id.clone(),
            received_at: msg.received_at,
            folder: msg.source_folder.clone(),
            subject: msg.subject.clone(),
            sender: msg.sender_email.clone(),
            run_id: self.ctx.run_id.clone(),
            outcome: outcome.to_string(),
            rows_appended: rows,
        };
        if let Err(e) = self.ctx.ledger.mark_processed(&entry).await {
            warn!(id = %msg.id, error = %e, "ledger commit failed");
        }
    }
}
