//! Label synonyms — deterministic mapping from label text to canonical KPI field.
//!
//! Used by both body-text parsing and attachment cell scanning.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

/// Canonical KPI fields, in sheet column order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KpiField {
    Revenue,
    Cash,
    PipelineValue,
    ClosingsCount,
    OrdersCount,
    Occupancy,
}

impl KpiField {
    pub const ALL: [KpiField; 6] = [
        KpiField::Revenue,
        KpiField::Cash,
        KpiField::PipelineValue,
        KpiField::ClosingsCount,
        KpiField::OrdersCount,
        KpiField::Occupancy,
    ];

    /// Snake-case key, matching rule configuration and the sheet schema.
    pub fn key(&self) -> &'static str {
        match self {
            KpiField::Revenue => "revenue",
            KpiField::Cash => "cash",
            KpiField::PipelineValue => "pipeline_value",
            KpiField::ClosingsCount => "closings_count",
            KpiField::OrdersCount => "orders_count",
            KpiField::Occupancy => "occupancy",
        }
    }

    /// Parse a configuration key back into a field.
    pub fn from_key(key: &str) -> Option<KpiField> {
        Self::ALL.iter().copied().find(|f| f.key() == key)
    }

    /// Count fields hold integers; everything else is monetary or a ratio.
    pub fn is_count(&self) -> bool {
        matches!(self, KpiField::ClosingsCount | KpiField::OrdersCount)
    }
}

/// Lowercase label synonyms per canonical field.
static SYNONYMS: LazyLock<Vec<(KpiField, Vec<&'static str>)>> = LazyLock::new(|| {
    vec![
        (
            KpiField::Revenue,
            vec![
                "revenue", "rev", "sales", "income", "gross revenue", "gross sales",
                "total revenue", "net revenue", "total sales",
            ],
        ),
        (
            KpiField::Cash,
            vec![
                "cash", "cash balance", "bank balance", "cash on hand", "available cash",
                "total cash", "checking", "savings", "ending balance", "current balance",
                "ending cash",
            ],
        ),
        (
            KpiField::PipelineValue,
            vec![
                "pipeline", "pipeline value", "pipeline $", "pipeline total", "in contract",
                "contracts in pipeline", "pending pipeline", "active pipeline",
                "pipeline balance",
            ],
        ),
        (
            KpiField::ClosingsCount,
            vec![
                "closings", "closed", "funded", "settled", "files closed", "closings count",
                "closed count", "units closed", "transactions closed", "closings today",
            ],
        ),
        (
            KpiField::OrdersCount,
            vec![
                "orders", "order count", "new orders", "open orders", "orders count",
                "total orders", "files opened", "new files", "order volume",
            ],
        ),
        (
            KpiField::Occupancy,
            vec![
                "occupancy", "occ", "occupied", "% occupied", "occupancy rate", "census",
                "bed occupancy", "unit occupancy", "occupancy %", "census count",
            ],
        ),
    ]
});

/// Flat reverse map sorted by synonym length descending, so that substring
/// matching always prefers the longest synonym ("occupancy rate" before "occ").
static REVERSE: LazyLock<Vec<(&'static str, KpiField)>> = LazyLock::new(|| {
    let mut flat: Vec<(&'static str, KpiField)> = SYNONYMS
        .iter()
        .flat_map(|(field, syns)| syns.iter().map(|s| (*s, *field)))
        .collect();
    flat.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    flat
});

/// Synonyms for one field (used to build body-regex alternations).
pub fn synonyms_for(field: KpiField) -> &'static [&'static str] {
    SYNONYMS
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, syns)| syns.as_slice())
        .unwrap_or(&[])
}

/// Return the canonical KPI field if `text` matches a known synonym.
///
/// Matching is case-insensitive and strips surrounding whitespace and a
/// trailing colon. Exact match first, then longest-synonym substring match.
pub fn match_label(text: &str) -> Option<KpiField> {
    let normalized = text.trim().to_lowercase();
    let normalized = normalized.trim_end_matches(':').trim();
    if normalized.is_empty() {
        return None;
    }
    if let Some((_, field)) = REVERSE.iter().find(|(syn, _)| *syn == normalized) {
        return Some(*field);
    }
    REVERSE
        .iter()
        .find(|(syn, _)| normalized.contains(syn))
        .map(|(_, field)| *field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_label_matches() {
        assert_eq!(match_label("Revenue"), Some(KpiField::Revenue));
        assert_eq!(match_label("cash balance"), Some(KpiField::Cash));
        assert_eq!(match_label("Census"), Some(KpiField::Occupancy));
    }

    #[test]
    fn trailing_colon_stripped() {
        assert_eq!(match_label("Revenue:"), Some(KpiField::Revenue));
        assert_eq!(match_label("  Pipeline : "), Some(KpiField::PipelineValue));
        assert_eq!(match_label("pipeline:"), Some(KpiField::PipelineValue));
    }

    #[test]
    fn substring_prefers_longest_synonym() {
        // "occupancy rate" contains both "occ" and "occupancy rate";
        // the longest synonym must win so the field is still occupancy.
        assert_eq!(match_label("Unit Occupancy Rate"), Some(KpiField::Occupancy));
        // "total cash on hand" should map to cash, not revenue via "total".
        assert_eq!(match_label("total cash on hand"), Some(KpiField::Cash));
    }

    #[test]
    fn unknown_label_is_none() {
        assert_eq!(match_label("EBITDA"), None);
        assert_eq!(match_label(""), None);
        assert_eq!(match_label("   "), None);
    }

    #[test]
    fn field_key_round_trip() {
        for field in KpiField::ALL {
            assert_eq!(KpiField::from_key(field.key()), Some(field));
        }
        assert_eq!(KpiField::from_key("ebitda"), None);
    }

    #[test]
    fn count_fields_flagged() {
        assert!(KpiField::ClosingsCount.is_count());
        assert!(KpiField::OrdersCount.is_count());
        assert!(!KpiField::Revenue.is_count());
        assert!(!KpiField::Occupancy.is_count());
    }
}
