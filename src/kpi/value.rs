//! Numeric value parsing for KPI cells and body-text matches.
//!
//! Handles `$` signs, thousands separators, parentheses negatives, and
//! k/m/b magnitude suffixes. Returns `None` for placeholder strings.

use super::labels::KpiField;

/// Parse a monetary or plain numeric string.
///
/// `"(1,234.50)"` → `-1234.5`, `"$1.2m"` → `1_200_000.0`, `"N/A"` → `None`.
pub fn parse_money(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.to_lowercase().as_str() {
        "-" | "n/a" | "na" | "none" => return None,
        _ => {}
    }

    let mut cleaned: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | ' '))
        .collect();

    // Parentheses mean a negative value in financial layouts.
    if cleaned.starts_with('(') && cleaned.ends_with(')') {
        cleaned = format!("-{}", &cleaned[1..cleaned.len() - 1]);
    }

    let lower = cleaned.to_lowercase();
    let (num_part, multiplier) = if let Some(stripped) = lower.strip_suffix('k') {
        (stripped.to_string(), 1_000.0)
    } else if let Some(stripped) = lower.strip_suffix('m') {
        (stripped.to_string(), 1_000_000.0)
    } else if let Some(stripped) = lower.strip_suffix('b') {
        (stripped.to_string(), 1_000_000_000.0)
    } else {
        (lower, 1.0)
    };

    num_part.parse::<f64>().ok().map(|v| v * multiplier)
}

/// Parse a percentage string into a `0.0..=1.0` ratio (`"92%"` → `0.92`).
pub fn parse_percent(raw: &str) -> Option<f64> {
    let cleaned = raw.replace('%', "");
    cleaned.trim().parse::<f64>().ok().map(|v| v / 100.0)
}

/// Parse a raw string into the appropriate numeric type for `field`.
///
/// Occupancy accepts either a percentage (with `%`) or a bare number which,
/// when in `(0, 100]`, is assumed to be a percentage and scaled down.
pub fn parse_field_value(raw: &str, field: KpiField) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match field {
        KpiField::Occupancy => {
            if raw.contains('%') {
                parse_percent(raw)
            } else {
                let v = parse_money(raw)?;
                if v > 0.0 && v <= 100.0 { Some(v / 100.0) } else { Some(v) }
            }
        }
        KpiField::ClosingsCount | KpiField::OrdersCount => {
            parse_money(raw).map(|v| v.trunc())
        }
        _ => parse_money(raw),
    }
}
