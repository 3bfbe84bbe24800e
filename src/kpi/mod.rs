//! Canonical KPI fields, label synonyms, and numeric value parsing.

pub mod labels;
pub mod value;

pub use labels::{KpiField, match_label, synonyms_for};
pub use value::{parse_field_value, parse_money, parse_percent};

use serde::{Deserialize, Serialize};

/// The six canonical KPI values a record can carry.
///
/// Monetary fields and occupancy are `f64`; counts are integers.
/// Occupancy is stored as a ratio in `0.0..=1.0`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KpiValues {
    pub revenue: Option<f64>,
    pub cash: Option<f64>,
    pub pipeline_value: Option<f64>,
    pub closings_count: Option<i64>,
    pub orders_count: Option<i64>,
    pub occupancy: Option<f64>,
}

impl KpiValues {
    /// True if at least one field is populated.
    pub fn has_any(&self) -> bool {
        KpiField::ALL.iter().any(|f| self.get(*f).is_some())
    }

    /// Number of populated fields.
    pub fn populated_count(&self) -> usize {
        KpiField::ALL.iter().filter(|f| self.get(**f).is_some()).count()
    }

    /// Read a field as `f64` (counts are widened).
    pub fn get(&self, field: KpiField) -> Option<f64> {
        match field {
            KpiField::Revenue => self.revenue,
            KpiField::Cash => self.cash,
            KpiField::PipelineValue => self.pipeline_value,
            KpiField::ClosingsCount => self.closings_count.map(|v| v as f64),
            KpiField::OrdersCount => self.orders_count.map(|v| v as f64),
            KpiField::Occupancy => self.occupancy,
        }
    }

    /// Write a field from an `f64`, truncating for count fields.
    pub fn set(&mut self, field: KpiField, value: f64) {
        match field {
            KpiField::Revenue => self.revenue = Some(value),
            KpiField::Cash => self.cash = Some(value),
            KpiField::PipelineValue => self.pipeline_value = Some(value),
            KpiField::ClosingsCount => self.closings_count = Some(value as i64),
            KpiField::OrdersCount => self.orders_count = Some(value as i64),
            KpiField::Occupancy => self.occupancy = Some(value),
        }
    }
}
