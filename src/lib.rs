//! KPI scraper — extracts operating metrics from report emails into a sheet.

pub mod config;
pub mod context;
pub mod docs;
pub mod entity;
pub mod error;
pub mod kpi;
pub mod ledger;
pub mod llm;
pub mod mailstore;
pub mod pipeline;
pub mod report;
pub mod sender;
pub mod sheets;

pub use error::{Error, Result};
