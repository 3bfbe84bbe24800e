//! Message-level pipeline stages, in processing order: attachment gate,
//! candidate filter, source matching, suitability tiering, extraction.

pub mod candidates;
pub mod extractor;
pub mod gate;
pub mod matcher;
pub mod processor;
pub mod suitability;
pub mod types;

pub use processor::{Pipeline, process_message};
pub use types::{KpiRecord, Message, SkipReason, SourceType};
