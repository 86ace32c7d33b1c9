use crate::{core::record::RecordSet, BatchError};

/// Per-record cleaning: blank normalization, cut-off date, deduplication.
pub mod cleaner;

/// Reader over items already held in memory.
pub mod memory;

/// CSV writer for records.
pub mod csv;

/// Source database extraction and PostgreSQL loading.
pub mod rdbc;

/// Month-partitioned extraction from the CRM REST API.
pub mod api;

/// A source that yields a whole [`RecordSet`] in one call.
///
/// Extraction runs to completion before anything touches the destination, so an
/// empty or failed extraction leaves the destination table as it was.
pub trait RecordExtractor {
    fn extract(&self) -> Result<RecordSet, BatchError>;
}
