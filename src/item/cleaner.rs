//! Per-record cleaning applied between extraction and loading.
//!
//! Every processor builds a new [`Record`]; nothing is modified in place.

use std::collections::HashMap;

use chrono::NaiveDate;
use log::debug;

use crate::core::{
    item::{ItemProcessor, ItemProcessorResult},
    record::{Columns, Record, Value},
};

/// Replaces empty or whitespace-only text fields with `Null`.
///
/// Non-text fields pass through untouched; the column a field belongs to plays no role.
#[derive(Default)]
pub struct BlankToNullProcessor {}

impl BlankToNullProcessor {
    pub fn clean(&self, record: &Record) -> Record {
        record.map_values(|value| {
            if value.is_blank_text() {
                Value::Null
            } else {
                value.clone()
            }
        })
    }
}

impl ItemProcessor<Record, Record> for BlankToNullProcessor {
    fn process(&self, item: &Record) -> ItemProcessorResult<Record> {
        Ok(self.clean(item))
    }
}

/// Appends the run's cut-off date as a trailing field.
pub struct CutOffDateProcessor {
    cut_off: NaiveDate,
    column: String,
}

impl CutOffDateProcessor {
    pub fn new(cut_off: NaiveDate, column: &str) -> Self {
        Self {
            cut_off,
            column: column.to_string(),
        }
    }

    /// Column list matching the records this processor produces.
    pub fn columns(&self, columns: &Columns) -> Columns {
        columns.with_trailing(&self.column)
    }

    pub fn stamp(&self, record: &Record) -> Record {
        record.with_appended(Value::Date(self.cut_off))
    }
}

impl ItemProcessor<Record, Record> for CutOffDateProcessor {
    fn process(&self, item: &Record) -> ItemProcessorResult<Record> {
        Ok(self.stamp(item))
    }
}

/// The cleaning a job asked for: blank normalization first, then the cut-off stamp.
#[derive(Default)]
pub struct CleaningProcessor {
    blank_to_null: Option<BlankToNullProcessor>,
    cut_off: Option<CutOffDateProcessor>,
}

impl CleaningProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blank_to_null(mut self, enabled: bool) -> Self {
        self.blank_to_null = enabled.then(BlankToNullProcessor::default);
        self
    }

    pub fn cut_off(mut self, cut_off: NaiveDate, column: &str) -> Self {
        self.cut_off = Some(CutOffDateProcessor::new(cut_off, column));
        self
    }

    /// Destination column list for the given source columns.
    pub fn columns(&self, columns: &Columns) -> Columns {
        match &self.cut_off {
            Some(cut_off) => cut_off.columns(columns),
            None => columns.clone(),
        }
    }
}

impl ItemProcessor<Record, Record> for CleaningProcessor {
    fn process(&self, item: &Record) -> ItemProcessorResult<Record> {
        let cleaned = match &self.blank_to_null {
            Some(blank_to_null) => blank_to_null.clean(item),
            None => item.clone(),
        };

        Ok(match &self.cut_off {
            Some(cut_off) => cut_off.stamp(&cleaned),
            None => cleaned,
        })
    }
}

/// Keeps one record per key value, the last one seen.
///
/// Records whose key is null or blank are dropped. The output follows the order
/// in which keys were first seen; callers must not rely on that order.
pub fn deduplicate_by_key(records: Vec<Record>, key_index: usize) -> Vec<Record> {
    let input_len = records.len();
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(input_len);
    let mut unique: Vec<Record> = Vec::with_capacity(input_len);

    for record in records {
        let key = match record.get(key_index).and_then(Value::to_sql_text) {
            Some(key) if !key.trim().is_empty() => key,
            _ => continue,
        };

        match positions.get(&key) {
            Some(&position) => unique[position] = record,
            None => {
                positions.insert(key, unique.len());
                unique.push(record);
            }
        }
    }

    debug!("Deduplicated {} records into {}", input_len, unique.len());

    unique
}
