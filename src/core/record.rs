//! Records, column lists and the values they carry.
//!
//! A [`Record`] is an ordered tuple of [`Value`]s aligned with a [`Columns`] list.
//! Records are never mutated once extracted: every transformation builds a new one.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};

use crate::BatchError;

/// A single column value, as extracted from a source.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns `true` for text that is empty or only whitespace.
    pub fn is_blank_text(&self) -> bool {
        match self {
            Value::Text(text) => text.trim().is_empty(),
            _ => false,
        }
    }

    /// Text form used both for parameter binding and for exports.
    ///
    /// `None` stands for SQL `NULL`.
    pub fn to_sql_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(value) => Some(value.to_string()),
            Value::Int(value) => Some(value.to_string()),
            Value::Float(value) => Some(value.to_string()),
            Value::Text(value) => Some(value.clone()),
            Value::Date(value) => Some(value.format("%Y-%m-%d").to_string()),
            Value::Timestamp(value) => Some(value.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            Value::Json(value) => Some(value.to_string()),
        }
    }

    /// Converts a JSON scalar into a value; arrays and objects are kept as JSON.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(value) => Value::Bool(*value),
            serde_json::Value::Number(number) => match number.as_i64() {
                Some(value) => Value::Int(value),
                None => number.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            serde_json::Value::String(value) => Value::Text(value.clone()),
            other => Value::Json(other.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_sql_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NULL"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

/// An ordered tuple of values.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    values: Vec<Value>,
}

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Builds a new record with `value` as an extra trailing field.
    pub fn with_appended(&self, value: Value) -> Record {
        let mut values = Vec::with_capacity(self.values.len() + 1);
        values.extend(self.values.iter().cloned());
        values.push(value);
        Record { values }
    }

    /// Builds a new record by applying `f` to every field.
    pub fn map_values<F>(&self, f: F) -> Record
    where
        F: Fn(&Value) -> Value,
    {
        Record {
            values: self.values.iter().map(f).collect(),
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Record::new(values)
    }
}

/// Ordered list of column names, in source projection order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Columns {
    names: Vec<String>,
}

impl Columns {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn first(&self) -> Option<&str> {
        self.names.first().map(String::as_str)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|column| column == name)
    }

    /// Column list with one more trailing name.
    pub fn with_trailing(&self, name: &str) -> Columns {
        let mut names = self.names.clone();
        names.push(name.to_string());
        Columns { names }
    }

    /// Comma separated list, ready for a column clause.
    pub fn join(&self) -> String {
        self.names.join(", ")
    }
}

/// Result of an extraction: a column list and the records aligned with it.
#[derive(Debug, Clone, Default)]
pub struct RecordSet {
    pub columns: Columns,
    pub records: Vec<Record>,
}

impl RecordSet {
    pub fn new(columns: Columns, records: Vec<Record>) -> Self {
        Self { columns, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Checks that every record has exactly one value per column.
    pub fn ensure_aligned(&self) -> Result<(), BatchError> {
        match self
            .records
            .iter()
            .position(|record| record.len() != self.columns.len())
        {
            Some(index) => Err(BatchError::ItemReader(format!(
                "record {} has {} values but the column list has {}",
                index,
                self.records[index].len(),
                self.columns.len()
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appending_builds_a_new_record() {
        let record = Record::new(vec![Value::from("a"), Value::Int(1)]);
        let date = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();

        let extended = record.with_appended(Value::Date(date));

        assert_eq!(record.len(), 2);
        assert_eq!(extended.len(), 3);
        assert_eq!(extended.get(2), Some(&Value::Date(date)));
    }

    #[test]
    fn sql_text_renders_null_as_none() {
        assert_eq!(Value::Null.to_sql_text(), None);
        assert_eq!(Value::Bool(true).to_sql_text(), Some("true".to_string()));
        assert_eq!(
            Value::Date(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()).to_sql_text(),
            Some("2025-01-02".to_string())
        );
    }

    #[test]
    fn json_numbers_keep_integer_precision() {
        let json: serde_json::Value = serde_json::json!({"a": 12, "b": 1.5, "c": {"x": 1}});

        assert_eq!(Value::from_json(&json["a"]), Value::Int(12));
        assert_eq!(Value::from_json(&json["b"]), Value::Float(1.5));
        assert!(matches!(Value::from_json(&json["c"]), Value::Json(_)));
        assert_eq!(Value::from_json(&json["missing"]), Value::Null);
    }

    #[test]
    fn misaligned_record_is_reported() {
        let set = RecordSet::new(
            Columns::new(["a", "b"]),
            vec![
                Record::new(vec![Value::Int(1), Value::Int(2)]),
                Record::new(vec![Value::Int(3)]),
            ],
        );

        let error = set.ensure_aligned().unwrap_err();
        assert!(error.to_string().contains("record 1"));
    }

    #[test]
    fn trailing_column_is_appended() {
        let columns = Columns::new(["id", "name"]).with_trailing("fecha_corte");

        assert_eq!(columns.join(), "id, name, fecha_corte");
        assert_eq!(columns.position("fecha_corte"), Some(2));
    }
}
