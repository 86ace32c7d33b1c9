use std::{
    cell::{Cell, RefCell},
    fs::File,
    io::{self, Write},
    path::Path,
    result,
};

use csv::{QuoteStyle, Terminator, Writer, WriterBuilder};

use crate::{
    core::{
        item::{ItemWriter, ItemWriterResult},
        record::{Columns, Record},
    },
    BatchError,
};

/// Writes records as delimited text, one line per record.
pub struct CsvRecordWriter<T: Write> {
    wrapper: RefCell<Writer<T>>,
    headers: Option<Columns>,
    rows: Cell<usize>,
}

impl<T: Write> ItemWriter<Record> for CsvRecordWriter<T> {
    fn write(&self, items: &[Record]) -> ItemWriterResult {
        let mut writer = self.wrapper.borrow_mut();

        for item in items {
            let fields = item
                .values()
                .iter()
                .map(|value| value.to_sql_text().unwrap_or_default());

            writer
                .write_record(fields)
                .map_err(|error| BatchError::ItemWriter(error.to_string()))?;
        }

        self.rows.set(self.rows.get() + items.len());
        Ok(())
    }

    fn flush(&self) -> ItemWriterResult {
        self.wrapper
            .borrow_mut()
            .flush()
            .map_err(|error| BatchError::ItemWriter(error.to_string()))
    }

    /// Writes the header row, if any.
    fn open(&self) -> ItemWriterResult {
        if let Some(headers) = &self.headers {
            self.wrapper
                .borrow_mut()
                .write_record(headers.names())
                .map_err(|error| BatchError::ItemWriter(error.to_string()))?;
        }
        Ok(())
    }

    fn close(&self) -> ItemWriterResult {
        self.flush()
    }
}

impl<T: Write> CsvRecordWriter<T> {
    /// Data rows written so far, header excluded.
    pub fn rows(&self) -> usize {
        self.rows.get()
    }

    pub fn into_inner(self) -> result::Result<T, BatchError> {
        self.wrapper
            .into_inner()
            .into_inner()
            .map_err(|error| BatchError::ItemWriter(error.to_string()))
    }
}

pub struct CsvRecordWriterBuilder {
    delimiter: u8,
    headers: Option<Columns>,
}

impl Default for CsvRecordWriterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CsvRecordWriterBuilder {
    pub fn new() -> CsvRecordWriterBuilder {
        CsvRecordWriterBuilder {
            delimiter: b',',
            headers: None,
        }
    }

    pub fn delimiter(mut self, delimiter: u8) -> CsvRecordWriterBuilder {
        self.delimiter = delimiter;
        self
    }

    pub fn headers(mut self, headers: Columns) -> CsvRecordWriterBuilder {
        self.headers = Some(headers);
        self
    }

    fn writer_builder(&self) -> WriterBuilder {
        let mut builder = WriterBuilder::new();
        builder
            .delimiter(self.delimiter)
            .quote_style(QuoteStyle::Always)
            .terminator(Terminator::Any(b'\n'))
            .has_headers(false)
            .flexible(false);
        builder
    }

    pub fn from_path<R: AsRef<Path>>(self, path: R) -> result::Result<CsvRecordWriter<File>, BatchError> {
        let wtr = self
            .writer_builder()
            .from_path(path)
            .map_err(|error| BatchError::ItemWriter(error.to_string()))?;

        Ok(CsvRecordWriter {
            wrapper: RefCell::new(wtr),
            headers: self.headers,
            rows: Cell::new(0),
        })
    }

    pub fn from_writer<W: io::Write>(self, wtr: W) -> CsvRecordWriter<W> {
        let wtr = self.writer_builder().from_writer(wtr);

        CsvRecordWriter {
            wrapper: RefCell::new(wtr),
            headers: self.headers,
            rows: Cell::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;
    use crate::core::record::Value;

    #[test]
    fn every_field_is_quoted_and_null_is_empty() -> Result<(), Box<dyn Error>> {
        let wtr = CsvRecordWriterBuilder::new()
            .delimiter(b';')
            .headers(Columns::new(["city", "note"]))
            .from_writer(vec![]);

        wtr.open()?;
        wtr.write(&[
            Record::new(vec![Value::from("Boston"), Value::from("a;b")]),
            Record::new(vec![Value::from("Say \"hi\""), Value::Null]),
        ])?;
        wtr.close()?;

        assert_eq!(wtr.rows(), 2);

        let data = String::from_utf8(wtr.into_inner()?)?;
        assert_eq!(
            data,
            "\"city\";\"note\"\n\"Boston\";\"a;b\"\n\"Say \"\"hi\"\"\";\"\"\n"
        );

        Ok(())
    }

    #[test]
    fn records_without_headers() -> Result<(), Box<dyn Error>> {
        let wtr = CsvRecordWriterBuilder::new().from_writer(vec![]);

        wtr.open()?;
        wtr.write(&[Record::new(vec![Value::Int(1), Value::Bool(false)])])?;

        let data = String::from_utf8(wtr.into_inner()?)?;
        assert_eq!(data, "\"1\",\"false\"\n");

        Ok(())
    }

    #[test]
    fn record_length_change_is_an_error() -> Result<(), Box<dyn Error>> {
        let wtr = CsvRecordWriterBuilder::new().from_writer(vec![]);

        wtr.write(&[Record::new(vec![Value::Int(1), Value::Int(2)])])?;
        let result = wtr.write(&[Record::new(vec![Value::Int(1)])]);

        assert!(result.is_err());
        Ok(())
    }
}
