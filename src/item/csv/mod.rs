/// CSV support for writing records.
///
/// The writer follows the export convention of the warehouse: configurable
/// delimiter, every field quoted, `\n` line endings, a header row built from the
/// column list, and `NULL` written as an empty field.
///
/// # Examples
///
/// ```
/// use warehouse_batch::core::item::ItemWriter;
/// use warehouse_batch::core::record::{Columns, Record, Value};
/// use warehouse_batch::item::csv::csv_writer::CsvRecordWriterBuilder;
///
/// let writer = CsvRecordWriterBuilder::new()
///     .delimiter(b';')
///     .headers(Columns::new(["name", "code"]))
///     .from_writer(vec![]);
///
/// writer.open().unwrap();
/// writer
///     .write(&[Record::new(vec![Value::from("A"), Value::Null])])
///     .unwrap();
///
/// let data = String::from_utf8(writer.into_inner().unwrap()).unwrap();
/// assert_eq!(data, "\"name\";\"code\"\n\"A\";\"\"\n");
/// ```
pub mod csv_writer;
