/*!
 # Warehouse Batch

 Full-refresh batch jobs feeding a PostgreSQL warehouse. Every job is a finite,
 one-shot run started by a scheduler: it extracts a dataset from one source
 system, truncates the destination table, reloads it in batches and checks the
 resulting row count. One job also exports the loaded table as a delimited file
 and uploads it to a remote server.

 ## Core Concepts

- **Job:** the whole run, a sequence of steps. Mandatory steps fail the job,
  optional ones (export, upload) only log their failure.
- **Step:** either chunk-oriented (reader, processor, writer) or a single
  [`Tasklet`](core::step::Tasklet).
- **ItemReader:** hands out one record at a time. Extraction happens up front,
  so the load step reads from memory.
- **ItemProcessor:** cleans a record: blank text to `NULL`, cut-off date stamp.
- **ItemWriter:** receives one chunk at a time. The PostgreSQL writer truncates
  on `open`, commits each chunk in its own transaction and counts rows on `close`.

 ## Sources

| **Source** | **Extractor**                                                  |
|------------|----------------------------------------------------------------|
| SQL        | [`SqlSourceReader`](item::rdbc::source_reader::SqlSourceReader), streamed in fixed-size chunks |
| CRM API    | [`CrmRequestExtractor`](item::api::requests::CrmRequestExtractor), one month at a time with retries |

 ## Getting Started

 Jobs are run from the `warehouse-batch` binary, configured through the
 environment or a `.env` file:

```text
warehouse-batch student-benefits
warehouse-batch crm-requests
```

 The building blocks can also be assembled by hand:

```rust
# use warehouse_batch::{
#     core::{
#         item::{ItemWriter, ItemWriterResult},
#         job::{Job, JobBuilder},
#         record::{Record, Value},
#         step::StepBuilder,
#     },
#     item::{cleaner::BlankToNullProcessor, memory::InMemoryItemReader},
#     BatchError,
# };
# use std::cell::RefCell;
# #[derive(Default)]
# struct VecWriter {
#     records: RefCell<Vec<Record>>,
# }
# impl ItemWriter<Record> for VecWriter {
#     fn write(&self, items: &[Record]) -> ItemWriterResult {
#         self.records.borrow_mut().extend_from_slice(items);
#         Ok(())
#     }
# }
fn main() -> Result<(), BatchError> {
    let reader = InMemoryItemReader::new(vec![
        Record::new(vec![Value::from("1"), Value::from("  ")]),
        Record::new(vec![Value::from("2"), Value::from("x")]),
    ]);
    let processor = BlankToNullProcessor::default();
    let writer = VecWriter::default();

    let step = StepBuilder::new("load")
        .chunk::<Record, Record>(1000)
        .reader(&reader)
        .processor(&processor)
        .writer(&writer)
        .build()?;

    let job = JobBuilder::new().start(&step).build();
    let execution = job.run()?;

    assert!(execution.succeeded("load"));
    assert_eq!(writer.records.borrow()[0].get(1), Some(&Value::Null));

    Ok(())
}
```
 */

/// Core module for batch operations
pub mod core;

/// Error types for batch operations
pub mod error;

#[doc(inline)]
pub use error::*;

/// Run configuration read from the environment
pub mod config;

/// Record readers, processors and writers
pub mod item;

/// Wiring of the warehouse jobs
pub mod jobs;

/// Single-task steps: export, repair, upload
pub mod tasklet;
