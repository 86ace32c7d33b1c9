use crate::error::BatchError;

/// Result of a single read: `Ok(None)` once the reader is exhausted.
pub type ItemReaderResult<I> = Result<Option<I>, BatchError>;

pub type ItemProcessorResult<O> = Result<O, BatchError>;

pub type ItemWriterResult = Result<(), BatchError>;

pub trait ItemReader<I> {
    fn read(&self) -> ItemReaderResult<I>;
}

pub trait ItemProcessor<I, O> {
    fn process(&self, item: &I) -> ItemProcessorResult<O>;
}

/// Output side of a chunk-oriented step.
///
/// `open` is called once before the first chunk, `write` once per chunk and
/// `close` once after the last chunk has been written successfully.
pub trait ItemWriter<O> {
    fn write(&self, items: &[O]) -> ItemWriterResult;

    fn flush(&self) -> ItemWriterResult {
        Ok(())
    }

    fn open(&self) -> ItemWriterResult {
        Ok(())
    }

    fn close(&self) -> ItemWriterResult {
        Ok(())
    }
}

#[derive(Default)]
pub struct PassThroughProcessor {}

impl<I: Clone> ItemProcessor<I, I> for PassThroughProcessor {
    fn process(&self, item: &I) -> ItemProcessorResult<I> {
        Ok(item.clone())
    }
}
