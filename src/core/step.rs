use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::BatchError;

use super::{
    build_name,
    item::{ItemProcessor, ItemReader, ItemWriter},
};

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkStatus {
    /// The chunk holds `chunk_size` items and the reader may have more.
    Full,
    /// The reader is exhausted; the chunk may be partial or empty.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Starting,
    Success,
    ReadError,
    ProcessorError,
    WriteError,
    /// The writer could not be opened (or closed) for the step.
    WriterLifecycleError,
    TaskletError,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RepeatStatus {
    /// The tasklet wants to be called again.
    Continuable,
    /// The tasklet has finished executing.
    Finished,
}

/// Execution details of one step run.
#[derive(Debug, Clone)]
pub struct StepExecution {
    /// Unique identifier for this step execution
    pub id: Uuid,
    /// Human-readable name for the step
    pub name: String,
    /// Current status of the step execution
    pub status: StepStatus,
    pub start_time: Instant,
    pub end_time: Instant,
    pub duration: Duration,
    /// Number of items successfully read
    pub read_count: usize,
    /// Number of items successfully written
    pub write_count: usize,
    /// Number of errors encountered during reading
    pub read_error_count: usize,
    /// Number of errors encountered during processing
    pub process_error_count: usize,
    /// Number of errors encountered during writing
    pub write_error_count: usize,
}

impl StepExecution {
    pub fn new(name: &str) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: StepStatus::Starting,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
            read_count: 0,
            write_count: 0,
            read_error_count: 0,
            process_error_count: 0,
            write_error_count: 0,
        }
    }

    fn finish(&mut self, start_time: Instant) {
        self.start_time = start_time;
        self.end_time = Instant::now();
        self.duration = start_time.elapsed();
    }
}

pub trait Step {
    fn get_name(&self) -> &str;

    /// Executes the step, recording counts and status into `step_execution`.
    ///
    /// # Returns
    /// - `Ok(())`: The step completed successfully
    /// - `Err(BatchError)`: The step failed
    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError>;
}

pub trait Tasklet {
    fn execute(&self, step_execution: &StepExecution) -> Result<RepeatStatus, BatchError>;
}

/// A step wrapping a single [`Tasklet`], called until it reports `Finished`.
pub struct TaskletStep<'a> {
    name: String,
    tasklet: &'a dyn Tasklet,
}

impl Step for TaskletStep<'_> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let start_time = Instant::now();
        info!("Start of step: {}, id: {}", self.name, step_execution.id);

        let result = loop {
            match self.tasklet.execute(step_execution) {
                Ok(RepeatStatus::Continuable) => continue,
                Ok(RepeatStatus::Finished) => break Ok(()),
                Err(error) => break Err(error),
            }
        };

        step_execution.finish(start_time);

        match result {
            Ok(()) => {
                step_execution.status = StepStatus::Success;
                info!("End of step: {}, id: {}", self.name, step_execution.id);
                Ok(())
            }
            Err(error) => {
                step_execution.status = StepStatus::TaskletError;
                error!("Step {} failed: {}", self.name, error);
                Err(error)
            }
        }
    }
}

/// Reads, processes and writes items one chunk at a time.
///
/// Each chunk is handed to the writer as a unit, so a writer that commits per
/// `write` call commits once per chunk.
pub struct ChunkOrientedStep<'a, I, O> {
    name: String,
    reader: &'a dyn ItemReader<I>,
    processor: &'a dyn ItemProcessor<I, O>,
    writer: &'a dyn ItemWriter<O>,
    chunk_size: usize,
    /// Maximum number of errors tolerated before failing the step
    skip_limit: usize,
}

impl<I, O> Step for ChunkOrientedStep<'_, I, O> {
    fn get_name(&self) -> &str {
        &self.name
    }

    fn execute(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        let start_time = Instant::now();
        step_execution.status = StepStatus::Starting;

        info!("Start of step: {}, id: {}", self.name, step_execution.id);

        let result = self.run_chunks(step_execution);

        step_execution.finish(start_time);

        match result {
            Ok(()) => {
                step_execution.status = StepStatus::Success;
                info!(
                    "End of step: {}, id: {}, read: {}, written: {}",
                    self.name, step_execution.id, step_execution.read_count, step_execution.write_count
                );
                Ok(())
            }
            Err(error) => {
                error!("Step {} failed: {}", self.name, error);
                Err(error)
            }
        }
    }
}

impl<I, O> ChunkOrientedStep<'_, I, O> {
    fn run_chunks(&self, step_execution: &mut StepExecution) -> Result<(), BatchError> {
        if let Err(error) = self.writer.open() {
            step_execution.status = StepStatus::WriterLifecycleError;
            return Err(error);
        }

        loop {
            let (read_items, chunk_status) = self.read_chunk(step_execution)?;
            let processed_items = self.process_chunk(step_execution, &read_items)?;
            self.write_chunk(step_execution, &processed_items)?;

            if chunk_status == ChunkStatus::Finished {
                break;
            }
        }

        if let Err(error) = self.writer.close() {
            step_execution.status = StepStatus::WriterLifecycleError;
            return Err(error);
        }

        Ok(())
    }

    /// Reads up to `chunk_size` items.
    ///
    /// # Returns
    /// - `Ok((items, ChunkStatus::Full))`: the chunk is full
    /// - `Ok((items, ChunkStatus::Finished))`: the reader is exhausted
    /// - `Err(BatchError)`: a read error exceeded the skip limit
    fn read_chunk(
        &self,
        step_execution: &mut StepExecution,
    ) -> Result<(Vec<I>, ChunkStatus), BatchError> {
        debug!("Start reading chunk");

        let mut read_items = Vec::with_capacity(self.chunk_size);

        loop {
            match self.reader.read() {
                Ok(Some(item)) => {
                    read_items.push(item);
                    step_execution.read_count += 1;

                    if read_items.len() >= self.chunk_size {
                        return Ok((read_items, ChunkStatus::Full));
                    }
                }
                Ok(None) => return Ok((read_items, ChunkStatus::Finished)),
                Err(error) => {
                    warn!("Error reading item: {}", error);
                    step_execution.read_error_count += 1;

                    if self.is_skip_limit_reached(step_execution) {
                        step_execution.status = StepStatus::ReadError;
                        return Err(error);
                    }
                }
            }
        }
    }

    fn process_chunk(
        &self,
        step_execution: &mut StepExecution,
        read_items: &[I],
    ) -> Result<Vec<O>, BatchError> {
        debug!("Processing chunk of {} items", read_items.len());
        let mut result = Vec::with_capacity(read_items.len());

        for item in read_items {
            match self.processor.process(item) {
                Ok(processed_item) => result.push(processed_item),
                Err(error) => {
                    warn!("Error processing item: {}", error);
                    step_execution.process_error_count += 1;

                    if self.is_skip_limit_reached(step_execution) {
                        step_execution.status = StepStatus::ProcessorError;
                        return Err(error);
                    }
                }
            }
        }

        Ok(result)
    }

    fn write_chunk(
        &self,
        step_execution: &mut StepExecution,
        processed_items: &[O],
    ) -> Result<(), BatchError> {
        if processed_items.is_empty() {
            debug!("No items to write, skipping write call");
            return Ok(());
        }

        debug!("Writing chunk of {} items", processed_items.len());

        match self.writer.write(processed_items).and_then(|_| self.writer.flush()) {
            Ok(()) => {
                step_execution.write_count += processed_items.len();
                Ok(())
            }
            Err(error) => {
                warn!("Error writing items: {}", error);
                step_execution.write_error_count += processed_items.len();

                if self.is_skip_limit_reached(step_execution) {
                    step_execution.status = StepStatus::WriteError;
                    return Err(error);
                }
                Ok(())
            }
        }
    }

    fn is_skip_limit_reached(&self, step_execution: &StepExecution) -> bool {
        step_execution.read_error_count
            + step_execution.write_error_count
            + step_execution.process_error_count
            > self.skip_limit
    }
}

pub struct ChunkOrientedStepBuilder<'a, I, O> {
    name: String,
    reader: Option<&'a dyn ItemReader<I>>,
    processor: Option<&'a dyn ItemProcessor<I, O>>,
    writer: Option<&'a dyn ItemWriter<O>>,
    chunk_size: usize,
    skip_limit: usize,
}

impl<'a, I, O> ChunkOrientedStepBuilder<'a, I, O> {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            reader: None,
            processor: None,
            writer: None,
            chunk_size: 10,
            skip_limit: 0,
        }
    }

    pub fn reader(mut self, reader: &'a dyn ItemReader<I>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn processor(mut self, processor: &'a dyn ItemProcessor<I, O>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn writer(mut self, writer: &'a dyn ItemWriter<O>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn skip_limit(mut self, skip_limit: usize) -> Self {
        self.skip_limit = skip_limit;
        self
    }

    pub fn build(self) -> Result<ChunkOrientedStep<'a, I, O>, BatchError> {
        let missing = |part: &str| {
            BatchError::Configuration(format!("{} is required for building step {}", part, self.name))
        };

        if self.chunk_size == 0 {
            return Err(BatchError::Configuration(format!(
                "Chunk size of step {} must be positive",
                self.name
            )));
        }

        Ok(ChunkOrientedStep {
            reader: self.reader.ok_or_else(|| missing("Reader"))?,
            processor: self.processor.ok_or_else(|| missing("Processor"))?,
            writer: self.writer.ok_or_else(|| missing("Writer"))?,
            chunk_size: self.chunk_size,
            skip_limit: self.skip_limit,
            name: self.name,
        })
    }
}

pub struct TaskletBuilder<'a> {
    name: String,
    tasklet: Option<&'a dyn Tasklet>,
}

impl<'a> TaskletBuilder<'a> {
    fn new(name: String) -> Self {
        Self {
            name,
            tasklet: None,
        }
    }

    pub fn tasklet(mut self, tasklet: &'a dyn Tasklet) -> Self {
        self.tasklet = Some(tasklet);
        self
    }

    pub fn build(self) -> Result<TaskletStep<'a>, BatchError> {
        let tasklet = self.tasklet.ok_or_else(|| {
            BatchError::Configuration(format!("Tasklet is required for building step {}", self.name))
        })?;

        Ok(TaskletStep {
            name: self.name,
            tasklet,
        })
    }
}

/// Entry point for building steps.
///
/// ```ignore
/// let step = StepBuilder::new("load")
///     .chunk(1000)
///     .reader(&reader)
///     .processor(&processor)
///     .writer(&writer)
///     .build()?;
/// ```
pub struct StepBuilder {
    name: String,
}

impl StepBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Step with a random name.
    pub fn unnamed() -> Self {
        Self { name: build_name() }
    }

    pub fn tasklet<'a>(self, tasklet: &'a dyn Tasklet) -> TaskletBuilder<'a> {
        TaskletBuilder::new(self.name).tasklet(tasklet)
    }

    pub fn chunk<'a, I, O>(self, chunk_size: usize) -> ChunkOrientedStepBuilder<'a, I, O> {
        ChunkOrientedStepBuilder::new(&self.name).chunk_size(chunk_size)
    }
}
