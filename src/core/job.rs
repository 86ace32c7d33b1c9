use std::time::{Duration, Instant};

use log::{info, warn};
use uuid::Uuid;

use crate::BatchError;

use super::{
    build_name,
    step::{Step, StepExecution},
};

/// Type alias for job execution results.
type JobResult<T> = Result<T, BatchError>;

/// Represents a job that can be executed.
///
/// A job is a container for a sequence of steps executed in order. Steps added
/// as optional may fail without failing the job: their failure is logged and
/// the next step runs.
pub trait Job {
    /// Runs the job and returns the result of the job execution.
    ///
    /// # Returns
    /// - `Ok(JobExecution)` when every mandatory step succeeded
    /// - `Err(BatchError)` when a mandatory step failed
    fn run(&self) -> JobResult<JobExecution>;
}

/// Timing information and step executions of one job run.
#[derive(Debug)]
pub struct JobExecution {
    /// The time when the job started executing
    pub start: Instant,
    /// The time when the job finished executing
    pub end: Instant,
    /// The total duration of the job execution
    pub duration: Duration,
    /// Executions of every step that ran, in order
    pub step_executions: Vec<StepExecution>,
}

impl JobExecution {
    pub fn step(&self, name: &str) -> Option<&StepExecution> {
        self.step_executions.iter().find(|execution| execution.name == name)
    }

    /// Whether the named step ran and succeeded.
    pub fn succeeded(&self, name: &str) -> bool {
        self.step(name)
            .is_some_and(|execution| execution.status == super::step::StepStatus::Success)
    }
}

struct JobStep<'a> {
    step: &'a dyn Step,
    optional: bool,
}

/// A configured job, ready to run.
pub struct JobInstance<'a> {
    /// Unique identifier for this job instance
    id: Uuid,
    /// Human-readable name for the job
    name: String,
    /// Steps that make up this job, in execution order
    steps: Vec<JobStep<'a>>,
}

impl JobInstance<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Job for JobInstance<'_> {
    fn run(&self) -> JobResult<JobExecution> {
        let start = Instant::now();

        info!("Start of job: {}, id: {}", self.name, self.id);

        let mut step_executions = Vec::with_capacity(self.steps.len());

        for job_step in &self.steps {
            let mut step_execution = StepExecution::new(job_step.step.get_name());
            let result = job_step.step.execute(&mut step_execution);
            step_executions.push(step_execution);

            if let Err(error) = result {
                if job_step.optional {
                    warn!(
                        "Optional step {} failed, job {} continues: {}",
                        job_step.step.get_name(),
                        self.name,
                        error
                    );
                } else {
                    return Err(BatchError::Step(format!(
                        "{}: {}",
                        job_step.step.get_name(),
                        error
                    )));
                }
            }
        }

        info!("End of job: {}, id: {}", self.name, self.id);

        Ok(JobExecution {
            start,
            end: Instant::now(),
            duration: start.elapsed(),
            step_executions,
        })
    }
}

/// Builder for creating a job instance.
///
/// ```ignore
/// let job = JobBuilder::new()
///     .name("student-benefits".to_string())
///     .start(&load_step)
///     .next_optional(&export_step)
///     .next_optional(&upload_step)
///     .build();
/// ```
#[derive(Default)]
pub struct JobBuilder<'a> {
    /// Optional name for the job (generated randomly if not specified)
    name: Option<String>,
    steps: Vec<JobStep<'a>>,
}

impl<'a> JobBuilder<'a> {
    pub fn new() -> Self {
        Self {
            name: None,
            steps: Vec::new(),
        }
    }

    pub fn name(mut self, name: String) -> JobBuilder<'a> {
        self.name = Some(name);
        self
    }

    /// Sets the first step of the job.
    pub fn start(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(JobStep {
            step,
            optional: false,
        });
        self
    }

    /// Adds a step whose failure fails the job.
    pub fn next(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(JobStep {
            step,
            optional: false,
        });
        self
    }

    /// Adds a step whose failure is logged and otherwise ignored.
    pub fn next_optional(mut self, step: &'a dyn Step) -> JobBuilder<'a> {
        self.steps.push(JobStep {
            step,
            optional: true,
        });
        self
    }

    pub fn build(self) -> JobInstance<'a> {
        JobInstance {
            id: Uuid::new_v4(),
            name: self.name.unwrap_or_else(build_name),
            steps: self.steps,
        }
    }
}
