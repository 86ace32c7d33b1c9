//! warehouse-batch - full-refresh loads into the PostgreSQL warehouse

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use warehouse_batch::{
    config::Config,
    jobs::{RunSummary, crm_requests, sql_table::{self, SqlJob}},
};

#[derive(Parser, Debug)]
#[command(name = "warehouse-batch")]
#[command(author, version, about = "Batch jobs loading source systems into the warehouse")]
struct Cli {
    #[command(subcommand)]
    job: JobCommand,

    /// Debug output (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum JobCommand {
    /// Student benefits, exported and uploaded after the load
    StudentBenefits,
    /// SIES data stamped with the cut-off date
    SiesData,
    /// Faculty survey answers (high volume)
    FacultySurvey,
    /// Moodle operational data, blank text loaded as NULL
    MoodleOperational,
    /// CRM requests fetched month by month from the REST API
    CrmRequests,
}

fn run(job: JobCommand) -> Result<RunSummary> {
    let config = Config::load().context("invalid configuration")?;

    let summary = match job {
        JobCommand::StudentBenefits => sql_table::run(SqlJob::StudentBenefits, &config),
        JobCommand::SiesData => sql_table::run(SqlJob::SiesData, &config),
        JobCommand::FacultySurvey => sql_table::run(SqlJob::FacultySurvey, &config),
        JobCommand::MoodleOperational => sql_table::run(SqlJob::MoodleOperational, &config),
        JobCommand::CrmRequests => crm_requests::run(&config),
    }?;

    Ok(summary)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    match run(cli.job) {
        Ok(summary) => {
            info!("Job {} finished", summary.job);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
