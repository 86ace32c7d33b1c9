use std::future::Future;

use rand::distr::{Alphanumeric, SampleString};

pub mod item;

pub mod job;

pub mod record;

pub mod step;

/// Generates a random name consisting of alphanumeric characters.
///
/// # Returns
///
/// A `String` containing the generated random name.
fn build_name() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 8)
}

/// Runs an async driver call from the synchronous batch API.
///
/// Requires a multi-thread tokio runtime: the current worker is handed over to
/// the blocking section while the future is driven to completion.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}
