/// HTTP client of the CRM API and the classification of its failures.
pub mod client;

/// Month-by-month fetching with retries and pacing.
pub mod fetcher;

/// Calendar month partitions.
pub mod partition;

/// Mapping of report items to records.
pub mod requests;

/// Linear backoff retry policy.
pub mod retry;
