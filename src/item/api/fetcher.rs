use std::{cell::RefCell, time::Duration};

use log::{info, warn};

use super::{
    client::{Authenticator, FetchError, MonthSource},
    partition::MonthPartition,
    retry::RetryPolicy,
};

/// Supplies the token sent with every report request.
pub trait TokenProvider {
    fn token(&self) -> Result<String, FetchError>;

    /// Drops the current token and obtains a new one.
    fn refresh(&self) -> Result<String, FetchError>;
}

/// Logs in on first use and hands out the same token for the rest of the run.
pub struct LoginTokenProvider<'a> {
    authenticator: &'a dyn Authenticator,
    cached: RefCell<Option<String>>,
}

impl<'a> LoginTokenProvider<'a> {
    pub fn new(authenticator: &'a dyn Authenticator) -> Self {
        Self {
            authenticator,
            cached: RefCell::new(None),
        }
    }
}

impl TokenProvider for LoginTokenProvider<'_> {
    fn token(&self) -> Result<String, FetchError> {
        if let Some(token) = self.cached.borrow().as_ref() {
            return Ok(token.clone());
        }
        self.refresh()
    }

    fn refresh(&self) -> Result<String, FetchError> {
        let token = self.authenticator.login()?;
        *self.cached.borrow_mut() = Some(token.clone());
        Ok(token)
    }
}

/// Fetches month partitions one after the other, absorbing failures.
///
/// Each month goes through [`RetryPolicy::run`]; a month whose attempts are all
/// exhausted, or whose body is not a JSON array, contributes no items. Months
/// are spaced by `pacing`, except after the last one.
///
/// The token is taken from the [`TokenProvider`] once per attempt. With
/// `refresh_on_unauthorized` unset, a rejected token is simply retried like any
/// other failure and the month ends up empty.
pub struct ResilientFetcher<'a> {
    source: &'a dyn MonthSource,
    tokens: &'a dyn TokenProvider,
    policy: RetryPolicy,
    pacing: Duration,
    refresh_on_unauthorized: bool,
    sleep: Box<dyn Fn(Duration) + 'a>,
}

impl<'a> ResilientFetcher<'a> {
    pub fn new(source: &'a dyn MonthSource, tokens: &'a dyn TokenProvider) -> Self {
        Self {
            source,
            tokens,
            policy: RetryPolicy::default(),
            pacing: Duration::from_secs(10),
            refresh_on_unauthorized: false,
            sleep: Box::new(std::thread::sleep),
        }
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Delay between two consecutive months.
    pub fn pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn refresh_on_unauthorized(mut self, enabled: bool) -> Self {
        self.refresh_on_unauthorized = enabled;
        self
    }

    /// Replaces `std::thread::sleep` for retry and pacing waits.
    pub fn sleep_with<S: Fn(Duration) + 'a>(mut self, sleep: S) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    /// Items of one month; empty when the month could not be fetched.
    pub fn fetch_month(&self, month: MonthPartition) -> Vec<serde_json::Value> {
        info!("Fetching requests of {}...", month);

        let label = month.to_string();
        let body = self.policy.run(
            &label,
            |_| {
                let token = self.tokens.token()?;
                match self.source.fetch_month(&token, month) {
                    Err(FetchError::Unauthorized) if self.refresh_on_unauthorized => {
                        warn!("Token rejected for {}, logging in again", month);
                        self.tokens.refresh()?;
                        Err(FetchError::Unauthorized)
                    }
                    other => other,
                }
            },
            |delay| (self.sleep)(delay),
        );

        match body {
            Some(serde_json::Value::Array(items)) => {
                info!("Fetched {} requests of {}", items.len(), month);
                items
            }
            Some(_) => {
                warn!("Unexpected response for {}, expected a list", month);
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Concatenated items of every month, in month order.
    ///
    /// The token is requested up front so an authentication failure stops the
    /// run before any month is fetched.
    pub fn fetch_months(&self, months: &[MonthPartition]) -> Result<Vec<serde_json::Value>, FetchError> {
        self.tokens.token()?;

        let mut items = Vec::new();

        for (index, month) in months.iter().enumerate() {
            items.extend(self.fetch_month(*month));

            if index + 1 < months.len() && !self.pacing.is_zero() {
                info!(
                    "  -> Waiting {}s before the next month...",
                    self.pacing.as_secs()
                );
                (self.sleep)(self.pacing);
            }
        }

        info!("Total requests fetched: {}", items.len());
        Ok(items)
    }
}
