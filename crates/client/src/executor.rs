//! Run a unit of work inside a transaction, with retry on conflict.
//!
//! [`TransactionExecutor`] wraps a closure in the full lifecycle: start,
//! run, finish — and retries the whole thing when the failure is a
//! conflict. Retry policy is pluggable through [`RetryStrategy`]; the
//! default is a bounded exponential backoff with jitter that retries only
//! conflicts, so engineers get sane behavior without thinking about it.

use crate::client::TxClient;
use crate::context::TransactionContext;
use crate::error::{ParticipantResult, TransactionFailure, TxPhase};
use crate::participant::TransactionParticipant;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Decides whether (and when) a failed attempt is retried.
pub trait RetryStrategy: Send + Sync {
    /// Delay before the next attempt, or `None` to give up.
    /// `attempts` counts the attempts made so far (>= 1).
    fn next_delay(&self, failure: &TransactionFailure, attempts: u32) -> Option<Duration>;
}

/// Never retries.
struct NoRetries;

impl RetryStrategy for NoRetries {
    fn next_delay(&self, _failure: &TransactionFailure, _attempts: u32) -> Option<Duration> {
        None
    }
}

/// Retries conflicts with capped exponential backoff plus jitter.
struct RetryOnConflict {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryStrategy for RetryOnConflict {
    fn next_delay(&self, failure: &TransactionFailure, attempts: u32) -> Option<Duration> {
        if !failure.is_conflict() || attempts >= self.max_attempts {
            return None;
        }
        let exp = attempts.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        // Up to 25% jitter keeps herds of retrying clients apart.
        let jitter_micros = rand::thread_rng().gen_range(0..=base.as_micros().max(1) / 4);
        Some(base + Duration::from_micros(jitter_micros as u64))
    }
}

/// Stock retry strategies.
pub struct RetryStrategies;

impl RetryStrategies {
    /// Fail on the first error of any kind.
    pub fn no_retries() -> Box<dyn RetryStrategy> {
        Box::new(NoRetries)
    }

    /// Retry only conflicts, up to `max_attempts` total attempts, with
    /// exponential backoff starting at `initial_backoff` (capped at 10s).
    pub fn retry_on_conflict(
        max_attempts: u32,
        initial_backoff: Duration,
    ) -> Box<dyn RetryStrategy> {
        Box::new(RetryOnConflict {
            max_attempts,
            initial_backoff,
            max_backoff: Duration::from_secs(10),
        })
    }

    /// The default policy: bounded conflict retry.
    pub fn default_strategy() -> Box<dyn RetryStrategy> {
        Self::retry_on_conflict(20, Duration::from_millis(100))
    }
}

/// Executes closures transactionally over a fixed participant set.
pub struct TransactionExecutor {
    client: Arc<dyn TxClient>,
    participants: Vec<Arc<dyn TransactionParticipant>>,
    retry: Box<dyn RetryStrategy>,
}

impl TransactionExecutor {
    /// Executor with the default conflict-retry policy.
    pub fn new(
        client: Arc<dyn TxClient>,
        participants: Vec<Arc<dyn TransactionParticipant>>,
    ) -> Self {
        TransactionExecutor {
            client,
            participants,
            retry: RetryStrategies::default_strategy(),
        }
    }

    pub fn with_retry_strategy(mut self, retry: Box<dyn RetryStrategy>) -> Self {
        self.retry = retry;
        self
    }

    /// Run `work` inside a transaction. The closure mutates the enrolled
    /// participants (via their interior mutability) and returns the unit
    /// of work's output; its error aborts the transaction.
    pub fn execute<T>(
        &self,
        work: impl Fn() -> ParticipantResult<T>,
    ) -> Result<T, TransactionFailure> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.execute_once(&work) {
                Ok(value) => return Ok(value),
                Err(failure) => match self.retry.next_delay(&failure, attempts) {
                    Some(delay) => {
                        debug!(
                            attempts,
                            delay_ms = delay.as_millis() as u64,
                            "retrying after conflict"
                        );
                        std::thread::sleep(delay);
                    }
                    None => return Err(failure),
                },
            }
        }
    }

    fn execute_once<T>(
        &self,
        work: &impl Fn() -> ParticipantResult<T>,
    ) -> Result<T, TransactionFailure> {
        let mut context =
            TransactionContext::new(self.client.clone(), self.participants.clone());
        context.start()?;
        let value = match work() {
            Ok(value) => value,
            Err(cause) => {
                context.abort()?;
                return Err(TransactionFailure::participant(
                    TxPhase::UserFunction,
                    "<closure>",
                    Some(cause),
                ));
            }
        };
        context.finish()?;
        Ok(value)
    }
}
