//! Central retry executor.
//!
//! Every call site that wants retries opts in through [`RetryPolicy::run`]
//! instead of hand-rolling its own loop; the DB connect path and the LLM
//! extraction stage are the two consumers.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Back-off progression between attempts.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// base, 2·base, 3·base, …
    Linear(Duration),
    /// base, 2·base, 4·base, …
    Exponential(Duration),
}

impl Backoff {
    /// Delay inserted after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Linear(base) => *base * attempt,
            Backoff::Exponential(base) => *base * 2u32.saturating_pow(attempt - 1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// The DB connect discipline: 3 attempts, linear back-off from 1s.
    pub fn db_connect() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Linear(Duration::from_secs(1)),
        }
    }

    /// The LLM transport discipline: 1 call + 2 retries, exponential from 1s.
    pub fn llm_transport() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential(Duration::from_secs(1)),
        }
    }

    /// Run `op` until it succeeds, the error is not retryable, or attempts
    /// run out. The last error is returned as-is.
    pub async fn run<T, E, F, Fut, P>(&self, mut is_retryable: P, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.max_attempts && is_retryable(&e) => {
                    let delay = self.backoff.delay_for(attempt);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
