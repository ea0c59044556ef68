//! Timeout and bounded retry at the collaborator call boundary.
//!
//! Every external call a stage makes goes through [`CallPolicy::call`]: the
//! call is bounded by a timeout, and failures flagged
//! [`transient`][CollaboratorError::transient] are retried with exponential
//! backoff plus jitter up to `max_attempts`. This retry is local to one call;
//! re-running a whole stage is the driver's decision.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use solmem_types::CollaboratorError;
use tracing::warn;

/// Upper bound of the random jitter added to each backoff delay.
const JITTER_MAX_MS: u64 = 50;

/// Timeout and retry settings for collaborator calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    /// Total attempts including the first; `0` behaves like `1`.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl CallPolicy {
    pub fn new(timeout: Duration, max_attempts: u32) -> Self {
        Self {
            timeout,
            max_attempts,
            ..Self::default()
        }
    }

    /// Run `op` under this policy.
    ///
    /// A timeout counts as a transient failure of `service`. Permanent
    /// failures are returned immediately.
    pub async fn call<T, F, Fut>(&self, service: &str, mut op: F) -> Result<T, CollaboratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut backoff = self.backoff_base;
        let mut attempt = 1;

        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(CollaboratorError::transient(
                    service,
                    format!("timed out after {}ms", self.timeout.as_millis()),
                )),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.transient && attempt < attempts => {
                    let delay = backoff.min(self.backoff_max) + jitter();
                    warn!(
                        service,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient collaborator failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::rng().random_range(0..=JITTER_MAX_MS))
}
