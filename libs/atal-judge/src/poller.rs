//! Polling for completion of one or many tokens.
//!
//! Callers that cannot block on an execution check the registry at a fixed
//! interval and get a [`BatchProgress`] snapshot each round. The wait is
//! bounded by wall-clock time, so a slow progress callback shortens the
//! number of rounds instead of stretching the deadline.

use atal_common::{BatchProgress, ExecutionStatus, Token};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{JudgeError, Result};
use crate::metrics;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            max_attempts: 60,
            interval: Duration::from_secs(1),
        }
    }
}

impl PollOptions {
    /// Total wall-clock budget: `max_attempts * interval`.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

/// Wait until every token is terminal, reporting progress after each check.
///
/// Statuses come back in the order of `tokens`. Unknown tokens fail
/// immediately with `NotFound`.
pub async fn wait_for_batch<F>(
    registry: &Registry,
    tokens: &[Token],
    mut on_progress: F,
    options: PollOptions,
) -> Result<Vec<ExecutionStatus>>
where
    F: FnMut(&BatchProgress),
{
    let started = Instant::now();
    let budget = options.budget();
    let mut round = 0u32;

    loop {
        round += 1;
        let progress = BatchProgress::from_statuses(registry.get_many(tokens)?);
        debug!(
            round,
            completed = progress.completed,
            pending = progress.pending,
            percentage = progress.percentage,
            "Poll round"
        );
        on_progress(&progress);

        if progress.is_done() {
            return Ok(progress.statuses);
        }

        let waited = started.elapsed();
        if waited >= budget {
            let pending: Vec<Token> = progress
                .statuses
                .iter()
                .filter(|s| !s.is_terminal())
                .map(|s| s.token)
                .collect();
            warn!(
                completed = progress.completed,
                pending = pending.len(),
                waited_ms = waited.as_millis() as u64,
                "Polling budget exhausted"
            );
            metrics::POLL_TIMEOUTS_TOTAL.inc();
            return Err(JudgeError::PollTimeout {
                completed: progress.completed,
                pending,
                waited,
            });
        }

        tokio::time::sleep(options.interval.min(budget - waited)).await;
    }
}

/// [`wait_for_batch`] for a single token.
pub async fn wait_for(registry: &Registry, token: Token, options: PollOptions) -> Result<ExecutionStatus> {
    let mut statuses = wait_for_batch(registry, &[token], |_| {}, options).await?;
    statuses.pop().ok_or(JudgeError::NotFound(token))
}
