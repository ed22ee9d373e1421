//! In-memory token → status map.
//!
//! One writer per token (its execution task), any number of readers. Records
//! only move forward: IN_QUEUE → PROCESSING → one terminal code, after which
//! updates are rejected.

use atal_common::{ExecutionStatus, StatusCode, StatusPatch, Token};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{JudgeError, Result};
use crate::metrics;

#[derive(Debug)]
struct Entry {
    status: ExecutionStatus,
    /// When the record turned terminal; the sweep TTL counts from here.
    finished_at: Option<Instant>,
}

#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<Token, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an IN_QUEUE record for `token`. An existing record is left as is.
    pub fn initialize(&self, token: Token) -> ExecutionStatus {
        let mut entries = self.entries.write();
        let status = entries
            .entry(token)
            .or_insert_with(|| Entry {
                status: ExecutionStatus::queued(token),
                finished_at: None,
            })
            .status
            .clone();
        metrics::TRACKED_TOKENS.set(entries.len() as i64);
        status
    }

    /// Merge `patch` into the record and move it to `code`.
    pub fn update_status(
        &self,
        token: Token,
        code: StatusCode,
        description: impl Into<String>,
        patch: StatusPatch,
    ) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&token).ok_or(JudgeError::NotFound(token))?;
        let current = &mut entry.status;
        if current.is_terminal() {
            warn!(token = %token, current = %current.status_code, rejected = %code, "Ignoring update to final status");
            return Err(JudgeError::AlreadyFinal(token));
        }
        // Never step back from PROCESSING to IN_QUEUE.
        if code < current.status_code {
            warn!(token = %token, current = %current.status_code, rejected = %code, "Ignoring backwards status transition");
            return Ok(());
        }
        current.apply(code, description, patch);
        if current.is_terminal() {
            entry.finished_at = Some(Instant::now());
        }
        debug!(token = %token, status = %code, "Status updated");
        Ok(())
    }

    pub fn get(&self, token: &Token) -> Result<ExecutionStatus> {
        self.entries
            .read()
            .get(token)
            .map(|e| e.status.clone())
            .ok_or(JudgeError::NotFound(*token))
    }

    pub fn get_many(&self, tokens: &[Token]) -> Result<Vec<ExecutionStatus>> {
        let entries = self.entries.read();
        tokens
            .iter()
            .map(|t| {
                entries
                    .get(t)
                    .map(|e| e.status.clone())
                    .ok_or(JudgeError::NotFound(*t))
            })
            .collect()
    }

    /// Drop the record once the caller is done with it.
    pub fn release(&self, token: &Token) -> Option<ExecutionStatus> {
        let mut entries = self.entries.write();
        let removed = entries.remove(token);
        metrics::TRACKED_TOKENS.set(entries.len() as i64);
        removed.map(|e| e.status)
    }

    /// Remove records that finished at least `ttl` ago. Returns how many went.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| !e.finished_at.is_some_and(|at| at.elapsed() >= ttl));
        metrics::TRACKED_TOKENS.set(entries.len() as i64);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Periodically sweep expired records until the handle is aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, ttl: Duration, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = registry.sweep(ttl);
                if removed > 0 {
                    debug!(removed, remaining = registry.len(), "Swept expired statuses");
                }
            }
        })
    }
}
