use atal_common::{Token, UnknownLanguage};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced synchronously to callers.
///
/// Outcomes of the submitted program (wrong answer, time limit, crashes) are
/// never errors; they travel through the status record. Infrastructure
/// failures inside a run are also folded into the record as INTERNAL_ERROR.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("unknown token: {0}")]
    NotFound(Token),

    #[error("status for {0} is already final")]
    AlreadyFinal(Token),

    #[error("source code is {size} bytes, limit is {limit}")]
    SourceTooLarge { size: usize, limit: usize },

    #[error("execution queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("judge is shutting down")]
    ShuttingDown,

    /// The poller ran out of patience. Says nothing about the submissions
    /// themselves, which may still be running.
    #[error(
        "gave up polling after {waited:?}: {completed} completed, {} still pending",
        .pending.len()
    )]
    PollTimeout {
        completed: usize,
        pending: Vec<Token>,
        waited: Duration,
    },
}

impl From<UnknownLanguage> for JudgeError {
    fn from(e: UnknownLanguage) -> Self {
        JudgeError::UnsupportedLanguage(e.0)
    }
}

pub type Result<T, E = JudgeError> = std::result::Result<T, E>;
