use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Token;

/// Numeric execution status.
///
/// Kept as an open newtype rather than an enum: records may arrive from
/// outside the process, and codes nobody mapped must survive the round trip
/// so verdict derivation can flag them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u8);

impl StatusCode {
    pub const IN_QUEUE: StatusCode = StatusCode(1);
    pub const PROCESSING: StatusCode = StatusCode(2);
    pub const ACCEPTED: StatusCode = StatusCode(3);
    pub const WRONG_ANSWER: StatusCode = StatusCode(4);
    pub const TIME_LIMIT_EXCEEDED: StatusCode = StatusCode(5);
    pub const COMPILATION_ERROR: StatusCode = StatusCode(6);
    pub const RUNTIME_ERROR_SIGSEGV: StatusCode = StatusCode(7);
    pub const RUNTIME_ERROR_SIGXFSZ: StatusCode = StatusCode(8);
    pub const RUNTIME_ERROR_SIGFPE: StatusCode = StatusCode(9);
    pub const RUNTIME_ERROR_SIGABRT: StatusCode = StatusCode(10);
    pub const RUNTIME_ERROR_NZEC: StatusCode = StatusCode(11);
    pub const RUNTIME_ERROR_OTHER: StatusCode = StatusCode(12);
    pub const INTERNAL_ERROR: StatusCode = StatusCode(13);

    /// Anything past PROCESSING will never change again.
    pub fn is_terminal(self) -> bool {
        self.0 > Self::PROCESSING.0
    }

    pub fn is_runtime_error(self) -> bool {
        (7..=12).contains(&self.0)
    }

    pub fn description(self) -> &'static str {
        match self.0 {
            1 => "In Queue",
            2 => "Processing",
            3 => "Accepted",
            4 => "Wrong Answer",
            5 => "Time Limit Exceeded",
            6 => "Compilation Error",
            7 => "Runtime Error (SIGSEGV)",
            8 => "Runtime Error (SIGXFSZ)",
            9 => "Runtime Error (SIGFPE)",
            10 => "Runtime Error (SIGABRT)",
            11 => "Runtime Error (NZEC)",
            12 => "Runtime Error (Other)",
            13 => "Internal Error",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.description())
    }
}

/// Mutable status record for one token. Only the token registry mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStatus {
    pub token: Token,
    pub status_code: StatusCode,
    pub status_description: String,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    /// Adjusted wall time in seconds, three decimals.
    pub time: Option<String>,
    /// TODO: memory is never measured; wire the container's cgroup peak
    /// usage in here once the engine reports it.
    pub memory: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionStatus {
    pub fn queued(token: Token) -> Self {
        Self {
            token,
            status_code: StatusCode::IN_QUEUE,
            status_description: StatusCode::IN_QUEUE.description().to_string(),
            stdout: None,
            stderr: None,
            compile_output: None,
            message: None,
            time: None,
            memory: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status_code.is_terminal()
    }

    /// Merge the set fields of `patch`; unset fields keep their value.
    pub fn apply(&mut self, code: StatusCode, description: impl Into<String>, patch: StatusPatch) {
        self.status_code = code;
        self.status_description = description.into();
        if patch.stdout.is_some() {
            self.stdout = patch.stdout;
        }
        if patch.stderr.is_some() {
            self.stderr = patch.stderr;
        }
        if patch.compile_output.is_some() {
            self.compile_output = patch.compile_output;
        }
        if patch.message.is_some() {
            self.message = patch.message;
        }
        if patch.time.is_some() {
            self.time = patch.time;
        }
        if let Some(memory) = patch.memory {
            self.memory = memory;
        }
    }
}

/// Partial update for [`ExecutionStatus::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub compile_output: Option<String>,
    pub message: Option<String>,
    pub time: Option<String>,
    pub memory: Option<u64>,
}

impl StatusPatch {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Final classification of one test-case run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    CompilationError,
    RuntimeError,
    InternalError,
    JudgeError,
}

/// Output of verdict derivation; the grading layer needs nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedResult {
    pub verdict: Verdict,
    pub passed: bool,
    pub execution_time_ms: Option<f64>,
    pub memory_used_kb: Option<u64>,
    pub output: Option<String>,
    pub error_message: Option<String>,
}

/// Snapshot handed to the progress callback after each polling round.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub completed: usize,
    pub pending: usize,
    pub total: usize,
    pub percentage: u8,
    pub statuses: Vec<ExecutionStatus>,
}

impl BatchProgress {
    pub fn from_statuses(statuses: Vec<ExecutionStatus>) -> Self {
        let total = statuses.len();
        let completed = statuses.iter().filter(|s| s.is_terminal()).count();
        let percentage = if total == 0 {
            100
        } else {
            ((completed as f64 / total as f64) * 100.0).round() as u8
        };
        Self {
            completed,
            pending: total - completed,
            total,
            percentage,
            statuses,
        }
    }

    pub fn is_done(&self) -> bool {
        self.pending == 0
    }
}
