use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Opaque handle for one execution. Returned by `submit`, used for every
/// later status query.
pub type Token = Uuid;

/// Languages the judge knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Language {
    Python,
    Java,
    Cpp,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::Java, Language::Cpp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Cpp => "cpp",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {0}")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "cpp" | "c++" | "cxx" => Ok(Language::Cpp),
            _ => Err(UnknownLanguage(s.to_string())),
        }
    }
}

/// Resource limits for a single run.
///
/// `wall_time_limit_seconds` falls back to the CPU limit when absent. Memory
/// is enforced by the container runtime; it is not measured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpu_time_limit_seconds: f64,
    pub memory_limit_kb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time_limit_seconds: Option<f64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_limit_seconds: 2.0,
            memory_limit_kb: 256 * 1024,
            wall_time_limit_seconds: None,
        }
    }
}

impl ResourceLimits {
    pub fn cpu_time_limit(&self) -> Duration {
        secs_to_duration(self.cpu_time_limit_seconds)
    }

    pub fn wall_time_limit(&self) -> Duration {
        self.wall_time_limit_seconds
            .map(secs_to_duration)
            .unwrap_or_else(|| self.cpu_time_limit())
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        i64::try_from(self.memory_limit_kb.saturating_mul(1024)).unwrap_or(i64::MAX)
    }
}

// Negative or NaN limits collapse to zero instead of panicking.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

/// Limits as the question entity stores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionLimits {
    pub time_limit_ms: u64,
    pub memory_limit_kb: u64,
}

impl From<QuestionLimits> for ResourceLimits {
    fn from(q: QuestionLimits) -> Self {
        Self {
            cpu_time_limit_seconds: q.time_limit_ms as f64 / 1000.0,
            memory_limit_kb: q.memory_limit_kb,
            wall_time_limit_seconds: None,
        }
    }
}

/// Inputs to a single run. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub source_code: String,
    pub language: Language,
    #[serde(default)]
    pub stdin: Option<String>,
    /// When present the runner checks the output itself and records
    /// WRONG_ANSWER instead of ACCEPTED on mismatch.
    #[serde(default)]
    pub expected_output: Option<String>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

impl ExecutionRequest {
    pub fn new(language: Language, source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            language,
            stdin: None,
            expected_output: None,
            limits: ResourceLimits::default(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// A graded test case as the question store hands it over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: u32,
    pub input: String,
    pub expected_output: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}
