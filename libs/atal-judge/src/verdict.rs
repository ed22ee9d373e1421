/// Verdict Derivation - Status Record to Final Verdict
///
/// Two stages:
/// 1. Map the status code to a verdict with a fixed table
/// 2. For ACCEPTED runs, compare output with the expected answer and
///    downgrade to WRONG_ANSWER on mismatch
///
/// The sandbox only knows whether a process ran, crashed or timed out;
/// whether the answer was right is decided here.
///
/// **Normalization Rules:**
/// - Trim leading and trailing whitespace: YES
/// - Internal whitespace: preserved, must match exactly
/// - Case sensitivity: YES
///
/// Precondition: the status is terminal. Passing a queued or running record
/// yields JUDGE_ERROR, never a pass.

use atal_common::{ExecutionStatus, ProcessedResult, StatusCode, Verdict};

pub(crate) fn normalize_output(output: &str) -> &str {
    output.trim()
}

/// True when `actual` matches `expected` after normalization.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    normalize_output(actual) == normalize_output(expected)
}

/// Fixed status-code table. Unmapped codes are flagged, never dropped.
pub fn verdict_for_code(code: StatusCode) -> Verdict {
    match code {
        StatusCode::ACCEPTED => Verdict::Accepted,
        StatusCode::WRONG_ANSWER => Verdict::WrongAnswer,
        StatusCode::TIME_LIMIT_EXCEEDED => Verdict::TimeLimitExceeded,
        StatusCode::COMPILATION_ERROR => Verdict::CompilationError,
        c if c.is_runtime_error() => Verdict::RuntimeError,
        StatusCode::INTERNAL_ERROR => Verdict::InternalError,
        _ => Verdict::JudgeError,
    }
}

/// Derive the verdict for one finished run.
pub fn derive_verdict(status: &ExecutionStatus, expected_output: Option<&str>) -> ProcessedResult {
    let mut verdict = verdict_for_code(status.status_code);
    let mut passed = false;

    if status.status_code == StatusCode::ACCEPTED {
        let actual = status.stdout.as_deref().unwrap_or("");
        match expected_output {
            Some(expected) if !outputs_match(actual, expected) => verdict = Verdict::WrongAnswer,
            _ => passed = true,
        }
    }

    let execution_time_ms = status
        .time
        .as_deref()
        .and_then(|t| t.trim().parse::<f64>().ok())
        .map(|secs| secs * 1000.0);

    let error_message = [&status.stderr, &status.compile_output, &status.message]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
        .cloned();

    ProcessedResult {
        verdict,
        passed,
        execution_time_ms,
        memory_used_kb: Some(status.memory),
        output: status.stdout.clone(),
        error_message,
    }
}
