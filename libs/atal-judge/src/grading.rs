/// Grading - Weighted Score From Per-Test Verdicts
///
/// **Scoring Rules:**
/// - Each test case has a weight
/// - score = sum of weights of passed tests
/// - max_score = sum of all weights
/// - percentage = score / max_score, 0 when max_score is 0

use atal_common::{ProcessedResult, TestCase, Verdict};
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradedTestCase {
    pub test_case_id: u32,
    pub weight: u32,
    #[serde(flatten)]
    pub result: ProcessedResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionScore {
    pub score: u32,
    pub max_score: u32,
    pub percentage: f64,
    pub passed: usize,
    pub total: usize,
    pub results: Vec<GradedTestCase>,
}

impl SubmissionScore {
    pub fn all_passed(&self) -> bool {
        self.passed == self.total
    }

    /// First verdict that is not ACCEPTED, in test-case order.
    pub fn first_failure(&self) -> Option<Verdict> {
        self.results
            .iter()
            .map(|r| r.result.verdict)
            .find(|v| *v != Verdict::Accepted)
    }
}

/// Combine per-test results with their weights.
///
/// `results[i]` belongs to `test_cases[i]`; extra entries on either side are
/// ignored.
pub fn grade(test_cases: &[TestCase], results: Vec<ProcessedResult>) -> SubmissionScore {
    let max_score: u32 = test_cases.iter().map(|tc| tc.weight).sum();
    let mut score = 0u32;
    let mut passed = 0usize;
    let mut graded = Vec::with_capacity(test_cases.len());

    for (test_case, result) in test_cases.iter().zip(results) {
        if result.passed {
            score += test_case.weight;
            passed += 1;
        }
        debug!(
            test_case_id = test_case.id,
            weight = test_case.weight,
            verdict = ?result.verdict,
            passed = result.passed,
            "Graded test case"
        );
        graded.push(GradedTestCase {
            test_case_id: test_case.id,
            weight: test_case.weight,
            result,
        });
    }

    let percentage = if max_score == 0 {
        0.0
    } else {
        (score as f64 / max_score as f64) * 100.0
    };

    SubmissionScore {
        score,
        max_score,
        percentage,
        passed,
        total: graded.len(),
        results: graded,
    }
}
