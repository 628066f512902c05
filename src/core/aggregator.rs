use uuid::Uuid;

use crate::core::domain::{Report, SubmissionStatus, TestOutcome, TestResult, Verdict};

/// Numbers the per-test outcomes in request order and derives the overall
/// status.
pub fn aggregate(submission_id: Uuid, outcomes: Vec<TestOutcome>) -> Report {
    let total = outcomes.len();
    let results: Vec<TestResult> = outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| TestResult {
            index,
            verdict: outcome.verdict,
            diagnostic: outcome.diagnostic,
            elapsed_ms: outcome.elapsed_ms,
        })
        .collect();

    let passed = results
        .iter()
        .filter(|result| result.verdict == Verdict::Pass)
        .count();
    let has = |verdict: Verdict| results.iter().any(|result| result.verdict == verdict);

    let status = if total > 0 && passed == total {
        SubmissionStatus::Passed
    } else if has(Verdict::CompileError) {
        SubmissionStatus::CompileError
    } else if has(Verdict::InternalError) {
        SubmissionStatus::InternalError
    } else if passed > 0 {
        SubmissionStatus::Partial
    } else {
        SubmissionStatus::Failed
    };

    Report {
        submission_id,
        status,
        passed,
        total,
        results,
    }
}
