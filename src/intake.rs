//! Wire types and validation at the edge of the engine.
//!
//! Requests are checked here as a whole: a rejected request never reaches a
//! sandbox, and an accepted one only carries values the engine can honour.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::Config,
    core::{
        domain::{Language, Report, Submission, TestCase, Verdict},
        judge::JudgeError,
    },
};

pub const MAX_SOURCE_CODE_BYTES: usize = 1024 * 1024;
pub const MAX_TEST_INPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRequest {
    #[serde(alias = "source_code")]
    pub source_code: String,
    pub language: String,
    #[serde(alias = "test_cases")]
    pub test_cases: Vec<TestCaseRequest>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseRequest {
    #[serde(default)]
    pub input: String,
    #[serde(alias = "expected_output")]
    pub expected_output: String,
    #[serde(default, alias = "time_limit_ms")]
    pub time_limit_ms: Option<u64>,
    #[serde(default, alias = "memory_limit_bytes")]
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultResponse {
    pub test_num: usize,
    pub result: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: &'static str,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn malformed(error: &serde_json::Error) -> Self {
        Self::new("MalformedRequest", error.to_string())
    }
}

impl From<&IntakeError> for ErrorResponse {
    fn from(error: &IntakeError) -> Self {
        let kind = match error {
            IntakeError::InvalidSubmission { .. } => "InvalidSubmission",
            IntakeError::UnsupportedLanguage { .. } => "UnsupportedLanguage",
        };
        Self::new(kind, error.to_string())
    }
}

impl From<&JudgeError> for ErrorResponse {
    fn from(error: &JudgeError) -> Self {
        let kind = match error {
            JudgeError::Overloaded => "Overloaded",
            JudgeError::Closed => "Unavailable",
        };
        Self::new(kind, error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntakeError {
    #[error("invalid submission: {reason}")]
    InvalidSubmission { reason: String },
    #[error("unsupported language: {tag:?}, expected one of {}", Language::supported_tags())]
    UnsupportedLanguage { tag: String },
}

fn invalid(reason: impl Into<String>) -> IntakeError {
    IntakeError::InvalidSubmission {
        reason: reason.into(),
    }
}

/// Validates a request and turns it into a [`Submission`] with a fresh id.
pub fn accept(request: SubmissionRequest, config: &Config) -> Result<Submission, IntakeError> {
    let language: Language = request
        .language
        .parse()
        .map_err(|_| IntakeError::UnsupportedLanguage {
            tag: request.language.clone(),
        })?;

    if request.source_code.trim().is_empty() {
        return Err(invalid("source code is empty"));
    }
    if request.source_code.len() > MAX_SOURCE_CODE_BYTES {
        return Err(invalid(format!(
            "source code exceeds {MAX_SOURCE_CODE_BYTES} bytes"
        )));
    }
    if request.test_cases.is_empty() {
        return Err(invalid("at least one test case is required"));
    }
    if request.test_cases.len() > config.max_test_cases {
        return Err(invalid(format!(
            "{} test cases given, at most {} allowed",
            request.test_cases.len(),
            config.max_test_cases
        )));
    }

    let test_cases = request
        .test_cases
        .into_iter()
        .enumerate()
        .map(|(i, test_case)| validate_test_case(i + 1, test_case, config))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Submission {
        id: Uuid::new_v4(),
        received_at: chrono::Utc::now(),
        code: request.source_code,
        language,
        test_cases,
    })
}

fn validate_test_case(
    test_num: usize,
    test_case: TestCaseRequest,
    config: &Config,
) -> Result<TestCase, IntakeError> {
    if test_case.input.len() > MAX_TEST_INPUT_BYTES {
        return Err(invalid(format!(
            "test {test_num}: input exceeds {MAX_TEST_INPUT_BYTES} bytes"
        )));
    }
    if test_case
        .time_limit_ms
        .is_some_and(|ms| !(1..=config.max_time_limit_ms).contains(&ms))
    {
        return Err(invalid(format!(
            "test {test_num}: time limit must be between 1 and {} ms",
            config.max_time_limit_ms
        )));
    }
    if test_case.memory_limit_bytes == Some(0) {
        return Err(invalid(format!(
            "test {test_num}: memory limit must be greater than zero"
        )));
    }

    Ok(TestCase {
        input: test_case.input,
        expected_output: test_case.expected_output,
        time_limit_ms: test_case.time_limit_ms,
        memory_limit_bytes: test_case.memory_limit_bytes,
    })
}

/// Shapes a report into the ordered response array, numbering tests from 1.
pub fn respond(report: &Report) -> Vec<TestResultResponse> {
    report
        .results
        .iter()
        .map(|result| TestResultResponse {
            test_num: result.index + 1,
            result: result.verdict,
            diagnostic: result.diagnostic.clone(),
            time_ms: result.elapsed_ms,
        })
        .collect()
}
