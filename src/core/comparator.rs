//! Output comparison.
//!
//! A pure function of the execution outcome and the expected text: no state,
//! no I/O. How the two texts are normalized before comparison is an explicit
//! [`NormalizationPolicy`] chosen in configuration.

use std::str::FromStr;

use crate::core::domain::{ExecutionOutcome, TerminationReason, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationPolicy {
    /// Strip trailing whitespace (including `\r`) from every line, then drop
    /// trailing empty lines. Leading and inner whitespace is significant.
    TrimTrailingWhitespace,
    /// Byte-for-byte equality.
    Exact,
}

impl FromStr for NormalizationPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trim-trailing" => Ok(NormalizationPolicy::TrimTrailingWhitespace),
            "exact" => Ok(NormalizationPolicy::Exact),
            _ => Err(()),
        }
    }
}

pub fn normalize(text: &str, policy: NormalizationPolicy) -> String {
    match policy {
        NormalizationPolicy::Exact => text.to_string(),
        NormalizationPolicy::TrimTrailingWhitespace => {
            let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
            while lines.last().is_some_and(|line| line.is_empty()) {
                lines.pop();
            }
            lines.join("\n")
        }
    }
}

pub fn judge(outcome: &ExecutionOutcome, expected: &str, policy: NormalizationPolicy) -> Verdict {
    match outcome.reason {
        TerminationReason::TimedOut => Verdict::TimedOut,
        TerminationReason::MemoryExceeded | TerminationReason::ProcessError => {
            Verdict::RuntimeError
        }
        TerminationReason::Completed => {
            if normalize(&outcome.stdout, policy) == normalize(expected, policy) {
                Verdict::Pass
            } else {
                Verdict::Fail
            }
        }
    }
}

/// Describes where normalized `actual` first departs from `expected`, for
/// the diagnostic attached to a failed test. `None` when they are equal.
pub fn first_difference(actual: &str, expected: &str, policy: NormalizationPolicy) -> Option<String> {
    let actual = normalize(actual, policy);
    let expected = normalize(expected, policy);
    if actual == expected {
        return None;
    }

    let mut actual_lines = actual.split('\n');
    let mut expected_lines = expected.split('\n');
    let mut line_no = 1;
    loop {
        match (actual_lines.next(), expected_lines.next()) {
            (Some(a), Some(e)) if a == e => line_no += 1,
            (Some(a), Some(e)) => {
                return Some(format!(
                    "line {line_no}: expected {:?}, got {:?}",
                    clip(e),
                    clip(a)
                ));
            }
            (None, Some(_)) => return Some(format!("line {line_no}: output ended early")),
            (Some(_), None) => return Some(format!("line {line_no}: unexpected extra output")),
            // Equal line sequences always join to equal strings.
            (None, None) => return Some("output differs in whitespace".to_string()),
        }
    }
}

fn clip(line: &str) -> String {
    const MAX_CHARS: usize = 64;
    if line.chars().count() <= MAX_CHARS {
        line.to_string()
    } else {
        let head: String = line.chars().take(MAX_CHARS).collect();
        format!("{head}...")
    }
}
