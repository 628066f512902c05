use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct Submission {
    pub id: Uuid,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub code: String,
    pub language: Language,
    pub test_cases: Vec<TestCase>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    pub time_limit_ms: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Language {
    GnuCpp,
    GnuC,
    Rust,
    Python,
    Shell,
}

impl Language {
    pub fn all_variants() -> &'static [Language] {
        &[
            Language::GnuCpp,
            Language::GnuC,
            Language::Rust,
            Language::Python,
            Language::Shell,
        ]
    }

    /// Wire tags of every supported language, comma separated.
    pub fn supported_tags() -> String {
        Self::all_variants()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, Language::GnuCpp | Language::GnuC | Language::Rust)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Language::GnuCpp => "cpp",
            Language::GnuC => "c",
            Language::Rust => "rust",
            Language::Python => "python",
            Language::Shell => "sh",
        };
        f.write_str(tag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language: {tag:?}")]
pub struct UnknownLanguage {
    pub tag: String,
}

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cpp" | "c++" | "gnucpp" => Ok(Language::GnuCpp),
            "c" | "gnuc" => Ok(Language::GnuC),
            "rust" | "rs" => Ok(Language::Rust),
            "python" | "python3" | "py" => Ok(Language::Python),
            "sh" | "shell" => Ok(Language::Shell),
            _ => Err(UnknownLanguage { tag: s.to_string() }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

/// Resolved build/run instructions for one submission.
///
/// Built once by the language adapter and only read afterwards; every test
/// case of the submission runs `run` in a fresh copy of `workdir`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunPlan {
    pub language: Language,
    pub source: SourceFile,
    pub build: Option<CommandSpec>,
    pub run: CommandSpec,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionLimits {
    pub time_ms: u64,
    pub memory_bytes: Option<u64>,
    pub output_bytes: usize,
}

impl ExecutionLimits {
    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.time_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Scratch {
    /// Run directly inside an existing directory (the build step).
    InPlace(PathBuf),
    /// Run inside a new directory seeded with a copy of `seed`.
    Fresh { seed: PathBuf },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionSpec {
    pub command: CommandSpec,
    pub scratch: Scratch,
    pub stdin: String,
    pub limits: ExecutionLimits,
    pub env: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    Completed,
    TimedOut,
    MemoryExceeded,
    ProcessError,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub elapsed_ms: u64,
    pub peak_memory_bytes: u64,
    pub reason: TerminationReason,
}

impl ExecutionOutcome {
    pub fn succeeded(&self) -> bool {
        self.reason == TerminationReason::Completed && self.exit_code == Some(0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Verdict {
    Pass,
    Fail,
    RuntimeError,
    CompileError,
    TimedOut,
    InternalError,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Verdict of one test case before it is numbered by the aggregator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestOutcome {
    pub verdict: Verdict,
    pub diagnostic: Option<String>,
    pub elapsed_ms: u64,
}

impl TestOutcome {
    pub fn with_diagnostic(verdict: Verdict, diagnostic: impl Into<String>) -> Self {
        Self {
            verdict,
            diagnostic: Some(diagnostic.into()),
            elapsed_ms: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestResult {
    pub index: usize,
    pub verdict: Verdict,
    pub diagnostic: Option<String>,
    pub elapsed_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmissionStatus {
    Passed,
    Partial,
    Failed,
    CompileError,
    InternalError,
}

#[derive(Clone, Debug)]
pub struct Report {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
    pub passed: usize,
    pub total: usize,
    pub results: Vec<TestResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_from_str() {
        assert_eq!("cpp".parse::<Language>(), Ok(Language::GnuCpp));
        assert_eq!("C++".parse::<Language>(), Ok(Language::GnuCpp));
        assert_eq!("c".parse::<Language>(), Ok(Language::GnuC));
        assert_eq!("Rust".parse::<Language>(), Ok(Language::Rust));
        assert_eq!("PYTHON3".parse::<Language>(), Ok(Language::Python));
        assert_eq!(" sh ".parse::<Language>(), Ok(Language::Shell));

        assert!("javascript".parse::<Language>().is_err());
        assert!("".parse::<Language>().is_err());
    }

    #[test]
    fn test_language_display_parses_back() {
        for language in Language::all_variants() {
            assert_eq!(language.to_string().parse::<Language>().as_ref(), Ok(language));
        }
    }

    #[test]
    fn test_supported_tags() {
        assert_eq!(Language::supported_tags(), "cpp, c, rust, python, sh");
    }

    #[test]
    fn test_compiled_languages() {
        assert!(Language::GnuCpp.is_compiled());
        assert!(Language::Rust.is_compiled());
        assert!(!Language::Python.is_compiled());
        assert!(!Language::Shell.is_compiled());
    }

    #[test]
    fn test_verdict_wire_strings() {
        let json = serde_json::to_string(&[Verdict::Pass, Verdict::CompileError]).unwrap();
        assert_eq!(json, r#"["Pass","CompileError"]"#);
        assert_eq!(Verdict::TimedOut.to_string(), "TimedOut");
    }

    #[test]
    fn test_outcome_succeeded() {
        let mut outcome = ExecutionOutcome {
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: Some(0),
            signal: None,
            elapsed_ms: 1,
            peak_memory_bytes: 0,
            reason: TerminationReason::Completed,
        };
        assert!(outcome.succeeded());

        outcome.exit_code = Some(1);
        outcome.reason = TerminationReason::ProcessError;
        assert!(!outcome.succeeded());
    }
}
