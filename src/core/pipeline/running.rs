use tokio::time::Instant;

use crate::{
    config::Config,
    core::{
        comparator,
        domain::{
            ExecutionLimits, ExecutionOutcome, ExecutionSpec, Scratch, TerminationReason,
            TestCase, TestOutcome, Verdict,
        },
        pipeline::{BUDGET_EXHAUSTED, compiling::Build},
        traits::sandbox::Sandbox,
    },
};

const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// Runs every test case against the build, one at a time and in order.
///
/// Each case gets a fresh copy of the build directory. A failing case never
/// stops the ones after it; only the submission deadline does, and cases
/// reached after it are reported as timed out without being run.
#[tracing::instrument(skip_all, fields(tests = test_cases.len()))]
pub async fn run_tests(
    test_cases: &[TestCase],
    build: &Build,
    config: &Config,
    sandbox: &dyn Sandbox,
    deadline: Instant,
) -> Vec<TestOutcome> {
    let mut outcomes = Vec::with_capacity(test_cases.len());

    for (index, test_case) in test_cases.iter().enumerate() {
        let remaining_ms = deadline
            .saturating_duration_since(Instant::now())
            .as_millis() as u64;
        if remaining_ms == 0 {
            tracing::debug!(test = index, "Skipping test, budget exhausted");
            outcomes.push(TestOutcome::with_diagnostic(Verdict::TimedOut, BUDGET_EXHAUSTED));
            continue;
        }

        let time_limit_ms = test_case.time_limit_ms.unwrap_or(config.default_time_limit_ms);
        let spec = ExecutionSpec {
            command: build.plan.run.clone(),
            scratch: Scratch::Fresh {
                seed: build.plan.workdir.clone(),
            },
            stdin: test_case.input.clone(),
            limits: ExecutionLimits {
                time_ms: time_limit_ms.min(remaining_ms),
                memory_bytes: Some(
                    test_case
                        .memory_limit_bytes
                        .unwrap_or(config.default_memory_limit_bytes),
                ),
                output_bytes: config.max_output_bytes,
            },
            env: build.plan.env.clone(),
        };

        tracing::debug!(test = index, limits = ?spec.limits, "Running test");
        let outcome = match sandbox.execute(&spec).await {
            Ok(outcome) => evaluate(&outcome, test_case, config, spec.limits.time_ms < time_limit_ms),
            Err(e) => {
                tracing::error!(internal = true, test = index, error = %e, "Sandbox failed while running test");
                TestOutcome::with_diagnostic(Verdict::InternalError, "sandbox failure")
            }
        };
        tracing::debug!(test = index, verdict = %outcome.verdict, "Test finished");

        outcomes.push(outcome);
    }

    outcomes
}

fn evaluate(
    outcome: &ExecutionOutcome,
    test_case: &TestCase,
    config: &Config,
    clipped_by_budget: bool,
) -> TestOutcome {
    let verdict = comparator::judge(outcome, &test_case.expected_output, config.normalization);

    let diagnostic = match verdict {
        Verdict::Pass => None,
        Verdict::Fail => comparator::first_difference(
            &outcome.stdout,
            &test_case.expected_output,
            config.normalization,
        )
        .map(|diff| {
            if outcome.stdout_truncated {
                format!("{diff} (output truncated)")
            } else {
                diff
            }
        }),
        Verdict::TimedOut if clipped_by_budget => Some(BUDGET_EXHAUSTED.to_string()),
        Verdict::TimedOut => Some("time limit exceeded".to_string()),
        _ => Some(runtime_error_message(outcome)),
    };

    TestOutcome {
        verdict,
        diagnostic,
        elapsed_ms: outcome.elapsed_ms,
    }
}

fn runtime_error_message(outcome: &ExecutionOutcome) -> String {
    if outcome.reason == TerminationReason::MemoryExceeded {
        return "memory limit exceeded".to_string();
    }

    let stderr = outcome.stderr.trim_end();
    if !stderr.is_empty() {
        return clip(stderr, MAX_DIAGNOSTIC_BYTES);
    }

    match (outcome.exit_code, outcome.signal) {
        (_, Some(signal)) => format!("killed by signal {signal}"),
        (Some(code), None) => format!("exited with code {code}"),
        (None, None) => "process failed".to_string(),
    }
}

fn clip(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use itertools::Itertools;
    use uuid::Uuid;

    use super::*;
    use crate::{
        core::{
            domain::{Language, Submission},
            language::LanguageAdapter,
            pipeline::compiling,
            traits::sandbox::{MockSandbox, SandboxError},
        },
        stubs::sandbox::{completed, terminated},
    };

    fn test_case(input: &str, expected_output: &str) -> TestCase {
        TestCase {
            input: input.to_string(),
            expected_output: expected_output.to_string(),
            ..TestCase::default()
        }
    }

    async fn shell_build(config: &Config) -> Build {
        let submission = Submission {
            id: Uuid::new_v4(),
            received_at: chrono::Utc::now(),
            code: "read a b; echo $((a + b))".to_string(),
            language: Language::Shell,
            test_cases: vec![],
        };
        let adapter = LanguageAdapter::new(config.toolchains.clone());
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().never();
        compiling::build(&submission, config, &adapter, &sandbox, far_deadline())
            .await
            .unwrap()
    }

    fn config(scratch: &tempfile::TempDir) -> Config {
        Config {
            scratch_root: scratch.path().to_path_buf(),
            ..Config::default()
        }
    }

    /// Sandbox that adds the two numbers found on stdin.
    fn adding_sandbox() -> MockSandbox {
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().returning(|spec| {
            let sum: i64 = spec
                .stdin
                .split_whitespace()
                .filter_map(|n| n.parse::<i64>().ok())
                .sum();
            Ok(completed(&format!("{sum}\n")))
        });
        sandbox
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_addition_scenario() {
        let scratch = tempfile::tempdir().unwrap();
        let config = config(&scratch);
        let build = shell_build(&config).await;

        let cases = [
            test_case("1 2", "3"),
            test_case("2 3", "5"),
            test_case("3 3", "7"),
        ];
        let outcomes = run_tests(&cases, &build, &config, &adding_sandbox(), far_deadline()).await;

        assert_eq!(
            outcomes.iter().map(|o| o.verdict).collect_vec(),
            vec![Verdict::Pass, Verdict::Pass, Verdict::Fail]
        );
        assert_eq!(outcomes[0].diagnostic, None);
        assert_eq!(
            outcomes[2].diagnostic.as_deref(),
            Some(r#"line 1: expected "7", got "6""#)
        );
    }

    #[tokio::test]
    async fn test_each_test_gets_fresh_copy_of_build() {
        let scratch = tempfile::tempdir().unwrap();
        let config = config(&scratch);
        let build = shell_build(&config).await;
        let workdir = build.workdir.path().to_path_buf();

        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .withf(move |spec| {
                spec.scratch == Scratch::Fresh { seed: workdir.clone() }
                    && spec.command.args == vec!["main.sh".to_string()]
                    && spec.env.iter().any(|(k, _)| k == "PATH")
            })
            .times(3)
            .returning(|_| Ok(completed("")));

        let cases = vec![TestCase::default(); 3];
        let outcomes = run_tests(&cases, &build, &config, &sandbox, far_deadline()).await;
        assert_eq!(outcomes.len(), 3);
    }

    #[tokio::test]
    async fn test_failures_do_not_abort_siblings() {
        let scratch = tempfile::tempdir().unwrap();
        let config = config(&scratch);
        let build = shell_build(&config).await;

        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().returning(|spec| match spec.stdin.as_str() {
            "crash" => Ok(terminated(TerminationReason::ProcessError, "segfault\n")),
            "loop" => Ok(terminated(TerminationReason::TimedOut, "")),
            "alloc" => Ok(terminated(TerminationReason::MemoryExceeded, "")),
            "engine" => Err(SandboxError::Wait(std::io::Error::other("wait failed"))),
            _ => Ok(completed("ok\n")),
        });

        let cases = [
            test_case("crash", "ok"),
            test_case("loop", "ok"),
            test_case("alloc", "ok"),
            test_case("engine", "ok"),
            test_case("fine", "ok"),
        ];
        let outcomes = run_tests(&cases, &build, &config, &sandbox, far_deadline()).await;

        assert_eq!(
            outcomes.iter().map(|o| o.verdict).collect_vec(),
            vec![
                Verdict::RuntimeError,
                Verdict::TimedOut,
                Verdict::RuntimeError,
                Verdict::InternalError,
                Verdict::Pass,
            ]
        );
        assert_eq!(outcomes[0].diagnostic.as_deref(), Some("segfault"));
        assert_eq!(outcomes[1].diagnostic.as_deref(), Some("time limit exceeded"));
        assert_eq!(outcomes[2].diagnostic.as_deref(), Some("memory limit exceeded"));
    }

    #[tokio::test]
    async fn test_per_test_limits_override_defaults() {
        let scratch = tempfile::tempdir().unwrap();
        let config = Config {
            default_time_limit_ms: 2000,
            default_memory_limit_bytes: 64 * 1024 * 1024,
            ..config(&scratch)
        };
        let build = shell_build(&config).await;

        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .withf(|spec| spec.limits.time_ms == 500 && spec.limits.memory_bytes == Some(1 << 20))
            .times(1)
            .returning(|_| Ok(completed("")));
        sandbox
            .expect_execute()
            .withf(|spec| {
                spec.limits.time_ms == 2000 && spec.limits.memory_bytes == Some(64 * 1024 * 1024)
            })
            .times(1)
            .returning(|_| Ok(completed("")));

        let cases = [
            TestCase {
                time_limit_ms: Some(500),
                memory_limit_bytes: Some(1 << 20),
                ..TestCase::default()
            },
            TestCase::default(),
        ];
        run_tests(&cases, &build, &config, &sandbox, far_deadline()).await;
    }

    #[tokio::test]
    async fn test_budget_exhausted_skips_remaining_tests() {
        let scratch = tempfile::tempdir().unwrap();
        let config = config(&scratch);
        let build = shell_build(&config).await;

        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().never();

        let cases = vec![test_case("1 2", "3"); 4];
        let outcomes = run_tests(&cases, &build, &config, &sandbox, Instant::now()).await;

        assert!(outcomes.iter().all(|o| o.verdict == Verdict::TimedOut
            && o.diagnostic.as_deref() == Some(BUDGET_EXHAUSTED)));
    }

    #[tokio::test]
    async fn test_time_limit_is_clipped_to_remaining_budget() {
        let scratch = tempfile::tempdir().unwrap();
        let config = Config {
            default_time_limit_ms: 5000,
            ..config(&scratch)
        };
        let build = shell_build(&config).await;

        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .withf(|spec| spec.limits.time_ms <= 1000)
            .times(1)
            .returning(|_| Ok(terminated(TerminationReason::TimedOut, "")));

        let deadline = Instant::now() + Duration::from_millis(1000);
        let outcomes = run_tests(&[TestCase::default()], &build, &config, &sandbox, deadline).await;

        assert_eq!(outcomes[0].verdict, Verdict::TimedOut);
        assert_eq!(outcomes[0].diagnostic.as_deref(), Some(BUDGET_EXHAUSTED));
    }

    #[test]
    fn test_runtime_error_message() {
        let mut outcome = terminated(TerminationReason::ProcessError, "");
        assert_eq!(runtime_error_message(&outcome), "exited with code 1");

        outcome.exit_code = None;
        outcome.signal = Some(11);
        assert_eq!(runtime_error_message(&outcome), "killed by signal 11");

        outcome.stderr = "é".repeat(MAX_DIAGNOSTIC_BYTES);
        let message = runtime_error_message(&outcome);
        assert!(message.ends_with("..."));
        assert!(message.len() <= MAX_DIAGNOSTIC_BYTES + 3);
    }
}
