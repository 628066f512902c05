use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::Duration;

use tokio::{sync::Semaphore, time::Instant};

use crate::{
    config::Config,
    core::{
        aggregator,
        domain::{Report, Submission},
        language::LanguageAdapter,
        pipeline::{compiling, running},
        traits::sandbox::Sandbox,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("judge is overloaded, try again later")]
    Overloaded,
    #[error("judge is shutting down")]
    Closed,
}

/// Entry point of the engine: admits a submission, builds it once and runs
/// its test cases in order.
///
/// At most `max_concurrent_sandboxes` submissions are judged at the same
/// time and each one holds a single permit for its whole duration, so the
/// number of live sandboxes never exceeds the permit count.
#[derive(Debug)]
pub struct Judge {
    config: Arc<Config>,
    adapter: LanguageAdapter,
    sandbox: Arc<dyn Sandbox>,
    permits: Semaphore,
    waiting: AtomicUsize,
}

impl Judge {
    pub fn new(config: Arc<Config>, sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            adapter: LanguageAdapter::new(config.toolchains.clone()),
            permits: Semaphore::new(config.max_concurrent_sandboxes),
            waiting: AtomicUsize::new(0),
            config,
            sandbox,
        }
    }

    #[tracing::instrument(skip_all, fields(submission = %submission.id, language = %submission.language))]
    pub async fn judge(&self, submission: Submission) -> Result<Report, JudgeError> {
        let _permit = match self.permits.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                let _queued = QueueSlot::take(&self.waiting, self.config.max_queued_submissions)
                    .ok_or(JudgeError::Overloaded)?;
                tracing::debug!("Waiting for a free sandbox slot");
                self.permits
                    .acquire()
                    .await
                    .map_err(|_| JudgeError::Closed)?
            }
        };

        // The build and every test share one deadline.
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.submission_budget_ms);
        tracing::info!(
            tests = submission.test_cases.len(),
            waited_ms = (chrono::Utc::now() - submission.received_at).num_milliseconds(),
            "Judging submission"
        );

        let outcomes = match compiling::build(
            &submission,
            &self.config,
            &self.adapter,
            self.sandbox.as_ref(),
            deadline,
        )
        .await
        {
            Ok(build) => {
                running::run_tests(
                    &submission.test_cases,
                    &build,
                    &self.config,
                    self.sandbox.as_ref(),
                    deadline,
                )
                .await
            }
            Err(failure) => vec![failure; submission.test_cases.len()],
        };

        let report = aggregator::aggregate(submission.id, outcomes);
        tracing::info!(
            id = %report.submission_id,
            status = ?report.status,
            passed = report.passed,
            total = report.total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Submission judged"
        );

        Ok(report)
    }

    /// Stops admitting submissions; waiting ones fail with [`JudgeError::Closed`].
    pub fn close(&self) {
        self.permits.close();
    }
}

/// A reserved place in the admission queue, released on drop.
struct QueueSlot<'a>(&'a AtomicUsize);

impl<'a> QueueSlot<'a> {
    fn take(counter: &'a AtomicUsize, capacity: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |waiting| {
                (waiting < capacity).then_some(waiting + 1)
            })
            .ok()
            .map(|_| QueueSlot(counter))
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use itertools::Itertools;
    use uuid::Uuid;

    use super::*;
    use crate::{
        core::{
            domain::{
                ExecutionOutcome, ExecutionSpec, Language, SubmissionStatus, TerminationReason,
                TestCase, Verdict,
            },
            traits::sandbox::{MockSandbox, SandboxError},
        },
        stubs::sandbox::{SandboxStub, completed, terminated},
    };

    fn config(scratch: &tempfile::TempDir) -> Config {
        Config {
            scratch_root: scratch.path().to_path_buf(),
            ..Config::default()
        }
    }

    fn submission(language: Language, code: &str, test_count: usize) -> Submission {
        Submission {
            id: Uuid::new_v4(),
            received_at: chrono::Utc::now(),
            code: code.to_string(),
            language,
            test_cases: (0..test_count)
                .map(|i| TestCase {
                    input: i.to_string(),
                    expected_output: i.to_string(),
                    ..TestCase::default()
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_judge_runs_all_tests_in_order() {
        let scratch = tempfile::tempdir().unwrap();
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .returning(|spec| Ok(completed(&spec.stdin)));
        let judge = Judge::new(Arc::new(config(&scratch)), Arc::new(sandbox));

        let report = judge
            .judge(submission(Language::Python, "print(input())", 5))
            .await
            .unwrap();

        assert_eq!(report.status, SubmissionStatus::Passed);
        assert_eq!(report.passed, 5);
        assert_eq!(
            report.results.iter().map(|r| r.index).collect_vec(),
            (0..5).collect_vec()
        );
    }

    #[tokio::test]
    async fn test_compile_error_fans_out() {
        let scratch = tempfile::tempdir().unwrap();
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .times(1)
            .returning(|_| Ok(terminated(TerminationReason::ProcessError, "error: expected ';'")));
        let judge = Judge::new(Arc::new(config(&scratch)), Arc::new(sandbox));

        let report = judge
            .judge(submission(Language::GnuCpp, "int main() { return 0 }", 3))
            .await
            .unwrap();

        assert_eq!(report.status, SubmissionStatus::CompileError);
        assert_eq!(report.total, 3);
        assert!(report.results.iter().all(|r| r.verdict == Verdict::CompileError
            && r.diagnostic.as_deref() == Some("error: expected ';'")));
    }

    #[tokio::test]
    async fn test_sandbox_failure_during_build_fans_out_internal_error() {
        let scratch = tempfile::tempdir().unwrap();
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .returning(|_| Err(SandboxError::Workspace(std::io::Error::other("disk full"))));
        let judge = Judge::new(Arc::new(config(&scratch)), Arc::new(sandbox));

        let report = judge
            .judge(submission(Language::Rust, "fn main() {}", 2))
            .await
            .unwrap();

        assert_eq!(report.status, SubmissionStatus::InternalError);
        assert!(report.results.iter().all(|r| r.verdict == Verdict::InternalError));
    }

    #[tokio::test]
    async fn test_build_draws_on_submission_budget() {
        let scratch = tempfile::tempdir().unwrap();
        let config = Config {
            submission_budget_ms: 400,
            build_time_limit_ms: 15_000,
            ..config(&scratch)
        };
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_execute()
            .withf(|spec| spec.limits.time_ms <= 400)
            .times(1)
            .returning(|_| Ok(terminated(TerminationReason::TimedOut, "")));
        let judge = Judge::new(Arc::new(config), Arc::new(sandbox));

        let report = judge
            .judge(submission(Language::Rust, "fn main() { loop {} }", 2))
            .await
            .unwrap();

        assert!(report.results.iter().all(|r| r.verdict == Verdict::TimedOut
            && r.diagnostic.as_deref() == Some(crate::core::pipeline::BUDGET_EXHAUSTED)));
    }

    #[tokio::test]
    async fn test_build_directory_is_removed_after_judging() {
        let scratch = tempfile::tempdir().unwrap();
        let mut sandbox = MockSandbox::new();
        sandbox.expect_execute().returning(|_| Ok(completed("0")));
        let judge = Judge::new(Arc::new(config(&scratch)), Arc::new(sandbox));

        judge
            .judge(submission(Language::Shell, "echo 0", 1))
            .await
            .unwrap();

        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_overloaded_when_queue_is_full() {
        let scratch = tempfile::tempdir().unwrap();
        let config = Config {
            max_concurrent_sandboxes: 1,
            max_queued_submissions: 1,
            ..config(&scratch)
        };
        let sandbox = SandboxStub::new(completed("0"), Duration::from_millis(300));
        let judge = Judge::new(Arc::new(config), Arc::new(sandbox));

        let results = join_all([
            judge.judge(submission(Language::Shell, "echo 0", 1)),
            judge.judge(submission(Language::Shell, "echo 0", 1)),
            judge.judge(submission(Language::Shell, "echo 0", 1)),
        ])
        .await;

        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(JudgeError::Overloaded)));
    }

    #[tokio::test]
    async fn test_closed_judge_rejects_waiting_submissions() {
        let scratch = tempfile::tempdir().unwrap();
        let config = Config {
            max_concurrent_sandboxes: 1,
            ..config(&scratch)
        };
        let judge = Judge::new(
            Arc::new(config),
            Arc::new(SandboxStub::new(completed("0"), Duration::ZERO)),
        );
        judge.close();

        let result = judge.judge(submission(Language::Shell, "echo 0", 1)).await;
        assert!(matches!(result, Err(JudgeError::Closed)));
    }

    /// Counts how many executions overlap.
    #[derive(Debug, Default)]
    struct CountingSandbox {
        live: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Sandbox for CountingSandbox {
        async fn execute(&self, _spec: &ExecutionSpec) -> Result<ExecutionOutcome, SandboxError> {
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(live, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.live.fetch_sub(1, Ordering::SeqCst);
            Ok(completed("0"))
        }
    }

    #[tokio::test]
    async fn test_live_sandboxes_never_exceed_limit() {
        let scratch = tempfile::tempdir().unwrap();
        let config = Config {
            max_concurrent_sandboxes: 2,
            max_queued_submissions: 16,
            ..config(&scratch)
        };
        let sandbox = Arc::new(CountingSandbox::default());
        let judge = Judge::new(Arc::new(config), sandbox.clone());

        let results = join_all(
            (0..6).map(|_| judge.judge(submission(Language::Shell, "echo 0", 2))),
        )
        .await;

        assert!(results.iter().all(|r| r.is_ok()));
        let peak = sandbox.peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak of {peak} live sandboxes");
    }
}
