use tempfile::TempDir;
use tokio::time::Instant;

use crate::{
    config::Config,
    core::{
        domain::{
            ExecutionLimits, ExecutionSpec, RunPlan, Scratch, Submission, TerminationReason,
            TestOutcome, Verdict,
        },
        language::LanguageAdapter,
        pipeline::BUDGET_EXHAUSTED,
        traits::sandbox::Sandbox,
    },
};

/// A submission ready to run: its plan and the directory holding the source
/// and, for compiled languages, the built executable. The directory is
/// removed when the build is dropped.
#[derive(Debug)]
pub struct Build {
    pub workdir: TempDir,
    pub plan: RunPlan,
}

/// Writes the source into a new build directory and runs the plan's build
/// command there, if any.
///
/// The build shares the submission deadline with the tests: its time limit is
/// clipped to whatever is left. `Err` carries the outcome that every test case
/// of the submission gets.
#[tracing::instrument(skip_all, fields(submission = %submission.id, language = %submission.language))]
pub async fn build(
    submission: &Submission,
    config: &Config,
    adapter: &LanguageAdapter,
    sandbox: &dyn Sandbox,
    deadline: Instant,
) -> Result<Build, TestOutcome> {
    let workdir = create_workdir(config).await.map_err(|e| {
        tracing::error!(internal = true, error = %e, "Failed to create build directory");
        TestOutcome::with_diagnostic(Verdict::InternalError, "failed to prepare build directory")
    })?;

    let plan = adapter.plan(submission.language, &submission.code, workdir.path());
    tokio::fs::write(plan.workdir.join(&plan.source.name), &plan.source.contents)
        .await
        .map_err(|e| {
            tracing::error!(internal = true, error = %e, "Failed to write source file");
            TestOutcome::with_diagnostic(Verdict::InternalError, "failed to write source file")
        })?;

    let Some(command) = plan.build.clone() else {
        tracing::debug!("Nothing to build");
        return Ok(Build { workdir, plan });
    };

    let remaining_ms = deadline
        .saturating_duration_since(Instant::now())
        .as_millis() as u64;
    if remaining_ms == 0 {
        tracing::debug!("Skipping build, budget exhausted");
        return Err(TestOutcome::with_diagnostic(Verdict::TimedOut, BUDGET_EXHAUSTED));
    }
    let clipped_by_budget = remaining_ms < config.build_time_limit_ms;

    let spec = ExecutionSpec {
        command,
        scratch: Scratch::InPlace(plan.workdir.clone()),
        stdin: String::new(),
        limits: ExecutionLimits {
            time_ms: config.build_time_limit_ms.min(remaining_ms),
            memory_bytes: config.build_memory_limit_bytes,
            output_bytes: config.max_output_bytes,
        },
        env: plan.env.clone(),
    };

    tracing::debug!("Start compiling");
    let outcome = sandbox.execute(&spec).await.map_err(|e| {
        tracing::error!(internal = true, error = %e, "Sandbox failed during build");
        TestOutcome::with_diagnostic(Verdict::InternalError, "sandbox failure during build")
    })?;
    tracing::debug!(reason = ?outcome.reason, exit_code = ?outcome.exit_code, "Compilation finished");

    if outcome.succeeded() {
        return Ok(Build { workdir, plan });
    }
    if clipped_by_budget && outcome.reason == TerminationReason::TimedOut {
        return Err(TestOutcome {
            verdict: Verdict::TimedOut,
            diagnostic: Some(BUDGET_EXHAUSTED.to_string()),
            elapsed_ms: outcome.elapsed_ms,
        });
    }

    let diagnostic = match outcome.reason {
        TerminationReason::TimedOut => "build exceeded time limit".to_string(),
        TerminationReason::MemoryExceeded => "build exceeded memory limit".to_string(),
        TerminationReason::Completed | TerminationReason::ProcessError => {
            compiler_message(&outcome.stderr, &outcome.stdout, outcome.exit_code)
        }
    };

    Err(TestOutcome {
        verdict: Verdict::CompileError,
        diagnostic: Some(diagnostic),
        elapsed_ms: outcome.elapsed_ms,
    })
}

async fn create_workdir(config: &Config) -> std::io::Result<TempDir> {
    tokio::fs::create_dir_all(&config.scratch_root).await?;
    tempfile::Builder::new()
        .prefix("build-")
        .tempdir_in(&config.scratch_root)
}

fn compiler_message(stderr: &str, stdout: &str, exit_code: Option<i32>) -> String {
    let message = if stderr.trim().is_empty() { stdout } else { stderr };
    match (message.trim(), exit_code) {
        ("", Some(code)) => format!("build failed with exit code {code}"),
        ("", None) => "build failed".to_string(),
        (message, _) => message.to_string(),
    }
}
