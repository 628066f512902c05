use std::time::Duration;

use crate::core::{
    domain::{ExecutionOutcome, ExecutionSpec, TerminationReason},
    traits::sandbox::{Sandbox, SandboxError},
};

/// Sandbox that sleeps for `delay` and then answers with a fixed outcome.
#[derive(Debug, Clone)]
pub struct SandboxStub {
    outcome: ExecutionOutcome,
    delay: Duration,
}

impl SandboxStub {
    pub fn new(outcome: ExecutionOutcome, delay: Duration) -> Self {
        Self { outcome, delay }
    }
}

#[async_trait::async_trait]
impl Sandbox for SandboxStub {
    #[tracing::instrument(skip(spec))]
    async fn execute(&self, spec: &ExecutionSpec) -> Result<ExecutionOutcome, SandboxError> {
        tracing::debug!("Start execution: command={:?}", spec.command);
        tokio::time::sleep(self.delay).await;
        tracing::debug!("Execution result: {:?}", self.outcome);

        Ok(self.outcome.clone())
    }
}

pub fn completed(stdout: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        stdout: stdout.to_string(),
        stderr: String::new(),
        stdout_truncated: false,
        stderr_truncated: false,
        exit_code: Some(0),
        signal: None,
        elapsed_ms: 5,
        peak_memory_bytes: 1024 * 1024,
        reason: TerminationReason::Completed,
    }
}

pub fn terminated(reason: TerminationReason, stderr: &str) -> ExecutionOutcome {
    ExecutionOutcome {
        stderr: stderr.to_string(),
        exit_code: match reason {
            TerminationReason::ProcessError => Some(1),
            _ => None,
        },
        signal: match reason {
            TerminationReason::TimedOut | TerminationReason::MemoryExceeded => Some(9),
            _ => None,
        },
        reason,
        ..completed("")
    }
}
