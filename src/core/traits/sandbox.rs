use crate::core::domain::{ExecutionOutcome, ExecutionSpec};

/// Runs one untrusted command under limits and reports how it ended.
///
/// Anything the submitted program does wrong (non-zero exit, timeout,
/// memory) is part of the [`ExecutionOutcome`]. An `Err` means the engine
/// itself failed and the command's behaviour is unknown.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    async fn execute(&self, spec: &ExecutionSpec) -> Result<ExecutionOutcome, SandboxError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to prepare scratch directory: {0}")]
    Workspace(#[source] std::io::Error),
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for sandboxed process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("namespace isolation is unavailable: {0}")]
    Isolation(#[source] std::io::Error),
}
