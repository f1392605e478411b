use thiserror::Error;

/// The error taxonomy surfaced to pipeline callers. Internal call chains within a
/// module keep using `anyhow::Result`; a result is converted to a `CoreError` only
/// once it crosses into the orchestrator's public surface (an `AgentExecution.error`
/// or a `PipelineRun` failure reason) so the kind survives structurally.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("budget exceeded: {limit_name} limit={limit}, usage={usage}")]
    BudgetExceeded {
        limit_name: String,
        limit: f64,
        usage: f64,
    },

    #[error("transient upstream error: {0}")]
    TransientUpstream(String),

    #[error("tool error: {0}")]
    ToolError(String),

    #[error("sandbox violation: {0}")]
    SandboxViolation(String),

    #[error("git unavailable")]
    GitUnavailable,

    #[error("storage conflict: {0}")]
    StorageConflict(String),

    #[error("aborted")]
    Aborted,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    /// The short reason string surfaced on a failed `PipelineRun`, never including
    /// key material, file contents, or prompts.
    pub fn reason(&self) -> String {
        match self {
            CoreError::Validation(_) => "validation".to_string(),
            CoreError::BudgetExceeded { .. } => "budget_exceeded".to_string(),
            CoreError::TransientUpstream(_) => "transient_upstream".to_string(),
            CoreError::ToolError(_) => "tool_error".to_string(),
            CoreError::SandboxViolation(_) => "sandbox_violation".to_string(),
            CoreError::GitUnavailable => "git_unavailable".to_string(),
            CoreError::StorageConflict(_) => "storage_conflict".to_string(),
            CoreError::Aborted => "aborted".to_string(),
            CoreError::Internal(_) => "internal".to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::TransientUpstream(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::StorageConflict(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
