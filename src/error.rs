//! Infrastructure failures and process exit statuses.
//!
//! Guard rejections are not errors (see [`crate::rejection::Rejection`]); the
//! types here cover conditions that end the whole invocation.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    /// A required external program is not on PATH
    #[error("required tool '{tool}' is not available on PATH")]
    ToolMissing { tool: String },

    /// Another invocation holds the working-tree lock
    #[error("another patchwarden run holds the lock at {}", path.display())]
    LockHeld { path: PathBuf },

    #[error("'{}' is not inside a git repository", path.display())]
    NotARepository { path: PathBuf },

    /// Protected paths still differ from the pre-change snapshot after a revert
    #[error("revert left protected paths modified: {}", paths.join(", "))]
    RevertIncomplete { paths: Vec<String> },

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Scope name that is not a single directory under the spec root
    #[error("scope '{spec}' must name one directory under the spec root")]
    InvalidScope { spec: String },
}

/// Terminal status reported to calling automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Green,
    PassBudgetExhausted,
    PatchRejected,
    InfrastructureUnavailable,
}

impl ExitStatus {
    /// Status of a finished invocation. Any error ends it as an
    /// infrastructure failure.
    pub fn of(result: &anyhow::Result<ExitStatus>) -> ExitStatus {
        match result {
            Ok(status) => *status,
            Err(_) => ExitStatus::InfrastructureUnavailable,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Green => 0,
            ExitStatus::PassBudgetExhausted => 1,
            ExitStatus::PatchRejected => 2,
            ExitStatus::InfrastructureUnavailable => 3,
        }
    }
}
