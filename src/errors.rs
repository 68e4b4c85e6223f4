//! Typed error taxonomy for run execution.
//!
//! `RunError` is the closed set of failure codes recorded on runs and
//! surfaced in machine summaries. Infrastructure plumbing uses `anyhow`;
//! anything that escapes a lifecycle stage is classified into one of
//! these variants before persistence.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while executing a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External CLI is not installed or not on PATH")]
    CodexNotInstalled,

    #[error("External CLI credential rejected: {0}")]
    CodexAuthRequired(String),

    #[error("Workspace path escaped the configured root: {0}")]
    WorkspacePathInvalid(String),

    #[error("Path traversal attempt: {0}")]
    PathTraversal(String),

    #[error("Source workspace for run {0} not found")]
    WorkspaceMissing(String),

    #[error("Filesystem access denied inside workspace: {0}")]
    PermissionError(String),

    #[error("CLI execution exceeded the wall-clock limit of {0}s")]
    Timeout(u64),

    #[error("CLI exited with code {code}: {detail}")]
    ToolFailure { code: i32, detail: String },

    #[error("Run was cancelled")]
    Cancelled,

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl RunError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::CodexNotInstalled => "CODEX_NOT_INSTALLED",
            Self::CodexAuthRequired(_) => "CODEX_AUTH_REQUIRED",
            Self::WorkspacePathInvalid(_) => "WORKSPACE_PATH_INVALID",
            Self::PathTraversal(_) => "PATH_TRAVERSAL",
            Self::WorkspaceMissing(_) => "WORKSPACE_MISSING",
            Self::PermissionError(_) => "PERMISSION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::ToolFailure { .. } => "TOOL_FAILURE",
            Self::Cancelled => "CANCELLED",
            Self::Runtime(_) => "RUNTIME_ERROR",
        }
    }

    /// Recovery hint surfaced alongside the error.
    pub fn recovery(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "Fix the request and resubmit; this is not retriable as-is.",
            Self::CodexNotInstalled => {
                "Install the codex CLI and make sure it is on the server's PATH."
            }
            Self::CodexAuthRequired(_) => {
                "Set OPENAI_API_KEY (or run `codex login`) on the server host."
            }
            Self::WorkspacePathInvalid(_) => {
                "Check the project and run identifiers; this usually indicates a bug."
            }
            Self::PathTraversal(_) => "The requested path is outside the workspace.",
            Self::WorkspaceMissing(_) => {
                "Check the source run id, or start without from_run_id."
            }
            Self::PermissionError(_) => "Check filesystem permissions under the workspace root.",
            Self::Timeout(_) => "Break the task into smaller runs or raise the profile timeout.",
            Self::ToolFailure { .. } => "Inspect the codex-jsonl artifact for details.",
            Self::Cancelled => "The run was cancelled by the caller.",
            Self::Runtime(_) => "Check server logs for details.",
        }
    }

    /// Convert into the persistable record shape.
    pub fn to_record(&self) -> RunErrorRecord {
        RunErrorRecord {
            code: self.code().to_string(),
            message: self.to_string(),
            recovery: Some(self.recovery().to_string()),
        }
    }
}

/// A structured error entry as stored on the run's error list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunErrorRecord {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RunError::InvalidInput("x".into()).code(), "INVALID_INPUT");
        assert_eq!(RunError::CodexNotInstalled.code(), "CODEX_NOT_INSTALLED");
        assert_eq!(
            RunError::CodexAuthRequired("bad key".into()).code(),
            "CODEX_AUTH_REQUIRED"
        );
        assert_eq!(RunError::Timeout(1800).code(), "TIMEOUT");
        assert_eq!(
            RunError::ToolFailure {
                code: 2,
                detail: "boom".into()
            }
            .code(),
            "TOOL_FAILURE"
        );
        assert_eq!(RunError::Cancelled.code(), "CANCELLED");
        assert_eq!(RunError::Runtime("x".into()).code(), "RUNTIME_ERROR");
    }

    #[test]
    fn record_carries_code_message_recovery() {
        let rec = RunError::Timeout(60).to_record();
        assert_eq!(rec.code, "TIMEOUT");
        assert!(rec.message.contains("60"));
        assert!(rec.recovery.is_some());
    }

    #[test]
    fn record_serializes_without_null_recovery() {
        let rec = RunErrorRecord {
            code: "CANCELLED".into(),
            message: "Run was cancelled".into(),
            recovery: None,
        };
        let json = serde_json::to_string(&rec).unwrap();
        assert!(!json.contains("recovery"));
    }

    #[test]
    fn tool_failure_message_contains_exit_code() {
        let err = RunError::ToolFailure {
            code: 3,
            detail: "no structured reason".into(),
        };
        assert!(err.to_string().contains('3'));
    }
}
