use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::RunErrorRecord;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub task_type: TaskType,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Closed set of workflow domains. Selects the pattern extractor variant
/// and the domain instruction block composed into the system prompt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Research,
    Writing,
    DataAnalysis,
    DocumentProcessing,
    DocumentWriting,
    DocumentAnalysis,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Research => "research",
            Self::Writing => "writing",
            Self::DataAnalysis => "data_analysis",
            Self::DocumentProcessing => "document_processing",
            Self::DocumentWriting => "document_writing",
            Self::DocumentAnalysis => "document_analysis",
        }
    }

    /// Domain-specific instruction block appended to the composed system
    /// prompt after the base prompt.
    pub fn instructions(&self) -> &'static str {
        match self {
            Self::Code => {
                "Focus on the requested code changes. Run the relevant tests or \
                 commands to confirm your edits, and report the files you touched."
            }
            Self::Research => {
                "Gather sources before synthesizing. Record queries and URLs you \
                 used, cite sources inline, and write findings to a markdown file."
            }
            Self::Writing => {
                "Produce long-form prose in the requested tone. Draft into a \
                 markdown file, then revise for structure and clarity."
            }
            Self::DataAnalysis => {
                "Work with scripts, not ad-hoc shell pipelines. Save plots and \
                 tables as files and summarize the numbers you derived."
            }
            Self::DocumentProcessing => {
                "Convert or transform the given documents in place. Preserve \
                 content exactly unless asked otherwise; list every file written."
            }
            Self::DocumentWriting => {
                "Author the requested document from its template or outline. \
                 Keep formatting consistent and write the result to the workspace."
            }
            Self::DocumentAnalysis => {
                "Read the given documents fully before answering. Quote the \
                 passages your conclusions rest on and write the analysis to a file."
            }
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(Self::Code),
            "research" => Ok(Self::Research),
            "writing" => Ok(Self::Writing),
            "data_analysis" => Ok(Self::DataAnalysis),
            "document_processing" => Ok(Self::DocumentProcessing),
            "document_writing" => Ok(Self::DocumentWriting),
            "document_analysis" => Ok(Self::DocumentAnalysis),
            _ => Err(format!("Invalid task type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepRole {
    User,
    Assistant,
    Tool,
}

impl StepRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for StepRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            _ => Err(format!("Invalid step role: {}", s)),
        }
    }
}

/// One execution of an instruction under a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub task_type: TaskType,
    /// The original user instruction, verbatim.
    pub instructions: String,
    pub status: RunStatus,
    /// Non-decreasing 0..=100; reaches 100 exactly when the status is terminal.
    pub progress: i64,
    pub reference_run_id: Option<String>,
    pub source_run_id: Option<String>,
    pub system_instructions: Option<String>,
    pub session_id: Option<String>,
    pub had_errors: bool,
    pub errors: Vec<RunErrorRecord>,
    pub machine_summary: Option<MachineSummary>,
    pub cancel_requested: bool,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

/// One observed turn of the planner or CLI, persisted in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub run_id: String,
    pub seq: i64,
    pub role: StepRole,
    pub content: String,
    pub files: Vec<String>,
    pub notes: Vec<String>,
    pub outcome_ok: Option<bool>,
    pub created_at: String,
}

/// A persisted byte payload tied to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    pub kind: String,
    pub path: String,
    pub bytes: i64,
    pub created_at: String,
}

/// A cached pattern distilled from one successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: String,
    pub source_run_id: String,
    pub project_id: String,
    pub name: String,
    pub summary: String,
    pub steps: Vec<serde_json::Value>,
    pub variables: serde_json::Value,
    pub rendered: String,
    pub created_at: String,
}

/// Deterministic, machine-readable record of a terminal run's outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineSummary {
    pub goal: String,
    pub primary_artifact: Option<String>,
    pub secondary_artifacts: Vec<String>,
    pub execution_attempted: bool,
    pub execution_succeeded: bool,
    pub reason_for_failure: Option<String>,
    pub notes: Option<String>,
}

// API view types

#[derive(Debug, Clone, Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceListing {
    pub total_files: usize,
    pub files: Vec<WorkspaceFile>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkspaceFile {
    pub path: String,
    pub size_bytes: u64,
    #[serde(rename = "type")]
    pub mime: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_roundtrip() {
        for s in &["queued", "running", "succeeded", "failed", "cancelled"] {
            let parsed: RunStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_run_status_terminal() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_task_type_roundtrip() {
        for s in &[
            "code",
            "research",
            "writing",
            "data_analysis",
            "document_processing",
            "document_writing",
            "document_analysis",
        ] {
            let parsed: TaskType = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_step_role_roundtrip() {
        for s in &["user", "assistant", "tool"] {
            let parsed: StepRole = s.parse().unwrap();
            assert_eq!(parsed.as_str(), *s);
        }
        assert!("invalid".parse::<StepRole>().is_err());
    }

    #[test]
    fn test_serde_produces_snake_case_strings() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::to_string(&TaskType::DataAnalysis).unwrap(),
            "\"data_analysis\""
        );
        assert_eq!(serde_json::to_string(&StepRole::Tool).unwrap(), "\"tool\"");
    }

    #[test]
    fn test_every_task_type_has_instructions() {
        for t in [
            TaskType::Code,
            TaskType::Research,
            TaskType::Writing,
            TaskType::DataAnalysis,
            TaskType::DocumentProcessing,
            TaskType::DocumentWriting,
            TaskType::DocumentAnalysis,
        ] {
            assert!(!t.instructions().is_empty());
        }
    }

    #[test]
    fn test_workspace_file_serializes_type_field() {
        let f = WorkspaceFile {
            path: "a.txt".into(),
            size_bytes: 5,
            mime: "text/plain".into(),
        };
        let json = serde_json::to_string(&f).unwrap();
        assert!(json.contains("\"type\":\"text/plain\""));
        assert!(json.contains("\"size_bytes\":5"));
    }

    #[test]
    fn test_run_detail_flattens_run_fields() {
        let run = Run {
            id: "run-1".into(),
            project_id: "demo".into(),
            name: "n".into(),
            task_type: TaskType::Code,
            instructions: "touch hello.txt".into(),
            status: RunStatus::Queued,
            progress: 0,
            reference_run_id: None,
            source_run_id: None,
            system_instructions: None,
            session_id: None,
            had_errors: false,
            errors: vec![],
            machine_summary: None,
            cancel_requested: false,
            created_at: "2024-01-01T00:00:00Z".into(),
            started_at: None,
            finished_at: None,
        };
        let detail = RunDetail {
            run,
            artifacts: vec![],
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["id"], "run-1");
        assert_eq!(json["status"], "queued");
        assert!(json["artifacts"].as_array().unwrap().is_empty());
    }
}
