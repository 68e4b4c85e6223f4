//! Typed model of the external CLI's JSONL stream output.
//!
//! The CLI emits one JSON object per line when run with `--json`. Unknown
//! event and item kinds are tolerated so newer CLI versions don't break
//! ingestion.

use serde::Deserialize;

use crate::service::models::StepRole;

/// Events from the codex CLI's `--json` stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum CodexEvent {
    #[serde(rename = "thread.started")]
    ThreadStarted {
        #[serde(default)]
        thread_id: Option<String>,
    },

    #[serde(rename = "turn.started")]
    TurnStarted,

    #[serde(rename = "item.completed")]
    ItemCompleted { item: CodexItem },

    #[serde(rename = "turn.completed")]
    TurnCompleted,

    #[serde(rename = "run.failed")]
    RunFailed {
        #[serde(default)]
        error: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

/// A completed item within a turn.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum CodexItem {
    #[serde(rename = "agent_message")]
    AgentMessage {
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "reasoning")]
    Reasoning {
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "command_execution")]
    CommandExecution {
        #[serde(default)]
        command: String,
        #[serde(default)]
        exit_code: Option<i64>,
        #[serde(default)]
        aggregated_output: Option<String>,
    },

    #[serde(rename = "file_change")]
    FileChange {
        #[serde(default)]
        changes: Vec<FileChange>,
        #[serde(default)]
        status: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
pub struct FileChange {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// A step-shaped observation extracted from one stream event.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDraft {
    pub role: StepRole,
    pub content: String,
    pub files: Vec<String>,
    pub notes: Vec<String>,
    pub outcome_ok: bool,
}

impl CodexEvent {
    /// Convert a decoded event into a persistable step, if it represents one.
    ///
    /// Session metadata and turn boundaries produce no step; they are
    /// handled by the ingestion loop directly.
    pub fn to_step_draft(&self) -> Option<StepDraft> {
        match self {
            CodexEvent::ItemCompleted { item } => item.to_step_draft(),
            CodexEvent::RunFailed { error } => Some(StepDraft {
                role: StepRole::Tool,
                content: "run failed".to_string(),
                files: Vec::new(),
                notes: error.iter().map(|e| format!("error:{}", e)).collect(),
                outcome_ok: false,
            }),
            CodexEvent::Error { message } => Some(StepDraft {
                role: StepRole::Tool,
                content: message.clone().unwrap_or_else(|| "stream error".to_string()),
                files: Vec::new(),
                notes: Vec::new(),
                outcome_ok: false,
            }),
            _ => None,
        }
    }
}

impl CodexItem {
    fn to_step_draft(&self) -> Option<StepDraft> {
        match self {
            CodexItem::AgentMessage { text } => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    return None;
                }
                Some(StepDraft {
                    role: StepRole::Assistant,
                    content: trimmed.to_string(),
                    files: Vec::new(),
                    notes: Vec::new(),
                    outcome_ok: true,
                })
            }
            CodexItem::CommandExecution {
                command,
                exit_code,
                aggregated_output,
            } => {
                let exit = exit_code.unwrap_or(0);
                let mut notes = vec![format!("cmd:{} exit:{}", command.trim(), exit)];
                if let Some(out) = aggregated_output {
                    let excerpt: String = out.trim().chars().take(200).collect();
                    if !excerpt.is_empty() {
                        notes.push(format!("output:{}", excerpt));
                    }
                }
                Some(StepDraft {
                    role: StepRole::Tool,
                    content: command.trim().to_string(),
                    files: Vec::new(),
                    notes,
                    outcome_ok: exit == 0,
                })
            }
            CodexItem::FileChange { changes, status } => {
                let files: Vec<String> = changes
                    .iter()
                    .map(|c| c.path.clone())
                    .filter(|p| !p.is_empty())
                    .collect();
                let ok = status.as_deref() != Some("failed");
                let notes = changes
                    .iter()
                    .filter_map(|c| {
                        c.kind
                            .as_ref()
                            .map(|k| format!("{}:{}", k, c.path))
                    })
                    .collect();
                Some(StepDraft {
                    role: StepRole::Tool,
                    content: format!("edited {} file(s)", files.len()),
                    files,
                    notes,
                    outcome_ok: ok,
                })
            }
            // Reasoning traces are noise for the pattern pipeline.
            CodexItem::Reasoning { .. } | CodexItem::Unknown => None,
        }
    }
}
