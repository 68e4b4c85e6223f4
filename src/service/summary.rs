//! Deterministic machine summary of a terminal run.
//!
//! Pure data transformation over the run's final state: no I/O, no LLM
//! calls. The caller supplies the workspace listing so the function stays
//! total and side-effect-free.

use super::models::{
    Artifact, MachineSummary, Run, RunStatus, Step, StepRole, WorkspaceFile,
};

/// Extensions considered non-binary when picking a primary artifact.
const TEXT_EXTENSIONS: &[&str] = &["md", "txt", "csv", "json", "py", "rs", "js", "ts", "html"];

/// Build the machine summary for a finalized run.
pub fn build(
    run: &Run,
    instructions: &str,
    steps: &[Step],
    artifacts: &[Artifact],
    workspace_files: &[WorkspaceFile],
) -> MachineSummary {
    let goal = {
        let trimmed = instructions.trim();
        if trimmed.is_empty() {
            "No goal specified".to_string()
        } else {
            trimmed.to_string()
        }
    };

    let (primary, secondary) = identify_artifacts(steps, workspace_files);

    let execution_attempted = !steps.is_empty();
    let execution_succeeded = run.status == RunStatus::Succeeded;

    let (reason_for_failure, notes) = if execution_succeeded {
        (None, None)
    } else {
        analyze_failure(run, steps, artifacts)
    };

    MachineSummary {
        goal,
        primary_artifact: primary,
        secondary_artifacts: secondary,
        execution_attempted,
        execution_succeeded,
        reason_for_failure,
        notes,
    }
}

/// Primary-artifact selection:
/// (a) files named by the last assistant step, then
/// (b) the largest file on the non-binary extension allow-list, then
/// (c) the lexicographically first file. Ties break lexicographically.
/// The candidate pool is intersected with the step-reported touched-files
/// set when that set is non-empty.
fn identify_artifacts(
    steps: &[Step],
    workspace_files: &[WorkspaceFile],
) -> (Option<String>, Vec<String>) {
    let touched: Vec<&str> = steps
        .iter()
        .flat_map(|s| s.files.iter())
        .map(|f| f.as_str())
        .collect();

    let mut candidates: Vec<&WorkspaceFile> = workspace_files
        .iter()
        .filter(|f| !f.path.starts_with('.'))
        .collect();
    if !touched.is_empty() {
        let narrowed: Vec<&WorkspaceFile> = candidates
            .iter()
            .copied()
            .filter(|f| touched.iter().any(|t| *t == f.path || t.ends_with(&f.path)))
            .collect();
        if !narrowed.is_empty() {
            candidates = narrowed;
        }
    }
    candidates.sort_by(|a, b| a.path.cmp(&b.path));

    if candidates.is_empty() {
        return (None, Vec::new());
    }

    let last_assistant = steps
        .iter()
        .rev()
        .find(|s| s.role == StepRole::Assistant)
        .map(|s| s.content.as_str());

    let primary = last_assistant
        .and_then(|content| {
            candidates
                .iter()
                .find(|f| content.contains(file_name(&f.path)))
                .copied()
        })
        .or_else(|| {
            candidates
                .iter()
                .filter(|f| is_text_file(&f.path))
                .max_by(|a, b| {
                    a.size_bytes
                        .cmp(&b.size_bytes)
                        .then_with(|| b.path.cmp(&a.path))
                })
                .copied()
        })
        .unwrap_or(candidates[0]);

    let secondary: Vec<String> = candidates
        .iter()
        .filter(|f| f.path != primary.path)
        .map(|f| f.path.clone())
        .take(5)
        .collect();

    (Some(primary.path.clone()), secondary)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn is_text_file(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map(|ext| TEXT_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn analyze_failure(
    run: &Run,
    steps: &[Step],
    _artifacts: &[Artifact],
) -> (Option<String>, Option<String>) {
    if run.status == RunStatus::Cancelled {
        return (
            Some("CANCELLED".to_string()),
            Some("Run was cancelled by the caller".to_string()),
        );
    }
    if run.status != RunStatus::Failed {
        return (None, None);
    }

    // Prefer the structured error list; fall back to the last failed tool step.
    if let Some(first) = run.errors.first() {
        return (Some(first.code.clone()), Some(first.message.clone()));
    }

    let last_failed = steps
        .iter()
        .rev()
        .find(|s| s.role == StepRole::Tool && s.outcome_ok == Some(false));
    if let Some(step) = last_failed {
        let notes = if step.notes.is_empty() {
            format!("Tool step failed: {}", step.content)
        } else {
            step.notes.join("; ")
        };
        return (Some("TOOL_FAILURE".to_string()), Some(notes));
    }

    (
        Some("RUNTIME_ERROR".to_string()),
        Some("Run failed without specific error details".to_string()),
    )
}
