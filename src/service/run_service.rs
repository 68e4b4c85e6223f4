//! Run lifecycle orchestration: the single source of truth for state
//! transitions.
//!
//! `create_run` validates and persists the run, then launches the
//! lifecycle in a background task:
//!
//! ```text
//! queued ──► running ──► succeeded
//!                │   └─► failed
//!                └─► cancelled
//! ```
//!
//! Every path through the lifecycle runs finalization (diff summary,
//! pattern extraction for successes, machine summary, terminal status),
//! and every transition publishes a `status` event.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use regex::Regex;

use super::codex::{CancelRegistry, CodexTool, ExecContext};
use super::db::Store;
use super::events::{EventBroker, RunEvent};
use super::models::{Run, RunStatus, StepRole, TaskType};
use super::planner::PlannerClient;
use super::summary;
use super::workspace::WorkspaceManager;
use crate::config::{Settings, BASE_PROMPT};
use crate::errors::RunError;
use crate::patterns;
use crate::util::new_id;

static PROJECT_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

const MAX_INSTRUCTION_CHARS: usize = 10_000;

/// Validated input for run creation.
#[derive(Debug, Clone)]
pub struct CreateRunRequest {
    pub project_id: String,
    pub name: String,
    pub instructions: String,
    pub task_type: Option<String>,
    pub reference_run_id: Option<String>,
    pub from_run_id: Option<String>,
}

pub struct RunService {
    settings: Settings,
    db: Store,
    events: Arc<EventBroker>,
    workspaces: WorkspaceManager,
    planner: PlannerClient,
    registry: Arc<CancelRegistry>,
}

impl RunService {
    pub fn new(settings: Settings, db: Store, events: Arc<EventBroker>) -> Arc<Self> {
        let registry = Arc::new(CancelRegistry::new());
        let codex = CodexTool::new(
            settings.clone(),
            db.clone(),
            Arc::clone(&events),
            Arc::clone(&registry),
        );
        let planner = PlannerClient::new(settings.clone(), codex, db.clone(), Arc::clone(&events));
        let workspaces = WorkspaceManager::new(settings.workspace_root.clone());
        Arc::new(Self {
            settings,
            db,
            events,
            workspaces,
            planner,
            registry,
        })
    }

    pub fn events(&self) -> Arc<EventBroker> {
        Arc::clone(&self.events)
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Validate, persist as `queued`, and launch the lifecycle. Validation
    /// failures return `INVALID_INPUT` without side effects.
    pub async fn create_run(self: &Arc<Self>, req: CreateRunRequest) -> Result<Run, RunError> {
        if !PROJECT_ID_REGEX.is_match(&req.project_id) {
            return Err(RunError::InvalidInput(format!(
                "project id must match [A-Za-z0-9_-]{{1,64}}, got {:?}",
                req.project_id
            )));
        }
        let trimmed = req.instructions.trim();
        if trimmed.is_empty() || trimmed.chars().count() > MAX_INSTRUCTION_CHARS {
            return Err(RunError::InvalidInput(
                "instructions must be 1..=10000 characters".into(),
            ));
        }
        let requested_task_type = match &req.task_type {
            Some(raw) => Some(TaskType::from_str(raw).map_err(RunError::InvalidInput)?),
            None => None,
        };

        let run_id = new_id("run");
        let run = {
            let req = req.clone();
            let instructions = trimmed.to_string();
            let run_id = run_id.clone();
            self.db
                .with(move |store| {
                    // Projects are created on first reference.
                    let task_type = match store.get_project(&req.project_id)? {
                        Some(project) => requested_task_type.unwrap_or(project.task_type),
                        None => {
                            let task_type = requested_task_type.unwrap_or(TaskType::Code);
                            store.upsert_project(&req.project_id, &req.project_id, task_type)?;
                            task_type
                        }
                    };
                    store.create_run(
                        &run_id,
                        &req.project_id,
                        &req.name,
                        task_type,
                        &instructions,
                        req.reference_run_id.as_deref(),
                        req.from_run_id.as_deref(),
                    )
                })
                .await
                .map_err(|e| RunError::Runtime(format!("{:#}", e)))?
        };

        self.events.publish(
            &run.id,
            RunEvent::Status {
                run_id: run.id.clone(),
                status: run.status,
            },
        );

        let service = Arc::clone(self);
        let lifecycle_run = run.clone();
        tokio::spawn(async move {
            service.lifecycle(lifecycle_run).await;
        });

        Ok(run)
    }

    /// Set the durable cancellation flag, signal any live subprocess and
    /// publish `cancellation_requested`. Returns an error for runs already
    /// terminal; idempotent otherwise.
    pub async fn cancel(&self, run_id: &str) -> Result<Run, RunError> {
        let accepted = {
            let run_id = run_id.to_string();
            self.db
                .with(move |store| store.set_cancel_requested(&run_id))
                .await
                .map_err(|e| RunError::Runtime(format!("{:#}", e)))?
        };
        let run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunError::InvalidInput(format!("run {} not found", run_id)))?;
        if !accepted {
            return Err(RunError::InvalidInput(format!(
                "run {} is already {}",
                run_id, run.status
            )));
        }

        self.registry.request_cancel(run_id);
        self.events.publish(
            run_id,
            RunEvent::CancellationRequested {
                run_id: run_id.to_string(),
            },
        );
        Ok(run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, RunError> {
        let run_id = run_id.to_string();
        self.db
            .with(move |store| store.get_run(&run_id))
            .await
            .map_err(|e| RunError::Runtime(format!("{:#}", e)))
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    async fn lifecycle(&self, run: Run) {
        let started = Instant::now();
        let run_id = run.id.clone();

        let outcome = self.run_stages(&run).await;

        let (workspace, error) = match outcome {
            Ok(workspace) => (Some(workspace), None),
            Err(e) => (self.workspaces.path(&run.project_id, &run_id).ok(), Some(e)),
        };

        // Late cancellations observed here still finalize as cancelled.
        let cancelled = self.registry.is_cancelled(&run_id)
            || matches!(&error, Some(RunError::Cancelled));
        let target = if cancelled {
            RunStatus::Cancelled
        } else if error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        if let Some(err) = &error {
            if !matches!(err, RunError::Cancelled) {
                eprintln!("[run] {} failed: {:#}", run_id, err);
                self.record_error(&run_id, err).await;
            }
        }
        if cancelled {
            self.record_error(&run_id, &RunError::Cancelled).await;
        }

        self.finalize(&run_id, workspace.as_deref(), target, started)
            .await;
        self.registry.clear(&run_id);
    }

    /// Stages 1–4: workspace, compose, running transition, dispatch.
    /// Returns the workspace path for finalization.
    async fn run_stages(&self, run: &Run) -> Result<PathBuf, RunError> {
        let run_id = &run.id;

        // Stage 1: workspace preparation (progress 0 → 20).
        self.progress(run_id, "workspace_prep", 0, "Preparing workspace...", None)
            .await;
        let prepare = {
            let workspaces = self.workspaces.clone();
            let project_id = run.project_id.clone();
            let run_id = run_id.clone();
            let source = run.source_run_id.clone();
            tokio::task::spawn_blocking(move || {
                workspaces.prepare(&project_id, &run_id, source.as_deref())
            })
            .await
            .map_err(|e| RunError::Runtime(format!("prepare task: {}", e)))?
            .map_err(|e| match e.downcast::<RunError>() {
                Ok(run_err) => run_err,
                Err(other) => classify_io_error(&other),
            })?
        };

        if let Some(source_run_id) = &run.source_run_id {
            let action = if prepare.source_found { "cloned" } else { "clone-missing" };
            self.events.publish(
                run_id,
                RunEvent::Workspace {
                    run_id: run_id.clone(),
                    source_run_id: Some(source_run_id.clone()),
                    action: action.to_string(),
                    entries: prepare.cloned_entries.iter().take(10).cloned().collect(),
                    total_files: None,
                },
            );
        }
        let ready_message = if prepare.source_found {
            format!(
                "Cloned {} items from previous run",
                prepare.cloned_entries.len()
            )
        } else {
            "Workspace ready".to_string()
        };
        self.progress(run_id, "workspace_ready", 20, &ready_message, None)
            .await;
        self.check_cancelled(run_id)?;

        // Stage 2: compose system instructions (progress 20 → 30).
        let pattern_block = self.fetch_pattern_block(run).await;
        let system_instructions =
            compose_system_instructions(&pattern_block, run.task_type);
        {
            let run_id = run_id.clone();
            let text = system_instructions.clone();
            self.db
                .with(move |store| store.set_system_instructions(&run_id, &text))
                .await
                .map_err(|e| RunError::Runtime(format!("{:#}", e)))?;
        }

        // Stage 3: transition to running.
        let (_, changed) = {
            let run_id = run_id.clone();
            self.db
                .with(move |store| store.update_run_status(&run_id, RunStatus::Running))
                .await
                .map_err(|e| RunError::Runtime(format!("{:#}", e)))?
        };
        if changed {
            self.events.publish(
                run_id,
                RunEvent::Status {
                    run_id: run_id.clone(),
                    status: RunStatus::Running,
                },
            );
        }
        self.progress(run_id, "executing", 30, "Running the agent on your task...", None)
            .await;
        self.check_cancelled(run_id)?;

        // Stage 4: dispatch (progress 30 → 70).
        let resume_session_id = self.resume_session_for(run).await;
        let ctx = ExecContext {
            run_id: run_id.clone(),
            workspace: prepare.workspace.clone(),
            task_type: run.task_type,
            profile: self.settings.codex_profile.clone(),
            resume_session_id,
        };
        let outcome = self
            .planner
            .dispatch(&ctx, &run.instructions, &pattern_block)
            .await?;

        for message in &outcome.messages {
            let Ok(role) = StepRole::from_str(&message.role) else {
                continue;
            };
            let stored = {
                let run_id = run_id.clone();
                let content = message.content.clone();
                self.db
                    .with(move |store| {
                        store.append_step(&run_id, role, &content, &[], &[], None)
                    })
                    .await
            };
            match stored {
                Ok(step) => self.events.publish(
                    run_id,
                    RunEvent::Step {
                        run_id: run_id.clone(),
                        step_id: step.id,
                        role: step.role,
                        content: step.content,
                        files: step.files,
                        notes: step.notes,
                    },
                ),
                Err(e) => eprintln!("[run] {} failed to persist message: {:#}", run_id, e),
            }
        }
        if let Some(session) = &outcome.session_id {
            let run_id = run_id.clone();
            let session = session.clone();
            let _ = self
                .db
                .with(move |store| store.set_session_id(&run_id, &session))
                .await;
        }

        self.progress(run_id, "processing_results", 70, "Processing execution results...", None)
            .await;
        self.check_cancelled(run_id)?;

        Ok(prepare.workspace)
    }

    /// Stages 5–7: diff, pattern extraction, machine summary, terminal
    /// transition. Runs on every path; stage failures here are logged and
    /// never change the terminal status (except that patterns are only
    /// extracted for successful runs).
    async fn finalize(
        &self,
        run_id: &str,
        workspace: Option<&std::path::Path>,
        target: RunStatus,
        started: Instant,
    ) {
        // Stage 5: diff summary (progress 70 → 80).
        if let Some(workspace) = workspace {
            if let Some(diff) = self.workspaces.diff_summary(workspace).await {
                self.persist_diff(run_id, &diff).await;
            }
        }
        self.progress(run_id, "extracting_patterns", 80, "Learning patterns from this run...", None)
            .await;

        // Stage 6: pattern extraction, successes only (progress 80 → 95).
        if target == RunStatus::Succeeded {
            if let Err(e) = self.extract_pattern(run_id).await {
                eprintln!("[run] {} pattern extraction failed: {:#}", run_id, e);
            }
        }
        self.progress(run_id, "finalizing", 95, "Building run summary...", None)
            .await;

        // Stage 7: machine summary and terminal transition.
        let workspace_files = workspace
            .map(|w| self.workspaces.list_files(w).unwrap_or_default())
            .unwrap_or_default();

        let summary_result = {
            let run_id_owned = run_id.to_string();
            let files = workspace_files.clone();
            let target_status = target;
            self.db
                .with(move |store| {
                    let Some(mut run) = store.get_run(&run_id_owned)? else {
                        return Ok(());
                    };
                    // Build the summary against the status the run is about
                    // to take; the transition below makes it durable.
                    run.status = target_status;
                    let steps = store.list_steps(&run_id_owned)?;
                    let artifacts = store.list_artifacts(&run_id_owned)?;
                    let machine_summary = summary::build(
                        &run,
                        &run.instructions,
                        &steps,
                        &artifacts,
                        &files,
                    );
                    store.set_machine_summary(&run_id_owned, &machine_summary)
                })
                .await
        };
        if let Err(e) = summary_result {
            eprintln!("[run] {} machine summary failed: {:#}", run_id, e);
        }

        if !workspace_files.is_empty() {
            self.events.publish(
                run_id,
                RunEvent::Workspace {
                    run_id: run_id.to_string(),
                    source_run_id: None,
                    action: "summary".to_string(),
                    entries: workspace_files
                        .iter()
                        .take(20)
                        .map(|f| f.path.clone())
                        .collect(),
                    total_files: Some(workspace_files.len()),
                },
            );
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.progress(
            run_id,
            "complete",
            100,
            &format!("Run completed in {:.1}s", elapsed),
            Some(elapsed),
        )
        .await;

        let transition = {
            let run_id = run_id.to_string();
            self.db
                .with(move |store| store.update_run_status(&run_id, target))
                .await
        };
        match transition {
            Ok((run, _)) => self.events.publish(
                run_id,
                RunEvent::Status {
                    run_id: run_id.to_string(),
                    status: run.status,
                },
            ),
            Err(e) => eprintln!("[run] {} terminal transition failed: {:#}", run_id, e),
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────

    fn check_cancelled(&self, run_id: &str) -> Result<(), RunError> {
        if self.registry.is_cancelled(run_id) {
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn progress(
        &self,
        run_id: &str,
        stage: &str,
        percent: i64,
        message: &str,
        elapsed: Option<f64>,
    ) {
        {
            let run_id = run_id.to_string();
            let _ = self
                .db
                .with(move |store| store.update_run_progress(&run_id, percent))
                .await;
        }
        self.events.publish(
            run_id,
            RunEvent::Progress {
                run_id: run_id.to_string(),
                stage: stage.to_string(),
                percent,
                message: message.to_string(),
                elapsed,
            },
        );
    }

    /// Rendered pattern block for the referenced run, or empty.
    async fn fetch_pattern_block(&self, run: &Run) -> String {
        let Some(reference) = run.reference_run_id.clone() else {
            return String::new();
        };
        let record = self
            .db
            .with(move |store| store.get_pattern(&reference))
            .await;
        match record {
            Ok(Some(pattern)) => pattern.rendered,
            Ok(None) => String::new(),
            Err(e) => {
                eprintln!("[run] {} pattern lookup failed: {:#}", run.id, e);
                String::new()
            }
        }
    }

    /// Upstream session id of the referenced run, for CLI resume.
    async fn resume_session_for(&self, run: &Run) -> Option<String> {
        let reference = run.reference_run_id.clone()?;
        self.db
            .with(move |store| store.get_run(&reference))
            .await
            .ok()
            .flatten()
            .and_then(|r| r.session_id)
    }

    async fn record_error(&self, run_id: &str, error: &RunError) {
        let record = error.to_record();
        self.events.publish(
            run_id,
            RunEvent::Error {
                run_id: run_id.to_string(),
                code: record.code.clone(),
                message: record.message.clone(),
                recovery: record.recovery.clone(),
            },
        );
        let run_id = run_id.to_string();
        if let Err(e) = self
            .db
            .with(move |store| store.record_error(&run_id, &record))
            .await
        {
            eprintln!("[run] failed to record error: {:#}", e);
        }
    }

    async fn persist_diff(&self, run_id: &str, diff: &super::workspace::DiffSummary) {
        let path = self
            .settings
            .artifacts_root
            .join(format!("{}-diff.json", run_id));
        let payload = match serde_json::to_string_pretty(diff) {
            Ok(json) => json,
            Err(e) => {
                eprintln!("[run] {} diff serialization failed: {}", run_id, e);
                return;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(&self.settings.artifacts_root).await {
            eprintln!("[run] artifacts root: {}", e);
            return;
        }
        if let Err(e) = tokio::fs::write(&path, &payload).await {
            eprintln!("[run] {} diff artifact write failed: {}", run_id, e);
            return;
        }

        let stored = {
            let run_id = run_id.to_string();
            let path = path.display().to_string();
            let bytes = payload.len() as i64;
            self.db
                .with(move |store| store.add_artifact(&run_id, "diff-summary", &path, bytes))
                .await
        };
        match stored {
            Ok(artifact) => {
                self.events.publish(
                    run_id,
                    RunEvent::Artifact {
                        run_id: run_id.to_string(),
                        artifact_id: artifact.id.clone(),
                        kind: artifact.kind.clone(),
                        path: artifact.path.clone(),
                        bytes: artifact.bytes,
                    },
                );
                self.events.publish(
                    run_id,
                    RunEvent::Diff {
                        run_id: run_id.to_string(),
                        summary: serde_json::to_value(diff).unwrap_or_default(),
                    },
                );
            }
            Err(e) => eprintln!("[run] {} diff artifact registration failed: {:#}", run_id, e),
        }
    }

    async fn extract_pattern(&self, run_id: &str) -> anyhow::Result<()> {
        let run_id = run_id.to_string();
        self.db
            .with(move |store| {
                let Some(run) = store.get_run(&run_id)? else {
                    return Ok(());
                };
                let steps = store.list_steps(&run_id)?;
                let Some(pattern) = patterns::extract_pattern_from_steps(
                    &run_id,
                    &steps,
                    &run.instructions,
                    run.task_type,
                ) else {
                    return Ok(());
                };
                store.insert_pattern(&pattern.to_record(&run.project_id))
            })
            .await
    }
}

/// `pattern_block ⊕ base_prompt ⊕ domain_instructions`, skipping the
/// pattern block when no reference pattern exists.
pub fn compose_system_instructions(pattern_block: &str, task_type: TaskType) -> String {
    let mut parts = Vec::new();
    let trimmed = pattern_block.trim();
    if !trimmed.is_empty() {
        parts.push(trimmed);
    }
    parts.push(BASE_PROMPT);
    parts.push(task_type.instructions());
    parts.join("\n\n")
}

fn classify_io_error(error: &anyhow::Error) -> RunError {
    for cause in error.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::PermissionDenied {
                return RunError::PermissionError(error.to_string());
            }
        }
    }
    RunError::Runtime(format!("{:#}", error))
}
