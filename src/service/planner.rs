//! Client for the upstream single-agent planner.
//!
//! With a credential configured, the run is POSTed to the planner service
//! and its reply is returned verbatim. Without one (or with
//! `FAKE_PLANNER=1`) the client degrades to synthetic mode: the
//! single-agent loop collapses to one inline `exec` invocation with the
//! user's instructions.

use serde::{Deserialize, Serialize};

use super::codex::{CodexTool, ExecContext};
use super::db::Store;
use super::events::{EventBroker, RunEvent};
use super::models::StepRole;
use crate::config::Settings;
use crate::errors::RunError;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerMessage {
    pub role: String,
    pub content: String,
}

/// What a planner round produced.
#[derive(Debug, Clone)]
pub struct PlannerOutcome {
    pub messages: Vec<PlannerMessage>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct RunnerRequest<'a> {
    messages: Vec<PlannerMessage>,
    context: RunnerContext<'a>,
}

#[derive(Debug, Serialize)]
struct RunnerContext<'a> {
    workspace: String,
    pattern_block: &'a str,
    base_prompt: &'a str,
    task_type: &'a str,
    profile: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prior_session_id: Option<&'a str>,
    run_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RunnerResponse {
    #[serde(default)]
    messages: Vec<PlannerMessage>,
    #[serde(default)]
    context: RunnerResponseContext,
}

#[derive(Debug, Default, Deserialize)]
struct RunnerResponseContext {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    tool_reports: Vec<RemoteToolReport>,
}

#[derive(Debug, Deserialize)]
struct RemoteToolReport {
    #[serde(default)]
    tool: String,
    #[serde(default)]
    ok: Option<bool>,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    notes: Vec<String>,
    #[serde(default)]
    artifact_path: Option<String>,
    #[serde(default)]
    bytes: Option<i64>,
}

pub struct PlannerClient {
    settings: Settings,
    codex: CodexTool,
    db: Store,
    events: Arc<EventBroker>,
    http: reqwest::Client,
}

impl PlannerClient {
    pub fn new(
        settings: Settings,
        codex: CodexTool,
        db: Store,
        events: Arc<EventBroker>,
    ) -> Self {
        Self {
            settings,
            codex,
            db,
            events,
            http: reqwest::Client::new(),
        }
    }

    /// Drive one planner round for the run. Cancellation is transitive:
    /// the `exec` primitive (invoked here in synthetic mode, or inside the
    /// upstream planner otherwise) observes the cancellation predicate.
    pub async fn dispatch(
        &self,
        ctx: &ExecContext,
        user_instructions: &str,
        pattern_block: &str,
    ) -> Result<PlannerOutcome, RunError> {
        if self.settings.planner_is_synthetic() {
            return self.dispatch_synthetic(ctx, user_instructions).await;
        }
        self.dispatch_remote(ctx, user_instructions, pattern_block)
            .await
    }

    async fn dispatch_synthetic(
        &self,
        ctx: &ExecContext,
        user_instructions: &str,
    ) -> Result<PlannerOutcome, RunError> {
        let report = self.codex.exec(ctx, user_instructions, None).await?;
        Ok(PlannerOutcome {
            messages: vec![PlannerMessage {
                role: "assistant".to_string(),
                content: report.summary,
            }],
            session_id: report.session_id,
        })
    }

    async fn dispatch_remote(
        &self,
        ctx: &ExecContext,
        user_instructions: &str,
        pattern_block: &str,
    ) -> Result<PlannerOutcome, RunError> {
        let request = RunnerRequest {
            messages: vec![PlannerMessage {
                role: "user".to_string(),
                content: user_instructions.to_string(),
            }],
            context: RunnerContext {
                workspace: ctx.workspace.display().to_string(),
                pattern_block,
                base_prompt: crate::config::BASE_PROMPT,
                task_type: ctx.task_type.as_str(),
                profile: &ctx.profile,
                prior_session_id: ctx.resume_session_id.as_deref(),
                run_id: &ctx.run_id,
            },
        };

        // No client-side timeout: cancellation is the only abort path for
        // long planner calls.
        let url = format!("{}/run", self.settings.runner_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| RunError::Runtime(format!("planner unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(RunError::Runtime(format!(
                "planner returned HTTP {}",
                response.status()
            )));
        }
        let body: RunnerResponse = response
            .json()
            .await
            .map_err(|e| RunError::Runtime(format!("planner response: {}", e)))?;

        for report in &body.context.tool_reports {
            self.persist_remote_report(&ctx.run_id, report).await;
        }

        Ok(PlannerOutcome {
            messages: body.messages,
            session_id: body.context.session_id,
        })
    }

    /// Persist a tool report returned by the remote planner as a tool step
    /// plus, when present, its artifact. Best-effort.
    async fn persist_remote_report(&self, run_id: &str, report: &RemoteToolReport) {
        let content = format!(
            "{} result",
            if report.tool.is_empty() { "tool" } else { &report.tool }
        );
        let stored = {
            let run_id = run_id.to_string();
            let content = content.clone();
            let files = report.files.clone();
            let notes = report.notes.clone();
            let ok = report.ok;
            self.db
                .with(move |store| {
                    store.append_step(&run_id, StepRole::Tool, &content, &files, &notes, ok)
                })
                .await
        };
        match stored {
            Ok(step) => {
                self.events.publish(
                    run_id,
                    RunEvent::Step {
                        run_id: run_id.to_string(),
                        step_id: step.id,
                        role: step.role,
                        content: step.content,
                        files: step.files,
                        notes: step.notes,
                    },
                );
            }
            Err(e) => eprintln!("[planner] failed to persist tool report: {:#}", e),
        }

        if let Some(path) = &report.artifact_path {
            let bytes = report.bytes.unwrap_or(0);
            let stored = {
                let run_id = run_id.to_string();
                let path = path.clone();
                self.db
                    .with(move |store| store.add_artifact(&run_id, "codex-jsonl", &path, bytes))
                    .await
            };
            match stored {
                Ok(artifact) => self.events.publish(
                    run_id,
                    RunEvent::Artifact {
                        run_id: run_id.to_string(),
                        artifact_id: artifact.id,
                        kind: artifact.kind,
                        path: artifact.path,
                        bytes,
                    },
                ),
                Err(e) => eprintln!("[planner] failed to register remote artifact: {:#}", e),
            }
        }
    }
}
