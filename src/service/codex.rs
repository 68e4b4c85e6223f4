//! The `exec` primitive: the planner's only tool.
//!
//! Launches the external codex CLI non-interactively, streams its JSONL
//! output line by line, persists one step per decoded event, registers the
//! raw stream as a `codex-jsonl` artifact on every exit path, and honors
//! cooperative cancellation between lines.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

use super::db::Store;
use super::events::{EventBroker, RunEvent};
use super::models::{StepRole, TaskType};
use crate::config::Settings;
use crate::errors::RunError;
use crate::stream::{CodexEvent, StepDraft};
use crate::util::new_id;

/// How long a cancelled subprocess gets to exit after SIGTERM.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Context bundle threaded from the run lifecycle into the tool.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub run_id: String,
    pub workspace: PathBuf,
    pub task_type: TaskType,
    pub profile: String,
    pub resume_session_id: Option<String>,
}

/// What one tool invocation produced, summarized for the planner.
#[derive(Debug, Clone)]
pub struct ToolReport {
    pub ok: bool,
    pub files: Vec<String>,
    pub notes: Vec<String>,
    pub artifact_path: String,
    pub bytes: i64,
    pub session_id: Option<String>,
    pub summary: String,
}

/// Process-wide guard for cooperative cancellation.
///
/// Holds the cancellation flags and the pid of any live subprocess per
/// run. Registration happens before the first read; deregistration is
/// guaranteed on every exit path of the ingestion loop.
#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    flags: HashSet<String>,
    pids: HashMap<String, u32>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the run as cancelled and signal its subprocess if one is live.
    /// Idempotent; returns true when a subprocess was signaled.
    pub fn request_cancel(&self, run_id: &str) -> bool {
        let pid = {
            let mut inner = self.inner.lock().expect("cancel registry poisoned");
            inner.flags.insert(run_id.to_string());
            inner.pids.get(run_id).copied()
        };
        match pid {
            Some(pid) => {
                let _ = std::process::Command::new("kill").arg(pid.to_string()).status();
                true
            }
            None => false,
        }
    }

    pub fn is_cancelled(&self, run_id: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.flags.contains(run_id))
            .unwrap_or(false)
    }

    fn register_pid(&self, run_id: &str, pid: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pids.insert(run_id.to_string(), pid);
        }
    }

    fn deregister_pid(&self, run_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.pids.remove(run_id);
        }
    }

    /// Clear all state for a run once it reaches a terminal status.
    pub fn clear(&self, run_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.flags.remove(run_id);
            inner.pids.remove(run_id);
        }
    }

    #[cfg(test)]
    pub fn live_pid_count(&self) -> usize {
        self.inner.lock().map(|i| i.pids.len()).unwrap_or(0)
    }
}

enum LoopEnd {
    Eof,
    Cancelled,
}

#[derive(Clone)]
pub struct CodexTool {
    settings: Settings,
    db: Store,
    events: Arc<EventBroker>,
    registry: Arc<CancelRegistry>,
}

impl CodexTool {
    pub fn new(
        settings: Settings,
        db: Store,
        events: Arc<EventBroker>,
        registry: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            settings,
            db,
            events,
            registry,
        }
    }

    pub fn registry(&self) -> Arc<CancelRegistry> {
        Arc::clone(&self.registry)
    }

    /// Execute the CLI with a prompt and ingest its stream.
    ///
    /// The JSONL artifact is registered on every exit path, including
    /// failures, timeout and cancellation.
    pub async fn exec(
        &self,
        ctx: &ExecContext,
        prompt: &str,
        profile_override: Option<&str>,
    ) -> Result<ToolReport, RunError> {
        let artifact_path = self
            .settings
            .artifacts_root
            .join(format!("{}-codex-{}.jsonl", ctx.run_id, &new_id("x")[2..10]));
        tokio::fs::create_dir_all(&self.settings.artifacts_root)
            .await
            .map_err(|e| RunError::Runtime(format!("artifacts root: {}", e)))?;

        if self.settings.fake_codex {
            return self.exec_fake(ctx, prompt, &artifact_path).await;
        }

        let profile = profile_override.unwrap_or(&ctx.profile);
        let mut notes = vec![format!("profile:{}", profile)];
        self.ensure_login().await?;

        let has_git = ctx.workspace.join(".git").exists();
        let skip_git_check = !self.settings.require_git_repo || !has_git;

        let mut cmd = Command::new(&self.settings.codex_cmd);
        cmd.arg("exec")
            .arg("--json")
            .arg("--cd")
            .arg(&ctx.workspace)
            .arg("--full-auto");
        if skip_git_check {
            cmd.arg("--skip-git-repo-check");
            notes.push("skip-git-repo-check".to_string());
        }
        if let Some(session) = &ctx.resume_session_id {
            cmd.arg("resume").arg(session);
        }
        cmd.arg(prompt);
        if let Some(key) = &self.settings.openai_api_key {
            cmd.env("OPENAI_API_KEY", key);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => RunError::CodexNotInstalled,
            std::io::ErrorKind::PermissionDenied => {
                RunError::PermissionError(self.settings.codex_cmd.clone())
            }
            _ => RunError::Runtime(format!("failed to spawn CLI: {}", e)),
        })?;

        if let Some(pid) = child.id() {
            self.registry.register_pid(&ctx.run_id, pid);
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Runtime("failed to capture CLI stdout".into()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut artifact_file = tokio::fs::File::create(&artifact_path)
            .await
            .map_err(|e| RunError::Runtime(format!("artifact file: {}", e)))?;

        let mut ok = true;
        let mut files: Vec<String> = Vec::new();
        let mut session_id: Option<String> = None;

        let run_id = ctx.run_id.clone();
        let registry = Arc::clone(&self.registry);
        let ingest = async {
            while let Some(line) = lines
                .next_line()
                .await
                .context("Failed to read CLI stdout line")?
            {
                if registry.is_cancelled(&run_id) {
                    return Ok(LoopEnd::Cancelled);
                }
                artifact_file
                    .write_all(line.as_bytes())
                    .await
                    .context("Failed to write artifact line")?;
                artifact_file
                    .write_all(b"\n")
                    .await
                    .context("Failed to write artifact line")?;

                let event: CodexEvent = match serde_json::from_str(&line) {
                    Ok(event) => event,
                    Err(_) => continue,
                };
                match &event {
                    CodexEvent::ThreadStarted { thread_id } => {
                        session_id = thread_id.clone().or(session_id.take());
                    }
                    CodexEvent::RunFailed { .. } | CodexEvent::Error { .. } => {
                        ok = false;
                    }
                    _ => {}
                }
                if let Some(draft) = event.to_step_draft() {
                    if !draft.outcome_ok {
                        ok = false;
                    }
                    files.extend(draft.files.iter().cloned());
                    self.persist_step(&run_id, &draft).await?;
                }
            }
            // A cancel that arrived while blocked on the read shows up as
            // EOF after the subprocess was signalled; still honor it.
            if registry.is_cancelled(&run_id) {
                return Ok(LoopEnd::Cancelled);
            }
            Ok::<LoopEnd, anyhow::Error>(LoopEnd::Eof)
        };

        let timeout = Duration::from_secs(self.settings.codex_timeout_secs);
        let loop_result = tokio::time::timeout(timeout, ingest).await;
        let _ = artifact_file.flush().await;
        drop(artifact_file);

        let end = match loop_result {
            Err(_) => {
                // Wall-clock limit hit mid-stream.
                self.registry.deregister_pid(&ctx.run_id);
                let _ = child.kill().await;
                notes.push("timeout".to_string());
                self.register_artifact(ctx, &artifact_path, &mut notes).await;
                return Err(RunError::Timeout(self.settings.codex_timeout_secs));
            }
            Ok(Err(e)) => {
                self.registry.deregister_pid(&ctx.run_id);
                let _ = child.kill().await;
                self.register_artifact(ctx, &artifact_path, &mut notes).await;
                return Err(RunError::Runtime(format!("{:#}", e)));
            }
            Ok(Ok(end)) => end,
        };

        if let LoopEnd::Cancelled = end {
            terminate_child(&mut child).await;
            self.registry.deregister_pid(&ctx.run_id);
            notes.push("cancelled-by-user".to_string());
            self.register_artifact(ctx, &artifact_path, &mut notes).await;
            return Err(RunError::Cancelled);
        }

        let stderr_excerpt = match child.stderr.take() {
            Some(stderr) => read_excerpt(stderr).await,
            None => String::new(),
        };
        let status = child.wait().await;
        self.registry.deregister_pid(&ctx.run_id);

        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        if let Some(code) = exit_code.filter(|c| *c != 0) {
            ok = false;
            notes.push(format!("codex-exit-{}", code));
        }
        if !stderr_excerpt.is_empty() {
            notes.push(format!("stderr:{}", stderr_excerpt));
        }

        let bytes = self.register_artifact(ctx, &artifact_path, &mut notes).await;

        if let Some(session) = &session_id {
            let run_id = ctx.run_id.clone();
            let session = session.clone();
            let _ = self
                .db
                .with(move |store| store.set_session_id(&run_id, &session))
                .await;
        }

        match exit_code {
            Some(0) | None if ok => Ok(ToolReport {
                ok: true,
                summary: format!(
                    "codex_exec(ok=true, exit={}, files={})",
                    exit_code.unwrap_or(0),
                    files.len()
                ),
                files,
                notes,
                artifact_path: artifact_path.display().to_string(),
                bytes,
                session_id,
            }),
            Some(code) if code != 0 => {
                if stderr_excerpt.to_lowercase().contains("permission denied") {
                    return Err(RunError::PermissionError(stderr_excerpt));
                }
                Err(RunError::ToolFailure {
                    code,
                    detail: if stderr_excerpt.is_empty() {
                        "no structured reason".to_string()
                    } else {
                        stderr_excerpt
                    },
                })
            }
            // Zero exit but a run.failed/error event in the stream.
            _ => Err(RunError::ToolFailure {
                code: exit_code.unwrap_or(0),
                detail: "stream reported failure".to_string(),
            }),
        }
    }

    async fn exec_fake(
        &self,
        ctx: &ExecContext,
        prompt: &str,
        artifact_path: &std::path::Path,
    ) -> Result<ToolReport, RunError> {
        let payload = serde_json::json!({
            "type": "run.end",
            "status": "succeeded",
            "prompt": prompt,
        });
        tokio::fs::write(artifact_path, format!("{}\n", payload))
            .await
            .map_err(|e| RunError::Runtime(format!("fake artifact: {}", e)))?;

        let draft = StepDraft {
            role: StepRole::Tool,
            content: "codex_exec(fake)".to_string(),
            files: Vec::new(),
            notes: vec!["fake-codex-mode".to_string()],
            outcome_ok: true,
        };
        self.persist_step(&ctx.run_id, &draft)
            .await
            .map_err(|e| RunError::Runtime(format!("{:#}", e)))?;

        let mut notes = vec!["fake-codex-mode".to_string()];
        let bytes = self.register_artifact(ctx, artifact_path, &mut notes).await;

        Ok(ToolReport {
            ok: true,
            files: Vec::new(),
            notes,
            artifact_path: artifact_path.display().to_string(),
            bytes,
            session_id: None,
            summary: "codex_exec(fake)".to_string(),
        })
    }

    /// Probe CLI authentication; retry the login exactly once with the
    /// configured credential before giving up.
    async fn ensure_login(&self) -> Result<(), RunError> {
        let status = Command::new(&self.settings.codex_cmd)
            .args(["login", "status"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RunError::CodexNotInstalled,
                _ => RunError::Runtime(format!("login probe: {}", e)),
            })?;
        if status.success() {
            return Ok(());
        }

        let key = self
            .settings
            .openai_api_key
            .clone()
            .ok_or_else(|| RunError::CodexAuthRequired("no credential configured".into()))?;

        let mut child = Command::new(&self.settings.codex_cmd)
            .args(["login", "--with-api-key"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RunError::Runtime(format!("login spawn: {}", e)))?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(format!("{}\n", key).as_bytes()).await;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| RunError::Runtime(format!("login wait: {}", e)))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(RunError::CodexAuthRequired(
                stderr.trim().chars().take(200).collect(),
            ))
        }
    }

    async fn persist_step(&self, run_id: &str, draft: &StepDraft) -> anyhow::Result<()> {
        let step = {
            let run_id = run_id.to_string();
            let draft = draft.clone();
            self.db
                .with(move |store| {
                    store.append_step(
                        &run_id,
                        draft.role,
                        &draft.content,
                        &draft.files,
                        &draft.notes,
                        Some(draft.outcome_ok),
                    )
                })
                .await?
        };
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
        Ok(())
    }

    /// Stat and register the JSONL artifact; best-effort, never fails the
    /// surrounding exec path.
    async fn register_artifact(
        &self,
        ctx: &ExecContext,
        path: &std::path::Path,
        notes: &mut Vec<String>,
    ) -> i64 {
        let bytes = tokio::fs::metadata(path)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(0);
        let run_id = ctx.run_id.clone();
        let path_str = path.display().to_string();
        let stored = self
            .db
            .with(move |store| store.add_artifact(&run_id, "codex-jsonl", &path_str, bytes))
            .await;
        match stored {
            Ok(artifact) => {
                self.events.publish(
                    &ctx.run_id,
                    RunEvent::Artifact {
                        run_id: ctx.run_id.clone(),
                        artifact_id: artifact.id,
                        kind: artifact.kind,
                        path: artifact.path,
                        bytes,
                    },
                );
            }
            Err(e) => {
                eprintln!("[codex] failed to register artifact: {:#}", e);
                notes.push("artifact-registration-failed".to_string());
            }
        }
        bytes
    }
}

/// SIGTERM, then up to five seconds of grace, then SIGKILL.
async fn terminate_child(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = Command::new("kill").arg(pid.to_string()).status().await;
    }
    if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

async fn read_excerpt(stderr: tokio::process::ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut content = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        content.push_str(&line);
        content.push('\n');
        if content.len() > 2000 {
            break;
        }
    }
    content.trim().chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn harness(settings: Settings) -> (CodexTool, Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            artifacts_root: dir.path().join("artifacts"),
            ..settings
        };
        let db = Store::new_in_memory().unwrap();
        db.upsert_project("demo", "Demo", TaskType::Code).unwrap();
        db.create_run("run-1", "demo", "n", TaskType::Code, "do it", None, None)
            .unwrap();
        let tool = CodexTool::new(
            settings,
            db.clone(),
            Arc::new(EventBroker::new()),
            Arc::new(CancelRegistry::new()),
        );
        (tool, db, dir)
    }

    fn ctx(dir: &tempfile::TempDir) -> ExecContext {
        let workspace = dir.path().join("ws");
        std::fs::create_dir_all(&workspace).unwrap();
        ExecContext {
            run_id: "run-1".into(),
            workspace,
            task_type: TaskType::Code,
            profile: "batch".into(),
            resume_session_id: None,
        }
    }

    /// Write an executable stub that answers the `login status` probe and
    /// then runs the given body for `exec` invocations.
    fn write_stub(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("codex-stub.sh");
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"login\" ]; then exit 0; fi\n{}\n",
            body
        );
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    #[tokio::test]
    async fn test_fake_mode_skips_subprocess() {
        let (tool, db, dir) = harness(Settings {
            fake_codex: true,
            ..Settings::default()
        });
        let report = tool.exec(&ctx(&dir), "touch hello.txt", None).await.unwrap();

        assert!(report.ok);
        assert_eq!(report.summary, "codex_exec(fake)");
        assert!(report.bytes > 0);

        let store = &db;
        let steps = store.list_steps("run-1").unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].content, "codex_exec(fake)");
        assert_eq!(steps[0].notes, vec!["fake-codex-mode"]);

        let artifacts = store.list_artifacts("run-1").unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].kind, "codex-jsonl");
    }

    #[tokio::test]
    async fn test_streaming_persists_one_step_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            &dir,
            r#"echo '{"type":"thread.started","thread_id":"th_9"}'
echo '{"type":"item.completed","item":{"type":"command_execution","command":"touch a.txt","exit_code":0}}'
echo '{"type":"item.completed","item":{"type":"agent_message","text":"Done"}}'
exit 0"#,
        );
        let (tool, db, dir) = harness(Settings {
            codex_cmd: stub,
            ..Settings::default()
        });
        let report = tool.exec(&ctx(&dir), "do it", None).await.unwrap();

        assert!(report.ok);
        assert_eq!(report.session_id.as_deref(), Some("th_9"));
        assert!(report.summary.contains("ok=true"));

        let store = &db;
        let steps = store.list_steps("run-1").unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].role, StepRole::Tool);
        assert_eq!(steps[1].role, StepRole::Assistant);
        assert_eq!(steps[1].content, "Done");

        let run = store.get_run("run-1").unwrap().unwrap();
        assert_eq!(run.session_id.as_deref(), Some("th_9"));

        let artifacts = store.list_artifacts("run-1").unwrap();
        assert_eq!(artifacts.len(), 1);
        let raw = std::fs::read_to_string(&artifacts[0].path).unwrap();
        assert_eq!(raw.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_nonzero_exit_maps_to_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(&dir, "echo oops >&2\nexit 3");
        let (tool, db, dir) = harness(Settings {
            codex_cmd: stub,
            ..Settings::default()
        });
        let err = tool.exec(&ctx(&dir), "do it", None).await.unwrap_err();
        assert_eq!(err.code(), "TOOL_FAILURE");
        assert!(err.to_string().contains('3'));

        // The artifact is still registered on the failure path.
        let store = &db;
        assert_eq!(store.list_artifacts("run-1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_binary_maps_to_not_installed() {
        let (tool, _db, dir) = harness(Settings {
            codex_cmd: "/definitely/not/a/binary".into(),
            ..Settings::default()
        });
        let err = tool.exec(&ctx(&dir), "do it", None).await.unwrap_err();
        assert_eq!(err.code(), "CODEX_NOT_INSTALLED");
    }

    #[tokio::test]
    async fn test_auth_required_without_credential() {
        let dir = tempfile::tempdir().unwrap();
        // login status fails; no key configured → auth error, no retry.
        let path = dir.path().join("codex-stub.sh");
        std::fs::write(&path, "#!/bin/sh\nexit 1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        let (tool, _db, dir) = harness(Settings {
            codex_cmd: path.display().to_string(),
            openai_api_key: None,
            ..Settings::default()
        });
        let err = tool.exec(&ctx(&dir), "do it", None).await.unwrap_err();
        assert_eq!(err.code(), "CODEX_AUTH_REQUIRED");
    }

    #[tokio::test]
    async fn test_cancellation_terminates_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(
            &dir,
            r#"echo '{"type":"item.completed","item":{"type":"agent_message","text":"starting"}}'
exec sleep 60"#,
        );
        let (tool, _db, dir) = harness(Settings {
            codex_cmd: stub,
            ..Settings::default()
        });
        let registry = tool.registry();
        let context = ctx(&dir);

        let exec_task = tokio::spawn({
            let tool = tool.clone();
            async move { tool.exec(&context, "do it", None).await }
        });

        // Let the stream produce its first line, then cancel.
        tokio::time::sleep(Duration::from_millis(300)).await;
        registry.request_cancel("run-1");

        let result = tokio::time::timeout(Duration::from_secs(8), exec_task)
            .await
            .expect("cancel must resolve within the grace window")
            .unwrap();
        assert_eq!(result.unwrap_err().code(), "CANCELLED");
        assert_eq!(registry.live_pid_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_error() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(&dir, "exec sleep 30");
        let (tool, db, dir) = harness(Settings {
            codex_cmd: stub,
            codex_timeout_secs: 1,
            ..Settings::default()
        });
        let err = tool.exec(&ctx(&dir), "do it", None).await.unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");

        let store = &db;
        assert_eq!(store.list_artifacts("run-1").unwrap().len(), 1);
    }

    #[test]
    fn test_cancel_registry_is_idempotent() {
        let registry = CancelRegistry::new();
        assert!(!registry.is_cancelled("run-1"));
        registry.request_cancel("run-1");
        registry.request_cancel("run-1");
        assert!(registry.is_cancelled("run-1"));
        registry.clear("run-1");
        assert!(!registry.is_cancelled("run-1"));
    }
}
