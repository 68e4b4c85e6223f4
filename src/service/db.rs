//! Embedded relational store over projects, runs, steps, artifacts and
//! cached patterns.
//!
//! SQLite is synchronous, so the store keeps its connection behind a mutex
//! and hands whole units of work to tokio's blocking pool through
//! [`Store::with`]. The same mutex is what makes per-run step sequencing
//! single-writer: `append_step` allocates and inserts under one guard.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::models::*;
use crate::errors::RunErrorRecord;
use crate::util::new_id;

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Handle to the embedded store. Cloning is cheap; every clone shares the
/// one guarded connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Hand a unit of store work to the blocking pool, keeping SQLite I/O
    /// off the async workers. The closure receives its own clone of the
    /// store and must own everything else it touches.
    pub async fn with<R, F>(&self, work: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(Store) -> Result<R> + Send + 'static,
    {
        let store = self.clone();
        match tokio::task::spawn_blocking(move || work(store)).await {
            Ok(result) => result,
            Err(join) => Err(anyhow::anyhow!("store worker exited early: {}", join)),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("store connection mutex poisoned"))
    }

    // ── Project CRUD ──────────────────────────────────────────────────

    pub fn upsert_project(&self, id: &str, name: &str, task_type: TaskType) -> Result<Project> {
        self.conn()?
            .execute(
                "INSERT INTO projects (id, name, task_type, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, task_type = excluded.task_type",
                params![id, name, task_type.as_str(), now_iso()],
            )
            .context("Failed to upsert project")?;
        self.get_project(id)?
            .context("Project not found after upsert")
    }

    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, task_type, created_at FROM projects ORDER BY id")
            .context("Failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .context("Failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            let (id, name, task_type, created_at) = row.context("Failed to read project row")?;
            projects.push(Project {
                id,
                name,
                task_type: parse_task_type(&task_type)?,
                created_at,
            });
        }
        Ok(projects)
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, name, task_type, created_at FROM projects WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query project")?;
        match row {
            Some((id, name, task_type, created_at)) => Ok(Some(Project {
                id,
                name,
                task_type: parse_task_type(&task_type)?,
                created_at,
            })),
            None => Ok(None),
        }
    }

    // ── Runs ──────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_run(
        &self,
        id: &str,
        project_id: &str,
        name: &str,
        task_type: TaskType,
        instructions: &str,
        reference_run_id: Option<&str>,
        source_run_id: Option<&str>,
    ) -> Result<Run> {
        self.conn()?
            .execute(
                "INSERT INTO runs (id, project_id, name, task_type, instructions, reference_run_id, source_run_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    project_id,
                    name,
                    task_type.as_str(),
                    instructions,
                    reference_run_id,
                    source_run_id,
                    now_iso()
                ],
            )
            .context("Failed to insert run")?;
        self.get_run(id)?.context("Run not found after insert")
    }

    pub fn get_run(&self, id: &str) -> Result<Option<Run>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{} WHERE id = ?1", RUN_SELECT))
            .context("Failed to prepare get_run")?;
        let row = stmt
            .query_row(params![id], RunRow::from_row)
            .optional()
            .context("Failed to query run")?;
        match row {
            Some(r) => Ok(Some(r.into_run()?)),
            None => Ok(None),
        }
    }

    pub fn list_runs(&self, project_id: Option<&str>) -> Result<Vec<Run>> {
        let conn = self.conn()?;
        let mut runs = Vec::new();
        match project_id {
            Some(pid) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "{} WHERE project_id = ?1 ORDER BY created_at, id",
                        RUN_SELECT
                    ))
                    .context("Failed to prepare list_runs")?;
                let rows = stmt
                    .query_map(params![pid], RunRow::from_row)
                    .context("Failed to query runs")?;
                for row in rows {
                    runs.push(row.context("Failed to read run row")?.into_run()?);
                }
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!("{} ORDER BY created_at, id", RUN_SELECT))
                    .context("Failed to prepare list_runs")?;
                let rows = stmt
                    .query_map([], RunRow::from_row)
                    .context("Failed to query runs")?;
                for row in rows {
                    runs.push(row.context("Failed to read run row")?.into_run()?);
                }
            }
        }
        Ok(runs)
    }

    /// Transition the run's status. Terminal states are absorbing: once a
    /// run is succeeded/failed/cancelled this is a no-op.
    ///
    /// Returns the current run plus whether the transition was applied.
    /// Transitioning to running stamps `started_at`; a terminal transition
    /// stamps `finished_at` and pins progress to 100.
    pub fn update_run_status(&self, id: &str, status: RunStatus) -> Result<(Run, bool)> {
        let now = now_iso();
        let changed = if status.is_terminal() {
            self.conn()?.execute(
                "UPDATE runs SET status = ?1, progress = 100, finished_at = ?2
                 WHERE id = ?3 AND status IN ('queued', 'running')",
                params![status.as_str(), now, id],
            )
        } else if status == RunStatus::Running {
            self.conn()?.execute(
                "UPDATE runs SET status = ?1, started_at = ?2
                 WHERE id = ?3 AND status = 'queued'",
                params![status.as_str(), now, id],
            )
        } else {
            self.conn()?.execute(
                "UPDATE runs SET status = ?1 WHERE id = ?2 AND status IN ('queued', 'running')",
                params![status.as_str(), id],
            )
        }
        .context("Failed to update run status")?;

        let run = self.get_run(id)?.context("Run not found after status update")?;
        Ok((run, changed > 0))
    }

    /// Raise the run's progress. Values never decrease and are capped at 99
    /// here; only a terminal transition sets 100.
    pub fn update_run_progress(&self, id: &str, percent: i64) -> Result<()> {
        let clamped = percent.clamp(0, 99);
        self.conn()?
            .execute(
                "UPDATE runs SET progress = MAX(progress, ?1)
                 WHERE id = ?2 AND status IN ('queued', 'running')",
                params![clamped, id],
            )
            .context("Failed to update run progress")?;
        Ok(())
    }

    pub fn set_system_instructions(&self, id: &str, instructions: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE runs SET system_instructions = ?1 WHERE id = ?2",
                params![instructions, id],
            )
            .context("Failed to set system instructions")?;
        Ok(())
    }

    pub fn set_session_id(&self, id: &str, session_id: &str) -> Result<()> {
        self.conn()?
            .execute(
                "UPDATE runs SET session_id = ?1 WHERE id = ?2",
                params![session_id, id],
            )
            .context("Failed to set session id")?;
        Ok(())
    }

    /// Durably mark cancellation as requested. Returns false when the run
    /// is already terminal.
    pub fn set_cancel_requested(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE runs SET cancel_requested = 1
                 WHERE id = ?1 AND status IN ('queued', 'running')",
                params![id],
            )
            .context("Failed to set cancel flag")?;
        Ok(changed > 0)
    }

    /// Append a structured error and raise `had_errors`.
    pub fn record_error(&self, id: &str, record: &RunErrorRecord) -> Result<()> {
        let run = self.get_run(id)?.context("Run not found for error record")?;
        let mut errors = run.errors;
        errors.push(record.clone());
        let json = serde_json::to_string(&errors).context("Failed to serialize errors")?;
        self.conn()?
            .execute(
                "UPDATE runs SET had_errors = 1, errors_json = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to record error")?;
        Ok(())
    }

    pub fn set_machine_summary(&self, id: &str, summary: &MachineSummary) -> Result<()> {
        let json = serde_json::to_string(summary).context("Failed to serialize summary")?;
        self.conn()?
            .execute(
                "UPDATE runs SET machine_summary_json = ?1 WHERE id = ?2",
                params![json, id],
            )
            .context("Failed to set machine summary")?;
        Ok(())
    }

    // ── Steps ─────────────────────────────────────────────────────────

    /// Append a step in order. Sequence numbers are dense per run
    /// (0,1,2,…); allocation and insert happen under one connection guard
    /// so concurrent writers cannot interleave.
    pub fn append_step(
        &self,
        run_id: &str,
        role: StepRole,
        content: &str,
        files: &[String],
        notes: &[String],
        outcome_ok: Option<bool>,
    ) -> Result<Step> {
        let conn = self.conn()?;
        let seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), -1) + 1 FROM steps WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .context("Failed to allocate step sequence")?;
        let id = new_id("step");
        let created_at = now_iso();
        let files_json = serde_json::to_string(files).context("Failed to serialize files")?;
        let notes_json = serde_json::to_string(notes).context("Failed to serialize notes")?;
        conn.execute(
            "INSERT INTO steps (id, run_id, seq, role, content, files_json, notes_json, outcome_ok, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                run_id,
                seq,
                role.as_str(),
                content,
                files_json,
                notes_json,
                outcome_ok,
                created_at
            ],
        )
        .context("Failed to insert step")?;
        Ok(Step {
            id,
            run_id: run_id.to_string(),
            seq,
            role,
            content: content.to_string(),
            files: files.to_vec(),
            notes: notes.to_vec(),
            outcome_ok,
            created_at,
        })
    }

    pub fn list_steps(&self, run_id: &str) -> Result<Vec<Step>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run_id, seq, role, content, files_json, notes_json, outcome_ok, created_at
                 FROM steps WHERE run_id = ?1 ORDER BY seq",
            )
            .context("Failed to prepare list_steps")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, Option<bool>>(7)?,
                    row.get::<_, String>(8)?,
                ))
            })
            .context("Failed to query steps")?;
        let mut steps = Vec::new();
        for row in rows {
            let (id, run_id, seq, role, content, files_json, notes_json, outcome_ok, created_at) =
                row.context("Failed to read step row")?;
            steps.push(Step {
                id,
                run_id,
                seq,
                role: StepRole::from_str(&role)
                    .map_err(|e| anyhow::anyhow!("invalid role in database: {}", e))?,
                content,
                files: serde_json::from_str(&files_json)
                    .context("Failed to parse step files JSON")?,
                notes: serde_json::from_str(&notes_json)
                    .context("Failed to parse step notes JSON")?,
                outcome_ok,
                created_at,
            });
        }
        Ok(steps)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn add_artifact(&self, run_id: &str, kind: &str, path: &str, bytes: i64) -> Result<Artifact> {
        let id = new_id("art");
        let created_at = now_iso();
        self.conn()?
            .execute(
                "INSERT INTO artifacts (id, run_id, kind, path, bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, run_id, kind, path, bytes, created_at],
            )
            .context("Failed to insert artifact")?;
        Ok(Artifact {
            id,
            run_id: run_id.to_string(),
            kind: kind.to_string(),
            path: path.to_string(),
            bytes,
            created_at,
        })
    }

    pub fn list_artifacts(&self, run_id: &str) -> Result<Vec<Artifact>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, run_id, kind, path, bytes, created_at
                 FROM artifacts WHERE run_id = ?1 ORDER BY created_at, id",
            )
            .context("Failed to prepare list_artifacts")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(Artifact {
                    id: row.get(0)?,
                    run_id: row.get(1)?,
                    kind: row.get(2)?,
                    path: row.get(3)?,
                    bytes: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.context("Failed to read artifact row")?);
        }
        Ok(artifacts)
    }

    pub fn get_artifact(&self, run_id: &str, artifact_id: &str) -> Result<Option<Artifact>> {
        Ok(self
            .list_artifacts(run_id)?
            .into_iter()
            .find(|a| a.id == artifact_id))
    }

    pub fn get_artifact_by_kind(&self, run_id: &str, kind: &str) -> Result<Option<Artifact>> {
        Ok(self
            .list_artifacts(run_id)?
            .into_iter()
            .find(|a| a.kind == kind))
    }

    // ── Patterns ──────────────────────────────────────────────────────

    pub fn insert_pattern(&self, record: &PatternRecord) -> Result<()> {
        let steps_json =
            serde_json::to_string(&record.steps).context("Failed to serialize pattern steps")?;
        let variables_json = serde_json::to_string(&record.variables)
            .context("Failed to serialize pattern variables")?;
        self.conn()?
            .execute(
                "INSERT INTO patterns (id, source_run_id, project_id, name, summary, steps_json, variables_json, rendered, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(source_run_id) DO NOTHING",
                params![
                    record.id,
                    record.source_run_id,
                    record.project_id,
                    record.name,
                    record.summary,
                    steps_json,
                    variables_json,
                    record.rendered,
                    now_iso()
                ],
            )
            .context("Failed to insert pattern")?;
        Ok(())
    }

    pub fn get_pattern(&self, source_run_id: &str) -> Result<Option<PatternRecord>> {
        let row = self
            .conn()?
            .query_row(
                "SELECT id, source_run_id, project_id, name, summary, steps_json, variables_json, rendered, created_at
                 FROM patterns WHERE source_run_id = ?1",
                params![source_run_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query pattern")?;
        match row {
            Some((
                id,
                source_run_id,
                project_id,
                name,
                summary,
                steps_json,
                variables_json,
                rendered,
                created_at,
            )) => Ok(Some(PatternRecord {
                id,
                source_run_id,
                project_id,
                name,
                summary,
                steps: serde_json::from_str(&steps_json)
                    .context("Failed to parse pattern steps JSON")?,
                variables: serde_json::from_str(&variables_json)
                    .context("Failed to parse pattern variables JSON")?,
                rendered,
                created_at,
            })),
            None => Ok(None),
        }
    }
}

fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .context("Failed to enable foreign keys")?;
    run_migrations(conn).context("Failed to run migrations")?;
    Ok(())
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            task_type TEXT NOT NULL DEFAULT 'code',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL REFERENCES projects(id),
            name TEXT NOT NULL,
            task_type TEXT NOT NULL DEFAULT 'code',
            instructions TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'queued',
            progress INTEGER NOT NULL DEFAULT 0,
            reference_run_id TEXT,
            source_run_id TEXT,
            system_instructions TEXT,
            session_id TEXT,
            had_errors INTEGER NOT NULL DEFAULT 0,
            errors_json TEXT NOT NULL DEFAULT '[]',
            machine_summary_json TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        );

        CREATE TABLE IF NOT EXISTS steps (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            seq INTEGER NOT NULL,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            files_json TEXT NOT NULL DEFAULT '[]',
            notes_json TEXT NOT NULL DEFAULT '[]',
            outcome_ok INTEGER,
            created_at TEXT NOT NULL,
            UNIQUE(run_id, seq)
        );

        CREATE TABLE IF NOT EXISTS artifacts (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL REFERENCES runs(id),
            kind TEXT NOT NULL,
            path TEXT NOT NULL,
            bytes INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS patterns (
            id TEXT PRIMARY KEY,
            source_run_id TEXT NOT NULL UNIQUE,
            project_id TEXT NOT NULL,
            name TEXT NOT NULL,
            summary TEXT NOT NULL,
            steps_json TEXT NOT NULL,
            variables_json TEXT NOT NULL,
            rendered TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_runs_project ON runs(project_id);
        CREATE INDEX IF NOT EXISTS idx_steps_run ON steps(run_id, seq);
        CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id);
        ",
    )
    .context("Failed to create tables")?;
    Ok(())
}

// ── Internal row helpers ──────────────────────────────────────────────

const RUN_SELECT: &str = "SELECT id, project_id, name, task_type, instructions, status, \
    progress, reference_run_id, source_run_id, system_instructions, session_id, had_errors, \
    errors_json, machine_summary_json, cancel_requested, created_at, started_at, finished_at \
    FROM runs";

/// Intermediate row struct for reading runs before converting status /
/// task_type / JSON columns into typed values.
struct RunRow {
    id: String,
    project_id: String,
    name: String,
    task_type: String,
    instructions: String,
    status: String,
    progress: i64,
    reference_run_id: Option<String>,
    source_run_id: Option<String>,
    system_instructions: Option<String>,
    session_id: Option<String>,
    had_errors: bool,
    errors_json: String,
    machine_summary_json: Option<String>,
    cancel_requested: bool,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            task_type: row.get(3)?,
            instructions: row.get(4)?,
            status: row.get(5)?,
            progress: row.get(6)?,
            reference_run_id: row.get(7)?,
            source_run_id: row.get(8)?,
            system_instructions: row.get(9)?,
            session_id: row.get(10)?,
            had_errors: row.get(11)?,
            errors_json: row.get(12)?,
            machine_summary_json: row.get(13)?,
            cancel_requested: row.get(14)?,
            created_at: row.get(15)?,
            started_at: row.get(16)?,
            finished_at: row.get(17)?,
        })
    }

    fn into_run(self) -> Result<Run> {
        let errors: Vec<RunErrorRecord> =
            serde_json::from_str(&self.errors_json).context("Failed to parse errors JSON")?;
        let machine_summary = match &self.machine_summary_json {
            Some(json) => {
                Some(serde_json::from_str(json).context("Failed to parse machine summary JSON")?)
            }
            None => None,
        };
        Ok(Run {
            id: self.id,
            project_id: self.project_id,
            name: self.name,
            task_type: parse_task_type(&self.task_type)?,
            instructions: self.instructions,
            status: RunStatus::from_str(&self.status)
                .map_err(|e| anyhow::anyhow!("invalid status in database: {}", e))?,
            progress: self.progress,
            reference_run_id: self.reference_run_id,
            source_run_id: self.source_run_id,
            system_instructions: self.system_instructions,
            session_id: self.session_id,
            had_errors: self.had_errors,
            errors,
            machine_summary,
            cancel_requested: self.cancel_requested,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

fn parse_task_type(raw: &str) -> Result<TaskType> {
    TaskType::from_str(raw).map_err(|e| anyhow::anyhow!("invalid task_type in database: {}", e))
}

// ── Tests ─────────────────────────────────────────────────────────────
