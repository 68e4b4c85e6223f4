use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use super::db::Store;
use super::events::RunEvent;
use super::models::{RunDetail, TaskType, WorkspaceListing};
use super::run_service::{CreateRunRequest, RunService};
use crate::config::Settings;
use crate::errors::RunError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: Store,
    pub runs: Arc<RunService>,
    pub settings: Settings,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UpsertProjectRequest {
    pub name: String,
    #[serde(default)]
    pub task_type: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateRunBody {
    pub name: String,
    pub instructions: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub reference_run_id: Option<String>,
    #[serde(default)]
    pub from_run_id: Option<String>,
}

#[derive(Deserialize)]
struct RunFilter {
    project_id: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "detail": detail }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match &err {
            RunError::InvalidInput(_) => ApiError::BadRequest(err.to_string()),
            RunError::PathTraversal(_) => ApiError::Forbidden(err.to_string()),
            RunError::WorkspaceMissing(_) => ApiError::NotFound(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/projects", get(list_projects))
        .route("/projects/:id", put(upsert_project))
        .route("/projects/:id/runs", post(create_run))
        .route("/runs", get(list_runs))
        .route("/runs/:id", get(get_run))
        .route("/runs/:id/steps", get(get_run_steps))
        .route("/runs/:id/stream", get(stream_run))
        .route("/runs/:id/diff", get(get_run_diff))
        .route("/runs/:id/cancel", post(cancel_run))
        .route("/runs/:id/workspace/files", get(list_workspace_files))
        .route("/runs/:id/workspace/files/*path", get(read_workspace_file))
        .route("/runs/:id/artifacts", get(list_artifacts))
        .route(
            "/runs/:id/artifacts/:aid/download",
            get(download_artifact),
        )
        .route("/patterns/:run_id", get(get_pattern))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state.db.with(|store| store.list_projects()).await?;
    Ok(Json(projects))
}

async fn upsert_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpsertProjectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        || id.is_empty()
        || id.len() > 64
    {
        return Err(ApiError::BadRequest(
            "project id must match [A-Za-z0-9_-]{1,64}".into(),
        ));
    }
    if req.name.trim().is_empty() {
        return Err(ApiError::BadRequest("project name must not be empty".into()));
    }
    let task_type = match req.task_type.as_deref() {
        Some(raw) => raw
            .parse::<TaskType>()
            .map_err(ApiError::BadRequest)?,
        None => TaskType::Code,
    };
    let name = req.name.clone();
    let project = state
        .db
        .with(move |store| store.upsert_project(&id, &name, task_type))
        .await?;
    Ok(Json(project))
}

async fn create_run(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    Json(body): Json<CreateRunBody>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .runs
        .create_run(CreateRunRequest {
            project_id,
            name: body.name,
            instructions: body.instructions,
            task_type: body.task_type,
            reference_run_id: body.reference_run_id,
            from_run_id: body.from_run_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(filter): Query<RunFilter>,
) -> Result<impl IntoResponse, ApiError> {
    let runs = state
        .db
        .with(move |store| store.list_runs(filter.project_id.as_deref()))
        .await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .with(move |store| {
            let Some(run) = store.get_run(&id)? else {
                return Ok(None);
            };
            let artifacts = store.list_artifacts(&run.id)?;
            Ok(Some(RunDetail { run, artifacts }))
        })
        .await?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound("Run not found.".into())),
    }
}

async fn get_run_steps(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let steps = state
        .db
        .with(move |store| {
            if store.get_run(&id)?.is_none() {
                return Ok(None);
            }
            store.list_steps(&id).map(Some)
        })
        .await?;
    match steps {
        Some(steps) => Ok(Json(steps)),
        None => Err(ApiError::NotFound("Run not found.".into())),
    }
}

/// State threaded through the SSE unfold loop.
struct SseCursor {
    /// Absent for runs that were already terminal at subscribe time: only
    /// the replayed snapshot is delivered.
    rx: Option<broadcast::Receiver<RunEvent>>,
    pending: Option<RunEvent>,
    done: bool,
}

async fn stream_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = {
        let id = id.clone();
        state.db.with(move |store| store.get_run(&id)).await?
    }
    .ok_or_else(|| ApiError::NotFound("Run not found.".into()))?;

    // For live runs, subscribe before taking the status snapshot: a
    // terminal transition landing in between is then either reflected in
    // the snapshot or buffered on the receiver, never lost.
    let (rx, status) = if run.status.is_terminal() {
        (None, run.status)
    } else {
        let rx = state.runs.events().subscribe(&id);
        let fresh = {
            let id = id.clone();
            state.db.with(move |store| store.get_run(&id)).await?
        }
        .ok_or_else(|| ApiError::NotFound("Run not found.".into()))?;
        (Some(rx), fresh.status)
    };

    let cursor = SseCursor {
        rx,
        pending: Some(RunEvent::Status {
            run_id: id.clone(),
            status,
        }),
        done: status.is_terminal(),
    };
    let stream = futures_util::stream::unfold(cursor, |mut cursor| async move {
        if let Some(event) = cursor.pending.take() {
            return Some((to_sse_event(&event), cursor));
        }
        if cursor.done {
            return None;
        }
        loop {
            let received = cursor.rx.as_mut()?.recv().await;
            match received {
                Ok(event) => {
                    cursor.done = event.is_terminal_status();
                    return Some((to_sse_event(&event), cursor));
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(stream))
}

fn to_sse_event(event: &RunEvent) -> Result<Event, Infallible> {
    let payload = serde_json::to_string(event)
        .unwrap_or_else(|_| "{\"type\":\"error\",\"message\":\"serialization\"}".to_string());
    Ok(Event::default().data(payload))
}

async fn get_run_diff(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let artifact = state
        .db
        .with(move |store| {
            if store.get_run(&id)?.is_none() {
                return Ok(None);
            }
            store.get_artifact_by_kind(&id, "diff-summary")
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("Diff summary not available.".into()))?;

    let raw = tokio::fs::read_to_string(&artifact.path)
        .await
        .map_err(|_| ApiError::NotFound("Diff artifact missing.".into()))?;
    let summary: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| ApiError::Internal(format!("corrupt diff artifact: {}", e)))?;
    Ok(Json(serde_json::json!({
        "artifact_id": artifact.id,
        "summary": summary,
    })))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = {
        let id = id.clone();
        state.db.with(move |store| store.get_run(&id)).await?
    }
    .ok_or_else(|| ApiError::NotFound("Run not found.".into()))?;
    if run.status.is_terminal() {
        return Err(ApiError::BadRequest(format!(
            "run {} is already {}",
            run.id, run.status
        )));
    }
    let run = state.runs.cancel(&id).await?;
    Ok(Json(run))
}

async fn list_workspace_files(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = {
        let id = id.clone();
        state.db.with(move |store| store.get_run(&id)).await?
    }
    .ok_or_else(|| ApiError::NotFound("Run not found.".into()))?;

    let workspaces = state.runs.workspaces();
    let workspace = workspaces.path(&run.project_id, &run.id)?;
    let files = workspaces.list_files(&workspace)?;
    Ok(Json(WorkspaceListing {
        total_files: files.len(),
        files,
    }))
}

async fn read_workspace_file(
    State(state): State<SharedState>,
    Path((id, rel)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let run = {
        let id = id.clone();
        state.db.with(move |store| store.get_run(&id)).await?
    }
    .ok_or_else(|| ApiError::NotFound("Run not found.".into()))?;

    let workspaces = state.runs.workspaces();
    let workspace = workspaces.path(&run.project_id, &run.id)?;
    let bytes = workspaces.read_file(&workspace, &rel)?;
    let mime = mime_guess::from_path(&rel).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.to_string())], bytes))
}

async fn list_artifacts(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let artifacts = state
        .db
        .with(move |store| {
            if store.get_run(&id)?.is_none() {
                return Ok(None);
            }
            store.list_artifacts(&id).map(Some)
        })
        .await?;
    match artifacts {
        Some(artifacts) => Ok(Json(artifacts)),
        None => Err(ApiError::NotFound("Run not found.".into())),
    }
}

fn artifact_media_type(kind: &str, path: &str) -> String {
    match kind {
        "codex-jsonl" => "application/x-ndjson".to_string(),
        "diff-summary" | "json" => "application/json".to_string(),
        "markdown" => "text/markdown".to_string(),
        "csv" => "text/csv".to_string(),
        "txt" => "text/plain".to_string(),
        _ => mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string(),
    }
}

async fn download_artifact(
    State(state): State<SharedState>,
    Path((id, aid)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let artifact = state
        .db
        .with(move |store| {
            if store.get_run(&id)?.is_none() {
                return Ok(None);
            }
            store.get_artifact(&id, &aid)
        })
        .await?
        .ok_or_else(|| ApiError::NotFound("Artifact not found.".into()))?;

    // Artifact paths are server-generated, but confinement is enforced on
    // every lookup regardless.
    let root = state
        .settings
        .artifacts_root
        .canonicalize()
        .map_err(|e| ApiError::Internal(format!("artifacts root: {}", e)))?;
    let resolved = std::path::Path::new(&artifact.path)
        .canonicalize()
        .map_err(|_| ApiError::NotFound("Artifact file not found on disk.".into()))?;
    if !resolved.starts_with(&root) {
        return Err(ApiError::Forbidden("Artifact path escapes artifacts root.".into()));
    }

    let bytes = tokio::fs::read(&resolved)
        .await
        .map_err(|_| ApiError::NotFound("Artifact file not found on disk.".into()))?;
    let media_type = artifact_media_type(&artifact.kind, &artifact.path);
    Ok(([(header::CONTENT_TYPE, media_type)], bytes))
}

async fn get_pattern(
    State(state): State<SharedState>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pattern = state
        .db
        .with(move |store| store.get_pattern(&run_id))
        .await?
        .ok_or_else(|| ApiError::NotFound("Pattern not found.".into()))?;
    Ok(Json(pattern))
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::db::Store;
    use crate::service::events::EventBroker;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(dir: &tempfile::TempDir) -> SharedState {
        let settings = Settings {
            fake_codex: true,
            fake_planner: true,
            workspace_root: dir.path().join("workspaces"),
            artifacts_root: dir.path().join("artifacts"),
            ..Settings::default()
        };
        std::fs::create_dir_all(&settings.artifacts_root).unwrap();
        let db = Store::new_in_memory().unwrap();
        let runs = RunService::new(settings.clone(), db.clone(), Arc::new(EventBroker::new()));
        Arc::new(AppState { db, runs, settings })
    }

    fn test_app(dir: &tempfile::TempDir) -> Router {
        api_router().with_state(test_state(dir))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put_project(id: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(format!("/projects/{}", id))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"id": id, "name": "Demo"}).to_string(),
            ))
            .unwrap()
    }

    fn post_run(project: &str, instructions: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/projects/{}/runs", project))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "project_id": project,
                    "name": "n",
                    "instructions": instructions,
                })
                .to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_upsert_and_list_projects() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);

        let resp = app.clone().oneshot(put_project("demo")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let project: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(project["id"], "demo");
        assert_eq!(project["task_type"], "code");

        let resp = app
            .oneshot(Request::builder().uri("/projects").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let projects: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert_eq!(projects.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_project_rejects_bad_id() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        let req = Request::builder()
            .method("PUT")
            .uri("/projects/bad%20id")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"id": "bad id", "name": "Demo"}).to_string(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert!(body["detail"].as_str().unwrap().contains("project id"));
    }

    #[tokio::test]
    async fn test_create_run_returns_persisted_run() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        app.clone().oneshot(put_project("demo")).await.unwrap();

        let resp = app
            .clone()
            .oneshot(post_run("demo", "touch hello.txt"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let run: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(run["project_id"], "demo");
        let status = run["status"].as_str().unwrap();
        assert!(status == "queued" || status == "running");

        let run_id = run["id"].as_str().unwrap();
        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{}", run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let detail: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(detail["id"], run_id);
        assert!(detail["artifacts"].is_array());
    }

    #[tokio::test]
    async fn test_create_run_validation_returns_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);

        let resp = app.clone().oneshot(post_run("demo", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert!(body["detail"].is_string());

        // No run was created.
        let resp = app
            .oneshot(Request::builder().uri("/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let runs: Vec<serde_json::Value> = body_json(resp.into_body()).await;
        assert!(runs.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_run_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        for uri in [
            "/runs/run-ghost",
            "/runs/run-ghost/steps",
            "/runs/run-ghost/artifacts",
            "/runs/run-ghost/diff",
            "/runs/run-ghost/stream",
            "/patterns/run-ghost",
        ] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "uri: {}", uri);
        }
    }

    #[tokio::test]
    async fn test_workspace_traversal_is_403_without_read() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = api_router().with_state(Arc::clone(&state));
        app.clone().oneshot(put_project("demo")).await.unwrap();

        let resp = app
            .clone()
            .oneshot(post_run("demo", "touch hello.txt"))
            .await
            .unwrap();
        let run: serde_json::Value = body_json(resp.into_body()).await;
        let run_id = run["id"].as_str().unwrap().to_string();

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!(
                        "/runs/{}/workspace/files/..%2F..%2F..%2Fetc%2Fpasswd",
                        run_id
                    ))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let body: serde_json::Value = body_json(resp.into_body()).await;
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn test_cancel_terminal_run_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = api_router().with_state(Arc::clone(&state));
        app.clone().oneshot(put_project("demo")).await.unwrap();

        let resp = app
            .clone()
            .oneshot(post_run("demo", "touch hello.txt"))
            .await
            .unwrap();
        let run: serde_json::Value = body_json(resp.into_body()).await;
        let run_id = run["id"].as_str().unwrap().to_string();

        // Wait for the fake-mode lifecycle to finish.
        for _ in 0..100 {
            let run = state.runs.get_run(&run_id).await.unwrap().unwrap();
            if run.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/runs/{}/cancel", run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/runs/run-ghost/cancel")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stream_replays_snapshot_for_terminal_run() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = api_router().with_state(Arc::clone(&state));
        app.clone().oneshot(put_project("demo")).await.unwrap();

        let resp = app
            .clone()
            .oneshot(post_run("demo", "touch hello.txt"))
            .await
            .unwrap();
        let run: serde_json::Value = body_json(resp.into_body()).await;
        let run_id = run["id"].as_str().unwrap().to_string();

        for _ in 0..100 {
            let run = state.runs.get_run(&run_id).await.unwrap().unwrap();
            if run.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/runs/{}/stream", run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        // Terminal run: the stream closes after the replayed snapshot.
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.starts_with("data: "));
        assert!(text.contains("\"status\":\"succeeded\""));
        assert_eq!(text.matches("data: ").count(), 1);
    }

    #[tokio::test]
    async fn test_pattern_endpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = api_router().with_state(Arc::clone(&state));
        app.clone().oneshot(put_project("demo")).await.unwrap();

        let resp = app
            .clone()
            .oneshot(post_run("demo", "touch hello.txt"))
            .await
            .unwrap();
        let run: serde_json::Value = body_json(resp.into_body()).await;
        let run_id = run["id"].as_str().unwrap().to_string();

        for _ in 0..100 {
            let run = state.runs.get_run(&run_id).await.unwrap().unwrap();
            if run.status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/patterns/{}", run_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let pattern: serde_json::Value = body_json(resp.into_body()).await;
        assert_eq!(pattern["source_run_id"], run_id.as_str());
        assert!(pattern["rendered"]
            .as_str()
            .unwrap()
            .starts_with(&format!("<reference_workflow id=\"pat-{}\">", run_id)));
        assert!(pattern["steps"].as_array().unwrap().len() <= 12);
    }

    #[test]
    fn test_artifact_media_types() {
        assert_eq!(artifact_media_type("codex-jsonl", "x.jsonl"), "application/x-ndjson");
        assert_eq!(artifact_media_type("diff-summary", "x.json"), "application/json");
        assert_eq!(artifact_media_type("markdown", "x.md"), "text/markdown");
        assert_eq!(artifact_media_type("other", "x.png"), "image/png");
    }
}
