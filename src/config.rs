//! Runtime configuration shared by the API server and the CLI tool.
//!
//! All knobs come from the environment with workable defaults, so a bare
//! `runweave serve` works out of the box against local directories.

use std::path::PathBuf;

/// Default system prompt prepended to every run's composed instructions.
pub const BASE_PROMPT: &str = "You are a precise code agent. Keep changes minimal.";

/// Global settings for storage roots, the planner and the external CLI.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub workspace_root: PathBuf,
    pub artifacts_root: PathBuf,
    pub runner_url: String,
    pub openai_api_key: Option<String>,
    pub fake_codex: bool,
    pub fake_planner: bool,
    pub require_git_repo: bool,
    pub codex_cmd: String,
    pub codex_profile: String,
    /// Wall-clock bound on a single CLI invocation, in seconds.
    pub codex_timeout_secs: u64,
    pub max_pattern_steps: usize,
    pub step_content_chars: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/store"),
            workspace_root: PathBuf::from("./workspaces"),
            artifacts_root: PathBuf::from("./artifacts"),
            runner_url: "http://localhost:5055".to_string(),
            openai_api_key: None,
            fake_codex: false,
            fake_planner: false,
            require_git_repo: false,
            codex_cmd: "codex".to_string(),
            codex_profile: "batch".to_string(),
            codex_timeout_secs: 1800,
            max_pattern_steps: 12,
            step_content_chars: 160,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1" || v == "true").unwrap_or(false)
}

impl Settings {
    /// Build settings from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            workspace_root: std::env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            artifacts_root: std::env::var("ARTIFACTS_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_root),
            runner_url: std::env::var("RUNNER_URL").unwrap_or(defaults.runner_url),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()),
            fake_codex: env_flag("FAKE_CODEX"),
            fake_planner: env_flag("FAKE_PLANNER"),
            require_git_repo: env_flag("REQUIRE_GIT_REPO"),
            codex_cmd: std::env::var("CODEX_CMD").unwrap_or(defaults.codex_cmd),
            codex_profile: std::env::var("CODEX_PROFILE").unwrap_or(defaults.codex_profile),
            codex_timeout_secs: std::env::var("CODEX_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.codex_timeout_secs),
            max_pattern_steps: defaults.max_pattern_steps,
            step_content_chars: defaults.step_content_chars,
        }
    }

    /// Whether the upstream planner should be bypassed in favor of the
    /// inline single-tool loop.
    pub fn planner_is_synthetic(&self) -> bool {
        self.fake_planner || self.openai_api_key.is_none()
    }
}
