//! Per-run filesystem sandboxes under the configured workspace root.
//!
//! Every resolved path is confined to the root: project and run ids are
//! percent-encoded into safe segments and relative lookups are lexically
//! normalized before use. Adversarial ids or request paths fail with
//! `WORKSPACE_PATH_INVALID` / `PATH_TRAVERSAL` without touching the disk.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::models::WorkspaceFile;
use crate::errors::RunError;

/// Structured result of `git status`/`git diff` over a workspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffSummary {
    pub branch: String,
    pub shortstat: String,
    pub files: Vec<DiffFile>,
    pub stat: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffFile {
    pub path: String,
    pub status: String,
}

/// Outcome of workspace preparation.
#[derive(Debug, Clone)]
pub struct PrepareOutcome {
    pub workspace: PathBuf,
    pub cloned_entries: Vec<String>,
    pub source_found: bool,
}

#[derive(Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

/// Percent-encode every byte outside `[A-Za-z0-9._-]` so arbitrary ids
/// become single, slash-free path segments.
pub fn safe_segment(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return fallback.to_string();
    }
    let mut out = String::with_capacity(trimmed.len());
    for byte in trimmed.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Lexically normalize a joined path, resolving `.` and `..` without
/// touching the filesystem. Returns `None` when `..` escapes the start.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    Some(out)
}

impl WorkspaceManager {
    pub fn new(root: PathBuf) -> Self {
        // Normalize once so the confinement prefix check below compares
        // like with like (a `./workspaces` root would otherwise never
        // prefix-match its own normalized descendants).
        let root = normalize(&root).unwrap_or(root);
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Pure resolution of `{root}/{safe(project)}/{safe(run)}`.
    pub fn path(&self, project_id: &str, run_id: &str) -> Result<PathBuf, RunError> {
        let project = safe_segment(project_id, "project");
        let run = safe_segment(run_id, "run");
        let candidate = self.root.join(&project).join(&run);
        let normalized = normalize(&candidate)
            .ok_or_else(|| RunError::WorkspacePathInvalid(candidate.display().to_string()))?;
        if !normalized.starts_with(&self.root) {
            return Err(RunError::WorkspacePathInvalid(
                normalized.display().to_string(),
            ));
        }
        Ok(normalized)
    }

    /// Create the run's workspace, optionally deep-copying the contents of
    /// a source run's workspace (including `.git`). A missing source is a
    /// soft condition: the run proceeds with an empty workspace.
    pub fn prepare(
        &self,
        project_id: &str,
        run_id: &str,
        from_run_id: Option<&str>,
    ) -> Result<PrepareOutcome> {
        let workspace = self.path(project_id, run_id)?;
        std::fs::create_dir_all(&workspace)
            .with_context(|| format!("Failed to create workspace {}", workspace.display()))?;

        let mut cloned_entries = Vec::new();
        let mut source_found = false;
        if let Some(source_id) = from_run_id.filter(|s| *s != run_id) {
            let source = self.path(project_id, source_id)?;
            if source.is_dir() {
                source_found = true;
                cloned_entries = copy_dir_contents(&source, &workspace)?;
            }
        }

        ensure_git_repo(&workspace);

        Ok(PrepareOutcome {
            workspace,
            cloned_entries,
            source_found,
        })
    }

    /// Structured git summary for the workspace, or `None` when the
    /// directory is not a repository or the git binary is unavailable.
    pub async fn diff_summary(&self, workspace: &Path) -> Option<DiffSummary> {
        if git2::Repository::open(workspace).is_err() {
            return None;
        }

        let status_out = run_git(workspace, &["status", "-sb"]).await?;
        let mut branch = String::new();
        let mut files = Vec::new();
        for line in status_out.lines() {
            if let Some(rest) = line.strip_prefix("##") {
                branch = rest.trim().to_string();
                continue;
            }
            if line.trim().is_empty() || line.len() < 3 {
                continue;
            }
            files.push(DiffFile {
                status: line[..2].trim().to_string(),
                path: line[3..].trim().to_string(),
            });
        }
        if files.is_empty() {
            return None;
        }

        let shortstat = run_git(workspace, &["diff", "--shortstat"])
            .await
            .unwrap_or_default()
            .trim()
            .to_string();
        let stat = run_git(workspace, &["diff", "--stat", "--", "."])
            .await
            .unwrap_or_default()
            .trim()
            .to_string();

        Some(DiffSummary {
            branch,
            shortstat,
            files,
            stat,
        })
    }

    /// Recursive listing of the workspace, `.git` internals excluded.
    pub fn list_files(&self, workspace: &Path) -> Result<Vec<WorkspaceFile>> {
        let mut files = Vec::new();
        if !workspace.is_dir() {
            return Ok(files);
        }
        collect_files(workspace, workspace, &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Read a file by workspace-relative path, enforcing confinement.
    pub fn read_file(&self, workspace: &Path, rel: &str) -> Result<Vec<u8>, RunError> {
        let resolved = self.resolve_member(workspace, rel)?;
        if !resolved.is_file() {
            return Err(RunError::WorkspaceMissing(rel.to_string()));
        }
        std::fs::read(&resolved).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                RunError::PermissionError(resolved.display().to_string())
            }
            _ => RunError::WorkspaceMissing(rel.to_string()),
        })
    }

    /// Resolve a relative path against a workspace without reading it.
    /// Rejects absolute paths and anything that escapes the workspace.
    pub fn resolve_member(&self, workspace: &Path, rel: &str) -> Result<PathBuf, RunError> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute() {
            return Err(RunError::PathTraversal(rel.to_string()));
        }
        let joined = workspace.join(rel_path);
        let normalized =
            normalize(&joined).ok_or_else(|| RunError::PathTraversal(rel.to_string()))?;
        if !normalized.starts_with(workspace) {
            return Err(RunError::PathTraversal(rel.to_string()));
        }
        Ok(normalized)
    }
}

/// Deep-copy the top-level entries of `source` into `dest`, returning the
/// copied entry names (directories suffixed with `/`).
fn copy_dir_contents(source: &Path, dest: &Path) -> Result<Vec<String>> {
    let mut copied = Vec::new();
    for entry in std::fs::read_dir(source)
        .with_context(|| format!("Failed to read source workspace {}", source.display()))?
    {
        let entry = entry.context("Failed to read source entry")?;
        let name = entry.file_name().to_string_lossy().to_string();
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type().context("Failed to stat source entry")?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
            copied.push(format!("{}/", name));
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", name))?;
            copied.push(name);
        }
        // Symlinks are intentionally skipped: a link pointing outside the
        // workspace would breach confinement when followed later.
    }
    copied.sort();
    Ok(copied)
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    for entry in std::fs::read_dir(source)
        .with_context(|| format!("Failed to read {}", source.display()))?
    {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

/// Initialize a git repository in the workspace when none exists, so diff
/// summaries work for fresh runs. Failure is non-fatal.
fn ensure_git_repo(workspace: &Path) {
    if git2::Repository::open(workspace).is_ok() {
        return;
    }
    if let Err(e) = git2::Repository::init(workspace) {
        eprintln!(
            "[workspace] git init failed for {}: {}",
            workspace.display(),
            e
        );
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<WorkspaceFile>) -> Result<()> {
    for entry in
        std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if name == ".git" {
                continue;
            }
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            let rel = path
                .strip_prefix(root)
                .context("File escaped workspace during listing")?
                .to_string_lossy()
                .to_string();
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let mime = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .to_string();
            out.push(WorkspaceFile {
                path: rel,
                size_bytes: size,
                mime,
            });
        }
    }
    Ok(())
}

async fn run_git(workspace: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(workspace)
        .args(args)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager() -> (WorkspaceManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (WorkspaceManager::new(dir.path().to_path_buf()), dir)
    }

    #[test]
    fn test_safe_segment_passthrough_and_encoding() {
        assert_eq!(safe_segment("demo-project_1.0", "x"), "demo-project_1.0");
        assert_eq!(safe_segment("a/b", "x"), "a%2Fb");
        assert_eq!(safe_segment("a b", "x"), "a%20b");
        assert_eq!(safe_segment("", "fallback"), "fallback");
        assert_eq!(safe_segment("  ", "fallback"), "fallback");
    }

    #[test]
    fn test_path_is_confined() {
        let (ws, _dir) = manager();
        let p = ws.path("demo", "run-1").unwrap();
        assert!(p.starts_with(ws.root()));
        assert!(p.ends_with("demo/run-1"));

        // Slashes in ids are encoded, not treated as separators.
        let p = ws.path("../../etc", "run").unwrap();
        assert!(p.starts_with(ws.root()));
        assert!(!p.to_string_lossy().contains("/../"));
    }

    #[test]
    fn test_relative_root_still_confines() {
        let ws = WorkspaceManager::new(PathBuf::from("./workspaces"));
        let p = ws.path("demo", "run-1").unwrap();
        assert!(p.starts_with(ws.root()));
        assert_eq!(ws.root(), Path::new("workspaces"));
    }

    #[test]
    fn test_prepare_creates_empty_workspace() {
        let (ws, _dir) = manager();
        let outcome = ws.prepare("demo", "run-1", None).unwrap();
        assert!(outcome.workspace.is_dir());
        assert!(outcome.cloned_entries.is_empty());
        assert!(!outcome.source_found);
    }

    #[test]
    fn test_prepare_clones_source_contents() {
        let (ws, _dir) = manager();
        let src = ws.prepare("demo", "run-a", None).unwrap().workspace;
        std::fs::write(src.join("a.txt"), "hello").unwrap();
        std::fs::create_dir(src.join("sub")).unwrap();
        std::fs::write(src.join("sub/b.txt"), "world").unwrap();

        let outcome = ws.prepare("demo", "run-b", Some("run-a")).unwrap();
        assert!(outcome.source_found);
        assert!(outcome.cloned_entries.contains(&"a.txt".to_string()));
        assert!(outcome.cloned_entries.contains(&"sub/".to_string()));
        assert_eq!(
            std::fs::read_to_string(outcome.workspace.join("sub/b.txt")).unwrap(),
            "world"
        );
    }

    #[test]
    fn test_prepare_missing_source_is_soft() {
        let (ws, _dir) = manager();
        let outcome = ws.prepare("demo", "run-b", Some("run-ghost")).unwrap();
        assert!(!outcome.source_found);
        assert!(outcome.cloned_entries.is_empty());
        assert!(outcome.workspace.is_dir());
    }

    #[test]
    fn test_prepare_initializes_git() {
        let (ws, _dir) = manager();
        let outcome = ws.prepare("demo", "run-1", None).unwrap();
        assert!(git2::Repository::open(&outcome.workspace).is_ok());
    }

    #[test]
    fn test_list_files_skips_git_and_sorts() {
        let (ws, _dir) = manager();
        let workspace = ws.prepare("demo", "run-1", None).unwrap().workspace;
        std::fs::write(workspace.join("b.md"), "b").unwrap();
        std::fs::write(workspace.join("a.txt"), "aa").unwrap();

        let files = ws.list_files(&workspace).unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.md"]);
        assert!(files.iter().all(|f| !f.path.starts_with(".git")));
        assert_eq!(files[0].size_bytes, 2);
        assert_eq!(files[1].mime, "text/markdown");
    }

    #[test]
    fn test_clone_then_list_round_trip() {
        let (ws, _dir) = manager();
        let src = ws.prepare("demo", "run-a", None).unwrap().workspace;
        std::fs::write(src.join("kept.txt"), "x").unwrap();

        let outcome = ws.prepare("demo", "run-b", Some("run-a")).unwrap();
        let listed: Vec<String> = ws
            .list_files(&outcome.workspace)
            .unwrap()
            .into_iter()
            .map(|f| f.path)
            .collect();
        assert_eq!(listed, vec!["kept.txt"]);
    }

    #[test]
    fn test_read_file_rejects_traversal_without_reading() {
        let (ws, dir) = manager();
        let workspace = ws.prepare("demo", "run-1", None).unwrap().workspace;
        std::fs::write(dir.path().join("secret.txt"), "top secret").unwrap();

        let err = ws
            .read_file(&workspace, "../../secret.txt")
            .expect_err("traversal must fail");
        assert_eq!(err.code(), "PATH_TRAVERSAL");

        let err = ws
            .read_file(&workspace, "/etc/passwd")
            .expect_err("absolute path must fail");
        assert_eq!(err.code(), "PATH_TRAVERSAL");
    }

    #[test]
    fn test_read_file_returns_bytes_inside_workspace() {
        let (ws, _dir) = manager();
        let workspace = ws.prepare("demo", "run-1", None).unwrap().workspace;
        std::fs::write(workspace.join("hello.txt"), "hi").unwrap();
        assert_eq!(ws.read_file(&workspace, "hello.txt").unwrap(), b"hi");

        let err = ws.read_file(&workspace, "missing.txt").unwrap_err();
        assert_eq!(err.code(), "WORKSPACE_MISSING");
    }

    #[tokio::test]
    async fn test_diff_summary_none_outside_repo() {
        let (ws, dir) = manager();
        let plain = dir.path().join("plain");
        std::fs::create_dir_all(&plain).unwrap();
        assert!(ws.diff_summary(&plain).await.is_none());
    }

    #[tokio::test]
    async fn test_diff_summary_reports_untracked_file() {
        let (ws, _dir) = manager();
        let workspace = ws.prepare("demo", "run-1", None).unwrap().workspace;
        std::fs::write(workspace.join("new.txt"), "content").unwrap();

        match ws.diff_summary(&workspace).await {
            Some(summary) => {
                assert!(summary.files.iter().any(|f| f.path == "new.txt"));
                assert!(summary.files.iter().all(|f| !f.status.is_empty()));
            }
            // Environments without a git binary degrade to None.
            None => {}
        }
    }
}
