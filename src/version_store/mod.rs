pub mod git_runner;
pub mod preview;
pub mod sanitize;

use crate::error::{CoreError, CoreResult};
use crate::paths::projects_root;
use git_runner::{run_git, run_git_ok};
use preview::{PreviewRegistry, PreviewState};
use sanitize::{auto_message, user_message};
use std::path::{Path, PathBuf};

const EMPTY_TREE_SHA: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

#[derive(Debug, Clone)]
pub struct Version {
    pub sha: String,
    pub email: String,
    pub message: String,
    pub timestamp: i64,
    pub is_user_version: bool,
    pub is_initial: bool,
}

#[derive(Debug, Clone)]
pub struct DiffFile {
    pub path: String,
    pub additions: usize,
    pub deletions: usize,
}

fn validate_sha_shape(sha: &str) -> CoreResult<()> {
    let len_ok = (7..=40).contains(&sha.len());
    let hex_ok = !sha.is_empty() && sha.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if len_ok && hex_ok {
        Ok(())
    } else {
        Err(CoreError::Validation(format!("invalid sha shape: {sha}")))
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut result = PathBuf::new();
    for component in path.components() {
        if !matches!(component, std::path::Component::CurDir) {
            result.push(component.as_os_str());
        }
    }
    result
}

/// The path sandbox required of every public operation (`spec.md` §4.4, §8
/// invariant 5).
pub fn validate_path(path: &Path) -> CoreResult<PathBuf> {
    let raw = path.to_string_lossy();
    if raw.contains("..") {
        return Err(CoreError::SandboxViolation(format!("path contains '..': {raw}")));
    }
    let root = projects_root();
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let normalized = normalize_lexically(&absolute);
    if !normalized.starts_with(root) {
        return Err(CoreError::SandboxViolation(format!(
            "path escapes sandbox root: {}",
            normalized.display()
        )));
    }
    if normalized.exists() {
        let real = normalized
            .canonicalize()
            .map_err(|e| CoreError::Internal(e.into()))?;
        if !real.starts_with(root) {
            return Err(CoreError::SandboxViolation(format!(
                "symlink escapes sandbox root: {}",
                real.display()
            )));
        }
    }
    Ok(normalized)
}

fn parse_diff_stats(diff_text: &str) -> Vec<DiffFile> {
    let mut files = Vec::new();
    let mut current: Option<DiffFile> = None;
    for line in diff_text.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(f) = current.take() {
                files.push(f);
            }
            let path = rest.split(" b/").last().unwrap_or("").to_string();
            current = Some(DiffFile { path, additions: 0, deletions: 0 });
        } else if line.starts_with("+++") || line.starts_with("---") {
            continue;
        } else if let Some(f) = current.as_mut() {
            if line.starts_with('+') {
                f.additions += 1;
            } else if line.starts_with('-') {
                f.deletions += 1;
            }
        }
    }
    if let Some(f) = current.take() {
        files.push(f);
    }
    files
}

/// Sandboxed, auditable git history for a project directory (`spec.md` §4.4).
/// Grounded in the teacher's read-only `git status`/`git diff` usage in
/// `server/chat_api.rs`, generalized here to the full read/write surface.
pub struct VersionStore {
    previews: PreviewRegistry,
}

impl Default for VersionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionStore {
    pub fn new() -> Self {
        Self {
            previews: PreviewRegistry::new(),
        }
    }

    pub fn is_in_preview(&self, path: &Path) -> CoreResult<bool> {
        let root = validate_path(path)?;
        Ok(self.previews.is_active(&root))
    }

    pub async fn ensure_repo(&self, path: &Path, user_name: &str, user_email: &str) -> CoreResult<()> {
        let root = validate_path(path)?;
        std::fs::create_dir_all(&root).map_err(|e| CoreError::Internal(e.into()))?;
        if root.join(".git").is_dir() {
            return Ok(());
        }
        run_git_ok(&root, &["init"]).await?;
        run_git_ok(&root, &["config", "user.name", user_name]).await?;
        run_git_ok(&root, &["config", "user.email", user_email]).await?;
        let gitignore = root.join(".gitignore");
        if !gitignore.exists() {
            std::fs::write(&gitignore, "node_modules/\n.DS_Store\ntarget/\n")
                .map_err(|e| CoreError::Internal(e.into()))?;
        }
        run_git_ok(&root, &["add", "-A"]).await?;
        run_git_ok(&root, &["commit", "--allow-empty", "-m", "auto: initial commit"]).await?;
        Ok(())
    }

    async fn commit_if_dirty(
        &self,
        root: &Path,
        message: String,
        max_versions_retained: usize,
    ) -> CoreResult<Option<String>> {
        if self.previews.is_active(&root.to_path_buf()) {
            self.exit_preview(root, false).await?;
        }
        run_git_ok(root, &["add", "-A"]).await?;
        let status = run_git_ok(root, &["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Ok(None);
        }
        run_git_ok(root, &["commit", "-m", &message]).await?;
        let sha = run_git_ok(root, &["rev-parse", "HEAD"]).await?.trim().to_string();
        self.prune_excess(root, max_versions_retained).await.ok();
        Ok(Some(sha))
    }

    pub async fn auto_commit(
        &self,
        path: &Path,
        message: &str,
        max_versions_retained: usize,
    ) -> CoreResult<Option<String>> {
        let root = validate_path(path)?;
        self.commit_if_dirty(&root, auto_message(message), max_versions_retained)
            .await
    }

    pub async fn user_commit(
        &self,
        path: &Path,
        label: &str,
        max_versions_retained: usize,
    ) -> CoreResult<Option<String>> {
        let root = validate_path(path)?;
        self.commit_if_dirty(&root, user_message(label), max_versions_retained)
            .await
    }

    pub async fn list_versions(
        &self,
        path: &Path,
        max_auto: usize,
        max_user: usize,
    ) -> CoreResult<Vec<Version>> {
        let root = validate_path(path)?;
        let initial_output = run_git_ok(&root, &["rev-list", "--max-parents=0", "HEAD"])
            .await
            .unwrap_or_default();
        let initial_shas: std::collections::HashSet<String> =
            initial_output.lines().map(|s| s.trim().to_string()).collect();

        let log = run_git_ok(&root, &["log", "--format=%H%x1f%ae%x1f%ct%x1f%s"]).await?;
        let mut autos = Vec::new();
        let mut users = Vec::new();
        for line in log.lines() {
            let mut parts = line.splitn(4, '\x1f');
            let sha = parts.next().unwrap_or_default().to_string();
            let email = parts.next().unwrap_or_default().to_string();
            let timestamp: i64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
            let message = parts.next().unwrap_or_default().to_string();
            let is_user_version = message.starts_with("user:");
            let is_initial = initial_shas.contains(&sha);
            let version = Version {
                sha,
                email,
                message,
                timestamp,
                is_user_version,
                is_initial,
            };
            if is_user_version {
                users.push(version);
            } else {
                autos.push(version);
            }
        }
        autos.truncate(max_auto);
        users.truncate(max_user);
        let mut combined = autos;
        combined.extend(users);
        combined.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(combined)
    }

    pub async fn rollback_to_version(
        &self,
        path: &Path,
        sha: &str,
        max_versions_retained: usize,
    ) -> CoreResult<Option<String>> {
        let root = validate_path(path)?;
        validate_sha_shape(sha)?;
        let obj_type = run_git_ok(&root, &["cat-file", "-t", sha]).await?;
        if obj_type.trim() != "commit" {
            return Err(CoreError::Validation(format!("{sha} is not a commit")));
        }
        let initial = run_git_ok(&root, &["rev-list", "--max-parents=0", "HEAD"]).await?;
        if initial.lines().any(|l| l.trim() == sha) {
            return Err(CoreError::Validation(
                "cannot roll back to the initial root commit".into(),
            ));
        }
        run_git_ok(&root, &["checkout", sha, "--", "."]).await?;
        let short = &sha[..sha.len().min(7)];
        self.commit_if_dirty(
            &root,
            auto_message(&format!("Reverted to {short}")),
            max_versions_retained,
        )
        .await
    }

    pub async fn get_diff(&self, path: &Path, sha: &str) -> CoreResult<Vec<DiffFile>> {
        let root = validate_path(path)?;
        validate_sha_shape(sha)?;
        let parent_ref = format!("{sha}~1");
        let output = run_git(&root, &["diff", &parent_ref, sha]).await?;
        let diff_text = if output.status.success() {
            String::from_utf8_lossy(&output.stdout).to_string()
        } else {
            run_git_ok(&root, &["diff", EMPTY_TREE_SHA, sha]).await?
        };
        Ok(parse_diff_stats(&diff_text))
    }

    pub async fn enter_preview(&self, path: &Path, sha: &str) -> CoreResult<()> {
        let root = validate_path(path)?;
        validate_sha_shape(sha)?;
        let head = run_git_ok(&root, &["rev-parse", "HEAD"]).await?.trim().to_string();
        run_git_ok(&root, &["checkout", sha, "--", "."]).await?;
        self.previews.enter(
            &root,
            PreviewState {
                original_head: head,
                preview_sha: sha.to_string(),
            },
        );
        Ok(())
    }

    pub async fn exit_preview(&self, path: &Path, clean: bool) -> CoreResult<()> {
        let root = validate_path(path)?;
        if let Some(state) = self.previews.exit(&root) {
            run_git_ok(&root, &["checkout", &state.original_head, "--", "."]).await?;
            if clean {
                run_git_ok(&root, &["clean", "-fd"]).await?;
            }
        }
        Ok(())
    }

    /// Rewrites history by `commit-tree` so every retained commit keeps its exact
    /// tree and message, chained by `-p` (`spec.md` §4.4, §8 invariant 6).
    pub async fn delete_version(&self, path: &Path, sha: &str) -> CoreResult<()> {
        let root = validate_path(path)?;
        validate_sha_shape(sha)?;
        let head = run_git_ok(&root, &["rev-parse", "HEAD"]).await?.trim().to_string();
        let log = run_git_ok(&root, &["rev-list", "--reverse", "HEAD"]).await?;
        let shas: Vec<String> = log.lines().map(|s| s.trim().to_string()).collect();
        if shas.len() <= 1 {
            return Err(CoreError::Validation("cannot delete the only commit".into()));
        }
        if sha == head {
            return Err(CoreError::Validation("cannot delete HEAD".into()));
        }
        if !shas.iter().any(|s| s == sha) {
            return Err(CoreError::Validation(format!("{sha} not found in history")));
        }

        let mut prev_new_sha: Option<String> = None;
        for old_sha in shas.iter().filter(|s| s.as_str() != sha) {
            let tree = run_git_ok(&root, &["rev-parse", &format!("{old_sha}^{{tree}}")])
                .await?
                .trim()
                .to_string();
            let message = run_git_ok(&root, &["log", "-1", "--format=%B", old_sha]).await?;
            let message = message.trim_end_matches('\n').to_string();
            let mut args: Vec<String> = vec!["commit-tree".into(), tree];
            if let Some(parent) = &prev_new_sha {
                args.push("-p".into());
                args.push(parent.clone());
            }
            args.push("-m".into());
            args.push(message);
            let args_ref: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
            let new_sha = run_git_ok(&root, &args_ref).await?.trim().to_string();
            prev_new_sha = Some(new_sha);
        }

        let new_tip = prev_new_sha
            .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("no commits retained")))?;
        run_git_ok(&root, &["reset", "--hard", &new_tip]).await?;
        run_git_ok(&root, &["reflog", "expire", "--expire=now", "--all"]).await?;
        run_git_ok(&root, &["gc", "--prune=now"]).await?;
        Ok(())
    }

    /// While total commits exceed `max_versions_retained`, delete the oldest
    /// auto-commit that is not `HEAD` (falling back to the absolute oldest
    /// non-HEAD commit), recounting between iterations since every rewrite
    /// changes every subsequent SHA (`spec.md` §4.4, §8 invariant 7).
    pub async fn prune_excess(&self, path: &Path, max_versions_retained: usize) -> CoreResult<()> {
        let root = validate_path(path)?;
        loop {
            let count_raw = run_git_ok(&root, &["rev-list", "--count", "HEAD"]).await?;
            let count: usize = count_raw.trim().parse().unwrap_or(0);
            if count <= max_versions_retained {
                break;
            }
            let head = run_git_ok(&root, &["rev-parse", "HEAD"]).await?.trim().to_string();
            let log_all = run_git_ok(&root, &["log", "--reverse", "--format=%H%x1f%s"]).await?;
            let mut candidate: Option<String> = None;
            let mut fallback: Option<String> = None;
            for line in log_all.lines() {
                let mut parts = line.splitn(2, '\x1f');
                let sha = parts.next().unwrap_or_default().to_string();
                let msg = parts.next().unwrap_or_default();
                if sha == head {
                    continue;
                }
                if fallback.is_none() {
                    fallback = Some(sha.clone());
                }
                if msg.starts_with("auto:") && candidate.is_none() {
                    candidate = Some(sha);
                    break;
                }
            }
            let target = candidate.or(fallback);
            match target {
                Some(target_sha) => {
                    if self.delete_version(&root, &target_sha).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Every public `VersionStore` method runs its path through the sandbox, so
    /// tests operate on a throwaway directory under the real `projects/` root
    /// rather than an arbitrary tempdir.
    struct SandboxedRepo {
        root: PathBuf,
    }

    impl SandboxedRepo {
        async fn new(name: &str) -> Self {
            let root = projects_root().join(format!("test-{name}-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&root).unwrap();
            run_git_ok(&root, &["init"]).await.unwrap();
            run_git_ok(&root, &["config", "user.name", "tester"]).await.unwrap();
            run_git_ok(&root, &["config", "user.email", "tester@local"])
                .await
                .unwrap();
            Self { root }
        }
    }

    impl Drop for SandboxedRepo {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    async fn write_and_commit(store: &VersionStore, root: &Path, content: &str, label: &str) -> String {
        std::fs::write(root.join("file.txt"), content).unwrap();
        store
            .auto_commit(root, label, 50)
            .await
            .unwrap()
            .expect("expected a commit")
    }

    #[tokio::test]
    async fn validate_rejects_dotdot_and_escapes() {
        let root = projects_root();
        assert!(validate_path(&root.join("../escape")).is_err());
        assert!(validate_path(Path::new("/etc/passwd")).is_err());
        assert!(validate_path(&root.join("ok-project")).is_ok());
    }

    #[tokio::test]
    async fn ensure_repo_is_idempotent() {
        let repo = SandboxedRepo::new("ensure").await;
        let store = VersionStore::new();
        store.ensure_repo(&repo.root, "tester", "tester@local").await.unwrap();
        store.ensure_repo(&repo.root, "tester", "tester@local").await.unwrap();
    }

    #[tokio::test]
    async fn rollback_restores_prior_content() {
        let repo = SandboxedRepo::new("rollback").await;
        let store = VersionStore::new();
        write_and_commit(&store, &repo.root, "v1", "first").await;
        let sha_a = write_and_commit(&store, &repo.root, "v2", "second").await;
        write_and_commit(&store, &repo.root, "v3", "third").await;

        store.rollback_to_version(&repo.root, &sha_a, 50).await.unwrap();
        let content = std::fs::read_to_string(repo.root.join("file.txt")).unwrap();
        assert_eq!(content, "v2");
    }

    #[tokio::test]
    async fn delete_middle_version_preserves_head_tree() {
        let repo = SandboxedRepo::new("delete-middle").await;
        let store = VersionStore::new();
        write_and_commit(&store, &repo.root, "v1", "first").await;
        let sha_middle = write_and_commit(&store, &repo.root, "v2", "second").await;
        write_and_commit(&store, &repo.root, "v3", "third").await;

        let head_tree_before = run_git_ok(&repo.root, &["rev-parse", "HEAD^{tree}"]).await.unwrap();

        store.delete_version(&repo.root, &sha_middle).await.unwrap();

        let head_tree_after = run_git_ok(&repo.root, &["rev-parse", "HEAD^{tree}"]).await.unwrap();
        assert_eq!(head_tree_before.trim(), head_tree_after.trim());

        let versions = store.list_versions(&repo.root, 50, 50).await.unwrap();
        assert!(!versions.iter().any(|v| v.sha == sha_middle));

        let content = std::fs::read_to_string(repo.root.join("file.txt")).unwrap();
        assert_eq!(content, "v3");
    }

    #[tokio::test]
    async fn preview_never_moves_head_and_restores_on_exit() {
        let repo = SandboxedRepo::new("preview").await;
        let store = VersionStore::new();
        let sha_a = write_and_commit(&store, &repo.root, "v1", "first").await;
        write_and_commit(&store, &repo.root, "v2", "second").await;

        let head_before = run_git_ok(&repo.root, &["rev-parse", "HEAD"]).await.unwrap();
        store.enter_preview(&repo.root, &sha_a).await.unwrap();
        let head_during = run_git_ok(&repo.root, &["rev-parse", "HEAD"]).await.unwrap();
        assert_eq!(head_before.trim(), head_during.trim());
        let content_during = std::fs::read_to_string(repo.root.join("file.txt")).unwrap();
        assert_eq!(content_during, "v1");

        store.exit_preview(&repo.root, false).await.unwrap();
        let content_after = std::fs::read_to_string(repo.root.join("file.txt")).unwrap();
        assert_eq!(content_after, "v2");
    }

    #[test]
    fn diff_stats_count_added_and_removed_lines() {
        let diff = "diff --git a/foo.txt b/foo.txt\nindex abc..def 100644\n--- a/foo.txt\n+++ b/foo.txt\n@@ -1,2 +1,2 @@\n-old line\n+new line\n+another\n";
        let files = parse_diff_stats(diff);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "foo.txt");
        assert_eq!(files[0].additions, 2);
        assert_eq!(files[0].deletions, 1);
    }

    #[test]
    fn sha_shape_validation() {
        assert!(validate_sha_shape("abc1234").is_ok());
        assert!(validate_sha_shape("ABC1234").is_err());
        assert!(validate_sha_shape("short").is_err());
        assert!(validate_sha_shape("not-hex!").is_err());
    }
}
