use crate::error::{CoreError, CoreResult};
use std::path::Path;
use std::process::Output;
use tokio::process::Command;

/// Runs `git` as a subprocess with host configuration neutralized
/// (`GIT_CONFIG_GLOBAL`/`GIT_CONFIG_SYSTEM` pointed at the null device) and every
/// argument passed through argv, never a shell (`spec.md` §4.4). Grounded in the
/// teacher's own `Command::new("git").arg("-C").args([...])` pattern in
/// `server/chat_api.rs`, generalized from read-only status/diff calls to every
/// git operation the version store needs.
pub async fn run_git(repo_root: &Path, args: &[&str]) -> CoreResult<Output> {
    let null_device = if cfg!(windows) { "NUL" } else { "/dev/null" };
    let output = Command::new("git")
        .env("GIT_CONFIG_GLOBAL", null_device)
        .env("GIT_CONFIG_SYSTEM", null_device)
        .arg("-C")
        .arg(repo_root)
        .args(args)
        .output()
        .await
        .map_err(|_| CoreError::GitUnavailable)?;
    Ok(output)
}

pub async fn run_git_ok(repo_root: &Path, args: &[&str]) -> CoreResult<String> {
    let output = run_git(repo_root, args).await?;
    if !output.status.success() {
        return Err(CoreError::ToolError(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub fn is_git_on_path() -> bool {
    which_git().is_some()
}

fn which_git() -> Option<std::path::PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join("git"))
        .find(|candidate| candidate.is_file())
}
