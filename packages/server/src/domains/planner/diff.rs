//! Changed-path diff for a commit, read from the repository snapshot with
//! `git show --name-only`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Paths touched by `commit_sha`. An error (unknown sha, not a git repo)
/// is surfaced to the planner, which falls back rather than guessing.
pub async fn changed_paths(repo_dir: &Path, commit_sha: &str) -> Result<Vec<String>> {
    let output = Command::new("git")
        .arg("show")
        .arg("--name-only")
        .arg("--format=")
        .arg(commit_sha)
        .current_dir(repo_dir)
        .output()
        .await
        .context("failed to spawn git")?;

    if !output.status.success() {
        bail!(
            "git show failed for {}: {}",
            commit_sha,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let mut paths: Vec<String> = String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    paths.sort();
    paths.dedup();

    Ok(paths)
}
