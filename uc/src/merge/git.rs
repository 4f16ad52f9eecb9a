//! Git operations for the merge queue
//!
//! All git work goes through the system git binary. Failed operations are
//! always aborted so the repository never stays in a half-rebased or
//! half-merged state.

use std::path::Path;

use eyre::{Result, bail};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::MergeStrategy;

/// Result of a rebase attempt
#[derive(Debug, Clone)]
pub enum RebaseOutcome {
    Success,
    Conflict { files: Vec<String>, message: String },
}

/// Result of a merge attempt
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    /// Fast-forwarded, no merge commit
    FastForward,
    /// Three-way merge commit created
    Merged,
    Conflict { message: String },
}

async fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    debug!(?args, repo = %repo.display(), "git");
    Ok(Command::new("git").args(args).current_dir(repo).output().await?)
}

/// The branch currently checked out
pub async fn current_branch(repo: &Path) -> Result<String> {
    let output = git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    if !output.status.success() {
        bail!("Not a git repository: {}", repo.display());
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Create and check out a branch
pub async fn create_branch(repo: &Path, name: &str) -> Result<()> {
    let output = git(repo, &["checkout", "-b", name]).await?;
    if !output.status.success() {
        bail!("Failed to create branch {}: {}", name, String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

/// Check out an existing branch
pub async fn checkout(repo: &Path, name: &str) -> Result<()> {
    let output = git(repo, &["checkout", name]).await?;
    if !output.status.success() {
        bail!("Failed to checkout {}: {}", name, String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

/// Rebase a branch onto a base branch
///
/// On conflict the rebase is aborted and the conflicting files returned;
/// the branch itself is left untouched.
pub async fn rebase_branch(repo: &Path, branch: &str, onto: &str) -> Result<RebaseOutcome> {
    checkout(repo, branch).await?;

    let output = git(repo, &["rebase", onto]).await?;
    if output.status.success() {
        info!(branch, onto, "Rebase succeeded");
        return Ok(RebaseOutcome::Success);
    }

    let message = String::from_utf8_lossy(&output.stderr).to_string();

    // Collect the conflicting files before aborting
    let conflicts = git(repo, &["diff", "--name-only", "--diff-filter=U"]).await?;
    let files: Vec<String> = String::from_utf8_lossy(&conflicts.stdout)
        .lines()
        .map(String::from)
        .collect();

    let abort = git(repo, &["rebase", "--abort"]).await?;
    if !abort.status.success() {
        warn!(branch, "Rebase abort failed: {}", String::from_utf8_lossy(&abort.stderr));
    }

    warn!(branch, conflict_count = files.len(), "Rebase conflict");
    Ok(RebaseOutcome::Conflict { files, message })
}

/// Merge a branch into a base branch
///
/// Fast-forward when possible; otherwise a three-way merge, applying the
/// configured strategy option on conflicts. An unresolvable conflict is
/// aborted and reported.
pub async fn merge_branch(repo: &Path, branch: &str, onto: &str, strategy: MergeStrategy) -> Result<MergeOutcome> {
    checkout(repo, onto).await?;

    // Try fast-forward first
    let ff = git(repo, &["merge", "--ff-only", branch]).await?;
    if ff.status.success() {
        info!(branch, onto, "Fast-forward merge");
        return Ok(MergeOutcome::FastForward);
    }

    let merge_msg = format!("Merge branch '{}'", branch);
    let mut args = vec!["merge", "--no-ff"];
    match strategy {
        MergeStrategy::Default => {}
        MergeStrategy::Ours => args.extend(["-X", "ours"]),
        MergeStrategy::Theirs => args.extend(["-X", "theirs"]),
    }
    args.extend([branch, "-m", &merge_msg]);

    let output = git(repo, &args).await?;
    if output.status.success() {
        info!(branch, onto, strategy = strategy.as_str(), "Three-way merge");
        return Ok(MergeOutcome::Merged);
    }

    let message = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let abort = git(repo, &["merge", "--abort"]).await?;
    if !abort.status.success() {
        warn!(branch, "Merge abort failed: {}", String::from_utf8_lossy(&abort.stderr));
    }

    warn!(branch, "Merge conflict");
    Ok(MergeOutcome::Conflict { message })
}

/// Push a branch to origin; a missing remote is reported, not fatal
pub async fn push_branch(repo: &Path, branch: &str) -> Result<bool> {
    let output = git(repo, &["push", "origin", branch]).await?;
    if output.status.success() {
        info!(branch, "Pushed");
        Ok(true)
    } else {
        warn!(branch, "Push failed: {}", String::from_utf8_lossy(&output.stderr));
        Ok(false)
    }
}

/// Delete a branch (only ever called after a successful merge)
pub async fn delete_branch(repo: &Path, branch: &str) -> Result<()> {
    let output = git(repo, &["branch", "-D", branch]).await?;
    if !output.status.success() {
        warn!(branch, "Branch delete failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(())
}

#[cfg(test)]
pub mod test_repo {
    use super::*;

    /// Initialise a git repo with one commit on `main`
    pub async fn init(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test"],
            vec!["commit", "--allow-empty", "-m", "initial"],
        ] {
            let output = Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
            assert!(output.status.success(), "git {:?} failed", args);
        }
    }

    /// Write a file and commit it on the current branch
    pub async fn commit_file(dir: &Path, name: &str, content: &str, message: &str) {
        std::fs::write(dir.join(name), content).unwrap();
        for args in [vec!["add", "-A"], vec!["commit", "-m", message]] {
            let output = Command::new("git").args(&args).current_dir(dir).output().await.unwrap();
            assert!(output.status.success(), "git {:?} failed", args);
        }
    }
}
