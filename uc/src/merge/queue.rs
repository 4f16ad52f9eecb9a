//! MergeQueue - serial integration over parallel workers
//!
//! Workers run in parallel; integration is strictly serial. Each item goes
//! rebase -> test -> merge -> push, one item at a time. Failures schedule
//! exponential-backoff retries and keep their branches so a human can
//! recover the work.

use std::collections::HashSet;
use std::path::PathBuf;
use rand::Rng;
use tracing::{debug, info, warn};
use understore::now_ms;

use crate::config::MergeConfig;
use crate::state::{StateManager, StateResult};
use crate::verify::Verifier;

use super::git::{MergeOutcome, RebaseOutcome, delete_branch, merge_branch, push_branch, rebase_branch};
use super::item::{MergeItemStatus, MergeQueueItem};

/// Overlapping files at or below this count is a warning, above an error
const CONFLICT_WARNING_MAX_FILES: usize = 3;

/// Severity of a predicted conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSeverity {
    Warning,
    Error,
}

/// A predicted conflict between two queued items
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConflict {
    pub branch_a: String,
    pub branch_b: String,
    pub overlapping_files: Vec<String>,
    pub severity: ConflictSeverity,
}

/// The serial merge queue
pub struct MergeQueue {
    state: StateManager,
    config: MergeConfig,
    repo_root: PathBuf,
    base_branch: String,
    /// Re-verification after rebase; None skips the test step
    verifier: Option<Verifier>,
    /// Push after merge (disabled by --no-commit and in tests)
    push: bool,
}

impl MergeQueue {
    pub fn new(state: StateManager, config: MergeConfig, repo_root: impl Into<PathBuf>) -> Self {
        Self {
            state,
            config,
            repo_root: repo_root.into(),
            base_branch: "main".to_string(),
            verifier: None,
            push: true,
        }
    }

    pub fn with_base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = branch.into();
        self
    }

    pub fn with_verifier(mut self, verifier: Verifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    pub fn without_push(mut self) -> Self {
        self.push = false;
        self
    }

    /// Enqueue a completed branch
    pub async fn add(
        &self,
        branch: &str,
        task_id: &str,
        agent_id: &str,
        modified_files: Vec<String>,
    ) -> StateResult<MergeQueueItem> {
        let conflicts = self.check_conflicts_before_add(&modified_files, Some(branch)).await?;
        for conflict in &conflicts {
            warn!(
                branch,
                other = %conflict.branch_b,
                files = conflict.overlapping_files.len(),
                "Queued branch overlaps an earlier item"
            );
        }

        let item = MergeQueueItem::new(branch, task_id, agent_id, modified_files);
        self.state.upsert_merge_item(item.clone()).await?;
        info!(branch, task_id, "Enqueued for merge");
        Ok(item)
    }

    /// Predict conflicts among all incomplete queued items
    ///
    /// Symmetric: the set of pairs is stable under input permutation.
    pub async fn detect_queue_conflicts(&self) -> StateResult<Vec<QueueConflict>> {
        let items: Vec<MergeQueueItem> = self
            .state
            .list_merge_items(None)
            .await?
            .into_iter()
            .filter(|i| i.status != MergeItemStatus::Complete)
            .collect();

        let mut conflicts = Vec::new();
        for (idx, a) in items.iter().enumerate() {
            for b in items.iter().skip(idx + 1) {
                if let Some(conflict) = predict_conflict(a, b) {
                    conflicts.push(conflict);
                }
            }
        }
        Ok(conflicts)
    }

    /// Compare candidate files against pending/in-progress items only
    pub async fn check_conflicts_before_add(
        &self,
        files: &[String],
        exclude_branch: Option<&str>,
    ) -> StateResult<Vec<QueueConflict>> {
        let candidate_files: HashSet<&String> = files.iter().collect();
        let items = self.state.list_merge_items(None).await?;

        let mut conflicts = Vec::new();
        for item in items {
            if item.status == MergeItemStatus::Complete {
                continue;
            }
            if exclude_branch == Some(item.branch.as_str()) {
                continue;
            }

            let overlapping: Vec<String> = item
                .modified_files
                .iter()
                .filter(|f| candidate_files.contains(f))
                .cloned()
                .collect();
            if !overlapping.is_empty() {
                conflicts.push(build_conflict("<candidate>", &item.branch, overlapping));
            }
        }
        Ok(conflicts)
    }

    /// Drain the queue serially until nothing is eligible
    ///
    /// After each successful merge, previously failed items become
    /// immediately eligible again - their conflict may have resolved.
    pub async fn process_all(&self) -> StateResult<Vec<MergeQueueItem>> {
        if !self.config.enabled {
            debug!("Merge queue disabled");
            return Ok(Vec::new());
        }

        let mut processed = Vec::new();
        while let Some(item) = self.next_eligible().await? {
            let merged = self.process_item(item).await?;
            let succeeded = merged.status == MergeItemStatus::Complete;
            processed.push(merged);

            if succeeded {
                self.wake_failed_items().await?;
            }
        }
        Ok(processed)
    }

    async fn next_eligible(&self) -> StateResult<Option<MergeQueueItem>> {
        let now = now_ms();
        let items = self.state.list_merge_items(None).await?;

        // Invariant check: nothing should be mid-processing when the
        // serial drain starts an item
        if let Some(stuck) = items.iter().find(|i| i.status.is_processing()) {
            warn!(branch = %stuck.branch, status = %stuck.status, "Resetting item stuck in processing state");
            let mut item = stuck.clone();
            item.try_set_status(MergeItemStatus::Pending);
            self.state.upsert_merge_item(item).await?;
            return self.next_eligible_after_reset().await;
        }

        Ok(items.into_iter().find(|i| match i.status {
            MergeItemStatus::Pending => true,
            MergeItemStatus::Failed | MergeItemStatus::TestFailed => {
                i.retry_count <= self.config.max_retries && i.next_retry_after.map(|t| t <= now).unwrap_or(false)
            }
            _ => false,
        }))
    }

    async fn next_eligible_after_reset(&self) -> StateResult<Option<MergeQueueItem>> {
        let items = self.state.list_merge_items(Some("pending")).await?;
        Ok(items.into_iter().next())
    }

    /// Rebase -> test -> merge -> push for one item
    async fn process_item(&self, mut item: MergeQueueItem) -> StateResult<MergeQueueItem> {
        info!(branch = %item.branch, attempt = item.retry_count + 1, "Processing merge item");

        // === Rebase ===
        item.try_set_status(MergeItemStatus::Rebasing);
        self.state.upsert_merge_item(item.clone()).await?;

        match rebase_branch(&self.repo_root, &item.branch, &self.base_branch).await {
            Ok(RebaseOutcome::Success) => {}
            Ok(RebaseOutcome::Conflict { files, message }) => {
                item.conflict_files = files;
                return self.schedule_retry(item, format!("rebase conflict: {}", message)).await;
            }
            Err(e) => {
                return self.schedule_retry(item, format!("rebase error: {}", e)).await;
            }
        }

        // === Test (re-verification after rebase) ===
        if let Some(verifier) = &self.verifier {
            item.try_set_status(MergeItemStatus::Testing);
            self.state.upsert_merge_item(item.clone()).await?;

            match verifier.run(&self.repo_root).await {
                Ok(result) if result.passed => {}
                Ok(result) => {
                    return self
                        .schedule_retry_as(item, MergeItemStatus::TestFailed, format!("tests failed after rebase: {}", result.feedback))
                        .await;
                }
                Err(e) => {
                    return self
                        .schedule_retry_as(item, MergeItemStatus::TestFailed, format!("verification error: {}", e))
                        .await;
                }
            }
        }

        // === Merge ===
        item.try_set_status(MergeItemStatus::Merging);
        item.strategy_used = self.config.strategy;
        self.state.upsert_merge_item(item.clone()).await?;

        match merge_branch(&self.repo_root, &item.branch, &self.base_branch, self.config.strategy).await {
            Ok(MergeOutcome::FastForward) | Ok(MergeOutcome::Merged) => {}
            Ok(MergeOutcome::Conflict { message }) => {
                return self.schedule_retry(item, format!("merge conflict: {}", message)).await;
            }
            Err(e) => {
                return self.schedule_retry(item, format!("merge error: {}", e)).await;
            }
        }

        // === Push ===
        if self.push {
            match push_branch(&self.repo_root, &self.base_branch).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(branch = %item.branch, "Merged locally but push failed");
                }
                Err(e) => {
                    warn!(branch = %item.branch, error = %e, "Merged locally but push errored");
                }
            }
        }

        // Merged work branches are cleaned up; failed ones are never touched
        if let Err(e) = delete_branch(&self.repo_root, &item.branch).await {
            warn!(branch = %item.branch, error = %e, "Merged branch cleanup failed");
        }

        item.try_set_status(MergeItemStatus::Complete);
        item.next_retry_after = None;
        self.state.upsert_merge_item(item.clone()).await?;
        info!(branch = %item.branch, "Merge complete");
        Ok(item)
    }

    async fn schedule_retry(&self, item: MergeQueueItem, error: String) -> StateResult<MergeQueueItem> {
        self.schedule_retry_as(item, MergeItemStatus::Failed, error).await
    }

    /// Exponential backoff with jitter, capped at max_delay
    ///
    /// Failed merges keep their branches - never auto-deleted.
    async fn schedule_retry_as(
        &self,
        mut item: MergeQueueItem,
        status: MergeItemStatus,
        error: String,
    ) -> StateResult<MergeQueueItem> {
        item.record_error(&error);
        item.retry_count += 1;
        item.try_set_status(status);

        if item.retry_count > self.config.max_retries {
            item.next_retry_after = None;
            warn!(branch = %item.branch, retries = item.retry_count, "Merge item exhausted retries");
        } else {
            let exponential = self.config.base_delay_ms.saturating_mul(1_i64 << (item.retry_count - 1).min(16));
            let jitter = rand::rng().random_range(0..=self.config.base_delay_ms.max(1));
            let delay = (exponential + jitter).min(self.config.max_delay_ms);
            item.next_retry_after = Some(now_ms() + delay);
            debug!(branch = %item.branch, delay_ms = delay, "Scheduled merge retry");
        }

        self.state.upsert_merge_item(item.clone()).await?;
        Ok(item)
    }

    /// Make failed items immediately eligible after a successful merge
    async fn wake_failed_items(&self) -> StateResult<()> {
        let now = now_ms();
        for status in ["failed", "test_failed"] {
            for mut item in self.state.list_merge_items(Some(status)).await? {
                if item.retry_count <= self.config.max_retries && item.next_retry_after.is_some() {
                    item.next_retry_after = Some(now);
                    self.state.upsert_merge_item(item).await?;
                }
            }
        }
        Ok(())
    }
}

fn build_conflict(branch_a: &str, branch_b: &str, mut overlapping: Vec<String>) -> QueueConflict {
    overlapping.sort();
    let severity = if overlapping.len() <= CONFLICT_WARNING_MAX_FILES {
        ConflictSeverity::Warning
    } else {
        ConflictSeverity::Error
    };
    QueueConflict {
        branch_a: branch_a.to_string(),
        branch_b: branch_b.to_string(),
        overlapping_files: overlapping,
        severity,
    }
}

fn predict_conflict(a: &MergeQueueItem, b: &MergeQueueItem) -> Option<QueueConflict> {
    let files_b: HashSet<&String> = b.modified_files.iter().collect();
    let overlapping: Vec<String> = a
        .modified_files
        .iter()
        .filter(|f| files_b.contains(f))
        .cloned()
        .collect();

    if overlapping.is_empty() {
        return None;
    }

    // Stable pair ordering regardless of queue order
    let (first, second) = if a.branch <= b.branch {
        (&a.branch, &b.branch)
    } else {
        (&b.branch, &a.branch)
    };
    Some(build_conflict(first, second, overlapping))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeStrategy;
    use crate::merge::git::test_repo::{commit_file, init};
    use crate::merge::git::{checkout, create_branch};
    use crate::state::test_support::temp_state;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn queue(state: &StateManager, repo: &std::path::Path) -> MergeQueue {
        MergeQueue::new(state.clone(), MergeConfig::default(), repo).without_push()
    }

    #[tokio::test]
    async fn test_conflict_detection_pairs() {
        let (_temp, state) = temp_state();
        let repo = tempfile::tempdir().unwrap();
        let q = queue(&state, repo.path());

        q.add("b1", "t1", "agent-1", files(&["shared.ts", "a.ts"])).await.unwrap();
        q.add("b2", "t2", "agent-2", files(&["shared.ts", "b.ts"])).await.unwrap();

        let conflicts = q.detect_queue_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].overlapping_files, vec!["shared.ts"]);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Warning);

        q.add("b3", "t3", "agent-3", files(&["shared.ts"])).await.unwrap();
        let conflicts = q.detect_queue_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 3);
        for conflict in &conflicts {
            assert!(conflict.overlapping_files.contains(&"shared.ts".to_string()));
        }

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_severity_error_above_three_files() {
        let (_temp, state) = temp_state();
        let repo = tempfile::tempdir().unwrap();
        let q = queue(&state, repo.path());

        let many = files(&["a.ts", "b.ts", "c.ts", "d.ts"]);
        q.add("b1", "t1", "agent-1", many.clone()).await.unwrap();
        q.add("b2", "t2", "agent-2", many).await.unwrap();

        let conflicts = q.detect_queue_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].severity, ConflictSeverity::Error);

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_check_conflicts_before_add_ignores_complete() {
        let (_temp, state) = temp_state();
        let repo = tempfile::tempdir().unwrap();
        let q = queue(&state, repo.path());

        let item = q.add("done", "t1", "agent-1", files(&["shared.ts"])).await.unwrap();
        let mut done = item.clone();
        done.try_set_status(MergeItemStatus::Rebasing);
        done.try_set_status(MergeItemStatus::Complete);
        state.upsert_merge_item(done).await.unwrap();

        let conflicts = q.check_conflicts_before_add(&files(&["shared.ts"]), None).await.unwrap();
        assert!(conflicts.is_empty());

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_queue_well_formed() {
        let (_temp, state) = temp_state();
        let repo = tempfile::tempdir().unwrap();
        let q = queue(&state, repo.path());

        assert!(q.detect_queue_conflicts().await.unwrap().is_empty());
        assert!(q.process_all().await.unwrap().is_empty());

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_all_merges_clean_branch() {
        let (_temp, state) = temp_state();
        let repo = tempfile::tempdir().unwrap();
        init(repo.path()).await;

        create_branch(repo.path(), "undercity/t1").await.unwrap();
        commit_file(repo.path(), "feature.txt", "feature", "add feature").await;
        checkout(repo.path(), "main").await.unwrap();

        let q = queue(&state, repo.path());
        q.add("undercity/t1", "t1", "agent-1", files(&["feature.txt"])).await.unwrap();

        let processed = q.process_all().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].status, MergeItemStatus::Complete);
        assert!(repo.path().join("feature.txt").exists());

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_conflicting_branch_schedules_retry_and_keeps_branch() {
        let (_temp, state) = temp_state();
        let repo = tempfile::tempdir().unwrap();
        init(repo.path()).await;
        commit_file(repo.path(), "shared.txt", "base", "base").await;

        create_branch(repo.path(), "undercity/t1").await.unwrap();
        commit_file(repo.path(), "shared.txt", "branch version", "branch edit").await;

        checkout(repo.path(), "main").await.unwrap();
        commit_file(repo.path(), "shared.txt", "main version", "main edit").await;

        let q = queue(&state, repo.path());
        q.add("undercity/t1", "t1", "agent-1", files(&["shared.txt"])).await.unwrap();

        let processed = q.process_all().await.unwrap();
        assert_eq!(processed.len(), 1);
        let item = &processed[0];
        assert_eq!(item.status, MergeItemStatus::Failed);
        assert_eq!(item.retry_count, 1);
        assert!(item.next_retry_after.is_some());
        assert!(item.original_error.as_deref().unwrap().contains("rebase conflict"));
        assert_eq!(item.conflict_files, vec!["shared.txt"]);

        // The work branch still exists
        let branches = tokio::process::Command::new("git")
            .args(["branch", "--list", "undercity/t1"])
            .current_dir(repo.path())
            .output()
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&branches.stdout).contains("undercity/t1"));

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_backoff_grows_and_caps() {
        let (_temp, state) = temp_state();
        let repo = tempfile::tempdir().unwrap();
        let q = MergeQueue::new(
            state.clone(),
            MergeConfig {
                base_delay_ms: 1000,
                max_delay_ms: 3000,
                max_retries: 10,
                ..Default::default()
            },
            repo.path(),
        )
        .without_push();

        let mut item = MergeQueueItem::new("b", "t", "a", vec![]);
        let before = now_ms();
        for expected_retry in 1..=4 {
            item = q.schedule_retry(item, "boom".to_string()).await.unwrap();
            assert_eq!(item.retry_count, expected_retry);
            let delay = item.next_retry_after.unwrap() - before;
            assert!(delay <= 3000 + 1000, "delay {} exceeds cap + slack", delay);
        }

        state.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_retries_stop_scheduling() {
        let (_temp, state) = temp_state();
        let repo = tempfile::tempdir().unwrap();
        let q = MergeQueue::new(
            state.clone(),
            MergeConfig {
                max_retries: 1,
                ..Default::default()
            },
            repo.path(),
        )
        .without_push();

        let mut item = MergeQueueItem::new("b", "t", "a", vec![]);
        item = q.schedule_retry(item, "first".to_string()).await.unwrap();
        assert!(item.next_retry_after.is_some());

        item = q.schedule_retry(item, "second".to_string()).await.unwrap();
        assert_eq!(item.retry_count, 2);
        assert!(item.next_retry_after.is_none());

        state.shutdown().await.unwrap();
    }
}
