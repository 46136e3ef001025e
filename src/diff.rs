//! Changed-file sets and file contents for a PR or a set of its commits.

use std::collections::BTreeSet;

use crate::error::SyncError;
use crate::git::LocalRepo;
use crate::types::{ChangeKind, CommitId, CommitInfo, FileChange, FileRef, PullRequestSummary};

/// A diff between two commits plus the revision its left side was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Merge base when one was found, otherwise the base itself.
    pub old: CommitId,
    pub new: CommitId,
    pub changes: Vec<FileChange>,
}

impl ChangeSet {
    /// Sorted, de-duplicated paths. Renames contribute both sides.
    pub fn files(&self) -> Vec<FileRef> {
        let files: BTreeSet<FileRef> = self
            .changes
            .iter()
            .flat_map(|c| c.paths().cloned())
            .collect();
        files.into_iter().collect()
    }
}

/// Diff `head` against its merge base with `base`.
///
/// Isolates the files the PR itself changed. When the merge base cannot be
/// computed (or the histories are unrelated) this falls back to a direct
/// `base..head` diff; only if that also fails is an error returned.
pub fn changes(
    repo: &dyn LocalRepo,
    head: &CommitId,
    base: &CommitId,
) -> Result<ChangeSet, SyncError> {
    match repo.merge_base(head, base) {
        Ok(Some(merge_base)) => match repo.diff(&merge_base, head) {
            Ok(changes) => {
                return Ok(ChangeSet {
                    old: merge_base,
                    new: head.clone(),
                    changes,
                });
            }
            Err(e) => tracing::warn!(
                "diff: {}..{} failed, using two-way diff: {e:#}",
                merge_base.short(),
                head.short()
            ),
        },
        Ok(None) => tracing::debug!(
            "diff: no merge base for {} and {}, using two-way diff",
            head.short(),
            base.short()
        ),
        Err(e) => tracing::warn!(
            "diff: merge-base {} {} failed, using two-way diff: {e:#}",
            head.short(),
            base.short()
        ),
    }

    repo.diff(base, head)
        .map(|changes| ChangeSet {
            old: base.clone(),
            new: head.clone(),
            changes,
        })
        .map_err(|e| SyncError::DiffComputation {
            head: head.clone(),
            base: base.clone(),
            cause: format!("{e:#}"),
        })
}

/// Files changed by a PR between `head` and `base`.
pub fn changed_files(
    repo: &dyn LocalRepo,
    head: &CommitId,
    base: &CommitId,
) -> Result<Vec<FileRef>, SyncError> {
    changes(repo, head, base).map(|set| set.files())
}

/// Changes a single commit introduced against its first parent.
///
/// A root commit is compared with the empty tree: every change is an
/// addition and `old` is left blank.
pub fn commit_changes(repo: &dyn LocalRepo, sha: &CommitId) -> Result<ChangeSet, SyncError> {
    let unavailable = || SyncError::ChangedFilesUnavailable { sha: sha.clone() };
    if !repo.has_commit(sha) {
        return Err(unavailable());
    }
    let (parent, changes) = match (repo.first_parent(sha), repo.commit_changes(sha)) {
        (Ok(parent), Ok(changes)) => (parent, changes),
        (Err(e), _) | (_, Err(e)) => {
            tracing::debug!("diff: listing changes of {} failed: {e:#}", sha.short());
            return Err(unavailable());
        }
    };
    Ok(ChangeSet {
        old: parent.unwrap_or_default(),
        new: sha.clone(),
        changes,
    })
}

/// Which base commit a PR's diff is computed against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffBase {
    /// The base SHA recorded when the PR was merged.
    Recorded(CommitId),
    /// Current tip of the base branch.
    BranchTip(CommitId),
}

impl DiffBase {
    /// Merged PRs are diffed against their recorded base so the result does
    /// not drift as the target branch moves on. Open PRs use the current tip
    /// of `<remote>/<base>` when it resolves locally, else the recorded SHA.
    pub fn for_pr(repo: &dyn LocalRepo, pr: &PullRequestSummary, remote: &str) -> Self {
        if pr.merged {
            return Self::Recorded(pr.base_sha.clone());
        }
        let tracking = format!("refs/remotes/{remote}/{}", pr.base_branch());
        match repo.resolve(&tracking) {
            Ok(Some(tip)) => Self::BranchTip(tip),
            Ok(None) => Self::Recorded(pr.base_sha.clone()),
            Err(e) => {
                tracing::debug!("diff: resolving {tracking} failed: {e:#}");
                Self::Recorded(pr.base_sha.clone())
            }
        }
    }

    pub fn commit(&self) -> &CommitId {
        match self {
            Self::Recorded(sha) | Self::BranchTip(sha) => sha,
        }
    }
}

/// Union of the files changed by each selected commit.
///
/// A commit whose changes cannot be listed contributes an inline error
/// message instead of aborting the rest. `keep_going` is polled before each
/// commit; returning `false` stops early.
pub fn files_for_commits(
    repo: &dyn LocalRepo,
    commits: &[CommitInfo],
    mut keep_going: impl FnMut() -> bool,
) -> (Vec<FileRef>, Vec<String>) {
    let mut files = BTreeSet::new();
    let mut errors = Vec::new();
    for commit in commits {
        if !keep_going() {
            break;
        }
        match commit.changed_files(repo) {
            Ok(changed) => files.extend(changed),
            Err(e) => errors.push(e.to_string()),
        }
    }
    (files.into_iter().collect(), errors)
}

/// Content of `path` at `rev`, empty when the file does not exist there.
pub fn file_content(repo: &dyn LocalRepo, rev: &CommitId, path: &str) -> String {
    match repo.file_content(rev, path) {
        Ok(content) => content.unwrap_or_default(),
        Err(e) => {
            tracing::warn!("diff: reading {path} at {} failed: {e:#}", rev.short());
            String::new()
        }
    }
}

/// A revision and the path of the file at that revision.
pub type Side = (CommitId, String);

/// Revisions each side of a comparison is read from, and the path on each side.
pub fn comparison_sides(set: &ChangeSet, change: &FileChange) -> (Option<Side>, Option<Side>) {
    let path = change.path.as_str().to_owned();
    match &change.kind {
        ChangeKind::Added => (None, Some((set.new.clone(), path))),
        ChangeKind::Deleted => (Some((set.old.clone(), path)), None),
        ChangeKind::Modified => (
            Some((set.old.clone(), path.clone())),
            Some((set.new.clone(), path)),
        ),
        ChangeKind::Renamed { from } => (
            Some((set.old.clone(), from.as_str().to_owned())),
            Some((set.new.clone(), path)),
        ),
    }
}
