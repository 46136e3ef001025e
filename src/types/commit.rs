use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::git::LocalRepo;

use super::common::{CommitId, FileRef};

/// One commit of a PR as listed by the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: CommitId,
    pub message: String,
}

impl CommitInfo {
    pub fn new(sha: impl Into<CommitId>, message: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            message: message.into(),
        }
    }

    /// First line of the commit message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }

    /// Files this commit changed relative to its first parent.
    ///
    /// Resolved against the local object store on every call; fails when the
    /// commit is not available locally.
    pub fn changed_files(&self, repo: &dyn LocalRepo) -> Result<Vec<FileRef>, SyncError> {
        let unavailable = || SyncError::ChangedFilesUnavailable {
            sha: self.sha.clone(),
        };
        if !repo.has_commit(&self.sha) {
            return Err(unavailable());
        }
        let changes = match repo.commit_changes(&self.sha) {
            Ok(changes) => changes,
            Err(e) => {
                tracing::debug!(
                    "commit {}: listing changes failed: {e:#}",
                    self.sha.short()
                );
                return Err(unavailable());
            }
        };
        let files: BTreeSet<FileRef> = changes.iter().flat_map(|c| c.paths().cloned()).collect();
        Ok(files.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::stub::StubRepo;

    #[test]
    fn summary_is_first_line() {
        let c = CommitInfo::new("abc", "Fix parser\n\nLonger body");
        assert_eq!(c.summary(), "Fix parser");
    }

    #[test]
    fn changed_files_requires_local_object() {
        let repo = StubRepo::new();
        repo.add_commit("c1", &[], &[("a.txt", "1")]);
        let commit = CommitInfo::new("c1", "init");
        assert!(matches!(
            commit.changed_files(&repo),
            Err(SyncError::ChangedFilesUnavailable { .. })
        ));

        repo.make_local("c1");
        let files = commit.changed_files(&repo).unwrap();
        assert_eq!(files, vec![FileRef::from("a.txt")]);
    }
}
