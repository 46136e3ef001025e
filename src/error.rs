use thiserror::Error;

use crate::types::CommitId;

/// Failures the synchronization engine reports upward.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// The PR list could not be fetched. Aborts the refresh.
    #[error("{cause}")]
    RemoteFetch { cause: String },

    /// A commit is still missing locally after a fetch attempt.
    #[error("Could not make commit {} available locally", .sha.short())]
    ObjectUnavailable { sha: CommitId },

    /// One field of one PR was unreadable and replaced with a sentinel.
    #[error("PR #{number}: unreadable field `{field}`")]
    PartialField { number: u64, field: &'static str },

    #[error("could not compute changes between {base} and {head}: {cause}")]
    DiffComputation {
        head: CommitId,
        base: CommitId,
        cause: String,
    },

    #[error("Error loading files for commit {}", .sha.short())]
    ChangedFilesUnavailable { sha: CommitId },

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("background worker failed: {0}")]
    Worker(String),

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_use_short_sha() {
        let err = SyncError::ChangedFilesUnavailable {
            sha: CommitId::from("0123456789abcdef"),
        };
        assert_eq!(err.to_string(), "Error loading files for commit 0123456");
    }
}
