// github module: the remote API seam and its GitHub REST implementation.

pub mod auth;
pub mod client;
pub mod errors;
pub mod pulls;
pub mod stub;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{CommitInfo, MergeableState, PrStateFilter, PullRequestSummary};

pub use client::{GitHubClient, TokenSource};
pub use pulls::GitHubRemote;
pub use stub::StubRemote;

/// Remote operations the engine consumes.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Every PR in `state`, across all pages.
    async fn list_pull_requests(&self, state: PrStateFilter) -> Result<Vec<PullRequestSummary>>;

    async fn list_commits(&self, number: u64) -> Result<Vec<CommitInfo>>;

    async fn mergeable_state(&self, number: u64) -> Result<MergeableState>;

    async fn is_merged(&self, number: u64) -> Result<bool>;

    /// Forget cached credentials so the next call re-resolves them.
    fn reset_credentials(&self);
}
