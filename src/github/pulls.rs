use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::SyncError;
use crate::types::{
    CommitId, CommitInfo, MergeableState, PrStateFilter, PullRequestSummary, RepoRef,
    UPDATED_AT_SENTINEL,
};

use super::RemoteApi;
use super::client::GitHubClient;

const PER_PAGE: usize = 100;
/// Hard stop for runaway pagination (10k items).
const MAX_PAGES: u32 = 100;

// ---------------------------------------------------------------------------
// Raw REST shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawPull {
    number: u64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    user: Option<RawUser>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    merged_at: Option<String>,
    #[serde(default)]
    merged: Option<bool>,
    #[serde(default)]
    html_url: Option<String>,
    #[serde(default)]
    labels: Option<Vec<RawLabel>>,
    #[serde(default)]
    assignees: Option<Vec<RawUser>>,
    #[serde(default)]
    draft: Option<bool>,
    #[serde(default)]
    mergeable_state: Option<String>,
    head: RawBranch,
    base: RawBranch,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawBranch {
    #[serde(rename = "ref", default)]
    ref_name: Option<String>,
    #[serde(default)]
    sha: Option<String>,
    #[serde(default)]
    repo: Option<RawRepo>,
}

#[derive(Debug, Deserialize)]
struct RawRepo {
    #[serde(default)]
    full_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    sha: String,
    #[serde(default)]
    commit: Option<RawCommitDetail>,
}

#[derive(Debug, Deserialize)]
struct RawCommitDetail {
    #[serde(default)]
    message: Option<String>,
}

fn partial(number: u64, field: &'static str) {
    tracing::warn!("github: {}", SyncError::PartialField { number, field });
}

/// Convert one listed PR, substituting sentinels for unreadable fields.
fn into_summary(raw: RawPull, repo_full_name: &str) -> PullRequestSummary {
    let number = raw.number;

    let parsed = raw.updated_at.as_deref().map(DateTime::parse_from_rfc3339);
    let updated_at = match parsed {
        Some(Ok(t)) => t.with_timezone(&Utc),
        _ => {
            partial(number, "updated_at");
            UPDATED_AT_SENTINEL
        }
    };

    let author = if let Some(user) = raw.user {
        user.login
    } else {
        partial(number, "user");
        String::new()
    };

    let base_full_name = raw
        .base
        .repo
        .and_then(|r| r.full_name)
        .unwrap_or_else(|| repo_full_name.to_owned());
    let (is_fork, fork_full_name) = match raw.head.repo.and_then(|r| r.full_name) {
        Some(head_full_name) => (head_full_name != base_full_name, head_full_name),
        None => {
            // The head repository was deleted: always a fork, nowhere to fetch from.
            partial(number, "head.repo");
            (true, String::new())
        }
    };

    let mergeable_state = match raw.mergeable_state.as_deref() {
        Some(state) => MergeableState::from_api(state),
        None if raw.draft == Some(true) => MergeableState::Draft,
        None => MergeableState::Unknown,
    };

    PullRequestSummary {
        number,
        title: raw.title.unwrap_or_default(),
        author,
        updated_at,
        base_ref: raw.base.ref_name.unwrap_or_default(),
        head_ref: raw.head.ref_name.unwrap_or_default(),
        head_sha: CommitId::new(raw.head.sha.unwrap_or_default()),
        base_sha: CommitId::new(raw.base.sha.unwrap_or_default()),
        is_fork,
        fork_full_name,
        labels: raw
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|l| l.name)
            .collect(),
        assignees: raw
            .assignees
            .unwrap_or_default()
            .into_iter()
            .map(|a| a.login)
            .collect(),
        mergeable_state,
        merged: raw.merged.unwrap_or(false) || raw.merged_at.is_some(),
        url: raw.html_url.unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// GitHubRemote
// ---------------------------------------------------------------------------

/// [`RemoteApi`] over the GitHub REST API for one repository.
pub struct GitHubRemote {
    client: GitHubClient,
    repo: RepoRef,
    /// Single-PR responses, shared by `is_merged` and `mergeable_state`.
    details: Cache<u64, Arc<RawPull>>,
}

impl GitHubRemote {
    pub fn new(client: GitHubClient, repo: RepoRef) -> Self {
        let details = Cache::builder()
            .max_capacity(500)
            .time_to_live(Duration::from_secs(30))
            .build();
        Self {
            client,
            repo,
            details,
        }
    }

    fn route(&self, suffix: &str) -> String {
        format!("/repos/{}/{}/{suffix}", self.repo.owner, self.repo.name)
    }

    /// GET every page of a list endpoint.
    async fn get_pages<T: DeserializeOwned + Send>(
        &self,
        route: &str,
        extra: &[(&'static str, String)],
        what: &str,
    ) -> Result<Vec<T>> {
        let octocrab = self.client.octocrab()?;
        let mut all = Vec::new();
        for page in 1..=MAX_PAGES {
            let mut params: HashMap<&str, String> = HashMap::new();
            params.insert("per_page", PER_PAGE.to_string());
            params.insert("page", page.to_string());
            for (key, value) in extra {
                params.insert(*key, value.clone());
            }
            let batch: Vec<T> = octocrab
                .get(route, Some(&params))
                .await
                .with_context(|| format!("{what} (page {page})"))?;
            let len = batch.len();
            all.extend(batch);
            if len < PER_PAGE {
                return Ok(all);
            }
        }
        tracing::warn!("github: {what} truncated after {MAX_PAGES} pages");
        Ok(all)
    }

    async fn detail(&self, number: u64) -> Result<Arc<RawPull>> {
        let route = self.route(&format!("pulls/{number}"));
        self.details
            .try_get_with(number, async {
                let octocrab = self.client.octocrab()?;
                let raw: RawPull = octocrab
                    .get(&route, None::<&()>)
                    .await
                    .with_context(|| format!("fetching PR #{number}"))?;
                Ok::<_, anyhow::Error>(Arc::new(raw))
            })
            .await
            .map_err(|e| anyhow!("{e:#}"))
    }
}

#[async_trait]
impl RemoteApi for GitHubRemote {
    async fn list_pull_requests(&self, state: PrStateFilter) -> Result<Vec<PullRequestSummary>> {
        let route = self.route("pulls");
        let extra = [
            ("state", state.as_api_str().to_owned()),
            ("sort", "updated".to_owned()),
            ("direction", "desc".to_owned()),
        ];
        // Items are decoded one by one so a single malformed PR cannot sink the batch.
        let items: Vec<JsonValue> = self
            .get_pages(&route, &extra, "listing pull requests")
            .await?;
        let full_name = self.repo.full_name();
        let mut prs = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<RawPull>(item) {
                Ok(raw) => prs.push(into_summary(raw, &full_name)),
                Err(e) => tracing::warn!("github: skipping unreadable PR entry: {e}"),
            }
        }
        tracing::debug!("github: listed {} {state} PRs for {full_name}", prs.len());
        Ok(prs)
    }

    async fn list_commits(&self, number: u64) -> Result<Vec<CommitInfo>> {
        let route = self.route(&format!("pulls/{number}/commits"));
        let raw: Vec<RawCommit> = self
            .get_pages(&route, &[], &format!("listing commits of PR #{number}"))
            .await?;
        let commits = raw
            .into_iter()
            .map(|c| {
                let message = c.commit.and_then(|d| d.message).unwrap_or_default();
                CommitInfo::new(c.sha, message)
            })
            .collect();
        Ok(commits)
    }

    async fn mergeable_state(&self, number: u64) -> Result<MergeableState> {
        let raw = self.detail(number).await?;
        let state = raw.mergeable_state.as_deref();
        Ok(state.map_or(MergeableState::Unknown, MergeableState::from_api))
    }

    async fn is_merged(&self, number: u64) -> Result<bool> {
        let raw = self.detail(number).await?;
        Ok(raw.merged.unwrap_or(false) || raw.merged_at.is_some())
    }

    fn reset_credentials(&self) {
        self.client.invalidate();
        self.details.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> RawPull {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn same_repo_pr() {
        let pr = into_summary(
            raw(r#"{
                "number": 42, "title": "Add cache", "user": {"login": "alice"},
                "updated_at": "2024-05-01T10:00:00Z", "merged_at": null,
                "html_url": "https://github.com/acme/widgets/pull/42",
                "labels": [{"name": "perf"}], "assignees": [{"login": "carol"}],
                "head": {"ref": "feature/cache", "sha": "abc123",
                         "repo": {"full_name": "acme/widgets"}},
                "base": {"ref": "main", "sha": "base000", "repo": {"full_name": "acme/widgets"}}
            }"#),
            "acme/widgets",
        );
        assert_eq!(pr.author, "alice");
        assert!(!pr.is_fork);
        assert!(!pr.merged);
        assert!(pr.labels.contains("perf"));
        assert!(pr.assignees.contains("carol"));
        assert_eq!(pr.head_sha, CommitId::from("abc123"));
        assert_eq!(pr.mergeable_state, MergeableState::Unknown);
        assert!(pr.has_readable_update_time());
    }

    #[test]
    fn fork_pr_records_head_repository() {
        let pr = into_summary(
            raw(r#"{
                "number": 12, "user": {"login": "bob"}, "updated_at": "2024-05-01T10:00:00Z",
                "head": {"ref": "fix", "sha": "f1", "repo": {"full_name": "bob/widgets"}},
                "base": {"ref": "main", "sha": "b1", "repo": {"full_name": "acme/widgets"}}
            }"#),
            "acme/widgets",
        );
        assert!(pr.is_fork);
        assert_eq!(pr.fork_full_name, "bob/widgets");
        assert_eq!(pr.fork_owner(), Some("bob"));
    }

    #[test]
    fn unreadable_fields_get_sentinels() {
        let pr = into_summary(
            raw(r#"{
                "number": 7, "user": null, "updated_at": "yesterday-ish",
                "merged_at": "2024-04-01T00:00:00Z", "draft": true, "labels": null,
                "head": {"ref": "gone", "sha": "h7", "repo": null},
                "base": {"ref": "main", "sha": "base000", "repo": null}
            }"#),
            "acme/widgets",
        );
        assert_eq!(pr.author, "");
        assert_eq!(pr.updated_at, UPDATED_AT_SENTINEL);
        assert!(pr.is_fork);
        assert_eq!(pr.fork_full_name, "");
        assert!(pr.merged);
        assert!(pr.labels.is_empty());
        assert_eq!(pr.mergeable_state, MergeableState::Draft);
    }
}
