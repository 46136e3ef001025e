use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::DateTime;
use tokio::sync::watch;

use crate::types::{
    CommitId, CommitInfo, MergeableState, PrStateFilter, PullRequestSummary, UPDATED_AT_SENTINEL,
};

use super::RemoteApi;

/// A same-repository open PR with predictable fields, for fixtures.
///
/// Head SHA is `head<N>`, base SHA `base000`, head branch `feature-<N>`.
/// Newer numbers are more recently updated.
pub fn summary(number: u64, author: &str) -> PullRequestSummary {
    let offset = i64::try_from(number).unwrap_or(0) * 60;
    let updated_at = DateTime::from_timestamp(1_700_000_000 + offset, 0);
    PullRequestSummary {
        number,
        title: format!("PR #{number}"),
        author: author.to_owned(),
        updated_at: updated_at.unwrap_or(UPDATED_AT_SENTINEL),
        base_ref: "main".to_owned(),
        head_ref: format!("feature-{number}"),
        head_sha: CommitId::new(format!("head{number}")),
        base_sha: CommitId::from("base000"),
        is_fork: false,
        fork_full_name: "acme/widgets".to_owned(),
        labels: Default::default(),
        assignees: Default::default(),
        mergeable_state: MergeableState::Unknown,
        merged: false,
        url: format!("https://github.com/acme/widgets/pull/{number}"),
    }
}

/// A [`RemoteApi`] serving fixture data without any network calls.
///
/// Every call is appended to a log; calls that can be held (commits and
/// status lookups) also log `"<call> done"` when their future finishes or
/// is dropped, so tests can observe when in-flight work terminated.
pub struct StubRemote {
    prs: Mutex<Vec<PullRequestSummary>>,
    commits: Mutex<HashMap<u64, Vec<CommitInfo>>>,
    statuses: Mutex<HashMap<u64, (bool, MergeableState)>>,
    list_error: Mutex<Option<String>>,
    log: Arc<Mutex<Vec<String>>>,
    gate: watch::Sender<bool>,
}

struct CallGuard {
    log: Arc<Mutex<Vec<String>>>,
    name: String,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        lock(&self.log).push(format!("{} done", self.name));
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StubRemote {
    pub fn new(prs: Vec<PullRequestSummary>) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            prs: Mutex::new(prs),
            commits: Mutex::new(HashMap::new()),
            statuses: Mutex::new(HashMap::new()),
            list_error: Mutex::new(None),
            log: Arc::new(Mutex::new(Vec::new())),
            gate,
        }
    }

    pub fn set_prs(&self, prs: Vec<PullRequestSummary>) {
        *lock(&self.prs) = prs;
    }

    pub fn set_commits(&self, number: u64, commits: Vec<CommitInfo>) {
        lock(&self.commits).insert(number, commits);
    }

    pub fn set_status(&self, number: u64, merged: bool, state: MergeableState) {
        lock(&self.statuses).insert(number, (merged, state));
    }

    /// Make `list_pull_requests` fail with `message` (or succeed again with `None`).
    pub fn fail_listing(&self, message: Option<&str>) {
        *lock(&self.list_error) = message.map(str::to_owned);
    }

    /// Park commit and status calls until [`StubRemote::release`].
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    /// Number of logged calls equal to `name`.
    pub fn count(&self, name: &str) -> usize {
        lock(&self.log).iter().filter(|c| *c == name).count()
    }

    fn record(&self, name: String) {
        tracing::debug!("stub remote: {name}");
        lock(&self.log).push(name);
    }

    async fn enter(&self, name: String) -> CallGuard {
        self.record(name.clone());
        let guard = CallGuard {
            log: Arc::clone(&self.log),
            name,
        };
        let mut open = self.gate.subscribe();
        let _ = open.wait_for(|open| *open).await;
        guard
    }
}

#[async_trait]
impl RemoteApi for StubRemote {
    async fn list_pull_requests(&self, state: PrStateFilter) -> Result<Vec<PullRequestSummary>> {
        self.record(format!("list_pull_requests {state}"));
        if let Some(message) = lock(&self.list_error).clone() {
            bail!(message);
        }
        let prs = lock(&self.prs).clone();
        Ok(prs
            .into_iter()
            .filter(|pr| match state {
                PrStateFilter::Open => !pr.merged,
                PrStateFilter::Closed => pr.merged,
                PrStateFilter::All => true,
            })
            .collect())
    }

    async fn list_commits(&self, number: u64) -> Result<Vec<CommitInfo>> {
        let _guard = self.enter(format!("list_commits #{number}")).await;
        let commits = lock(&self.commits).get(&number).cloned();
        Ok(commits.unwrap_or_default())
    }

    async fn mergeable_state(&self, number: u64) -> Result<MergeableState> {
        let _guard = self.enter(format!("mergeable_state #{number}")).await;
        lock(&self.statuses)
            .get(&number)
            .map(|(_, state)| state.clone())
            .ok_or_else(|| anyhow!("no status for #{number}"))
    }

    async fn is_merged(&self, number: u64) -> Result<bool> {
        let _guard = self.enter(format!("is_merged #{number}")).await;
        lock(&self.statuses)
            .get(&number)
            .map(|(merged, _)| *merged)
            .ok_or_else(|| anyhow!("no status for #{number}"))
    }

    fn reset_credentials(&self) {
        self.record("reset_credentials".to_owned());
    }
}
