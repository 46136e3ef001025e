//! Making commits referenced by remote PR metadata present in the local clone.
//!
//! Remote metadata routinely names SHAs the clone has never seen: PR heads
//! live under `refs/pull/*`, fork branches live in another repository, and
//! base branches move. Every lookup goes through [`Ensurer::ensure_local`],
//! which checks the object store, fetches a caller-built ref spec when the
//! object is missing, and re-checks.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::{CommitId, PullRequestSummary, short_branch};

use super::LocalRepo;

// ---------------------------------------------------------------------------
// Ref specs
// ---------------------------------------------------------------------------

/// A forced fetch ref spec, `+<src>:<dst>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefSpec(String);

impl RefSpec {
    /// The hosting service's read-only ref for a PR head.
    pub fn pull_head(number: u64, remote: &str) -> Self {
        Self(format!("+refs/pull/{number}/head:refs/remotes/{remote}/pr/{number}/head"))
    }

    /// A branch of `remote`, stored as its remote-tracking ref.
    pub fn branch(branch: &str, remote: &str) -> Self {
        let branch = short_branch(branch);
        Self(format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RefSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the remote added for a fork PR. Unique per PR and fork owner.
pub fn fork_remote_name(number: u64, owner: &str) -> String {
    format!("pr-{number}-{owner}")
}

/// Clone URL of a fork on `host`.
pub fn fork_remote_url(host: &str, fork_full_name: &str) -> String {
    format!("https://{host}/{fork_full_name}.git")
}

// ---------------------------------------------------------------------------
// Ensurer
// ---------------------------------------------------------------------------

type GateKey = (CommitId, String);

/// Best-effort "make this commit local" with one fetch in flight per
/// `(sha, refspec)`.
///
/// Callers racing on the same key queue behind the first; by the time they
/// run, the object is usually present and no second fetch is issued.
#[derive(Default)]
pub struct Ensurer {
    gates: Mutex<HashMap<GateKey, Arc<Mutex<()>>>>,
}

impl Ensurer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `sha` is present and parsable after the call.
    ///
    /// A failed fetch is logged and reported as `false`; it never panics or
    /// propagates.
    pub fn ensure_local(
        &self,
        repo: &dyn LocalRepo,
        sha: &CommitId,
        refspec: &RefSpec,
        remote: &str,
    ) -> bool {
        if sha.is_blank() {
            return false;
        }
        if repo.has_commit(sha) {
            return true;
        }

        let key = (sha.clone(), refspec.as_str().to_owned());
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(gates.entry(key.clone()).or_default())
        };

        let available = {
            let _held = gate.lock().unwrap_or_else(PoisonError::into_inner);
            // Another caller may have fetched while we waited.
            if repo.has_commit(sha) {
                true
            } else {
                tracing::debug!(
                    "ensure: {} missing, fetching {refspec} from {remote}",
                    sha.short()
                );
                if let Err(e) = repo.fetch(remote, refspec.as_str()) {
                    tracing::warn!("ensure: fetch {refspec} from {remote} failed: {e:#}");
                }
                repo.has_commit(sha)
            }
        };

        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry plus our clone: nobody else is queued on this key.
        if Arc::strong_count(&gate) == 2 {
            gates.remove(&key);
        }
        available
    }

    /// Make a PR's head commit local.
    ///
    /// Tries the PR ref first. If that fails, falls back to the head branch:
    /// on `remote` for same-repository PRs, on a dedicated fork remote
    /// otherwise.
    pub fn ensure_head_local(
        &self,
        repo: &dyn LocalRepo,
        pr: &PullRequestSummary,
        remote: &str,
        host: &str,
    ) -> bool {
        let head = &pr.head_sha;
        if self.ensure_local(repo, head, &RefSpec::pull_head(pr.number, remote), remote) {
            return true;
        }

        if !pr.is_fork {
            let spec = RefSpec::branch(pr.head_branch(), remote);
            return self.ensure_local(repo, head, &spec, remote);
        }

        let Some(owner) = pr.fork_owner() else {
            tracing::warn!(
                "ensure: PR #{} head repository is gone, no fork to fetch from",
                pr.number
            );
            return false;
        };
        let fork_remote = fork_remote_name(pr.number, owner);
        let url = fork_remote_url(host, &pr.fork_full_name);
        if let Err(e) = repo.add_remote(&fork_remote, &url) {
            tracing::warn!("ensure: adding remote {fork_remote} failed: {e:#}");
            return false;
        }
        self.ensure_local(
            repo,
            head,
            &RefSpec::branch(pr.head_branch(), &fork_remote),
            &fork_remote,
        )
    }

    /// Make a PR's recorded base commit local by fetching the base branch.
    pub fn ensure_base_local(
        &self,
        repo: &dyn LocalRepo,
        pr: &PullRequestSummary,
        remote: &str,
    ) -> bool {
        self.ensure_local(
            repo,
            &pr.base_sha,
            &RefSpec::branch(pr.base_branch(), remote),
            remote,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::stub::{ORIGIN_URL, StubRepo};

    #[test]
    fn refspec_shapes() {
        assert_eq!(
            RefSpec::pull_head(42, "origin").as_str(),
            "+refs/pull/42/head:refs/remotes/origin/pr/42/head"
        );
        assert_eq!(
            RefSpec::branch("refs/heads/main", "origin").as_str(),
            "+refs/heads/main:refs/remotes/origin/main"
        );
        assert_eq!(
            RefSpec::branch("feature/x", "pr-3-bob").as_str(),
            "+refs/heads/feature/x:refs/remotes/pr-3-bob/feature/x"
        );
    }

    #[test]
    fn fork_remote_is_per_pr_and_owner() {
        assert_eq!(fork_remote_name(12, "bob"), "pr-12-bob");
        assert_ne!(fork_remote_name(12, "bob"), fork_remote_name(13, "bob"));
        assert_eq!(
            fork_remote_url("github.com", "bob/widgets"),
            "https://github.com/bob/widgets.git"
        );
    }

    #[test]
    fn fetches_missing_head_once() {
        let repo = StubRepo::new();
        repo.add_commit("abc123", &[], &[("a.txt", "1")]);
        repo.advertise(ORIGIN_URL, "refs/pull/42/head", "abc123");
        let ensurer = Ensurer::new();
        let sha = CommitId::from("abc123");
        let spec = RefSpec::pull_head(42, "origin");

        assert!(ensurer.ensure_local(&repo, &sha, &spec, "origin"));
        assert!(ensurer.ensure_local(&repo, &sha, &spec, "origin"));
        assert_eq!(repo.fetch_count(), 1);
        assert!(ensurer.gates.lock().unwrap().is_empty());
    }

    #[test]
    fn corrupt_object_counts_as_missing() {
        let repo = StubRepo::new();
        repo.add_commit("bad1", &[], &[]);
        repo.make_local("bad1");
        repo.corrupt("bad1");
        let ensurer = Ensurer::new();
        assert!(!ensurer.ensure_local(
            &repo,
            &CommitId::from("bad1"),
            &RefSpec::pull_head(1, "origin"),
            "origin"
        ));
        assert_eq!(repo.fetch_count(), 1);
    }

    #[test]
    fn failed_fetch_is_false_not_error() {
        let repo = StubRepo::new();
        let ensurer = Ensurer::new();
        assert!(!ensurer.ensure_local(
            &repo,
            &CommitId::from("nowhere"),
            &RefSpec::pull_head(9, "origin"),
            "origin"
        ));
    }

    #[test]
    fn same_repo_head_falls_back_to_branch() {
        let repo = StubRepo::new();
        repo.add_commit("h1", &[], &[("f", "x")]);
        repo.advertise(ORIGIN_URL, "refs/heads/feature", "h1");
        let pr = crate::github::stub::summary(5, "alice");
        let pr = PullRequestSummary {
            head_ref: "feature".into(),
            head_sha: CommitId::from("h1"),
            ..pr
        };
        assert!(Ensurer::new().ensure_head_local(&repo, &pr, "origin", "github.com"));
        assert_eq!(
            repo.fetches(),
            vec![
                ("origin".to_owned(), RefSpec::pull_head(5, "origin").to_string()),
                ("origin".to_owned(), RefSpec::branch("feature", "origin").to_string()),
            ]
        );
    }

    #[test]
    fn fork_head_adds_fork_remote() {
        let repo = StubRepo::new();
        repo.add_commit("f1", &[], &[("f", "x")]);
        let fork_url = "https://github.com/bob/widgets.git";
        repo.advertise(fork_url, "refs/heads/fix", "f1");
        let pr = PullRequestSummary {
            head_ref: "fix".into(),
            head_sha: CommitId::from("f1"),
            is_fork: true,
            fork_full_name: "bob/widgets".into(),
            ..crate::github::stub::summary(12, "bob")
        };
        assert!(Ensurer::new().ensure_head_local(&repo, &pr, "origin", "github.com"));
        assert_eq!(repo.remote_url("pr-12-bob").as_deref(), Some(fork_url));
        let tracking = repo.resolve_ref("refs/remotes/pr-12-bob/fix");
        assert_eq!(tracking.as_deref(), Some("f1"));
    }

    #[test]
    fn deleted_fork_is_unavailable() {
        let repo = StubRepo::new();
        let pr = PullRequestSummary {
            is_fork: true,
            fork_full_name: String::new(),
            ..crate::github::stub::summary(3, "ghost")
        };
        assert!(!Ensurer::new().ensure_head_local(&repo, &pr, "origin", "github.com"));
    }
}
