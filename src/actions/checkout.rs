use anyhow::{Context, Result};

use crate::git::availability::fork_remote_url;
use crate::git::{LocalRepo, RefSpec, fork_remote_name};
use crate::types::PullRequestSummary;

/// Local branch a PR is checked out as.
///
/// Same-repository PRs use the head branch name; fork PRs are namespaced by
/// the fork owner (`owner/branch`) so they cannot collide with local work.
pub fn expected_local_branch(pr: &PullRequestSummary) -> String {
    match pr.fork_owner() {
        Some(owner) if pr.is_fork => format!("{owner}/{}", pr.head_branch()),
        _ => pr.head_branch().to_owned(),
    }
}

/// Check out a PR's head branch locally.
///
/// An existing local branch is switched to and fast-forwarded. Otherwise the
/// head branch is fetched (through a `pr-<n>-<owner>` remote for forks) and
/// a tracking branch is created.
pub fn checkout_pull_request(
    repo: &dyn LocalRepo,
    pr: &PullRequestSummary,
    remote: &str,
    host: &str,
) -> Result<String> {
    let local = expected_local_branch(pr);
    let branches = repo.list_local_branches().context("listing branches")?;

    if branches.iter().any(|b| *b == local) {
        tracing::debug!("checkout: {local} exists, switching and pulling");
        repo.checkout(&local)?;
        repo.pull().with_context(|| format!("pulling {local}"))?;
        return Ok(format!("Checked out {local} and pulled latest changes"));
    }

    let source = if pr.is_fork {
        let owner = pr
            .fork_owner()
            .with_context(|| format!("fork of PR #{} no longer exists", pr.number))?;
        let name = fork_remote_name(pr.number, owner);
        repo.add_remote(&name, &fork_remote_url(host, &pr.fork_full_name))
            .with_context(|| format!("adding remote {name}"))?;
        name
    } else {
        remote.to_owned()
    };

    let branch = pr.head_branch();
    let refspec = RefSpec::branch(branch, &source);
    repo.fetch(&source, refspec.as_str())
        .with_context(|| format!("fetching {branch} from {source}"))?;
    repo.checkout_remote_branch(&format!("{source}/{branch}"), &local)?;
    Ok(format!("Checked out PR #{} as {local}", pr.number))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::stub::{ORIGIN_URL, StubRepo};
    use crate::github::stub::summary;

    fn fork_pr() -> PullRequestSummary {
        PullRequestSummary {
            is_fork: true,
            fork_full_name: "bob/widgets".to_owned(),
            ..summary(2, "bob")
        }
    }

    #[test]
    fn local_branch_names() {
        assert_eq!(expected_local_branch(&summary(1, "alice")), "feature-1");
        assert_eq!(expected_local_branch(&fork_pr()), "bob/feature-2");
    }

    #[test]
    fn same_repo_pr_gets_tracking_branch() {
        let repo = StubRepo::new();
        repo.add_commit("head1", &[], &[("a.txt", "1")]);
        repo.advertise(ORIGIN_URL, "refs/heads/feature-1", "head1");

        let pr = summary(1, "alice");
        let message = checkout_pull_request(&repo, &pr, "origin", "github.com").unwrap();
        assert_eq!(message, "Checked out PR #1 as feature-1");
        assert_eq!(repo.current_branch().as_deref(), Some("feature-1"));
        let created = repo.resolve_ref("refs/heads/feature-1");
        assert_eq!(created.as_deref(), Some("head1"));
    }

    #[test]
    fn fork_pr_goes_through_dedicated_remote() {
        let repo = StubRepo::new();
        repo.add_commit("head2", &[], &[("a.txt", "1")]);
        let fork_url = "https://github.com/bob/widgets.git";
        repo.advertise(fork_url, "refs/heads/feature-2", "head2");

        checkout_pull_request(&repo, &fork_pr(), "origin", "github.com").unwrap();
        assert_eq!(repo.remote_url("pr-2-bob").as_deref(), Some(fork_url));
        assert_eq!(repo.current_branch().as_deref(), Some("bob/feature-2"));
    }

    #[test]
    fn existing_branch_is_switched_to_and_pulled() {
        let repo = StubRepo::new();
        repo.set_ref("refs/heads/feature-1", "head1");

        let pr = summary(1, "alice");
        let message = checkout_pull_request(&repo, &pr, "origin", "github.com").unwrap();
        assert_eq!(message, "Checked out feature-1 and pulled latest changes");
        assert_eq!(repo.pull_count(), 1);
        assert_eq!(repo.fetch_count(), 0);
    }

    #[test]
    fn missing_remote_branch_is_an_error() {
        let repo = StubRepo::new();
        let pr = summary(5, "alice");
        let err = checkout_pull_request(&repo, &pr, "origin", "github.com").unwrap_err();
        assert!(format!("{err:#}").contains("fetching feature-5 from origin"));
    }
}
