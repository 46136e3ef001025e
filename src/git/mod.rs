// git module: the local repository surface and the availability helpers.

pub mod availability;
pub mod cli;
pub mod stub;

use std::path::Path;
use std::process::Command;

use anyhow::Result;

use crate::types::{CommitId, FileChange, RepoRef};

pub use availability::{Ensurer, RefSpec, fork_remote_name};
pub use cli::GitCli;

/// Operations the engine needs from a local clone.
///
/// Every method is blocking; callers run them on the engine's blocking pool.
pub trait LocalRepo: Send + Sync {
    /// Resolve a revision to a commit id. `None` when it does not resolve.
    fn resolve(&self, rev: &str) -> Result<Option<CommitId>>;

    /// Whether `sha` is present locally *and* parses as a commit.
    /// A corrupt or truncated object counts as absent.
    fn has_commit(&self, sha: &CommitId) -> bool;

    /// Fetch `refspec` from `remote`.
    fn fetch(&self, remote: &str, refspec: &str) -> Result<()>;

    /// Most recent common ancestor. `None` when the histories are unrelated.
    fn merge_base(&self, a: &CommitId, b: &CommitId) -> Result<Option<CommitId>>;

    /// Tree-to-tree diff from `old` to `new`.
    fn diff(&self, old: &CommitId, new: &CommitId) -> Result<Vec<FileChange>>;

    /// Changes introduced by a single commit against its first parent.
    fn commit_changes(&self, sha: &CommitId) -> Result<Vec<FileChange>>;

    /// First parent of `sha`. `None` for a root commit.
    fn first_parent(&self, sha: &CommitId) -> Result<Option<CommitId>>;

    /// Unified diff text from `old` to `new`, as `git diff` prints it.
    fn unified_diff(&self, old: &CommitId, new: &CommitId) -> Result<String>;

    /// Content of `path` at `rev`. `None` when the file does not exist there.
    fn file_content(&self, rev: &CommitId, path: &str) -> Result<Option<String>>;

    fn list_local_branches(&self) -> Result<Vec<String>>;

    /// Add a remote. An existing remote with the same name is not an error.
    fn add_remote(&self, name: &str, url: &str) -> Result<()>;

    /// Create `local_name` tracking `remote_ref` (`<remote>/<branch>`) and switch to it.
    fn checkout_remote_branch(&self, remote_ref: &str, local_name: &str) -> Result<()>;

    fn checkout(&self, branch: &str) -> Result<()>;

    /// Fast-forward the current branch from its upstream.
    fn pull(&self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Remote detection
// ---------------------------------------------------------------------------

/// Detect `owner/repo` from the git remote of the directory at `path`.
///
/// Tries `preferred` first, falls back to the first listed remote.
/// Parses both SSH (`git@github.com:owner/repo.git`) and HTTPS
/// (`https://github.com/owner/repo.git`) URL formats.
pub fn detect_repo(path: &Path, preferred: &str) -> Option<RepoRef> {
    let url = remote_url(path, preferred).or_else(|| {
        let first = first_remote_name(path)?;
        remote_url(path, &first)
    })?;
    parse_remote_url(&url)
}

fn remote_url(path: &Path, remote: &str) -> Option<String> {
    let output = Command::new("git")
        .args(["remote", "get-url", remote])
        .current_dir(path)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let url = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    if url.is_empty() { None } else { Some(url) }
}

fn first_remote_name(path: &Path) -> Option<String> {
    let output = Command::new("git")
        .arg("remote")
        .current_dir(path)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let name = String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .to_owned();
    if name.is_empty() { None } else { Some(name) }
}

/// Parse `owner/repo` from an SSH or HTTPS remote URL.
pub fn parse_remote_url(url: &str) -> Option<RepoRef> {
    let slug = if let Some(rest) = url.strip_prefix("git@") {
        rest.split_once(':')?.1
    } else if let Some(rest) = url.strip_prefix("ssh://") {
        // ssh://git@host[:port]/owner/repo.git
        rest.split_once('/')?.1
    } else if url.starts_with("https://") || url.starts_with("http://") {
        let after_scheme = url.split_once("://")?.1;
        after_scheme.split_once('/')?.1
    } else {
        return None;
    };

    let slug = slug.trim_end_matches('/');
    let slug = slug.strip_suffix(".git").unwrap_or(slug);
    RepoRef::from_full_name(slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ssh_url() {
        let r = parse_remote_url("git@github.com:acme/widgets.git").unwrap();
        assert_eq!(r.owner, "acme");
        assert_eq!(r.name, "widgets");
    }

    #[test]
    fn parse_ssh_scheme_url() {
        let r = parse_remote_url("ssh://git@github.example.com:2222/acme/widgets.git").unwrap();
        assert_eq!(r.full_name(), "acme/widgets");
    }

    #[test]
    fn parse_https_url_no_git_suffix() {
        let r = parse_remote_url("https://github.com/acme/widgets").unwrap();
        assert_eq!(r.owner, "acme");
        assert_eq!(r.name, "widgets");
    }

    #[test]
    fn parse_invalid_url() {
        assert!(parse_remote_url("not-a-url").is_none());
        assert!(parse_remote_url("https://github.com/").is_none());
    }

    #[test]
    fn detect_repo_returns_none_for_no_remote() {
        let tmp = tempfile::tempdir().unwrap();
        let _ = Command::new("git")
            .arg("init")
            .current_dir(tmp.path())
            .output();
        assert!(detect_repo(tmp.path(), "origin").is_none());
    }
}
