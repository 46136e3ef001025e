use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, bail};

use crate::error::SyncError;
use crate::types::{ChangeKind, CommitId, FileChange, FileRef};

use super::LocalRepo;

/// [`LocalRepo`] backed by the `git` binary, run in the repository root.
pub struct GitCli {
    root: PathBuf,
}

impl GitCli {
    /// Open the repository containing `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(path)
            .output()
            .with_context(|| format!("cannot run git in {}", path.display()))?;
        if !output.status.success() {
            bail!("{} is not inside a git repository", path.display());
        }
        let root = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok(Self {
            root: PathBuf::from(root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn output(&self, args: &[&str]) -> Result<Output> {
        let command = args.join(" ");
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            // Never block on a credential prompt from a background worker.
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("cannot run git {command} in {}", self.root.display()))
    }

    /// Run git and return stdout, turning a non-zero exit into [`SyncError::Git`].
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = self.output(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(git_error(args, &output).into())
        }
    }
}

fn git_error(args: &[&str], output: &Output) -> SyncError {
    SyncError::Git {
        command: args.first().copied().unwrap_or_default().to_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    }
}

impl LocalRepo for GitCli {
    fn resolve(&self, rev: &str) -> Result<Option<CommitId>> {
        let spec = format!("{rev}^{{commit}}");
        let output = self.output(&["rev-parse", "--verify", "--quiet", &spec])?;
        if !output.status.success() {
            return Ok(None);
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        Ok((!sha.is_empty()).then(|| CommitId::new(sha)))
    }

    fn has_commit(&self, sha: &CommitId) -> bool {
        if sha.is_blank() {
            return false;
        }
        // `cat-file commit` inflates and parses the object, so a corrupt
        // object fails here even though `rev-parse` would resolve it.
        match self.output(&["cat-file", "commit", sha.as_str()]) {
            Ok(output) => output.status.success(),
            Err(e) => {
                tracing::debug!("git: cat-file {} failed: {e:#}", sha.short());
                false
            }
        }
    }

    fn fetch(&self, remote: &str, refspec: &str) -> Result<()> {
        tracing::debug!("git: fetch {remote} {refspec}");
        self.run(&["fetch", "--no-tags", remote, refspec])?;
        Ok(())
    }

    fn merge_base(&self, a: &CommitId, b: &CommitId) -> Result<Option<CommitId>> {
        let args = ["merge-base", a.as_str(), b.as_str()];
        let output = self.output(&args)?;
        if output.status.success() {
            let sha = String::from_utf8_lossy(&output.stdout).trim().to_owned();
            return Ok((!sha.is_empty()).then(|| CommitId::new(sha)));
        }
        // Exit status 1 with no stderr: the histories share no ancestor.
        if output.status.code() == Some(1) && output.stderr.is_empty() {
            return Ok(None);
        }
        Err(git_error(&args, &output).into())
    }

    fn diff(&self, old: &CommitId, new: &CommitId) -> Result<Vec<FileChange>> {
        let args = ["diff", "--name-status", "-z", "-M", old.as_str(), new.as_str()];
        let raw = self.run(&args)?;
        Ok(parse_name_status(&raw))
    }

    fn commit_changes(&self, sha: &CommitId) -> Result<Vec<FileChange>> {
        let raw = self.run(&[
            "diff-tree",
            "-r",
            "--root",
            "--no-commit-id",
            "--name-status",
            "-z",
            "-M",
            sha.as_str(),
        ])?;
        Ok(parse_name_status(&raw))
    }

    fn first_parent(&self, sha: &CommitId) -> Result<Option<CommitId>> {
        self.resolve(&format!("{sha}^1"))
    }

    fn unified_diff(&self, old: &CommitId, new: &CommitId) -> Result<String> {
        self.run(&[
            "diff",
            "--no-color",
            "--no-ext-diff",
            "-M",
            old.as_str(),
            new.as_str(),
        ])
    }

    fn file_content(&self, rev: &CommitId, path: &str) -> Result<Option<String>> {
        let object = format!("{rev}:{path}");
        let exists = self.output(&["cat-file", "-e", &object])?;
        if !exists.status.success() {
            return Ok(None);
        }
        let output = self.output(&["cat-file", "blob", &object])?;
        if !output.status.success() {
            return Err(git_error(&["cat-file"], &output).into());
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }

    fn list_local_branches(&self) -> Result<Vec<String>> {
        let format = "--format=%(refname:short)";
        let raw = self.run(&["for-each-ref", format, "refs/heads/"])?;
        let branches = raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        Ok(branches)
    }

    fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        let args = ["remote", "add", name, url];
        let output = self.output(&args)?;
        if output.status.success() {
            tracing::debug!("git: added remote {name} -> {url}");
            return Ok(());
        }
        let err = git_error(&args, &output);
        if let SyncError::Git { stderr, .. } = &err
            && stderr.contains("already exists")
        {
            tracing::debug!("git: remote {name} already exists");
            return Ok(());
        }
        Err(err.into())
    }

    fn checkout_remote_branch(&self, remote_ref: &str, local_name: &str) -> Result<()> {
        let tracking = format!("refs/remotes/{remote_ref}");
        if self.resolve(&tracking)?.is_none() {
            bail!("remote branch {remote_ref} not found");
        }
        if self.resolve(&format!("refs/heads/{local_name}"))?.is_some() {
            bail!("local branch {local_name} already exists");
        }
        self.run(&["checkout", "-b", local_name, "--track", remote_ref])?;
        Ok(())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let output = self.output(&["checkout", branch])?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if stderr.contains("did not match any") {
            bail!("branch '{branch}' not found locally: it may have been deleted");
        }
        bail!("git checkout failed: {stderr}")
    }

    fn pull(&self) -> Result<()> {
        self.run(&["pull", "--ff-only"])?;
        Ok(())
    }
}

/// Parse `--name-status -z` output into changes.
///
/// Records are `<status>\0<path>\0`, or `<status>\0<old>\0<new>\0` for
/// renames and copies.
pub(crate) fn parse_name_status(raw: &str) -> Vec<FileChange> {
    let mut tokens = raw.split('\0').filter(|t| !t.is_empty());
    let mut changes = Vec::new();
    while let Some(status) = tokens.next() {
        let Some(path) = tokens.next() else { break };
        let change = match status.chars().next() {
            Some('A') => FileChange::new(path, ChangeKind::Added),
            Some('D') => FileChange::new(path, ChangeKind::Deleted),
            Some('R') => {
                let Some(to) = tokens.next() else { break };
                FileChange::new(
                    to,
                    ChangeKind::Renamed {
                        from: FileRef::from(path),
                    },
                )
            }
            Some('C') => {
                let Some(to) = tokens.next() else { break };
                FileChange::new(to, ChangeKind::Added)
            }
            _ => FileChange::new(path, ChangeKind::Modified),
        };
        changes.push(change);
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_statuses() {
        let raw = "M\0src/lib.rs\0A\0new.txt\0D\0gone.txt\0";
        let changes = parse_name_status(raw);
        assert_eq!(
            changes,
            vec![
                FileChange::new("src/lib.rs", ChangeKind::Modified),
                FileChange::new("new.txt", ChangeKind::Added),
                FileChange::new("gone.txt", ChangeKind::Deleted),
            ]
        );
    }

    #[test]
    fn parses_rename_with_score() {
        let raw = "R087\0old/name.rs\0new/name.rs\0M\0x\0";
        let changes = parse_name_status(raw);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].path.as_str(), "new/name.rs");
        assert_eq!(
            changes[0].kind,
            ChangeKind::Renamed {
                from: FileRef::from("old/name.rs")
            }
        );
    }

    #[test]
    fn copy_counts_as_added_destination() {
        let changes = parse_name_status("C100\0a.txt\0b.txt\0");
        assert_eq!(changes, vec![FileChange::new("b.txt", ChangeKind::Added)]);
    }

    #[test]
    fn empty_output_is_no_changes() {
        assert!(parse_name_status("").is_empty());
    }

    #[test]
    fn truncated_record_is_dropped() {
        assert!(parse_name_status("M\0").is_empty());
    }
}
