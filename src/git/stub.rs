use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow, bail};

use crate::types::{ChangeKind, CommitId, FileChange};

use super::LocalRepo;

/// URL the stub's `origin` remote points at.
pub const ORIGIN_URL: &str = "https://github.com/acme/widgets.git";

/// An in-memory object store standing in for a clone.
///
/// Commits are registered "on the remote side" with [`StubRepo::add_commit`]
/// and only become locally visible once fetched (or marked with
/// [`StubRepo::make_local`]). Remotes advertise refs per URL, so a fetch
/// through a freshly added fork remote finds what the fork advertises.
pub struct StubRepo {
    state: Mutex<StubState>,
}

struct StubCommit {
    parents: Vec<String>,
    tree: BTreeMap<String, String>,
}

#[derive(Default)]
struct StubState {
    objects: HashMap<String, StubCommit>,
    local: HashSet<String>,
    corrupt: HashSet<String>,
    refs: BTreeMap<String, String>,
    remotes: BTreeMap<String, String>,
    advertised: HashMap<(String, String), String>,
    upstreams: HashMap<String, String>,
    current: Option<String>,
    fetches: Vec<(String, String)>,
    pulls: usize,
    fail_merge_base: bool,
}

impl Default for StubRepo {
    fn default() -> Self {
        Self::new()
    }
}

impl StubRepo {
    pub fn new() -> Self {
        let mut state = StubState::default();
        state.remotes.insert("origin".into(), ORIGIN_URL.into());
        Self {
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a commit with a full snapshot of its tree. Not yet local.
    pub fn add_commit(&self, sha: &str, parents: &[&str], files: &[(&str, &str)]) {
        let commit = StubCommit {
            parents: parents.iter().map(|p| (*p).to_owned()).collect(),
            tree: files
                .iter()
                .map(|(path, content)| ((*path).to_owned(), (*content).to_owned()))
                .collect(),
        };
        self.state().objects.insert(sha.to_owned(), commit);
    }

    /// Make `sha` and its ancestors present locally.
    pub fn make_local(&self, sha: &str) {
        let mut state = self.state();
        let ancestors = state.ancestors(sha);
        state.local.extend(ancestors);
    }

    pub fn corrupt(&self, sha: &str) {
        self.state().corrupt.insert(sha.to_owned());
    }

    /// Have the repository at `url` advertise `src_ref` pointing at `sha`.
    pub fn advertise(&self, url: &str, src_ref: &str, sha: &str) {
        self.state()
            .advertised
            .insert((url.to_owned(), src_ref.to_owned()), sha.to_owned());
    }

    pub fn set_ref(&self, name: &str, sha: &str) {
        self.state().refs.insert(name.to_owned(), sha.to_owned());
    }

    pub fn resolve_ref(&self, name: &str) -> Option<String> {
        self.state().refs.get(name).cloned()
    }

    pub fn remote_url(&self, name: &str) -> Option<String> {
        self.state().remotes.get(name).cloned()
    }

    pub fn current_branch(&self) -> Option<String> {
        self.state().current.clone()
    }

    pub fn fail_merge_base(&self, fail: bool) {
        self.state().fail_merge_base = fail;
    }

    /// Every fetch attempted, as `(remote, refspec)`.
    pub fn fetches(&self) -> Vec<(String, String)> {
        self.state().fetches.clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.state().fetches.len()
    }

    pub fn pull_count(&self) -> usize {
        self.state().pulls
    }
}

impl StubState {
    fn ancestors(&self, sha: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([sha.to_owned()]);
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            if let Some(commit) = self.objects.get(&next) {
                queue.extend(commit.parents.iter().cloned());
            }
            order.push(next);
        }
        order
    }

    fn is_local(&self, sha: &str) -> bool {
        self.local.contains(sha) && !self.corrupt.contains(sha) && self.objects.contains_key(sha)
    }

    fn local_tree(&self, sha: &str) -> Result<&BTreeMap<String, String>> {
        if !self.is_local(sha) {
            bail!("bad object {sha}");
        }
        self.objects
            .get(sha)
            .map(|c| &c.tree)
            .ok_or_else(|| anyhow!("bad object {sha}"))
    }
}

fn tree_diff(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> Vec<FileChange> {
    let mut changes: Vec<FileChange> = new
        .iter()
        .filter_map(|(path, content)| match old.get(path) {
            None => Some(FileChange::new(path.as_str(), ChangeKind::Added)),
            Some(before) if before != content => {
                Some(FileChange::new(path.as_str(), ChangeKind::Modified))
            }
            Some(_) => None,
        })
        .collect();
    changes.extend(
        old.keys()
            .filter(|path| !new.contains_key(*path))
            .map(|path| FileChange::new(path.as_str(), ChangeKind::Deleted)),
    );
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

/// One whole-file hunk per changed path, laid out like `git diff`.
fn render_patch(old: &BTreeMap<String, String>, new: &BTreeMap<String, String>) -> String {
    let mut patch = String::new();
    for change in tree_diff(old, new) {
        let path = change.path.as_str();
        let before = old.get(path);
        let after = new.get(path);
        let _ = writeln!(patch, "diff --git a/{path} b/{path}");
        let from = before.map_or_else(|| "/dev/null".to_owned(), |_| format!("a/{path}"));
        let to = after.map_or_else(|| "/dev/null".to_owned(), |_| format!("b/{path}"));
        let _ = writeln!(patch, "--- {from}\n+++ {to}");
        for line in before.into_iter().flat_map(|text| text.lines()) {
            let _ = writeln!(patch, "-{line}");
        }
        for line in after.into_iter().flat_map(|text| text.lines()) {
            let _ = writeln!(patch, "+{line}");
        }
    }
    patch
}

impl LocalRepo for StubRepo {
    fn resolve(&self, rev: &str) -> Result<Option<CommitId>> {
        let state = self.state();
        if let Some(sha) = state.refs.get(rev) {
            return Ok(Some(CommitId::from(sha.as_str())));
        }
        Ok(state.is_local(rev).then(|| CommitId::from(rev)))
    }

    fn has_commit(&self, sha: &CommitId) -> bool {
        self.state().is_local(sha.as_str())
    }

    fn fetch(&self, remote: &str, refspec: &str) -> Result<()> {
        let mut state = self.state();
        state.fetches.push((remote.to_owned(), refspec.to_owned()));
        let (src, dst) = refspec
            .trim_start_matches('+')
            .split_once(':')
            .ok_or_else(|| anyhow!("invalid refspec {refspec}"))?;
        let url = state
            .remotes
            .get(remote)
            .cloned()
            .ok_or_else(|| anyhow!("'{remote}' does not appear to be a git repository"))?;
        let sha = state
            .advertised
            .get(&(url, src.to_owned()))
            .cloned()
            .ok_or_else(|| anyhow!("couldn't find remote ref {src}"))?;
        let ancestors = state.ancestors(&sha);
        state.local.extend(ancestors);
        state.refs.insert(dst.to_owned(), sha);
        Ok(())
    }

    fn merge_base(&self, a: &CommitId, b: &CommitId) -> Result<Option<CommitId>> {
        let state = self.state();
        if state.fail_merge_base {
            bail!("simulated merge-base failure");
        }
        state.local_tree(a.as_str())?;
        state.local_tree(b.as_str())?;
        let theirs: HashSet<String> = state.ancestors(b.as_str()).into_iter().collect();
        Ok(state
            .ancestors(a.as_str())
            .into_iter()
            .find(|sha| theirs.contains(sha))
            .map(CommitId::from))
    }

    fn diff(&self, old: &CommitId, new: &CommitId) -> Result<Vec<FileChange>> {
        let state = self.state();
        Ok(tree_diff(
            state.local_tree(old.as_str())?,
            state.local_tree(new.as_str())?,
        ))
    }

    fn commit_changes(&self, sha: &CommitId) -> Result<Vec<FileChange>> {
        let state = self.state();
        let tree = state.local_tree(sha.as_str())?;
        let empty = BTreeMap::new();
        let parent = state
            .objects
            .get(sha.as_str())
            .and_then(|c| c.parents.first())
            .and_then(|p| state.objects.get(p))
            .map_or(&empty, |c| &c.tree);
        Ok(tree_diff(parent, tree))
    }

    fn first_parent(&self, sha: &CommitId) -> Result<Option<CommitId>> {
        let state = self.state();
        state.local_tree(sha.as_str())?;
        Ok(state
            .objects
            .get(sha.as_str())
            .and_then(|c| c.parents.first())
            .map(|p| CommitId::from(p.as_str())))
    }

    fn unified_diff(&self, old: &CommitId, new: &CommitId) -> Result<String> {
        let state = self.state();
        Ok(render_patch(
            state.local_tree(old.as_str())?,
            state.local_tree(new.as_str())?,
        ))
    }

    fn file_content(&self, rev: &CommitId, path: &str) -> Result<Option<String>> {
        let state = self.state();
        let Ok(tree) = state.local_tree(rev.as_str()) else {
            return Ok(None);
        };
        Ok(tree.get(path).cloned())
    }

    fn list_local_branches(&self) -> Result<Vec<String>> {
        Ok(self
            .state()
            .refs
            .keys()
            .filter_map(|r| r.strip_prefix("refs/heads/"))
            .map(str::to_owned)
            .collect())
    }

    fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        self.state()
            .remotes
            .entry(name.to_owned())
            .or_insert_with(|| url.to_owned());
        Ok(())
    }

    fn checkout_remote_branch(&self, remote_ref: &str, local_name: &str) -> Result<()> {
        let mut state = self.state();
        let tracking = format!("refs/remotes/{remote_ref}");
        let Some(sha) = state.refs.get(&tracking).cloned() else {
            bail!("remote branch {remote_ref} not found");
        };
        let local_ref = format!("refs/heads/{local_name}");
        if state.refs.contains_key(&local_ref) {
            bail!("local branch {local_name} already exists");
        }
        state.refs.insert(local_ref, sha);
        state
            .upstreams
            .insert(local_name.to_owned(), remote_ref.to_owned());
        state.current = Some(local_name.to_owned());
        Ok(())
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        let mut state = self.state();
        if !state.refs.contains_key(&format!("refs/heads/{branch}")) {
            bail!("branch '{branch}' not found locally: it may have been deleted");
        }
        state.current = Some(branch.to_owned());
        Ok(())
    }

    fn pull(&self) -> Result<()> {
        let mut state = self.state();
        state.pulls += 1;
        let Some(current) = state.current.clone() else {
            bail!("not on a branch");
        };
        let Some(upstream) = state.upstreams.get(&current).cloned() else {
            return Ok(());
        };
        let tracking = format!("refs/remotes/{upstream}");
        if let Some(sha) = state.refs.get(&tracking).cloned() {
            state.refs.insert(format!("refs/heads/{current}"), sha);
        }
        Ok(())
    }
}
