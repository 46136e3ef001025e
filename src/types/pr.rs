use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::{CommitId, short_branch};

/// Stand-in for an `updated_at` value the remote returned but we could not read.
/// Sorts as the oldest possible timestamp.
pub const UPDATED_AT_SENTINEL: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

// ---------------------------------------------------------------------------
// PR-specific enums
// ---------------------------------------------------------------------------

/// Which pull requests a metadata refresh asks the remote for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrStateFilter {
    #[default]
    Open,
    Closed,
    All,
}

impl PrStateFilter {
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::All => "all",
        }
    }
}

impl fmt::Display for PrStateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_api_str())
    }
}

impl FromStr for PrStateFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "all" => Ok(Self::All),
            other => Err(format!("unknown PR state {other:?} (expected open, closed or all)")),
        }
    }
}

/// Remote-computed classification of whether a PR merges cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MergeableState {
    Clean,
    Blocked,
    Unstable,
    #[default]
    Unknown,
    Draft,
    Other(String),
}

impl MergeableState {
    /// Map the REST `mergeable_state` string onto the coarse states we display.
    ///
    /// `dirty` (conflicts) collapses into `Blocked`, `behind` into `Unstable`.
    pub fn from_api(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "clean" => Self::Clean,
            "blocked" | "dirty" => Self::Blocked,
            "unstable" | "behind" => Self::Unstable,
            "draft" => Self::Draft,
            "" | "unknown" => Self::Unknown,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Clean => "clean",
            Self::Blocked => "blocked",
            Self::Unstable => "unstable",
            Self::Unknown => "unknown",
            Self::Draft => "draft",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for MergeableState {
    fn from(raw: String) -> Self {
        Self::from_api(&raw)
    }
}

impl From<MergeableState> for String {
    fn from(state: MergeableState) -> Self {
        state.as_str().to_owned()
    }
}

impl fmt::Display for MergeableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The status cell shown next to each listed PR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CiStatus {
    Merged,
    State(MergeableState),
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merged => f.write_str("Merged"),
            Self::State(state) => f.write_str(state.as_str()),
        }
    }
}

// ---------------------------------------------------------------------------
// PR domain types
// ---------------------------------------------------------------------------

/// Snapshot of one PR as returned by a metadata refresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestSummary {
    pub number: u64,
    pub title: String,
    /// Blank when the author account is gone.
    pub author: String,
    pub updated_at: DateTime<Utc>,
    pub base_ref: String,
    pub head_ref: String,
    pub head_sha: CommitId,
    pub base_sha: CommitId,
    pub is_fork: bool,
    /// `owner/name` of the head repository; blank when the fork was deleted.
    #[serde(default)]
    pub fork_full_name: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub assignees: BTreeSet<String>,
    #[serde(default)]
    pub mergeable_state: MergeableState,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub url: String,
}

impl PullRequestSummary {
    pub fn head_branch(&self) -> &str {
        short_branch(&self.head_ref)
    }

    pub fn base_branch(&self) -> &str {
        short_branch(&self.base_ref)
    }

    /// Owner login of the fork the head branch lives in.
    pub fn fork_owner(&self) -> Option<&str> {
        let (owner, _) = self.fork_full_name.split_once('/')?;
        (!owner.is_empty()).then_some(owner)
    }

    pub fn has_readable_update_time(&self) -> bool {
        self.updated_at != UPDATED_AT_SENTINEL
    }
}
