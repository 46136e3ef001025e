use std::sync::mpsc::Sender;

use crate::filter::{Facet, FacetChoices};
use crate::types::{
    CiStatus, CommitId, CommitInfo, FileComparison, FileRef, PrStateFilter, PullRequestSummary,
};

/// Handle to the engine held by the host application.
///
/// Cheaply cloneable. When the last handle is dropped the sender channel
/// closes, signalling the engine to shut down.
#[derive(Clone)]
pub struct EngineHandle {
    tx: tokio::sync::mpsc::UnboundedSender<Request>,
}

impl EngineHandle {
    pub(super) fn new(tx: tokio::sync::mpsc::UnboundedSender<Request>) -> Self {
        Self { tx }
    }

    /// Send a request to the engine. Non-blocking, returns immediately.
    pub fn send(&self, req: Request) {
        // Ignore errors: if the receiver is gone the engine has already shut down.
        let _ = self.tx.send(req);
    }
}

pub trait Engine: Send + 'static {
    fn start(self) -> EngineHandle;
}

/// All operations the host can send to the engine.
#[derive(Debug)]
pub enum Request {
    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------
    /// Re-fetch the PR list. `reply_tx` also receives later listing updates
    /// (CI statuses, the refresh that follows a credential change).
    Refresh {
        state: PrStateFilter,
        reply_tx: Sender<Event>,
    },
    /// Set (`Some`) or clear (`None`) one facet. Accepts `"label (N)"`.
    SetFilter {
        facet: Facet,
        choice: Option<String>,
        reply_tx: Sender<Event>,
    },
    GetDisplayedPullRequests {
        reply_tx: Sender<Event>,
    },

    // -----------------------------------------------------------------------
    // Per-PR data
    // -----------------------------------------------------------------------
    /// Make `number` the selected PR and load its commits and changed files.
    SelectPullRequest {
        number: u64,
        reply_tx: Sender<Event>,
    },
    GetCommits {
        number: u64,
        reply_tx: Sender<Event>,
    },
    /// Files changed by the PR, or by the given commits when non-empty.
    GetChangedFiles {
        number: u64,
        commits: Option<Vec<CommitId>>,
        reply_tx: Sender<Event>,
    },
    /// Left/right contents of every file the PR changes.
    FetchPrDiff {
        number: u64,
        reply_tx: Sender<Event>,
    },
    /// The PR's changes as one unified diff text.
    FetchPrPatch {
        number: u64,
        reply_tx: Sender<Event>,
    },
    /// Left/right contents of the files one commit of the PR changes,
    /// compared with that commit's first parent.
    FetchCommitDiff {
        number: u64,
        commit: CommitId,
        reply_tx: Sender<Event>,
    },

    // -----------------------------------------------------------------------
    // Local mutation
    // -----------------------------------------------------------------------
    CheckoutPullRequest {
        number: u64,
        reply_tx: Sender<Event>,
    },

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------
    /// Remote credentials changed: cancel everything, wait for it, refresh.
    CredentialsChanged {
        reply_tx: Sender<Event>,
    },
    Shutdown,
}

/// All events the engine pushes back to the host.
#[derive(Debug, Clone)]
pub enum Event {
    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------
    /// The displayed subset and the facet choices of the full set.
    /// An empty `prs` means no PR matched; failures arrive as `PrListFailed`.
    Displayed {
        epoch: u64,
        prs: Vec<PullRequestSummary>,
        choices: FacetChoices,
    },
    PrListFailed {
        message: String,
    },
    CiStatusUpdated {
        number: u64,
        status: Result<CiStatus, String>,
    },

    // -----------------------------------------------------------------------
    // Per-PR data
    // -----------------------------------------------------------------------
    Selected {
        number: u64,
    },
    CommitsFetched {
        number: u64,
        commits: Vec<CommitInfo>,
    },
    CommitsFailed {
        number: u64,
        message: String,
    },
    /// `errors` holds one inline message per commit whose files could not be listed.
    ChangedFilesFetched {
        number: u64,
        selection: Option<Vec<CommitId>>,
        files: Vec<FileRef>,
        errors: Vec<String>,
    },
    ChangedFilesFailed {
        number: u64,
        message: String,
    },
    PrDiffFetched {
        number: u64,
        files: Vec<FileComparison>,
    },
    /// `base` is the commit the patch starts from: the merge base when one
    /// was found, otherwise the diff base itself.
    PrPatchFetched {
        number: u64,
        base: CommitId,
        head: CommitId,
        patch: String,
    },
    CommitDiffFetched {
        number: u64,
        commit: CommitId,
        files: Vec<FileComparison>,
    },
    /// The request was superseded or cancelled before it produced a result.
    Cancelled {
        context: String,
    },
    FetchError {
        context: String,
        message: String,
    },

    // -----------------------------------------------------------------------
    // Mutation results
    // -----------------------------------------------------------------------
    MutationOk {
        description: String,
    },
    MutationError {
        description: String,
        message: String,
    },

    // -----------------------------------------------------------------------
    // Credential change
    // -----------------------------------------------------------------------
    CredentialChangeStarted {
        in_flight: usize,
    },
    /// Every task running at the change has terminated; a refresh follows.
    CredentialChangeDrained {
        drained: usize,
    },
}
