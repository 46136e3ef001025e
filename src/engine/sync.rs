//! The synchronization reactor.
//!
//! One engine thread owns every piece of mutable state. Remote and git work
//! runs in tasks registered by purpose; their results come back to the
//! reactor as [`Completion`]s and are applied only while their ticket is
//! still current.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::Sender;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::actions::checkout;
use crate::diff::{self, ChangeSet, DiffBase};
use crate::error::SyncError;
use crate::filter::{self, FacetChoices, Selections};
use crate::git::{Ensurer, LocalRepo};
use crate::github::{RemoteApi, errors};
use crate::types::{
    CiStatus, CommitId, CommitInfo, FileComparison, FileRef, PrStateFilter, PullRequestSummary,
};

use super::cache::{ContentCache, Lookup, PrCache};
use super::context::{EngineContext, TaskEnv};
use super::interface::{Engine, EngineHandle, Event, Request};
use super::tasks::{TaskPurpose, TaskRegistry, Ticket, cancellable, run_blocking};

/// Engine backed by a [`RemoteApi`] and a [`crate::git::LocalRepo`].
pub struct SyncEngine {
    ctx: EngineContext,
}

impl SyncEngine {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }
}

impl Engine for SyncEngine {
    fn start(self) -> EngineHandle {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Request>();
        let handle = EngineHandle::new(tx);
        let workers = self.ctx.settings.workers.max(1);
        let _ = std::thread::Builder::new()
            .name("prsync-engine".to_owned())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .max_blocking_threads(workers)
                    .build()
                    .expect("tokio runtime init");
                rt.block_on(self.run_loop(rx));
            });
        handle
    }
}

impl SyncEngine {
    async fn run_loop(self, mut rx: UnboundedReceiver<Request>) {
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel::<Completion>();
        let mut reactor = Reactor::new(self.ctx, done_tx);

        loop {
            tokio::select! {
                biased;
                Some(done) = done_rx.recv() => reactor.complete(done),
                maybe_req = rx.recv() => {
                    match maybe_req {
                        None | Some(Request::Shutdown) => {
                            tracing::debug!("engine: shutting down");
                            reactor.shutdown();
                            break;
                        }
                        Some(req) => reactor.handle(req),
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Task results
// ---------------------------------------------------------------------------

/// Who asked for a changed-file listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Follow-up of `SelectPullRequest`; dropped once the selection moves on.
    Selection,
    /// Explicit `GetChangedFiles`; always answered.
    Request,
}

enum Completion {
    PrList {
        ticket: Ticket,
        result: Result<Vec<PullRequestSummary>, SyncError>,
    },
    CiStatus {
        ticket: Ticket,
        epoch: u64,
        number: u64,
        status: Result<CiStatus, String>,
    },
    Commits {
        ticket: Ticket,
        epoch: u64,
        number: u64,
        result: Result<Vec<CommitInfo>, SyncError>,
    },
    Files {
        ticket: Ticket,
        epoch: u64,
        number: u64,
        origin: Origin,
        selection: Option<Vec<CommitId>>,
        result: Result<(Vec<FileRef>, Vec<String>), SyncError>,
        reply_tx: Sender<Event>,
    },
    Diff {
        ticket: Ticket,
        number: u64,
        result: Result<Vec<FileComparison>, SyncError>,
        reply_tx: Sender<Event>,
    },
    Patch {
        ticket: Ticket,
        number: u64,
        head: CommitId,
        result: Result<(CommitId, String), SyncError>,
        reply_tx: Sender<Event>,
    },
    CommitDiff {
        ticket: Ticket,
        number: u64,
        commit: CommitId,
        result: Result<Vec<FileComparison>, SyncError>,
        reply_tx: Sender<Event>,
    },
    Checkout {
        ticket: Ticket,
        number: u64,
        result: Result<Result<String, String>, SyncError>,
        reply_tx: Sender<Event>,
    },
    Drained {
        drained: usize,
        reply_tx: Sender<Event>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    /// Waiting for the tasks cancelled by a credential change to terminate.
    Draining,
}

struct PendingCommits {
    number: u64,
    ticket: Ticket,
    waiters: Vec<(Sender<Event>, Origin)>,
}

// ---------------------------------------------------------------------------
// Reactor state
// ---------------------------------------------------------------------------

struct Reactor {
    ctx: EngineContext,
    ensurer: Arc<Ensurer>,
    contents: ContentCache,
    registry: TaskRegistry,
    done_tx: UnboundedSender<Completion>,
    phase: Phase,
    deferred: VecDeque<Request>,

    subscriber: Option<Sender<Event>>,
    last_state: Option<PrStateFilter>,
    epoch: u64,
    all_prs: Vec<PullRequestSummary>,
    displayed: Vec<PullRequestSummary>,
    choices: FacetChoices,
    selections: Selections,
    list_error: Option<String>,

    selected: Option<u64>,
    ci: PrCache<CiStatus>,
    commits: PrCache<Vec<CommitInfo>>,
    files: PrCache<Vec<FileRef>>,
    commits_in_flight: Option<PendingCommits>,
}

impl Reactor {
    fn new(ctx: EngineContext, done_tx: UnboundedSender<Completion>) -> Self {
        let contents = ContentCache::new(ctx.settings.content_cache_capacity);
        Self {
            ctx,
            ensurer: Arc::new(Ensurer::new()),
            contents,
            registry: TaskRegistry::new(),
            done_tx,
            phase: Phase::Idle,
            deferred: VecDeque::new(),
            subscriber: None,
            last_state: None,
            epoch: 0,
            all_prs: Vec::new(),
            displayed: Vec::new(),
            choices: FacetChoices::default(),
            selections: Selections::default(),
            list_error: None,
            selected: None,
            ci: PrCache::new(),
            commits: PrCache::new(),
            files: PrCache::new(),
            commits_in_flight: None,
        }
    }

    fn env(&self) -> TaskEnv {
        TaskEnv {
            remote: Arc::clone(&self.ctx.remote),
            repo: Arc::clone(&self.ctx.repo),
            ensurer: Arc::clone(&self.ensurer),
            remote_name: self.ctx.settings.remote_name.clone(),
            host: self.ctx.settings.host.clone(),
        }
    }

    fn find(&self, number: u64) -> Option<PullRequestSummary> {
        self.all_prs.iter().find(|pr| pr.number == number).cloned()
    }

    fn notify(&self, event: Event) {
        if let Some(tx) = &self.subscriber {
            let _ = tx.send(event);
        }
    }

    fn display_event(&self) -> Event {
        match &self.list_error {
            Some(message) => Event::PrListFailed {
                message: message.clone(),
            },
            None => Event::Displayed {
                epoch: self.epoch,
                prs: self.displayed.clone(),
                choices: self.choices.clone(),
            },
        }
    }

    fn shutdown(&mut self) {
        let running = self.registry.cancel_all();
        tracing::debug!("engine: {} task(s) cancelled at shutdown", running.len());
    }

    // -----------------------------------------------------------------------
    // Request dispatch
    // -----------------------------------------------------------------------

    fn handle(&mut self, req: Request) {
        if self.phase == Phase::Draining {
            tracing::debug!("engine: draining, deferring request");
            self.deferred.push_back(req);
            return;
        }

        match req {
            Request::Refresh { state, reply_tx } => {
                tracing::debug!("engine: Refresh {state}");
                self.subscriber = Some(reply_tx);
                self.last_state = Some(state);
                self.start_listing(state);
            }
            Request::SetFilter {
                facet,
                choice,
                reply_tx,
            } => {
                tracing::debug!("engine: SetFilter {facet} = {choice:?}");
                self.selections.set(facet, choice.as_deref());
                self.displayed = filter::apply(&self.all_prs, &self.selections);
                let _ = reply_tx.send(self.display_event());
                self.refresh_ci();
            }
            Request::GetDisplayedPullRequests { reply_tx } => {
                let _ = reply_tx.send(self.display_event());
            }
            Request::SelectPullRequest { number, reply_tx } => {
                tracing::debug!("engine: SelectPullRequest #{number}");
                let Some(pr) = self.find(number) else {
                    let _ = reply_tx.send(not_listed("SelectPullRequest", number));
                    return;
                };
                self.selected = Some(number);
                let _ = reply_tx.send(Event::Selected { number });
                self.request_commits(number, reply_tx.clone(), Origin::Selection);
                self.request_files(pr, None, Origin::Selection, reply_tx);
            }
            Request::GetCommits { number, reply_tx } => {
                tracing::debug!("engine: GetCommits #{number}");
                self.request_commits(number, reply_tx, Origin::Request);
            }
            Request::GetChangedFiles {
                number,
                commits,
                reply_tx,
            } => {
                tracing::debug!("engine: GetChangedFiles #{number}");
                let Some(pr) = self.find(number) else {
                    let _ = reply_tx.send(not_listed("GetChangedFiles", number));
                    return;
                };
                let selection = commits.filter(|c| !c.is_empty());
                self.request_files(pr, selection, Origin::Request, reply_tx);
            }
            Request::FetchPrDiff { number, reply_tx } => {
                tracing::debug!("engine: FetchPrDiff #{number}");
                let Some(pr) = self.find(number) else {
                    let _ = reply_tx.send(not_listed("FetchPrDiff", number));
                    return;
                };
                self.start_diff(pr, reply_tx);
            }
            Request::FetchPrPatch { number, reply_tx } => {
                tracing::debug!("engine: FetchPrPatch #{number}");
                let Some(pr) = self.find(number) else {
                    let _ = reply_tx.send(not_listed("FetchPrPatch", number));
                    return;
                };
                self.start_patch(pr, reply_tx);
            }
            Request::FetchCommitDiff {
                number,
                commit,
                reply_tx,
            } => {
                tracing::debug!("engine: FetchCommitDiff #{number} {}", commit.short());
                let Some(pr) = self.find(number) else {
                    let _ = reply_tx.send(not_listed("FetchCommitDiff", number));
                    return;
                };
                self.start_commit_diff(pr, commit, reply_tx);
            }
            Request::CheckoutPullRequest { number, reply_tx } => {
                tracing::debug!("engine: CheckoutPullRequest #{number}");
                let Some(pr) = self.find(number) else {
                    let _ = reply_tx.send(not_listed("CheckoutPullRequest", number));
                    return;
                };
                self.start_checkout(pr, reply_tx);
            }
            Request::CredentialsChanged { reply_tx } => self.begin_credential_change(reply_tx),
            // Handled by the run loop.
            Request::Shutdown => {}
        }
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    fn start_listing(&mut self, state: PrStateFilter) {
        let remote = Arc::clone(&self.ctx.remote);
        let done_tx = self.done_tx.clone();
        self.registry
            .submit(TaskPurpose::Metadata, move |token, ticket| async move {
                let result = match cancellable(&token, remote.list_pull_requests(state)).await {
                    Ok(Ok(prs)) => Ok(prs),
                    Ok(Err(e)) => Err(SyncError::RemoteFetch {
                        cause: errors::describe(&e),
                    }),
                    Err(cancelled) => Err(cancelled),
                };
                let _ = done_tx.send(Completion::PrList { ticket, result });
            });
    }

    fn install_listing(&mut self, prs: Vec<PullRequestSummary>) {
        self.epoch += 1;
        tracing::info!("engine: {} PR(s) listed, epoch {}", prs.len(), self.epoch);
        self.all_prs = prs;
        self.list_error = None;
        // CI statuses survive a refresh; per-PR git data does not.
        self.commits.invalidate_all();
        self.files.invalidate_all();
        if let Some(number) = self.selected
            && !self.all_prs.iter().any(|pr| pr.number == number)
        {
            self.selected = None;
        }
        self.choices = filter::derive_choices(&self.all_prs);
        self.displayed = filter::apply(&self.all_prs, &self.selections);
        self.notify(self.display_event());
        self.refresh_ci();
    }

    fn fail_listing(&mut self, cause: &str) {
        tracing::warn!("engine: PR listing failed: {cause}");
        self.epoch += 1;
        self.all_prs.clear();
        self.displayed.clear();
        self.choices = FacetChoices::default();
        self.selected = None;
        self.ci.invalidate_all();
        self.commits.invalidate_all();
        self.files.invalidate_all();
        let message = format!("Error fetching PRs: {cause}");
        self.list_error = Some(message.clone());
        self.notify(Event::PrListFailed { message });
    }

    /// Fetch CI status for every displayed PR without a cached value.
    fn refresh_ci(&mut self) {
        let numbers: Vec<u64> = self
            .displayed
            .iter()
            .map(|pr| pr.number)
            .filter(|n| self.ci.needs_fetch(*n))
            .collect();
        if numbers.is_empty() {
            return;
        }
        tracing::debug!("engine: fetching CI status for {} PR(s)", numbers.len());
        let remote = Arc::clone(&self.ctx.remote);
        let done_tx = self.done_tx.clone();
        let epoch = self.epoch;
        self.registry
            .submit(TaskPurpose::CiStatus, move |token, ticket| async move {
                for number in numbers {
                    let fetch = ci_status(remote.as_ref(), number);
                    let Ok(status) = cancellable(&token, fetch).await else {
                        break;
                    };
                    let done = Completion::CiStatus {
                        ticket,
                        epoch,
                        number,
                        status,
                    };
                    if done_tx.send(done).is_err() {
                        break;
                    }
                }
            });
    }

    // -----------------------------------------------------------------------
    // Commits
    // -----------------------------------------------------------------------

    fn request_commits(&mut self, number: u64, reply_tx: Sender<Event>, origin: Origin) {
        match self.commits.lookup(number) {
            Lookup::Hit(commits) => {
                let _ = reply_tx.send(Event::CommitsFetched { number, commits });
                return;
            }
            Lookup::Failed(message) => {
                tracing::debug!("engine: retrying commits of #{number} ({message})");
            }
            Lookup::Miss => {}
        }

        if let Some(pending) = &mut self.commits_in_flight
            && pending.number == number
            && self.registry.is_current(pending.ticket)
        {
            pending.waiters.push((reply_tx, origin));
            return;
        }
        if let Some(previous) = self.commits_in_flight.take() {
            let event = Event::Cancelled {
                context: format!("commits of #{}", previous.number),
            };
            for (waiter, _) in previous.waiters {
                let _ = waiter.send(event.clone());
            }
        }

        let env = self.env();
        let pr = self.find(number);
        let done_tx = self.done_tx.clone();
        let epoch = self.epoch;
        let ticket = self
            .registry
            .submit(TaskPurpose::Commits, move |token, ticket| async move {
                let result = fetch_commits(&token, env, pr, number).await;
                let _ = done_tx.send(Completion::Commits {
                    ticket,
                    epoch,
                    number,
                    result,
                });
            });
        self.commits_in_flight = Some(PendingCommits {
            number,
            ticket,
            waiters: vec![(reply_tx, origin)],
        });
    }

    // -----------------------------------------------------------------------
    // Files and diffs
    // -----------------------------------------------------------------------

    fn request_files(
        &mut self,
        pr: PullRequestSummary,
        selection: Option<Vec<CommitId>>,
        origin: Origin,
        reply_tx: Sender<Event>,
    ) {
        let number = pr.number;
        if selection.is_none()
            && let Lookup::Hit(files) = self.files.lookup(number)
        {
            let _ = reply_tx.send(Event::ChangedFilesFetched {
                number,
                selection: None,
                files,
                errors: Vec::new(),
            });
            return;
        }

        let env = self.env();
        let done_tx = self.done_tx.clone();
        let epoch = self.epoch;
        self.registry
            .submit(TaskPurpose::Files, move |token, ticket| async move {
                let commits = selection.clone();
                let result = run_blocking(&token, move |token| {
                    changed_files(&env, &pr, commits.as_deref(), token)
                })
                .await;
                let _ = done_tx.send(Completion::Files {
                    ticket,
                    epoch,
                    number,
                    origin,
                    selection,
                    result,
                    reply_tx,
                });
            });
    }

    fn start_diff(&mut self, pr: PullRequestSummary, reply_tx: Sender<Event>) {
        let env = self.env();
        let contents = self.contents.clone();
        let done_tx = self.done_tx.clone();
        let number = pr.number;
        self.registry
            .submit(TaskPurpose::PrDiff, move |token, ticket| async move {
                let result = pr_diff(&token, env, &contents, pr).await;
                let _ = done_tx.send(Completion::Diff {
                    ticket,
                    number,
                    result,
                    reply_tx,
                });
            });
    }

    fn start_patch(&mut self, pr: PullRequestSummary, reply_tx: Sender<Event>) {
        let env = self.env();
        let done_tx = self.done_tx.clone();
        let number = pr.number;
        let head = pr.head_sha.clone();
        self.registry
            .submit(TaskPurpose::Patch, move |token, ticket| async move {
                let result = run_blocking(&token, move |token| pr_patch(&env, &pr, token)).await;
                let _ = done_tx.send(Completion::Patch {
                    ticket,
                    number,
                    head,
                    result,
                    reply_tx,
                });
            });
    }

    fn start_commit_diff(
        &mut self,
        pr: PullRequestSummary,
        commit: CommitId,
        reply_tx: Sender<Event>,
    ) {
        let env = self.env();
        let contents = self.contents.clone();
        let done_tx = self.done_tx.clone();
        let number = pr.number;
        self.registry
            .submit(TaskPurpose::CommitDiff, move |token, ticket| async move {
                let sha = commit.clone();
                let result = commit_diff(&token, env, &contents, pr, sha).await;
                let _ = done_tx.send(Completion::CommitDiff {
                    ticket,
                    number,
                    commit,
                    result,
                    reply_tx,
                });
            });
    }

    // -----------------------------------------------------------------------
    // Checkout
    // -----------------------------------------------------------------------

    fn start_checkout(&mut self, pr: PullRequestSummary, reply_tx: Sender<Event>) {
        let env = self.env();
        let done_tx = self.done_tx.clone();
        let number = pr.number;
        self.registry
            .submit(TaskPurpose::Checkout, move |token, ticket| async move {
                let result = run_blocking(&token, move |_| {
                    Ok(checkout::checkout_pull_request(
                        env.repo.as_ref(),
                        &pr,
                        &env.remote_name,
                        &env.host,
                    )
                    .map_err(|e| format!("{e:#}")))
                })
                .await;
                let _ = done_tx.send(Completion::Checkout {
                    ticket,
                    number,
                    result,
                    reply_tx,
                });
            });
    }

    // -----------------------------------------------------------------------
    // Credential change
    // -----------------------------------------------------------------------

    fn begin_credential_change(&mut self, reply_tx: Sender<Event>) {
        let running = self.registry.cancel_all();
        if let Some(pending) = self.commits_in_flight.take() {
            let event = Event::Cancelled {
                context: format!("commits of #{}", pending.number),
            };
            for (waiter, _) in pending.waiters {
                let _ = waiter.send(event.clone());
            }
        }

        let in_flight = running.len();
        tracing::info!("engine: credentials changed, {in_flight} task(s) to drain");
        let _ = reply_tx.send(Event::CredentialChangeStarted { in_flight });
        if running.is_empty() {
            self.finish_credential_change(0, &reply_tx);
            return;
        }

        self.phase = Phase::Draining;
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            for handle in running {
                if let Err(e) = handle.await
                    && e.is_panic()
                {
                    tracing::warn!("engine: task panicked while draining: {e}");
                }
            }
            let _ = done_tx.send(Completion::Drained {
                drained: in_flight,
                reply_tx,
            });
        });
    }

    fn finish_credential_change(&mut self, drained: usize, reply_tx: &Sender<Event>) {
        self.phase = Phase::Idle;
        self.ctx.remote.reset_credentials();
        self.ci.invalidate_all();
        self.commits.invalidate_all();
        self.files.invalidate_all();
        tracing::info!("engine: drained {drained} task(s), refreshing");
        let _ = reply_tx.send(Event::CredentialChangeDrained { drained });

        let state = self.last_state.unwrap_or(self.ctx.settings.default_state);
        self.last_state = Some(state);
        self.start_listing(state);

        while self.phase == Phase::Idle
            && let Some(req) = self.deferred.pop_front()
        {
            self.handle(req);
        }
    }

    // -----------------------------------------------------------------------
    // Completion handling
    // -----------------------------------------------------------------------

    fn complete(&mut self, done: Completion) {
        match done {
            Completion::PrList { ticket, result } => {
                if !self.registry.is_current(ticket) {
                    tracing::debug!("engine: stale PR list dropped");
                    return;
                }
                match result {
                    Ok(prs) => self.install_listing(prs),
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => self.fail_listing(&e.to_string()),
                }
            }
            Completion::CiStatus {
                ticket,
                epoch,
                number,
                status,
            } => {
                if !self.registry.is_current(ticket) || epoch != self.epoch {
                    return;
                }
                self.ci.store(number, status.clone());
                self.notify(Event::CiStatusUpdated { number, status });
            }
            Completion::Commits {
                ticket,
                epoch,
                number,
                result,
            } => {
                let Some(pending) = self.commits_in_flight.take_if(|p| p.ticket == ticket) else {
                    tracing::debug!("engine: stale commits of #{number} dropped");
                    return;
                };
                let event = match result {
                    Ok(commits) => {
                        if epoch == self.epoch {
                            self.commits.store(number, Ok(commits.clone()));
                        }
                        Event::CommitsFetched { number, commits }
                    }
                    Err(e) if e.is_cancelled() => Event::Cancelled {
                        context: format!("commits of #{number}"),
                    },
                    Err(e) => {
                        let message = e.to_string();
                        if epoch == self.epoch {
                            self.commits.store(number, Err(message.clone()));
                        }
                        Event::CommitsFailed { number, message }
                    }
                };
                for (waiter, origin) in pending.waiters {
                    if origin == Origin::Selection && self.selected != Some(number) {
                        continue;
                    }
                    let _ = waiter.send(event.clone());
                }
            }
            Completion::Files {
                ticket,
                epoch,
                number,
                origin,
                selection,
                result,
                reply_tx,
            } => {
                let current = self.registry.is_current(ticket);
                if origin == Origin::Selection && (!current || self.selected != Some(number)) {
                    tracing::debug!("engine: files of #{number} no longer selected, dropped");
                    return;
                }
                let event = match result {
                    _ if !current => Event::Cancelled {
                        context: format!("files of #{number}"),
                    },
                    Err(e) if e.is_cancelled() => Event::Cancelled {
                        context: format!("files of #{number}"),
                    },
                    Ok((files, errors)) => {
                        if selection.is_none() && epoch == self.epoch {
                            self.files.store(number, Ok(files.clone()));
                        }
                        Event::ChangedFilesFetched {
                            number,
                            selection,
                            files,
                            errors,
                        }
                    }
                    Err(e) => {
                        let message = e.to_string();
                        if selection.is_none() && epoch == self.epoch {
                            self.files.store(number, Err(message.clone()));
                        }
                        Event::ChangedFilesFailed { number, message }
                    }
                };
                let _ = reply_tx.send(event);
            }
            Completion::Diff {
                ticket,
                number,
                result,
                reply_tx,
            } => {
                let result = result.map(|files| Event::PrDiffFetched { number, files });
                let event = self.settle(ticket, format!("diff of #{number}"), result);
                let _ = reply_tx.send(event);
            }
            Completion::Patch {
                ticket,
                number,
                head,
                result,
                reply_tx,
            } => {
                let result = result.map(|(base, patch)| Event::PrPatchFetched {
                    number,
                    base,
                    head,
                    patch,
                });
                let event = self.settle(ticket, format!("patch of #{number}"), result);
                let _ = reply_tx.send(event);
            }
            Completion::CommitDiff {
                ticket,
                number,
                commit,
                result,
                reply_tx,
            } => {
                let context = format!("diff of {} in #{number}", commit.short());
                let result = result.map(|files| Event::CommitDiffFetched {
                    number,
                    commit,
                    files,
                });
                let event = self.settle(ticket, context, result);
                let _ = reply_tx.send(event);
            }
            Completion::Checkout {
                ticket,
                number,
                result,
                reply_tx,
            } => {
                let description = format!("checkout PR #{number}");
                let superseded = !self.registry.is_current(ticket);
                let event = match result {
                    // A checkout that ran to completion is reported even if superseded.
                    Ok(Ok(message)) => Event::MutationOk {
                        description: message,
                    },
                    Ok(Err(message)) => Event::MutationError {
                        description,
                        message,
                    },
                    Err(e) if e.is_cancelled() || superseded => Event::Cancelled {
                        context: description,
                    },
                    Err(e) => Event::MutationError {
                        description,
                        message: e.to_string(),
                    },
                };
                let _ = reply_tx.send(event);
            }
            Completion::Drained { drained, reply_tx } => {
                self.finish_credential_change(drained, &reply_tx)
            }
        }
    }

    /// The reply for a finished fetch, or `Cancelled` once superseded.
    fn settle(&self, ticket: Ticket, context: String, result: Result<Event, SyncError>) -> Event {
        match result {
            _ if !self.registry.is_current(ticket) => Event::Cancelled { context },
            Ok(event) => event,
            Err(e) if e.is_cancelled() => Event::Cancelled { context },
            Err(e) => Event::FetchError {
                context,
                message: e.to_string(),
            },
        }
    }
}

fn not_listed(context: &str, number: u64) -> Event {
    Event::FetchError {
        context: format!("{context} #{number}"),
        message: format!("PR #{number} is not in the current listing"),
    }
}

// ---------------------------------------------------------------------------
// Task bodies
// ---------------------------------------------------------------------------

async fn ci_status(remote: &dyn RemoteApi, number: u64) -> Result<CiStatus, String> {
    async fn fetch(remote: &dyn RemoteApi, number: u64) -> anyhow::Result<CiStatus> {
        if remote.is_merged(number).await? {
            return Ok(CiStatus::Merged);
        }
        Ok(CiStatus::State(remote.mergeable_state(number).await?))
    }

    fetch(remote, number).await.map_err(|e| {
        tracing::warn!("engine: CI status of #{number} failed: {e:#}");
        errors::describe(&e)
    })
}

async fn fetch_commits(
    token: &CancellationToken,
    env: TaskEnv,
    pr: Option<PullRequestSummary>,
    number: u64,
) -> Result<Vec<CommitInfo>, SyncError> {
    let commits = cancellable(token, env.remote.list_commits(number))
        .await?
        .map_err(|e| SyncError::RemoteFetch {
            cause: errors::describe(&e),
        })?;

    // Per-commit file listings need the head history locally.
    if let Some(pr) = pr {
        let available = run_blocking(token, move |_| {
            let ensurer = &env.ensurer;
            let repo = env.repo.as_ref();
            Ok(ensurer.ensure_head_local(repo, &pr, &env.remote_name, &env.host))
        })
        .await?;
        if !available {
            tracing::warn!("engine: head of #{number} is not available locally");
        }
    }
    Ok(commits)
}

/// Make both ends of a PR local and diff them.
fn pr_changes(
    env: &TaskEnv,
    pr: &PullRequestSummary,
    token: &CancellationToken,
) -> Result<ChangeSet, SyncError> {
    let repo = env.repo.as_ref();
    let ensurer = &env.ensurer;
    if !ensurer.ensure_head_local(repo, pr, &env.remote_name, &env.host) {
        return Err(SyncError::ObjectUnavailable {
            sha: pr.head_sha.clone(),
        });
    }
    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    if !ensurer.ensure_base_local(repo, pr, &env.remote_name) {
        tracing::debug!("engine: recorded base of #{} not fetched", pr.number);
    }
    let base = DiffBase::for_pr(repo, pr, &env.remote_name);
    if !repo.has_commit(base.commit()) {
        return Err(SyncError::ObjectUnavailable {
            sha: base.commit().clone(),
        });
    }
    if token.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    diff::changes(repo, &pr.head_sha, base.commit())
}

fn changed_files(
    env: &TaskEnv,
    pr: &PullRequestSummary,
    selection: Option<&[CommitId]>,
    token: &CancellationToken,
) -> Result<(Vec<FileRef>, Vec<String>), SyncError> {
    let Some(commits) = selection else {
        return pr_changes(env, pr, token).map(|set| (set.files(), Vec::new()));
    };

    let repo = env.repo.as_ref();
    let ensurer = &env.ensurer;
    if !ensurer.ensure_head_local(repo, pr, &env.remote_name, &env.host) {
        tracing::warn!(
            "engine: head of #{} is not available locally",
            pr.number
        );
    }
    let commits: Vec<CommitInfo> = commits
        .iter()
        .map(|sha| CommitInfo::new(sha.clone(), ""))
        .collect();
    Ok(diff::files_for_commits(repo, &commits, || !token.is_cancelled()))
}

async fn pr_diff(
    token: &CancellationToken,
    env: TaskEnv,
    contents: &ContentCache,
    pr: PullRequestSummary,
) -> Result<Vec<FileComparison>, SyncError> {
    let repo = Arc::clone(&env.repo);
    let set = run_blocking(token, move |token| pr_changes(&env, &pr, token)).await?;
    compare(token, contents, &repo, &set).await
}

/// The PR's changes as unified diff text, with the commit it starts from.
fn pr_patch(
    env: &TaskEnv,
    pr: &PullRequestSummary,
    token: &CancellationToken,
) -> Result<(CommitId, String), SyncError> {
    let set = pr_changes(env, pr, token)?;
    let repo = env.repo.as_ref();
    let patch = repo
        .unified_diff(&set.old, &set.new)
        .map_err(|e| SyncError::DiffComputation {
            head: set.new.clone(),
            base: set.old.clone(),
            cause: format!("{e:#}"),
        })?;
    Ok((set.old, patch))
}

/// Compare one commit with its first parent. The head history is fetched
/// first so commits of fork PRs resolve.
async fn commit_diff(
    token: &CancellationToken,
    env: TaskEnv,
    contents: &ContentCache,
    pr: PullRequestSummary,
    commit: CommitId,
) -> Result<Vec<FileComparison>, SyncError> {
    let repo = Arc::clone(&env.repo);
    let set = run_blocking(token, move |_| {
        let ensurer = &env.ensurer;
        let repo = env.repo.as_ref();
        if !ensurer.ensure_head_local(repo, &pr, &env.remote_name, &env.host) {
            tracing::warn!(
                "engine: head of #{} is not available locally",
                pr.number
            );
        }
        diff::commit_changes(repo, &commit)
    })
    .await?;
    compare(token, contents, &repo, &set).await
}

async fn compare(
    token: &CancellationToken,
    contents: &ContentCache,
    repo: &Arc<dyn LocalRepo>,
    set: &ChangeSet,
) -> Result<Vec<FileComparison>, SyncError> {
    let mut files = Vec::with_capacity(set.changes.len());
    for change in &set.changes {
        if token.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let (left, right) = diff::comparison_sides(set, change);
        let left = read_side(contents, repo, left).await;
        let right = read_side(contents, repo, right).await;
        files.push(FileComparison {
            path: change.path.clone(),
            kind: change.kind.clone(),
            left,
            right,
        });
    }
    Ok(files)
}

async fn read_side(
    contents: &ContentCache,
    repo: &Arc<dyn LocalRepo>,
    side: Option<diff::Side>,
) -> String {
    let Some((rev, path)) = side else {
        return String::new();
    };
    let content = contents.load(Arc::clone(repo), rev, path).await;
    content.to_string()
}
