use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;

use prsync::config::loader;
use prsync::config::types::AppConfig;
use prsync::engine::{
    Engine, EngineContext, EngineHandle, EngineSettings, Event, Request, SyncEngine,
};
use prsync::filter::{Facet, FacetChoices, REVIEW_STATUS_OPTIONS};
use prsync::git::{self, GitCli};
use prsync::github::{GitHubClient, GitHubRemote, TokenSource};
use prsync::types::{CiStatus, CommitId, PrStateFilter, PullRequestSummary, RepoRef};

/// How long to wait for any single engine reply.
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);
/// How long `list` waits for CI statuses after the listing arrived.
const CI_WAIT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(
    name = "prsync",
    version,
    about = "Pull requests reconciled against a local clone"
)]
struct Cli {
    /// Path to config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging to debug.log.
    #[arg(long)]
    debug: bool,

    /// Local clone to work in (defaults to `[repo] path`, then the current directory).
    #[arg(long)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Listing {
    /// PR state to list: open, closed or all.
    #[arg(long, default_value = "open")]
    state: PrStateFilter,
}

#[derive(Args)]
struct Filters {
    #[arg(long)]
    author: Option<String>,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    assignee: Option<String>,
    /// Review status (accepted but not applied).
    #[arg(long)]
    review: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List pull requests with their CI status.
    List {
        #[command(flatten)]
        listing: Listing,
        #[command(flatten)]
        filters: Filters,
    },
    /// Show the filter choices derived from the listing.
    Choices {
        #[command(flatten)]
        listing: Listing,
    },
    /// List the commits of a pull request.
    Commits {
        number: u64,
        #[command(flatten)]
        listing: Listing,
    },
    /// List the files a pull request (or some of its commits) changes.
    Files {
        number: u64,
        /// Restrict to these commits; repeatable.
        #[arg(long = "commit")]
        commits: Vec<String>,
        #[command(flatten)]
        listing: Listing,
    },
    /// Show the changed files of a pull request with both sides' sizes.
    Diff {
        number: u64,
        /// Compare this commit with its first parent instead.
        #[arg(long)]
        commit: Option<String>,
        #[command(flatten)]
        listing: Listing,
    },
    /// Print a pull request's changes as a unified diff.
    Patch {
        number: u64,
        #[command(flatten)]
        listing: Listing,
    },
    /// Check out a pull request's head branch.
    Checkout {
        number: u64,
        #[command(flatten)]
        listing: Listing,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up tracing.
    if cli.debug {
        let file = std::fs::File::create("debug.log")?;
        tracing_subscriber::fmt()
            .with_writer(file)
            .with_ansi(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .init();
    }

    let cwd = std::env::current_dir().context("reading current directory")?;
    let start = cli.repo.clone().unwrap_or(cwd);
    let mut config = loader::load_config(cli.config.as_deref(), &start)?;

    // Install the rustls CryptoProvider before any TLS client is constructed.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls: a crypto provider was already installed");
    }

    let repo_path = match (&cli.repo, config.repo.path.clone()) {
        (None, Some(configured)) if configured != start => {
            // Repo-local settings belong to the configured clone.
            config = loader::load_config(cli.config.as_deref(), &configured)?;
            configured
        }
        _ => start,
    };
    let git = GitCli::open(&repo_path)?;
    let repo_ref = resolve_repo(&config, &git)?;
    tracing::info!(
        "prsync starting for {} in {}",
        repo_ref.full_name(),
        git.root().display()
    );

    let mut client = GitHubClient::new(
        config.github.host.clone(),
        TokenSource::Discover {
            env_var: config.github.token_env.clone(),
        },
    );
    if let Some(url) = &config.github.api_url {
        client = client.with_api_url(url.clone());
    }

    let ctx = EngineContext::new(
        Arc::new(GitHubRemote::new(client, repo_ref)),
        Arc::new(git),
        EngineSettings::from_config(&config),
    );
    // Dropping the handle at the end of `main` closes the channel and stops the engine.
    let mut session = Session::new(SyncEngine::new(ctx).start());
    session.run(cli.command)
}

fn resolve_repo(config: &AppConfig, git: &GitCli) -> Result<RepoRef> {
    if let (Some(owner), Some(name)) = (&config.github.owner, &config.github.repo) {
        return Ok(RepoRef {
            owner: owner.clone(),
            name: name.clone(),
        });
    }
    let detected = git::detect_repo(git.root(), &config.repo.remote).with_context(|| {
        format!(
            "could not detect the GitHub repository from remote '{}'; set [github] owner and repo",
            config.repo.remote
        )
    })?;
    Ok(RepoRef {
        owner: config.github.owner.clone().unwrap_or(detected.owner),
        name: config.github.repo.clone().unwrap_or(detected.name),
    })
}

// ---------------------------------------------------------------------------
// Engine session
// ---------------------------------------------------------------------------

/// Displayed PRs and the facet choices of one listing.
type Listed = (Vec<PullRequestSummary>, FacetChoices);

struct Session {
    handle: EngineHandle,
    tx: Sender<Event>,
    rx: Receiver<Event>,
    ci: HashMap<u64, Result<CiStatus, String>>,
}

impl Session {
    fn new(handle: EngineHandle) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            handle,
            tx,
            rx,
            ci: HashMap::new(),
        }
    }

    fn run(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::List { listing, filters } => {
                let mut displayed = self.refresh(listing.state)?.0;
                for (facet, choice) in [
                    (Facet::Author, filters.author),
                    (Facet::Label, filters.label),
                    (Facet::Assignee, filters.assignee),
                    (Facet::ReviewStatus, filters.review),
                ] {
                    if let Some(choice) = choice {
                        self.handle.send(Request::SetFilter {
                            facet,
                            choice: Some(choice),
                            reply_tx: self.tx.clone(),
                        });
                        displayed = self.listing()?.0;
                    }
                }
                self.print_listing(&displayed);
            }
            Commands::Choices { listing } => {
                let (_, choices) = self.refresh(listing.state)?;
                print_choices(&choices);
            }
            Commands::Commits { number, listing } => {
                self.refresh(listing.state)?;
                self.handle.send(Request::GetCommits {
                    number,
                    reply_tx: self.tx.clone(),
                });
                loop {
                    match self.next()? {
                        Event::CommitsFetched { commits, .. } => {
                            for commit in commits {
                                println!("{} {}", commit.sha.short(), commit.summary());
                            }
                            break;
                        }
                        Event::CommitsFailed { message, .. } => bail!(message),
                        other => check_failure(&other)?,
                    }
                }
            }
            Commands::Files {
                number,
                commits,
                listing,
            } => {
                self.refresh(listing.state)?;
                let commits: Vec<CommitId> = commits.into_iter().map(CommitId::from).collect();
                self.handle.send(Request::GetChangedFiles {
                    number,
                    commits: (!commits.is_empty()).then_some(commits),
                    reply_tx: self.tx.clone(),
                });
                loop {
                    match self.next()? {
                        Event::ChangedFilesFetched { files, errors, .. } => {
                            for file in files {
                                println!("{file}");
                            }
                            for error in errors {
                                println!("{error}");
                            }
                            break;
                        }
                        Event::ChangedFilesFailed { message, .. } => bail!("Error: {message}"),
                        other => check_failure(&other)?,
                    }
                }
            }
            Commands::Diff {
                number,
                commit,
                listing,
            } => {
                self.refresh(listing.state)?;
                let reply_tx = self.tx.clone();
                let request = match commit {
                    Some(sha) => Request::FetchCommitDiff {
                        number,
                        commit: CommitId::from(sha),
                        reply_tx,
                    },
                    None => Request::FetchPrDiff { number, reply_tx },
                };
                self.handle.send(request);
                loop {
                    let files = match self.next_checked()? {
                        Event::PrDiffFetched { files, .. } => files,
                        Event::CommitDiffFetched { files, .. } => files,
                        _ => continue,
                    };
                    for file in files {
                        println!(
                            "{} {} ({} -> {} lines)",
                            file.kind.letter(),
                            file.path,
                            file.left.lines().count(),
                            file.right.lines().count()
                        );
                    }
                    break;
                }
            }
            Commands::Patch { number, listing } => {
                self.refresh(listing.state)?;
                self.handle.send(Request::FetchPrPatch {
                    number,
                    reply_tx: self.tx.clone(),
                });
                loop {
                    if let Event::PrPatchFetched { patch, .. } = self.next_checked()? {
                        print!("{patch}");
                        break;
                    }
                }
            }
            Commands::Checkout { number, listing } => {
                self.refresh(listing.state)?;
                self.handle.send(Request::CheckoutPullRequest {
                    number,
                    reply_tx: self.tx.clone(),
                });
                loop {
                    if let Event::MutationOk { description } = self.next_checked()? {
                        println!("{description}");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn next(&mut self) -> Result<Event> {
        let event = self
            .rx
            .recv_timeout(REPLY_TIMEOUT)
            .context("timed out waiting for the engine")?;
        if let Event::CiStatusUpdated { number, status } = &event {
            self.ci.insert(*number, status.clone());
        }
        Ok(event)
    }

    /// Next event, with failures turned into errors.
    fn next_checked(&mut self) -> Result<Event> {
        let event = self.next()?;
        check_failure(&event)?;
        Ok(event)
    }

    fn refresh(&mut self, state: PrStateFilter) -> Result<Listed> {
        self.handle.send(Request::Refresh {
            state,
            reply_tx: self.tx.clone(),
        });
        self.listing()
    }

    fn listing(&mut self) -> Result<Listed> {
        loop {
            match self.next()? {
                Event::Displayed { prs, choices, .. } => return Ok((prs, choices)),
                Event::PrListFailed { message } => bail!(message),
                _ => {}
            }
        }
    }

    fn print_listing(&mut self, prs: &[PullRequestSummary]) {
        if prs.is_empty() {
            println!("No matching PRs found");
            return;
        }

        let mut statuses: IndexMap<u64, Option<Result<CiStatus, String>>> = prs
            .iter()
            .map(|pr| (pr.number, self.ci.get(&pr.number).cloned()))
            .collect();
        let deadline = Instant::now() + CI_WAIT;
        while statuses.values().any(Option::is_none) {
            let Some(left) = deadline.checked_duration_since(Instant::now()) else {
                break;
            };
            match self.rx.recv_timeout(left) {
                Ok(Event::CiStatusUpdated { number, status }) => {
                    if let Some(slot) = statuses.get_mut(&number) {
                        *slot = Some(status);
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        for pr in prs {
            let ci = match statuses.get(&pr.number) {
                Some(Some(Ok(status))) => status.to_string(),
                Some(Some(Err(_))) => "Err".to_owned(),
                _ => "...".to_owned(),
            };
            let updated = if pr.has_readable_update_time() {
                pr.updated_at.format("%Y-%m-%d %H:%M").to_string()
            } else {
                "-".to_owned()
            };
            println!(
                "#{:<6} {:<10} {:<16} {:<16} {}",
                pr.number, ci, pr.author, updated, pr.title
            );
        }
    }
}

fn check_failure(event: &Event) -> Result<()> {
    match event {
        Event::FetchError { context, message } => bail!("{context}: {message}"),
        Event::MutationError {
            description,
            message,
        } => bail!("{description}: {message}"),
        Event::Cancelled { context } => bail!("{context} was cancelled"),
        _ => Ok(()),
    }
}

fn print_choices(choices: &FacetChoices) {
    for (facet, options) in [
        (Facet::Author, &choices.author),
        (Facet::Label, &choices.label),
        (Facet::Assignee, &choices.assignee),
    ] {
        println!("{facet}:");
        for option in options {
            println!("  {option}");
        }
    }
    println!("{}:", Facet::ReviewStatus);
    for option in REVIEW_STATUS_OPTIONS {
        println!("  {option}");
    }
}
