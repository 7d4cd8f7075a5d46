//! Command-line interface for tally
//!
//! This module defines the CLI structure using clap derive macros.
//! Each group of subcommands is implemented in its own submodule.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::error::Result;
use crate::event::ItemId;
use crate::output::{HumanOutput, OutputOptions};
use crate::sync::{self, CommitOutcome, SyncEngine};
use crate::tracker::Tracker;

mod actor;
mod admin;
mod init;
mod item;
mod remote;

/// tally - work items as an append-only event log in git
///
/// Every change is a new file; clones converge by merging their logs.
#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the repository (defaults to current directory)
    #[arg(long, global = true, env = "TALLY_REPO")]
    pub repo: Option<PathBuf>,

    /// Actor identity recorded on events
    #[arg(long, global = true, env = "TALLY_ACTOR")]
    pub actor: Option<String>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Write events without committing or pushing them
    #[arg(long, global = true)]
    pub no_sync: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize tally in a git repository
    Init {
        /// Persist this actor name for the clone
        #[arg(long = "as")]
        as_actor: Option<String>,
    },

    /// Actor identity commands
    #[command(subcommand)]
    Actor(ActorCommands),

    /// Create a new item
    Create {
        /// One-line description
        tagline: String,

        /// Initial status (defaults to statuses.default)
        #[arg(long)]
        status: Option<String>,
    },

    /// Replace an item's tagline
    Tagline { id: String, tagline: String },

    /// Move an item to another status
    Status { id: String, status: String },

    /// Append a note to an item
    Note { id: String, text: String },

    /// Record that ID needs TARGET
    Link { id: String, target: String },

    /// Remove a dependency
    Unlink { id: String, target: String },

    /// Watch an item
    Monitor { id: String },

    /// Stop watching an item
    Unmonitor { id: String },

    /// Hide an item from default listings
    Ignore { id: String },

    /// Show an ignored item again
    Unignore { id: String },

    /// Take responsibility for an item
    Take {
        id: String,

        /// Take over from this holder
        #[arg(long = "from")]
        from: Option<String>,
    },

    /// Give up responsibility for an item
    Surrender { id: String },

    /// Show one item
    Show { id: String },

    /// List items
    List {
        /// Only items with this status
        #[arg(long)]
        status: Option<String>,

        /// Only items taken by this actor
        #[arg(long)]
        taken_by: Option<String>,

        /// Include ignored items
        #[arg(long)]
        all: bool,
    },

    /// Show the dependency tree
    Tree {
        /// Roots to start from (defaults to every top-level item)
        ids: Vec<String>,
    },

    /// Re-derive aggregates from the event log
    Rebuild {
        /// Items to rebuild (defaults to every item)
        ids: Vec<String>,
    },

    /// Compare stored aggregates with a full replay and scan for cycles
    Validate,

    /// Show cache counters
    Stats,

    /// Commit and push pending events now
    Sync,

    /// Pull and merge the remote branch
    Pull,

    /// Fetch the remote branch without merging
    Fetch,
}

#[derive(Subcommand, Debug)]
pub enum ActorCommands {
    /// Persist the actor name for this clone
    Set { name: String },

    /// Show the resolved actor
    Show,
}

/// Flags shared by every command
#[derive(Debug, Clone)]
pub struct Common {
    pub repo: Option<PathBuf>,
    pub actor: Option<String>,
    pub json: bool,
    pub quiet: bool,
    pub no_sync: bool,
}

impl Common {
    pub fn output(&self) -> OutputOptions {
        OutputOptions {
            json: self.json,
            quiet: self.quiet,
        }
    }

    /// Working directory of the repository the command runs in.
    pub fn repo_root(&self) -> Result<PathBuf> {
        let repository = sync::git::open_repo(self.repo.as_deref())?;
        sync::git::workdir(&repository)
    }

    /// Open the tracker, attaching a sync engine when `with_sync` is set and
    /// sync is enabled in the configuration.
    pub fn open(&self, with_sync: bool) -> Result<Tracker> {
        let mut tracker = Tracker::open(self.repo_root()?, self.actor.as_deref())?;
        if with_sync && !self.no_sync && tracker.config().sync.enabled {
            let engine =
                SyncEngine::new(tracker.storage().clone(), tracker.config().sync.clone())?;
            tracker.attach_sync(engine);
        }
        Ok(tracker)
    }
}

/// Commit what a one-shot command wrote instead of waiting for the debounce.
///
/// Failures are reported as warnings; the events stay on disk and are
/// picked up by the next cycle.
pub(crate) async fn flush(tracker: &Tracker, human: &mut HumanOutput) -> Option<CommitOutcome> {
    let engine = tracker.sync()?;
    let outcome = engine.flush().await;
    match &outcome.error {
        Some(error) => {
            warn!(%error, "sync after write failed");
            human.push_warning(format!("events saved locally; sync failed: {error}"));
            human.push_next_step("tally sync");
        }
        None => {
            if let Some(sha) = &outcome.sha {
                human.push_summary("commit", short_sha(sha));
            }
        }
    }
    Some(outcome)
}

pub(crate) fn parse_id(raw: &str) -> Result<ItemId> {
    ItemId::parse(raw.trim())
}

pub(crate) fn parse_ids(raw: &[String]) -> Result<Vec<ItemId>> {
    raw.iter().map(|id| parse_id(id)).collect()
}

pub(crate) fn short_sha(sha: &str) -> String {
    sha.chars().take(8).collect()
}

impl Cli {
    /// Execute the CLI command
    pub async fn run(self) -> Result<()> {
        let common = Common {
            repo: self.repo,
            actor: self.actor,
            json: self.json,
            quiet: self.quiet,
            no_sync: self.no_sync,
        };

        match self.command {
            Commands::Init { as_actor } => init::run(init::InitOptions { as_actor, common }),
            Commands::Actor(cmd) => match cmd {
                ActorCommands::Set { name } => actor::run_set(actor::SetOptions { name, common }),
                ActorCommands::Show => actor::run_show(actor::ShowOptions { common }),
            },
            Commands::Create { tagline, status } => {
                item::run_create(item::CreateOptions {
                    tagline,
                    status,
                    common,
                })
                .await
            }
            Commands::Tagline { id, tagline } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Tagline(tagline),
                    common,
                })
                .await
            }
            Commands::Status { id, status } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Status(status),
                    common,
                })
                .await
            }
            Commands::Note { id, text } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Note(text),
                    common,
                })
                .await
            }
            Commands::Link { id, target } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Link(target),
                    common,
                })
                .await
            }
            Commands::Unlink { id, target } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Unlink(target),
                    common,
                })
                .await
            }
            Commands::Monitor { id } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Monitor,
                    common,
                })
                .await
            }
            Commands::Unmonitor { id } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Unmonitor,
                    common,
                })
                .await
            }
            Commands::Ignore { id } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Ignore(true),
                    common,
                })
                .await
            }
            Commands::Unignore { id } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Ignore(false),
                    common,
                })
                .await
            }
            Commands::Take { id, from } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Take(from),
                    common,
                })
                .await
            }
            Commands::Surrender { id } => {
                item::run_change(item::ChangeOptions {
                    id,
                    change: item::Change::Surrender,
                    common,
                })
                .await
            }
            Commands::Show { id } => item::run_show(item::ShowOptions { id, common }),
            Commands::List {
                status,
                taken_by,
                all,
            } => item::run_list(item::ListOptions {
                status,
                taken_by,
                all,
                common,
            }),
            Commands::Tree { ids } => item::run_tree(item::TreeOptions { ids, common }),
            Commands::Rebuild { ids } => admin::run_rebuild(admin::RebuildOptions { ids, common }),
            Commands::Validate => admin::run_validate(admin::ValidateOptions { common }),
            Commands::Stats => admin::run_stats(admin::StatsOptions { common }),
            Commands::Sync => remote::run_sync(remote::SyncOptions { common }).await,
            Commands::Pull => remote::run_pull(remote::PullOptions { common }).await,
            Commands::Fetch => remote::run_fetch(remote::FetchOptions { common }).await,
        }
    }
}
