//! Git-backed synchronization of the event log.
//!
//! The [`SyncEngine`] turns local writes into commits and exchanges them
//! with one remote branch:
//!
//! 1. writers report each new event file; the [`CommitScheduler`] batches
//!    them behind a debounce window
//! 2. when the window closes the worker fetches and pulls (merge, never
//!    rebase), reports the event files that arrived, stages the data
//!    directory and commits
//! 3. the push is retried with exponential backoff; a rejection means the
//!    remote moved, so it is fetched and merged before the next attempt
//!
//! Event files never collide by name, so merges of two replicas are clean
//! apart from pathological cases. A failed merge is aborted and the attempt
//! counts against the retry budget. Cycles run one at a time per engine.

pub mod gate;
pub mod git;
pub mod scheduler;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use git2::{Oid, Repository};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::event::codec;
use crate::listeners::ListenerSet;
use crate::storage::Storage;

pub use gate::PushGate;
pub use git::{FetchResult, GitCli};
pub use scheduler::CommitScheduler;

/// Commit messages list individual events up to this many files.
const DETAILED_MESSAGE_LIMIT: usize = 5;

/// Result of one commit cycle, delivered to commit listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub success: bool,
    /// New commit id, absent when nothing was staged
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Event files included in the commit
    pub files: Vec<String>,
    /// Push attempts made
    pub attempts: usize,
}

impl CommitOutcome {
    fn committed(sha: Option<Oid>, files: Vec<String>, attempts: usize) -> Self {
        Self {
            success: true,
            sha: sha.map(|oid| oid.to_string()),
            error: None,
            files,
            attempts,
        }
    }

    fn failed(error: &Error, files: Vec<String>, attempts: usize) -> Self {
        Self {
            success: false,
            sha: None,
            error: Some(error.to_string()),
            files,
            attempts,
        }
    }
}

/// Result of a manual pull
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PullOutcome {
    NothingNew,
    Synchronized { files: Vec<String> },
}

struct Inner {
    storage: Storage,
    config: SyncConfig,
    git: GitCli,
    scheduler: CommitScheduler,
    trigger: Mutex<Option<UnboundedReceiver<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    cycle: tokio::sync::Mutex<()>,
    gate: Option<PushGate>,
    files_pulled: ListenerSet<Vec<String>>,
    commit_complete: ListenerSet<CommitOutcome>,
}

/// Debounced commit, pull and push against one remote branch.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("repo", &self.inner.storage.repo_root())
            .field("remote", &self.inner.config.remote)
            .field("branch", &self.inner.config.branch)
            .finish()
    }
}

impl SyncEngine {
    pub fn new(storage: Storage, config: SyncConfig) -> Result<Self> {
        let repo = git::open_repo(Some(storage.repo_root()))?;
        let needs_identity = repo.signature().is_err();
        let git = GitCli::new(git::workdir(&repo)?).with_fallback_identity(needs_identity);
        let (scheduler, trigger) = CommitScheduler::channel(config.debounce());

        Ok(Self {
            inner: Arc::new(Inner {
                storage,
                config,
                git,
                scheduler,
                trigger: Mutex::new(Some(trigger)),
                worker: Mutex::new(None),
                cycle: tokio::sync::Mutex::new(()),
                gate: PushGate::from_env(),
                files_pulled: ListenerSet::new("files-pulled"),
                commit_complete: ListenerSet::new("commit-complete"),
            }),
        })
    }

    /// Replace the environment-configured push gate.
    pub fn with_push_gate(self, gate: Option<PushGate>) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.gate = gate;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                warn!("push gate can only be set before the engine is shared");
                Self { inner }
            }
        }
    }

    pub fn scheduler(&self) -> &CommitScheduler {
        &self.inner.scheduler
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Called with the event filenames that arrived from the remote.
    pub fn on_files_pulled<F>(&self, listener: F)
    where
        F: Fn(&Vec<String>) + Send + Sync + 'static,
    {
        self.inner.files_pulled.register(listener);
    }

    /// Called once per commit cycle, successful or not.
    pub fn on_commit_complete<F>(&self, listener: F)
    where
        F: Fn(&CommitOutcome) + Send + Sync + 'static,
    {
        self.inner.commit_complete.register(listener);
    }

    /// Spawn the worker that runs a commit cycle whenever the debounce
    /// window closes. Requires a tokio runtime; a second call is a no-op.
    pub fn start(&self) {
        let Some(mut trigger) = self
            .inner
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while trigger.recv().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SyncEngine { inner }.run_commit_cycle().await;
            }
        });
        *self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the worker and drop any pending timer without committing.
    pub fn shutdown(&self) {
        self.cancel_pending_commit();
        if let Some(worker) = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }
    }

    pub fn notify_file_created(&self, filename: &str) {
        self.inner.scheduler.notify_file_created(filename);
    }

    /// Cancel the debounce timer; returns whether one was running.
    pub fn cancel_pending_commit(&self) -> bool {
        self.inner.scheduler.cancel()
    }

    /// Commit now instead of waiting for the debounce window.
    pub async fn flush(&self) -> CommitOutcome {
        self.cancel_pending_commit();
        self.run_commit_cycle().await
    }

    /// Pull, stage, commit and push once. Failures are reported through the
    /// outcome (and commit listeners); pending files stay pending.
    pub async fn run_commit_cycle(&self) -> CommitOutcome {
        let _cycle = self.inner.cycle.lock().await;
        let snapshot = self.inner.scheduler.pending_files();

        let mut files = Vec::new();
        let mut attempts = 0;
        let outcome = match self.commit_and_push(&mut files, &mut attempts).await {
            Ok(sha) => {
                self.inner.scheduler.mark_committed(&snapshot);
                CommitOutcome::committed(sha, files, attempts)
            }
            Err(err) => {
                warn!(error = %err, attempts, "commit cycle failed");
                CommitOutcome::failed(&err, files, attempts)
            }
        };

        self.inner.commit_complete.emit(&outcome);
        outcome
    }

    /// Fetch and merge the remote branch now.
    pub async fn pull(&self) -> Result<PullOutcome> {
        let _cycle = self.inner.cycle.lock().await;
        self.require_remote()?;

        let before = self.head()?;
        let files = self.pull_remote(false).await?;
        if self.head()? == before {
            return Ok(PullOutcome::NothingNew);
        }
        self.notify_pulled(&files);
        Ok(PullOutcome::Synchronized { files })
    }

    /// Update the remote-tracking branch without touching the working tree.
    pub async fn fetch(&self) -> Result<FetchResult> {
        let _cycle = self.inner.cycle.lock().await;
        self.require_remote()?;
        let config = &self.inner.config;
        self.inner.git.fetch(&config.remote, &config.branch).await
    }

    // =========================================================================
    // Cycle steps
    // =========================================================================

    async fn commit_and_push(
        &self,
        files: &mut Vec<String>,
        attempts: &mut usize,
    ) -> Result<Option<Oid>> {
        let config = &self.inner.config;
        let remote_exists = git::has_remote(&self.repo()?, &config.remote);

        if remote_exists {
            // Local changes may block the pull; the push path merges later.
            match self.pull_remote(true).await {
                Ok(pulled) => self.notify_pulled(&pulled),
                Err(err) => warn!(error = %err, "pull before commit failed"),
            }
        }

        let repo = self.repo()?;
        git::stage_dir(&repo, self.inner.storage.data_dir_rel())?;
        *files = self.staged_event_files(&repo)?;

        let data_dir = self.inner.storage.data_dir_rel();
        let staged_anything = git::staged_files(&repo)?
            .iter()
            .any(|change| change.path.starts_with(data_dir));

        let sha = if staged_anything {
            let oid = git::create_commit(&repo, &commit_message(files))?;
            info!(sha = %oid, events = files.len(), "committed events");
            Some(oid)
        } else {
            debug!("nothing staged; skipping commit");
            None
        };

        if !remote_exists {
            return Ok(sha);
        }
        if sha.is_none() && !git::has_unpushed_commits(&repo, &config.remote, &config.branch)? {
            return Ok(None);
        }
        drop(repo);

        self.push_with_retry(attempts).await?;
        Ok(sha)
    }

    async fn push_with_retry(&self, attempts: &mut usize) -> Result<()> {
        let config = &self.inner.config;
        let budget = config.max_push_retries as usize + 1;
        let mut last_error = String::new();

        for attempt in 1..=budget {
            *attempts = attempt;
            if let Some(gate) = &self.inner.gate {
                gate.wait().await?;
            }

            let output = self.inner.git.push(&config.remote, &config.branch).await?;
            if output.success {
                info!(attempt, remote = %config.remote, branch = %config.branch, "pushed");
                return Ok(());
            }
            last_error = output.stderr.trim().to_string();
            if attempt == budget {
                break;
            }

            if git::is_push_rejection(&output.stderr) {
                warn!(attempt, "push rejected; merging remote changes");
                match self.merge_remote().await {
                    Ok(pulled) => self.notify_pulled(&pulled),
                    Err(err) => warn!(attempt, error = %err, "merge after rejected push failed"),
                }
            } else {
                warn!(attempt, error = %last_error, "push failed; retrying");
            }
            tokio::time::sleep(config.backoff(attempt as u32)).await;
        }

        Err(Error::SyncExhausted {
            attempts: budget,
            reason: last_error,
        })
    }

    /// Fetch then `git pull`; returns the event files that arrived.
    async fn pull_remote(&self, tolerate_failure: bool) -> Result<Vec<String>> {
        let config = &self.inner.config;
        let before = self.head()?;

        if self.inner.git.fetch(&config.remote, &config.branch).await? == FetchResult::RemoteEmpty
        {
            debug!(remote = %config.remote, "remote branch does not exist yet");
            return Ok(Vec::new());
        }

        let output = self.inner.git.pull(&config.remote, &config.branch).await?;
        if !output.success {
            self.abort_merge_in_progress().await?;
            if !tolerate_failure {
                return Err(Error::GitCommand {
                    command: "pull".to_string(),
                    stderr: output.stderr.trim().to_string(),
                });
            }
            debug!(stderr = %output.stderr.trim(), "pull failed; continuing");
        }
        self.pulled_since(before)
    }

    /// Fetch and merge after a rejected push.
    async fn merge_remote(&self) -> Result<Vec<String>> {
        let config = &self.inner.config;
        let before = self.head()?;

        if self.inner.git.fetch(&config.remote, &config.branch).await? == FetchResult::RemoteEmpty
        {
            return Ok(Vec::new());
        }
        if let Err(err) = self.inner.git.merge_fetch_head().await {
            self.inner.git.merge_abort().await?;
            return Err(Error::MergeConflict(err.to_string()));
        }
        self.pulled_since(before)
    }

    async fn abort_merge_in_progress(&self) -> Result<()> {
        if self.repo()?.path().join("MERGE_HEAD").exists() {
            warn!("aborting half-finished merge");
            self.inner.git.merge_abort().await?;
        }
        Ok(())
    }

    fn notify_pulled(&self, files: &[String]) {
        if files.is_empty() {
            return;
        }
        info!(files = files.len(), "event files pulled");
        self.inner.files_pulled.emit(&files.to_vec());
    }

    fn require_remote(&self) -> Result<()> {
        let remote = &self.inner.config.remote;
        if git::has_remote(&self.repo()?, remote) {
            Ok(())
        } else {
            Err(Error::InvalidConfig(format!("git remote '{remote}' is not configured")))
        }
    }

    // =========================================================================
    // Repository queries
    // =========================================================================

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(self.inner.git.workdir())?)
    }

    fn head(&self) -> Result<Option<Oid>> {
        git::head_oid(&self.repo()?)
    }

    fn events_dir_rel(&self) -> PathBuf {
        self.inner.storage.events_dir_rel()
    }

    /// Event files added or changed between `before` and the current HEAD
    fn pulled_since(&self, before: Option<Oid>) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let Some(after) = git::head_oid(&repo)? else {
            return Ok(Vec::new());
        };
        if Some(after) == before {
            return Ok(Vec::new());
        }
        let events_dir = self.events_dir_rel();
        Ok(git::diff_commits(&repo, before, after)?
            .iter()
            .filter(|change| change.is_arrival())
            .filter_map(|change| change.file_name_in(&events_dir))
            .collect())
    }

    fn staged_event_files(&self, repo: &Repository) -> Result<Vec<String>> {
        let events_dir = self.events_dir_rel();
        Ok(git::staged_files(repo)?
            .iter()
            .filter(|change| change.is_arrival())
            .filter_map(|change| change.file_name_in(&events_dir))
            .collect())
    }
}

/// Summary line, plus one line per event for small batches.
pub fn commit_message(files: &[String]) -> String {
    let summary = match files.len() {
        0 => "tally: update data".to_string(),
        1 => "tally: record 1 event".to_string(),
        n => format!("tally: record {n} events"),
    };
    if files.is_empty() || files.len() > DETAILED_MESSAGE_LIMIT {
        return summary;
    }

    let mut message = summary;
    message.push('\n');
    for file in files {
        let line = match codec::decode(file) {
            Ok(name) => format!("\n- {} {}", name.item, name.tag().as_str()),
            Err(_) => format!("\n- {file}"),
        };
        message.push_str(&line);
    }
    message
}
