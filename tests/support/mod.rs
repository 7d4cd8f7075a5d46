#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use git2::{IndexAddOption, Oid, Repository, Signature};
use tally::config::{Config, SyncConfig};
use tally::storage::Storage;
use tally::sync::SyncEngine;
use tally::Tracker;
use tempfile::TempDir;

pub const TEST_NAME: &str = "tally-test";
pub const TEST_EMAIL: &str = "tally-test@example.com";

/// Same body `Storage::init` writes, so seeded remotes merge cleanly.
const DATA_GITIGNORE: &str = "cache/\nlocal/\n";

pub struct TestRepo {
    dir: TempDir,
    repo: Repository,
}

impl TestRepo {
    /// Fresh repository with an identity and an initialized data directory.
    pub fn init() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let repo = Repository::init(dir.path())?;
        set_identity(&repo)?;
        Storage::for_repo(dir.path().to_path_buf()).init()?;
        Ok(Self { dir, repo })
    }

    /// Plain git repository without tally state.
    pub fn bare_git() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let repo = Repository::init(dir.path())?;
        set_identity(&repo)?;
        Ok(Self { dir, repo })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn storage(&self) -> Storage {
        Storage::for_repo(self.path().to_path_buf())
    }

    pub fn tracker(&self, actor: &str) -> Tracker {
        Tracker::new(self.storage(), Config::default(), actor)
    }

    pub fn commit_all(&self, message: &str) -> Result<Oid, git2::Error> {
        commit_all(&self.repo, message)
    }

    pub fn commit_count(&self) -> usize {
        commit_count(&self.repo)
    }
}

/// Bare remote seeded with one commit on `main`, plus clones of it.
pub struct Remote {
    dir: TempDir,
    clones: Vec<TempDir>,
}

impl Remote {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        git(dir.path(), &["init", "--bare", "--initial-branch=main", "."])?;

        let seed = tempfile::tempdir()?;
        let repo = Repository::init(seed.path())?;
        set_identity(&repo)?;
        fs::write(seed.path().join("README.md"), "shared work items\n")?;
        fs::create_dir_all(seed.path().join(".tally"))?;
        fs::write(seed.path().join(".tally").join(".gitignore"), DATA_GITIGNORE)?;
        commit_all(&repo, "seed")?;
        let url = dir.path().to_string_lossy().to_string();
        git(seed.path(), &["remote", "add", "origin", &url])?;
        git(seed.path(), &["push", "origin", "HEAD:refs/heads/main"])?;

        Ok(Self {
            dir,
            clones: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Clone the remote and prepare it for tally; returns the clone's root.
    pub fn clone_repo(&mut self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let url = self.dir.path().to_string_lossy().to_string();
        git(dir.path(), &["clone", "--branch", "main", &url, "."])?;
        set_identity(&Repository::open(dir.path())?)?;
        Storage::for_repo(dir.path().to_path_buf()).init()?;

        let root = dir.path().to_path_buf();
        self.clones.push(dir);
        Ok(root)
    }

    /// Number of commits on the remote's `main`.
    pub fn commit_count(&self) -> usize {
        Repository::open_bare(self.dir.path())
            .map(|repo| commit_count(&repo))
            .unwrap_or(0)
    }
}

/// Sync settings suitable for tests: short windows, quick retries.
pub fn fast_sync(debounce_ms: u64) -> SyncConfig {
    SyncConfig {
        debounce_ms,
        max_push_retries: 3,
        backoff_base_ms: 10,
        backoff_max_ms: 50,
        ..SyncConfig::default()
    }
}

/// Tracker for `root` with a sync engine attached.
pub fn synced_tracker(
    root: &Path,
    actor: &str,
    sync: SyncConfig,
) -> Result<Tracker, Box<dyn std::error::Error>> {
    let storage = Storage::for_repo(root.to_path_buf());
    let mut tracker = Tracker::new(storage.clone(), Config::default(), actor);
    let engine = SyncEngine::new(storage, sync)?.with_push_gate(None);
    tracker.attach_sync(engine);
    Ok(tracker)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn git(dir: &Path, args: &[&str]) -> Result<String, Box<dyn std::error::Error>> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .env("GIT_AUTHOR_NAME", TEST_NAME)
        .env("GIT_AUTHOR_EMAIL", TEST_EMAIL)
        .env("GIT_COMMITTER_NAME", TEST_NAME)
        .env("GIT_COMMITTER_EMAIL", TEST_EMAIL)
        .output()?;
    if !output.status.success() {
        return Err(format!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        )
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub fn head_message(root: &Path) -> String {
    Repository::open(root)
        .ok()
        .and_then(|repo| {
            let commit = repo.head().ok()?.peel_to_commit().ok()?;
            commit.message().map(str::to_string)
        })
        .unwrap_or_default()
}

fn commit_all(repo: &Repository, message: &str) -> Result<Oid, git2::Error> {
    let mut index = repo.index()?;
    index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
    index.write()?;

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = Signature::now(TEST_NAME, TEST_EMAIL)?;

    let parent = repo
        .head()
        .ok()
        .and_then(|head| head.target())
        .and_then(|oid| repo.find_commit(oid).ok());

    match parent {
        Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent]),
        None => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[]),
    }
}

fn commit_count(repo: &Repository) -> usize {
    let Ok(mut walk) = repo.revwalk() else {
        return 0;
    };
    if walk.push_head().is_err() && walk.push_ref("refs/heads/main").is_err() {
        return 0;
    }
    walk.count()
}

fn set_identity(repo: &Repository) -> Result<(), git2::Error> {
    let mut cfg = repo.config()?;
    cfg.set_str("user.name", TEST_NAME)?;
    cfg.set_str("user.email", TEST_EMAIL)?;
    Ok(())
}
