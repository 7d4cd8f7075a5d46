//! Git access for the sync engine.
//!
//! Local queries (HEAD, diffs, staging, commits) go through libgit2. Network
//! operations and merges shell out to the `git` binary so they pick up the
//! user's remotes, credentials helpers and merge machinery.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use git2::{ErrorCode, IndexAddOption, Oid, Repository, Signature};
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Identity used when the repository has no `user.name`/`user.email`.
pub const FALLBACK_NAME: &str = "tally";
pub const FALLBACK_EMAIL: &str = "tally@localhost";

/// Discover a git repository from a starting path.
pub fn discover_repo(start: Option<&Path>) -> Result<Repository> {
    let start_path = match start {
        Some(path) => path.to_path_buf(),
        None => std::env::current_dir()?,
    };

    Repository::discover(&start_path).map_err(|err| {
        if err.code() == ErrorCode::NotFound {
            Error::RepoNotFound(start_path)
        } else {
            Error::Git(err)
        }
    })
}

/// Open a repository and validate it is a non-bare checkout.
pub fn open_repo(start: Option<&Path>) -> Result<Repository> {
    let repo = discover_repo(start)?;
    if repo.is_bare() {
        return Err(Error::NotARepo(repo.path().to_path_buf()));
    }
    Ok(repo)
}

/// Return the repository workdir (root of the working tree).
pub fn workdir(repo: &Repository) -> Result<PathBuf> {
    repo.workdir()
        .map(|path| path.to_path_buf())
        .ok_or_else(|| Error::NotARepo(repo.path().to_path_buf()))
}

/// Commit HEAD points at, or `None` on an unborn branch.
pub fn head_oid(repo: &Repository) -> Result<Option<Oid>> {
    match repo.head() {
        Ok(head) => Ok(head.target()),
        Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
            Ok(None)
        }
        Err(err) => Err(Error::Git(err)),
    }
}

pub fn has_remote(repo: &Repository, name: &str) -> bool {
    repo.find_remote(name).is_ok()
}

/// Whether HEAD has commits the remote-tracking branch lacks.
///
/// A missing tracking ref counts as behind whenever HEAD exists.
pub fn has_unpushed_commits(repo: &Repository, remote: &str, branch: &str) -> Result<bool> {
    let Some(head) = head_oid(repo)? else {
        return Ok(false);
    };
    let tracking = format!("refs/remotes/{remote}/{branch}");
    let upstream = match repo.refname_to_id(&tracking) {
        Ok(oid) => oid,
        Err(err) if err.code() == ErrorCode::NotFound => return Ok(true),
        Err(err) => return Err(Error::Git(err)),
    };
    let (ahead, _behind) = repo.graph_ahead_behind(head, upstream)?;
    Ok(ahead > 0)
}

// =============================================================================
// Diff and File Status Operations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
    TypeChanged,
}

/// A path changed between two trees (relative to the repo root).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub status: FileStatus,
}

impl FileChange {
    /// Whether the file now exists with new content
    pub fn is_arrival(&self) -> bool {
        matches!(
            self.status,
            FileStatus::Added | FileStatus::Modified | FileStatus::Renamed
        )
    }

    /// File name when the path lies directly inside `dir`
    pub fn file_name_in(&self, dir: &Path) -> Option<String> {
        let rest = self.path.strip_prefix(dir).ok()?;
        let mut components = rest.components();
        let name = components.next()?;
        if components.next().is_some() {
            return None;
        }
        Some(name.as_os_str().to_string_lossy().into_owned())
    }
}

/// Files changed between two commits; `from == None` diffs against the empty tree.
pub fn diff_commits(repo: &Repository, from: Option<Oid>, to: Oid) -> Result<Vec<FileChange>> {
    let from_tree = match from {
        Some(oid) => Some(repo.find_commit(oid)?.tree()?),
        None => None,
    };
    let to_tree = repo.find_commit(to)?.tree()?;
    let diff = repo.diff_tree_to_tree(from_tree.as_ref(), Some(&to_tree), None)?;
    Ok(parse_diff_to_changes(&diff))
}

/// Files staged relative to HEAD.
pub fn staged_files(repo: &Repository) -> Result<Vec<FileChange>> {
    let head_tree = match head_oid(repo)? {
        Some(oid) => Some(repo.find_commit(oid)?.tree()?),
        None => None,
    };
    let index = repo.index()?;
    let diff = repo.diff_tree_to_index(head_tree.as_ref(), Some(&index), None)?;
    Ok(parse_diff_to_changes(&diff))
}

fn parse_diff_to_changes(diff: &git2::Diff) -> Vec<FileChange> {
    diff.deltas()
        .filter_map(|delta| {
            let status = match delta.status() {
                git2::Delta::Added => FileStatus::Added,
                git2::Delta::Deleted => FileStatus::Deleted,
                git2::Delta::Modified => FileStatus::Modified,
                git2::Delta::Renamed | git2::Delta::Copied => FileStatus::Renamed,
                git2::Delta::Typechange => FileStatus::TypeChanged,
                _ => return None,
            };
            let file = if status == FileStatus::Deleted {
                delta.old_file()
            } else {
                delta.new_file()
            };
            Some(FileChange {
                path: file.path().map(PathBuf::from).unwrap_or_default(),
                status,
            })
        })
        .collect()
}

// =============================================================================
// Commit Operations
// =============================================================================

/// Stage everything under `dir` (repo-relative), honouring `.gitignore` files.
pub fn stage_dir(repo: &Repository, dir: &Path) -> Result<()> {
    let mut index = repo.index()?;
    let spec = dir.to_string_lossy().replace('\\', "/");
    index.add_all([spec.as_str()], IndexAddOption::DEFAULT, None)?;
    index.write()?;
    Ok(())
}

/// Signature from git config, or the tally fallback identity.
pub fn signature(repo: &Repository) -> Result<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Ok(Signature::now(FALLBACK_NAME, FALLBACK_EMAIL)?),
    }
}

/// Commit the current index on top of HEAD.
pub fn create_commit(repo: &Repository, message: &str) -> Result<Oid> {
    let mut index = repo.index()?;
    let tree_oid = index.write_tree()?;
    let tree = repo.find_tree(tree_oid)?;

    let parents = match head_oid(repo)? {
        Some(oid) => vec![repo.find_commit(oid)?],
        None => vec![],
    };
    let parent_refs: Vec<&git2::Commit> = parents.iter().collect();

    let sig = signature(repo)?;
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?;
    Ok(oid)
}

// =============================================================================
// Subprocess Operations
// =============================================================================

/// Captured result of one `git` invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    fn into_result(self, command: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::GitCommand {
                command: command.to_string(),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchResult {
    Fetched,
    /// Remote exists but has no such branch yet
    RemoteEmpty,
}

/// Push failed because the remote moved ahead of us.
pub fn is_push_rejection(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("non-fast-forward")
        || stderr.contains("fetch first")
        || stderr.contains("rejected")
}

fn is_missing_remote_ref(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("couldn't find remote ref")
}

/// Async wrapper over the `git` binary rooted at a working tree.
#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
    fallback_identity: bool,
}

impl GitCli {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            fallback_identity: false,
        }
    }

    /// Supply the tally identity to merges when git has none configured.
    pub fn with_fallback_identity(mut self, enabled: bool) -> Self {
        self.fallback_identity = enabled;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub async fn run(&self, args: &[&str]) -> Result<GitOutput> {
        debug!(args = ?args, "git");
        let mut command = Command::new("git");
        command
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null());
        if self.fallback_identity {
            command
                .env("GIT_AUTHOR_NAME", FALLBACK_NAME)
                .env("GIT_AUTHOR_EMAIL", FALLBACK_EMAIL)
                .env("GIT_COMMITTER_NAME", FALLBACK_NAME)
                .env("GIT_COMMITTER_EMAIL", FALLBACK_EMAIL);
        }
        let output = command.output().await?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    pub async fn fetch(&self, remote: &str, branch: &str) -> Result<FetchResult> {
        let output = self.run(&["fetch", remote, branch]).await?;
        if output.success {
            Ok(FetchResult::Fetched)
        } else if is_missing_remote_ref(&output.stderr) {
            Ok(FetchResult::RemoteEmpty)
        } else {
            output.into_result("fetch").map(|_| FetchResult::Fetched)
        }
    }

    /// `git pull` with the merge strategy. The raw output is returned so the
    /// caller can decide whether a failure matters.
    pub async fn pull(&self, remote: &str, branch: &str) -> Result<GitOutput> {
        self.run(&[
            "pull",
            "--no-rebase",
            "--no-edit",
            "--allow-unrelated-histories",
            remote,
            branch,
        ])
        .await
    }

    /// Merge whatever the last fetch brought in.
    pub async fn merge_fetch_head(&self) -> Result<()> {
        self.run(&[
            "merge",
            "--no-edit",
            "--no-ff",
            "--allow-unrelated-histories",
            "FETCH_HEAD",
        ])
        .await?
        .into_result("merge")
        .map(|_| ())
    }

    /// Abort an in-progress merge; a no-op when none is in progress.
    pub async fn merge_abort(&self) -> Result<()> {
        self.run(&["merge", "--abort"]).await.map(|_| ())
    }

    pub async fn push(&self, remote: &str, branch: &str) -> Result<GitOutput> {
        let refspec = format!("HEAD:refs/heads/{branch}");
        self.run(&["push", remote, &refspec]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn init_test_repo() -> (TempDir, Repository) {
        let temp = TempDir::new().expect("tempdir");
        let repo = Repository::init(temp.path()).expect("init");
        {
            let mut config = repo.config().expect("config");
            config.set_str("user.name", "Test").expect("name");
            config.set_str("user.email", "test@test.com").expect("email");
        }
        (temp, repo)
    }

    #[test]
    fn unborn_head_is_none() {
        let (_temp, repo) = init_test_repo();
        assert_eq!(head_oid(&repo).expect("head"), None);
    }

    #[test]
    fn stage_respects_gitignore_and_commit_lists_files() {
        let (temp, repo) = init_test_repo();
        let data = temp.path().join(".tally");
        fs::create_dir_all(data.join("events")).expect("events");
        fs::create_dir_all(data.join("cache")).expect("cache");
        fs::write(data.join(".gitignore"), "cache/\n").expect("gitignore");
        fs::write(data.join("events/12345678.json"), "{}").expect("event");
        fs::write(data.join("cache/event-index.json"), "{}").expect("cache file");

        stage_dir(&repo, Path::new(".tally")).expect("stage");
        let staged = staged_files(&repo).expect("staged");
        let paths: Vec<_> = staged.iter().map(|c| c.path.clone()).collect();
        assert!(paths.contains(&PathBuf::from(".tally/events/12345678.json")));
        assert!(paths.contains(&PathBuf::from(".tally/.gitignore")));
        assert!(!paths.iter().any(|p| p.starts_with(".tally/cache")));

        let first = create_commit(&repo, "first").expect("commit");
        assert!(staged_files(&repo).expect("staged").is_empty());

        fs::write(data.join("events/23456789.json"), "{}").expect("event");
        stage_dir(&repo, Path::new(".tally")).expect("stage");
        let second = create_commit(&repo, "second").expect("commit");

        let changes = diff_commits(&repo, Some(first), second).expect("diff");
        assert_eq!(changes.len(), 1);
        assert!(changes[0].is_arrival());
        assert_eq!(
            changes[0].file_name_in(Path::new(".tally/events")),
            Some("23456789.json".to_string())
        );
        assert_eq!(diff_commits(&repo, None, first).expect("diff").len(), 2);
    }

    #[test]
    fn file_name_in_rejects_nested_and_foreign_paths() {
        let change = FileChange {
            path: PathBuf::from(".tally/events/sub/x.json"),
            status: FileStatus::Added,
        };
        assert_eq!(change.file_name_in(Path::new(".tally/events")), None);
        assert_eq!(change.file_name_in(Path::new("elsewhere")), None);
    }

    #[test]
    fn rejection_detection() {
        assert!(is_push_rejection(
            " ! [rejected]        HEAD -> main (fetch first)"
        ));
        assert!(is_push_rejection("Updates were rejected because of a non-fast-forward"));
        assert!(!is_push_rejection("fatal: unable to access: Could not resolve host"));
        assert!(is_missing_remote_ref("fatal: couldn't find remote ref main"));
    }

    #[tokio::test]
    async fn fetch_from_empty_remote_reports_empty() {
        let remote_dir = TempDir::new().expect("tempdir");
        Repository::init_bare(remote_dir.path()).expect("bare");
        let (temp, repo) = init_test_repo();
        repo.remote("origin", &remote_dir.path().to_string_lossy())
            .expect("remote");

        let git = GitCli::new(temp.path());
        assert_eq!(
            git.fetch("origin", "main").await.expect("fetch"),
            FetchResult::RemoteEmpty
        );
    }
}
