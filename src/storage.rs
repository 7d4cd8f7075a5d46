//! Storage layer for tally
//!
//! Everything lives under one data directory inside the repository:
//!
//! ```text
//! .tally/
//!   events/                     # Tracked: append-only event log
//!     <itemId>.json             # Creation event
//!     <itemId>.<kind>...json    # Every later fact about the item
//!   cache/                      # Ignored: derived, safe to delete
//!     aggregates/<itemId>.json  # Materialized item state
//!     aggregates/<itemId>.lock  # Per-item lock
//!     event-index.json          # Sorted event filename index
//!     event-index.lock
//!   local/                      # Ignored: per-clone state
//!     actor                     # Persisted actor identity
//!   .gitignore
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};
use crate::event::{EventPayload, ItemId};
use crate::lock;

/// Default data directory, relative to the repository root
pub const DATA_DIR: &str = ".tally";

const EVENTS_DIR: &str = "events";
const CACHE_DIR: &str = "cache";
const LOCAL_DIR: &str = "local";
const GITIGNORE_BODY: &str = "cache/\nlocal/\n";

/// Storage manager for tally state
#[derive(Debug, Clone)]
pub struct Storage {
    repo_root: PathBuf,
    /// Data directory relative to `repo_root`
    data_rel: PathBuf,
}

impl Storage {
    pub fn new(repo_root: PathBuf, data_rel: impl Into<PathBuf>) -> Self {
        Self {
            repo_root,
            data_rel: data_rel.into(),
        }
    }

    /// Storage with the default `.tally/` data directory
    pub fn for_repo(repo_root: PathBuf) -> Self {
        Self::new(repo_root, DATA_DIR)
    }

    // =========================================================================
    // Path accessors
    // =========================================================================

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.repo_root.join(&self.data_rel)
    }

    /// Data directory relative to the repository root (for staging)
    pub fn data_dir_rel(&self) -> &Path {
        &self.data_rel
    }

    pub fn events_dir(&self) -> PathBuf {
        self.data_dir().join(EVENTS_DIR)
    }

    /// Events directory relative to the repository root (for diff filtering)
    pub fn events_dir_rel(&self) -> PathBuf {
        self.data_rel.join(EVENTS_DIR)
    }

    pub fn event_file(&self, filename: &str) -> PathBuf {
        self.events_dir().join(filename)
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir().join(CACHE_DIR)
    }

    pub fn aggregates_dir(&self) -> PathBuf {
        self.cache_dir().join("aggregates")
    }

    pub fn aggregate_file(&self, item: &ItemId) -> PathBuf {
        self.aggregates_dir().join(format!("{item}.json"))
    }

    pub fn aggregate_lock(&self, item: &ItemId) -> PathBuf {
        self.aggregates_dir().join(format!("{item}.lock"))
    }

    pub fn index_file(&self) -> PathBuf {
        self.cache_dir().join("event-index.json")
    }

    pub fn index_lock(&self) -> PathBuf {
        self.cache_dir().join("event-index.lock")
    }

    pub fn local_dir(&self) -> PathBuf {
        self.data_dir().join(LOCAL_DIR)
    }

    pub fn actor_file(&self) -> PathBuf {
        self.local_dir().join("actor")
    }

    pub fn gitignore_file(&self) -> PathBuf {
        self.data_dir().join(".gitignore")
    }

    // =========================================================================
    // Directory initialization
    // =========================================================================

    /// Create the directory tree and the data directory's `.gitignore`
    pub fn init(&self) -> Result<()> {
        fs::create_dir_all(self.events_dir())?;
        fs::create_dir_all(self.aggregates_dir())?;
        fs::create_dir_all(self.local_dir())?;

        let gitignore = self.gitignore_file();
        if !gitignore.exists() {
            self.write_atomic(&gitignore, GITIGNORE_BODY.as_bytes())?;
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.events_dir().is_dir()
    }

    // =========================================================================
    // File I/O helpers
    // =========================================================================

    /// Write JSON atomically (temp file + rename)
    pub fn write_json<T: Serialize>(&self, path: &Path, data: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        self.write_atomic(path, json.as_bytes())
    }

    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let content = fs::read_to_string(path)?;
        let data: T = serde_json::from_str(&content)?;
        Ok(data)
    }

    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        lock::write_atomic(path, data)
    }

    /// Remove a file, returning whether it existed
    pub fn remove_file(&self, path: &Path) -> Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    // =========================================================================
    // Event log
    // =========================================================================

    /// Write a new event file
    ///
    /// Returns `Ok(false)` without touching anything when a file with the
    /// same name already exists.
    pub fn write_event(&self, filename: &str, payload: &EventPayload) -> Result<bool> {
        let mut json = serde_json::to_string_pretty(payload)?;
        json.push('\n');
        match lock::write_new(self.event_file(filename), json.as_bytes()) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    pub fn read_event(&self, filename: &str) -> Result<EventPayload> {
        self.read_json(&self.event_file(filename))
    }

    /// Raw directory listing of `*.json` files in the events directory
    pub fn list_event_files(&self) -> Result<Vec<String>> {
        let dir = self.events_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }

    /// Items with a materialized aggregate file
    pub fn list_aggregate_ids(&self) -> Result<Vec<ItemId>> {
        let dir = self.aggregates_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(id) = ItemId::parse(stem) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    // =========================================================================
    // Actor persistence
    // =========================================================================

    pub fn read_actor(&self) -> Option<String> {
        fs::read_to_string(self.actor_file())
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn write_actor(&self, actor: &str) -> Result<()> {
        fs::create_dir_all(self.local_dir())?;
        let mut body = actor.trim().to_string();
        body.push('\n');
        self.write_atomic(&self.actor_file(), body.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn id(raw: &str) -> ItemId {
        ItemId::parse(raw).expect("item id")
    }

    #[test]
    fn test_storage_paths() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        let storage = Storage::for_repo(root.clone());

        assert_eq!(storage.data_dir(), root.join(".tally"));
        assert_eq!(storage.events_dir_rel(), PathBuf::from(".tally/events"));
        assert_eq!(
            storage.aggregate_file(&id("12345678")),
            root.join(".tally/cache/aggregates/12345678.json")
        );
        assert_eq!(storage.index_file(), root.join(".tally/cache/event-index.json"));
        assert_eq!(storage.actor_file(), root.join(".tally/local/actor"));
    }

    #[test]
    fn init_creates_tree_and_ignores_cache() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::for_repo(temp.path().to_path_buf());
        assert!(!storage.is_initialized());

        storage.init().unwrap();

        assert!(storage.is_initialized());
        assert!(storage.aggregates_dir().is_dir());
        assert!(storage.local_dir().is_dir());
        let ignore = fs::read_to_string(storage.gitignore_file()).unwrap();
        assert!(ignore.contains("cache/"));
        assert!(ignore.contains("local/"));
    }

    #[test]
    fn events_are_write_once() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::for_repo(temp.path().to_path_buf());
        storage.init().unwrap();

        let payload = EventPayload::new(Utc::now(), Some("alice".into())).with_tagline("first");
        assert!(storage.write_event("12345678.json", &payload).unwrap());

        let other = EventPayload::new(Utc::now(), Some("bob".into())).with_tagline("second");
        assert!(!storage.write_event("12345678.json", &other).unwrap());

        let read = storage.read_event("12345678.json").unwrap();
        assert_eq!(read.tagline.as_deref(), Some("first"));
        assert_eq!(storage.list_event_files().unwrap(), vec!["12345678.json"]);
    }

    #[test]
    fn actor_round_trips_trimmed() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::for_repo(temp.path().to_path_buf());

        assert_eq!(storage.read_actor(), None);
        storage.write_actor("  alice \n").unwrap();
        assert_eq!(storage.read_actor().as_deref(), Some("alice"));
    }
}
