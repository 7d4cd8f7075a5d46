//! Sorted event filename index
//!
//! A derived cache over the events directory listing, kept sorted by event
//! timestamp (ties by filename). Appends insert in place; anything that
//! cannot be inserted with certainty drops the whole index so the next
//! reader rescans the directory.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{codec, EventName, ItemId, KindTag};
use crate::lock::{FileLock, DEFAULT_LOCK_TIMEOUT_MS};
use crate::storage::Storage;

const INDEX_VERSION: u32 = 1;

/// Restricts which filenames [`EventIndex::filenames`] returns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexFilter {
    /// Events that contribute to this item, including reverse dependencies
    Item(ItemId),
    Kind(KindTag),
}

impl IndexFilter {
    pub fn matches(&self, name: &EventName) -> bool {
        match self {
            IndexFilter::Item(item) => name.references(item),
            IndexFilter::Kind(tag) => name.tag() == *tag,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    generated_at: DateTime<Utc>,
    filenames: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EventIndex {
    storage: Storage,
}

impl EventIndex {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn is_cached(&self) -> bool {
        self.storage.index_file().exists()
    }

    /// Ordered filenames, rebuilding the index from a directory scan if absent
    pub fn filenames(&self, filter: Option<&IndexFilter>) -> Result<Vec<String>> {
        let all = match self.read_cached() {
            Some(document) => document.filenames,
            None => self.rebuild()?,
        };

        let Some(filter) = filter else {
            return Ok(all);
        };
        Ok(all
            .into_iter()
            .filter(|filename| {
                codec::decode(filename)
                    .map(|name| filter.matches(&name))
                    .unwrap_or(false)
            })
            .collect())
    }

    /// Rescan the events directory and rewrite the index
    pub fn rebuild(&self) -> Result<Vec<String>> {
        let _lock = FileLock::acquire(self.storage.index_lock(), DEFAULT_LOCK_TIMEOUT_MS)?;

        let mut decorated = Vec::new();
        for filename in self.storage.list_event_files()? {
            match codec::decode(&filename) {
                Ok(name) => decorated.push((name.sort_key(), filename)),
                Err(err) => warn!(%filename, error = %err, "skipping unrecognized file in events dir"),
            }
        }
        decorated.sort();
        let filenames: Vec<String> = decorated.into_iter().map(|(_, filename)| filename).collect();

        self.write(&filenames)?;
        debug!(count = filenames.len(), "rebuilt event index");
        Ok(filenames)
    }

    /// Ordered insertion of a newly written event
    ///
    /// A missing index is left missing. Any failure invalidates the index
    /// instead of surfacing an error.
    pub fn insert(&self, filename: &str) -> Result<()> {
        let _lock = FileLock::acquire(self.storage.index_lock(), DEFAULT_LOCK_TIMEOUT_MS)?;
        if !self.is_cached() {
            return Ok(());
        }

        if let Err(err) = self.insert_locked(filename) {
            warn!(%filename, error = %err, "event index insertion failed; invalidating");
            self.storage.remove_file(&self.storage.index_file())?;
        }
        Ok(())
    }

    fn insert_locked(&self, filename: &str) -> Result<()> {
        let target = codec::decode(filename)?;
        let target_key = target.sort_key();
        let mut document: IndexDocument = self.storage.read_json(&self.storage.index_file())?;
        if document.version != INDEX_VERSION {
            return Err(Error::OperationFailed(format!(
                "unsupported event index version {}",
                document.version
            )));
        }

        let mut undecodable = None;
        let position = document.filenames.binary_search_by(|probe| {
            match codec::decode(probe) {
                Ok(name) => name
                    .sort_key()
                    .cmp(&target_key)
                    .then_with(|| probe.as_str().cmp(filename)),
                Err(err) => {
                    undecodable = Some(err);
                    Ordering::Less
                }
            }
        });
        if let Some(err) = undecodable {
            return Err(err);
        }

        match position {
            Ok(_) => Ok(()),
            Err(at) => {
                document.filenames.insert(at, filename.to_string());
                self.write(&document.filenames)
            }
        }
    }

    /// Drop the index; the next reader rebuilds it
    pub fn invalidate(&self) -> Result<()> {
        let _lock = FileLock::acquire(self.storage.index_lock(), DEFAULT_LOCK_TIMEOUT_MS)?;
        if self.storage.remove_file(&self.storage.index_file())? {
            debug!("invalidated event index");
        }
        Ok(())
    }

    fn read_cached(&self) -> Option<IndexDocument> {
        let path = self.storage.index_file();
        if !path.exists() {
            return None;
        }
        match self.storage.read_json::<IndexDocument>(&path) {
            Ok(document) if document.version == INDEX_VERSION => Some(document),
            Ok(document) => {
                warn!(version = document.version, "ignoring event index with unknown version");
                None
            }
            Err(err) => {
                warn!(error = %err, "event index unreadable; rescanning");
                None
            }
        }
    }

    fn write(&self, filenames: &[String]) -> Result<()> {
        let document = IndexDocument {
            version: INDEX_VERSION,
            generated_at: Utc::now(),
            filenames: filenames.to_vec(),
        };
        let json = serde_json::to_vec(&document)?;
        self.storage.write_atomic(&self.storage.index_file(), &json)
    }
}
