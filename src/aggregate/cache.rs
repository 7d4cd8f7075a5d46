//! Aggregate cache
//!
//! Owns the materialized aggregate files and the event filename index.
//! Reads never fail on a damaged aggregate file: it is treated as absent
//! and rebuilt from the event log. Each read-modify-write of one item's
//! file holds that item's lock, so concurrent writers in this or another
//! process cannot interleave a rebuild with an incremental update.

use std::collections::BTreeSet;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use super::index::{EventIndex, IndexFilter};
use super::reconstruct::{fold, reconstruct, RecordedEvent};
use super::validate::{self, FieldDifference, ValidationReport, STORED_FILE};
use super::Aggregate;
use crate::error::{Error, Result};
use crate::event::{codec, EventKind, ItemId, KindTag, LinkAction, PayloadState};
use crate::graph::Adjacency;
use crate::listeners::ListenerSet;
use crate::lock::{FileLock, DEFAULT_LOCK_TIMEOUT_MS};
use crate::storage::Storage;

/// Counters for the two update paths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub incremental_applies: u64,
    pub incremental_micros: u64,
    pub rebuilds: u64,
    pub rebuild_micros: u64,
    /// Incremental requests that had to rebuild instead
    pub fallbacks: u64,
    pub invalidations: u64,
}

enum Stored {
    Missing,
    Corrupt(String),
    Present(Aggregate),
}

#[derive(Debug)]
pub struct AggregateCache {
    storage: Storage,
    index: EventIndex,
    stats: Mutex<CacheStats>,
    changed: ListenerSet<ItemId>,
}

impl AggregateCache {
    pub fn new(storage: Storage) -> Self {
        Self {
            index: EventIndex::new(storage.clone()),
            storage,
            stats: Mutex::new(CacheStats::default()),
            changed: ListenerSet::new("aggregate-changed"),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Called with the item id after its aggregate was written, rebuilt,
    /// deleted, or invalidated.
    pub fn on_aggregate_changed<F>(&self, listener: F)
    where
        F: Fn(&ItemId) + Send + Sync + 'static,
    {
        self.changed.register(listener);
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Materialized aggregate, if one exists and parses. No side effects.
    pub fn get(&self, item: &ItemId) -> Option<Aggregate> {
        match self.read_stored(item) {
            Stored::Present(aggregate) => Some(aggregate),
            Stored::Missing | Stored::Corrupt(_) => None,
        }
    }

    /// Materialized aggregate, rebuilding it from events when absent or damaged.
    pub fn load(&self, item: &ItemId) -> Result<Option<Aggregate>> {
        if let Some(aggregate) = self.get(item) {
            return Ok(Some(aggregate));
        }
        self.rebuild(item)
    }

    /// Every item that has a creation event, in id order
    pub fn get_all(&self) -> Result<Vec<Aggregate>> {
        let mut aggregates = Vec::new();
        for item in self.created_items()? {
            if let Some(aggregate) = self.load(&item)? {
                aggregates.push(aggregate);
            }
        }
        Ok(aggregates)
    }

    pub fn created_items(&self) -> Result<BTreeSet<ItemId>> {
        Ok(self
            .index
            .filenames(Some(&IndexFilter::Kind(KindTag::Creation)))?
            .iter()
            .filter_map(|filename| codec::decode(filename).ok())
            .map(|name| name.item)
            .collect())
    }

    pub fn exists(&self, item: &ItemId) -> bool {
        self.get(item).is_some() || self.storage.event_file(&format!("{item}.json")).exists()
    }

    /// "Depends on" edges replayed from dependency filenames alone
    ///
    /// Only the index is read, never an event body or an aggregate.
    pub fn dependency_adjacency(&self) -> Result<Adjacency> {
        let mut adjacency = Adjacency::new();
        for filename in self
            .index
            .filenames(Some(&IndexFilter::Kind(KindTag::Dependency)))?
        {
            let Ok(name) = codec::decode(&filename) else {
                continue;
            };
            if let EventKind::Dependency { action, target } = name.kind {
                let edges = adjacency.entry(name.item).or_default();
                match action {
                    LinkAction::Linked => edges.insert(target),
                    LinkAction::Unlinked => edges.remove(&target),
                };
            }
        }
        adjacency.retain(|_, edges| !edges.is_empty());
        Ok(adjacency)
    }

    // =========================================================================
    // Event filename index
    // =========================================================================

    pub fn get_event_filename_index(&self, filter: Option<&IndexFilter>) -> Result<Vec<String>> {
        self.index.filenames(filter)
    }

    pub fn add_to_index(&self, filename: &str) -> Result<()> {
        self.index.insert(filename)
    }

    pub fn invalidate_index(&self) -> Result<()> {
        self.index.invalidate()
    }

    // =========================================================================
    // Updates
    // =========================================================================

    /// Replay every event referencing `item` and replace its aggregate
    ///
    /// Zero events deletes the materialized file and returns `None`.
    pub fn rebuild(&self, item: &ItemId) -> Result<Option<Aggregate>> {
        let rebuilt = {
            let _lock = self.lock_item(item)?;
            self.rebuild_locked(item)?
        };
        self.changed.emit(item);
        Ok(rebuilt)
    }

    /// Fold one new event into the stored aggregate
    ///
    /// Falls back to [`rebuild`](Self::rebuild) when the payload is unknown,
    /// the stored aggregate is missing or damaged, or the event sorts at or
    /// before the last event already folded in.
    pub fn apply_incremental(
        &self,
        item: &ItemId,
        filename: &str,
        payload: PayloadState,
    ) -> Result<Option<Aggregate>> {
        let updated = {
            let _lock = self.lock_item(item)?;
            self.apply_locked(item, filename, payload)?
        };
        self.changed.emit(item);
        Ok(updated)
    }

    fn apply_locked(
        &self,
        item: &ItemId,
        filename: &str,
        payload: PayloadState,
    ) -> Result<Option<Aggregate>> {
        let PayloadState::Known(payload) = payload else {
            return self.fall_back(item, "payload not read");
        };
        let stored = match self.read_stored(item) {
            Stored::Present(aggregate) => aggregate,
            Stored::Missing => return self.fall_back(item, "no materialized aggregate"),
            Stored::Corrupt(reason) => {
                warn!(%item, %reason, "aggregate file unreadable; rebuilding");
                return self.fall_back(item, "corrupt aggregate");
            }
        };

        let event = RecordedEvent::decode(filename, payload)?;
        if !event.name.references(item) {
            return Err(Error::InvalidArgument(format!(
                "event {filename} does not reference item {item}"
            )));
        }
        if event.sort_key() <= stored.meta.last_event_timestamp {
            return self.fall_back(item, "event sorts before aggregate head");
        }

        let start = Instant::now();
        let Some(mut aggregate) = fold(Some(stored), item, &event) else {
            return self.fall_back(item, "fold produced no state");
        };
        aggregate.meta.built_at = Utc::now();
        self.storage
            .write_json(&self.storage.aggregate_file(item), &aggregate)?;

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.incremental_applies += 1;
        stats.incremental_micros += elapsed_micros(start);
        debug!(%item, %filename, "applied event incrementally");
        Ok(Some(aggregate))
    }

    fn fall_back(&self, item: &ItemId, reason: &str) -> Result<Option<Aggregate>> {
        debug!(%item, reason, "incremental update falling back to rebuild");
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fallbacks += 1;
        self.rebuild_locked(item)
    }

    fn rebuild_locked(&self, item: &ItemId) -> Result<Option<Aggregate>> {
        let start = Instant::now();
        let events = self.load_events(item)?;
        let rebuilt = reconstruct(item, &events, Utc::now());

        let path = self.storage.aggregate_file(item);
        match &rebuilt {
            Some(aggregate) => self.storage.write_json(&path, aggregate)?,
            None => {
                if self.storage.remove_file(&path)? {
                    debug!(%item, "no events reference item; removed aggregate");
                }
            }
        }

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.rebuilds += 1;
        stats.rebuild_micros += elapsed_micros(start);
        debug!(%item, events = events.len(), "rebuilt aggregate");
        Ok(rebuilt)
    }

    /// Delete materialized files without rebuilding them
    pub fn invalidate(&self, items: &BTreeSet<ItemId>) -> Result<()> {
        for item in items {
            {
                let _lock = self.lock_item(item)?;
                self.storage
                    .remove_file(&self.storage.aggregate_file(item))?;
            }
            self.stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .invalidations += 1;
            self.changed.emit(item);
        }
        if !items.is_empty() {
            debug!(count = items.len(), "invalidated aggregates");
        }
        Ok(())
    }

    /// Invalidate everything touched by files that arrived from a remote
    ///
    /// Paths may be repository-relative; only the file name is decoded.
    /// Returns the affected items.
    pub fn invalidate_pulled<S: AsRef<str>>(&self, filenames: &[S]) -> Result<BTreeSet<ItemId>> {
        let mut affected = BTreeSet::new();
        for path in filenames {
            let path = path.as_ref();
            let Some(filename) = Path::new(path).file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match codec::decode(filename) {
                Ok(name) => affected.extend(name.affected_items()),
                Err(err) => debug!(%path, error = %err, "ignoring pulled file"),
            }
        }
        if affected.is_empty() {
            return Ok(affected);
        }

        self.index.invalidate()?;
        self.invalidate(&affected)?;
        Ok(affected)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Replay `item` and diff the result against the stored aggregate
    pub fn validate(&self, item: &ItemId) -> Result<ValidationReport> {
        let _lock = self.lock_item(item)?;
        let expected = reconstruct(item, &self.load_events(item)?, Utc::now());

        let report = match self.read_stored(item) {
            // Not materialized yet is lazy, not drift.
            Stored::Missing => ValidationReport::new(item.clone(), false, Vec::new()),
            Stored::Corrupt(reason) => ValidationReport::new(
                item.clone(),
                true,
                vec![FieldDifference {
                    field: STORED_FILE.to_string(),
                    stored: serde_json::Value::String(reason),
                    expected: serde_json::to_value(&expected)?,
                }],
            ),
            Stored::Present(stored) => ValidationReport::new(
                item.clone(),
                true,
                validate::diff(Some(&stored), expected.as_ref())?,
            ),
        };
        if !report.valid {
            warn!(%item, differences = report.differences.len(), "aggregate drift detected");
        }
        Ok(report)
    }

    /// Validate every item referenced by an event or a materialized file
    pub fn validate_all(&self) -> Result<Vec<ValidationReport>> {
        let mut items: BTreeSet<ItemId> = BTreeSet::new();
        for filename in self.index.filenames(None)? {
            if let Ok(name) = codec::decode(&filename) {
                items.extend(name.affected_items());
            }
        }
        items.extend(self.storage.list_aggregate_ids()?);

        items.iter().map(|item| self.validate(item)).collect()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn lock_item(&self, item: &ItemId) -> Result<FileLock> {
        FileLock::acquire(self.storage.aggregate_lock(item), DEFAULT_LOCK_TIMEOUT_MS)
    }

    fn read_stored(&self, item: &ItemId) -> Stored {
        let path = self.storage.aggregate_file(item);
        match self.storage.read_json::<Aggregate>(&path) {
            Ok(aggregate) if &aggregate.id == item => Stored::Present(aggregate),
            Ok(aggregate) => Stored::Corrupt(format!("file holds item {}", aggregate.id)),
            Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => Stored::Missing,
            Err(err) => Stored::Corrupt(err.to_string()),
        }
    }

    fn load_events(&self, item: &ItemId) -> Result<Vec<RecordedEvent>> {
        let filenames = self
            .index
            .filenames(Some(&IndexFilter::Item(item.clone())))?;

        let mut events = Vec::with_capacity(filenames.len());
        let mut stale_index = false;
        for filename in filenames {
            match self.storage.read_event(&filename) {
                Ok(payload) => events.push(RecordedEvent::decode(filename, payload)?),
                Err(Error::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
                    stale_index = true;
                }
                Err(Error::Json(err)) => {
                    warn!(%filename, error = %err, "skipping unreadable event file");
                }
                Err(err) => return Err(err),
            }
        }

        if stale_index {
            warn!(%item, "event index listed missing files; rescanning");
            let known: BTreeSet<String> = events.iter().map(|e| e.filename.clone()).collect();
            for filename in self.index.rebuild()? {
                if known.contains(&filename) {
                    continue;
                }
                let Ok(name) = codec::decode(&filename) else {
                    continue;
                };
                if name.references(item) {
                    let payload = self.storage.read_event(&filename)?;
                    events.push(RecordedEvent::from_name(name, payload));
                }
            }
        }
        Ok(events)
    }
}

fn elapsed_micros(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{encode_at, EventPayload};
    use chrono::{DateTime, Duration, TimeZone};
    use std::fs;
    use tempfile::TempDir;

    fn id(raw: &str) -> ItemId {
        ItemId::parse(raw).expect("item id")
    }

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap() + Duration::milliseconds(ms)
    }

    struct Fixture {
        _temp: TempDir,
        cache: AggregateCache,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let storage = Storage::for_repo(temp.path().to_path_buf());
            storage.init().unwrap();
            Self {
                _temp: temp,
                cache: AggregateCache::new(storage),
            }
        }

        /// Write an event file and record it in the index, like the write path does.
        fn append(&self, item: &str, kind: EventKind, ms: i64, payload: EventPayload) -> (String, EventPayload) {
            let encoded = encode_at(&id(item), kind, t(ms));
            assert!(self.cache.storage().write_event(&encoded.filename, &payload).unwrap());
            self.cache.add_to_index(&encoded.filename).unwrap();
            (encoded.filename, payload)
        }

        fn create(&self, item: &str, tagline: &str) -> String {
            let payload = EventPayload::new(t(0), Some("alice".into()))
                .with_tagline(tagline)
                .with_status("open");
            self.append(item, EventKind::Creation, 0, payload).0
        }
    }

    #[test]
    fn incremental_matches_rebuild() {
        let fx = Fixture::new();
        let item = id("12345678");
        fx.create("12345678", "first");
        fx.cache.rebuild(&item).unwrap();

        for (ms, status) in [(10, "blocked"), (20, "in_progress"), (30, "done")] {
            let (filename, payload) = fx.append(
                "12345678",
                EventKind::Status,
                ms,
                EventPayload::new(t(ms), None).with_status(status),
            );
            fx.cache
                .apply_incremental(&item, &filename, PayloadState::Known(payload))
                .unwrap();
        }

        let incremental = fx.cache.get(&item).expect("materialized");
        let rebuilt = fx.cache.rebuild(&item).unwrap().expect("rebuilt");
        assert!(incremental.same_state(&rebuilt));
        assert_eq!(rebuilt.status, "done");

        let stats = fx.cache.stats();
        assert_eq!(stats.incremental_applies, 3);
        assert_eq!(stats.rebuilds, 2);
        assert_eq!(stats.fallbacks, 0);
    }

    #[test]
    fn unknown_payload_and_missing_aggregate_fall_back() {
        let fx = Fixture::new();
        let item = id("12345678");
        let creation = fx.create("12345678", "first");

        let built = fx
            .cache
            .apply_incremental(&item, &creation, PayloadState::Unknown)
            .unwrap()
            .expect("aggregate");
        assert_eq!(built.tagline, "first");

        fx.cache.invalidate(&BTreeSet::from([item.clone()])).unwrap();
        let (filename, payload) = fx.append(
            "12345678",
            EventKind::Tagline,
            5,
            EventPayload::new(t(5), None).with_tagline("second"),
        );
        let rebuilt = fx
            .cache
            .apply_incremental(&item, &filename, PayloadState::Known(payload))
            .unwrap()
            .expect("aggregate");
        assert_eq!(rebuilt.tagline, "second");
        assert_eq!(fx.cache.stats().fallbacks, 2);
    }

    #[test]
    fn late_event_triggers_rebuild() {
        let fx = Fixture::new();
        let item = id("12345678");
        fx.create("12345678", "first");
        let (late_file, late_payload) = fx.append(
            "12345678",
            EventKind::Entry,
            50,
            EventPayload::new(t(50), None).with_text("second note"),
        );
        fx.cache
            .apply_incremental(&item, &late_file, PayloadState::Known(late_payload))
            .unwrap();

        // An earlier event shows up after a later one was already applied.
        let (early_file, early_payload) = fx.append(
            "12345678",
            EventKind::Entry,
            10,
            EventPayload::new(t(10), None).with_text("first note"),
        );
        let aggregate = fx
            .cache
            .apply_incremental(&item, &early_file, PayloadState::Known(early_payload))
            .unwrap()
            .expect("aggregate");

        let texts: Vec<&str> = aggregate.entries.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["first note", "second note"]);
    }

    #[test]
    fn corrupt_aggregate_is_treated_as_absent() {
        let fx = Fixture::new();
        let item = id("12345678");
        fx.create("12345678", "first");
        fs::write(fx.cache.storage().aggregate_file(&item), "{ broken").unwrap();

        assert!(fx.cache.get(&item).is_none());
        let loaded = fx.cache.load(&item).unwrap().expect("rebuilt");
        assert_eq!(loaded.tagline, "first");
        assert!(fx.cache.get(&item).is_some());
    }

    #[test]
    fn invalidate_then_rebuild_is_identical() {
        let fx = Fixture::new();
        let item = id("12345678");
        fx.create("12345678", "first");
        let before = fx.cache.rebuild(&item).unwrap().expect("aggregate");

        fx.cache.invalidate(&BTreeSet::from([item.clone()])).unwrap();
        assert!(fx.cache.get(&item).is_none());

        let after = fx.cache.load(&item).unwrap().expect("aggregate");
        assert!(before.same_state(&after));
        assert_eq!(fx.cache.stats().invalidations, 1);
    }

    #[test]
    fn rebuild_without_events_deletes_file() {
        let fx = Fixture::new();
        let item = id("12345678");
        let creation = fx.create("12345678", "first");
        fx.cache.rebuild(&item).unwrap();

        fs::remove_file(fx.cache.storage().event_file(&creation)).unwrap();
        fx.cache.invalidate_index().unwrap();

        assert!(fx.cache.rebuild(&item).unwrap().is_none());
        assert!(!fx.cache.storage().aggregate_file(&item).exists());
    }

    #[test]
    fn reverse_dependency_updates_target() {
        let fx = Fixture::new();
        fx.create("11111111", "needs");
        fx.create("22222222", "provides");
        let (filename, _) = fx.append(
            "11111111",
            EventKind::Dependency {
                action: LinkAction::Linked,
                target: id("22222222"),
            },
            10,
            EventPayload::new(t(10), None),
        );

        let affected = fx.cache.invalidate_pulled(&[format!(".tally/events/{filename}")]).unwrap();
        assert_eq!(affected, BTreeSet::from([id("11111111"), id("22222222")]));

        let target = fx.cache.load(&id("22222222")).unwrap().expect("aggregate");
        assert!(target.provides_to.contains(&id("11111111")));

        let adjacency = fx.cache.dependency_adjacency().unwrap();
        assert_eq!(adjacency.get(&id("11111111")), Some(&BTreeSet::from([id("22222222")])));
    }

    #[test]
    fn validate_reports_drift_and_orphans() {
        let fx = Fixture::new();
        let item = id("12345678");
        fx.create("12345678", "first");
        let mut stored = fx.cache.rebuild(&item).unwrap().expect("aggregate");
        assert!(fx.cache.validate(&item).unwrap().valid);

        stored.tagline = "tampered".into();
        fx.cache
            .storage()
            .write_json(&fx.cache.storage().aggregate_file(&item), &stored)
            .unwrap();
        let report = fx.cache.validate(&item).unwrap();
        assert!(!report.valid);
        assert_eq!(report.differences[0].field, "tagline");
        // Reporting only: the stored file keeps the drift.
        assert_eq!(fx.cache.get(&item).unwrap().tagline, "tampered");

        let orphan = id("99999999");
        stored.id = orphan.clone();
        fx.cache
            .storage()
            .write_json(&fx.cache.storage().aggregate_file(&orphan), &stored)
            .unwrap();
        let reports = fx.cache.validate_all().unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().any(|r| r.item == orphan && r.is_orphan()));
    }

    #[test]
    fn listeners_hear_about_changes() {
        use std::sync::{Arc, Mutex};

        let fx = Fixture::new();
        let heard = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&heard);
        fx.cache
            .on_aggregate_changed(move |item| sink.lock().unwrap().push(item.clone()));

        fx.create("12345678", "first");
        fx.cache.rebuild(&id("12345678")).unwrap();
        fx.cache
            .invalidate(&BTreeSet::from([id("12345678")]))
            .unwrap();

        assert_eq!(heard.lock().unwrap().len(), 2);
    }
}
