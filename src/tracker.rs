//! Write path for items.
//!
//! Every mutation runs the same pipeline: validate against the currently
//! known state, encode the event name, write the event file (create-new),
//! insert it into the filename index, fold it into each affected aggregate,
//! and tell the sync engine a new file exists. Validation finishes before
//! anything touches disk, so a rejected request leaves no trace.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::actor::resolve_actor;
use crate::aggregate::{Aggregate, AggregateCache, ValidationReport};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::{
    codec, ActorHash, EventKind, EventName, EventPayload, IgnoreAction, ItemId, LinkAction,
    MonitorAction, PayloadState, TakeAction,
};
use crate::graph::{self, Adjacency, Cycle};
use crate::storage::Storage;
use crate::sync::SyncEngine;
use crate::tree::TreeWalk;

/// Attempts at finding an unused item id before giving up
const MAX_ID_ATTEMPTS: usize = 100;

/// Result of checking every aggregate and the dependency graph.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub reports: Vec<ValidationReport>,
    pub cycles: Vec<Cycle>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.cycles.is_empty() && self.reports.iter().all(|report| report.valid)
    }

    pub fn problems(&self) -> impl Iterator<Item = &ValidationReport> {
        self.reports.iter().filter(|report| !report.valid)
    }
}

pub struct Tracker {
    storage: Storage,
    config: Config,
    actor: String,
    cache: Arc<AggregateCache>,
    sync: Option<SyncEngine>,
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("data_dir", &self.storage.data_dir())
            .field("actor", &self.actor)
            .field("sync", &self.sync.is_some())
            .finish()
    }
}

impl Tracker {
    pub fn new(storage: Storage, config: Config, actor: impl Into<String>) -> Self {
        Self {
            cache: Arc::new(AggregateCache::new(storage.clone())),
            storage,
            config,
            actor: actor.into(),
            sync: None,
        }
    }

    /// Open the tracker of an initialized repository.
    pub fn open(repo_root: PathBuf, cli_actor: Option<&str>) -> Result<Self> {
        let config = Config::load_from_repo(&repo_root)?;
        let storage = Storage::new(repo_root, &config.data_dir);
        if !storage.is_initialized() {
            return Err(Error::NotInitialized(storage.repo_root().to_path_buf()));
        }
        let actor = resolve_actor(Some(&storage), &config, cli_actor);
        Ok(Self::new(storage, config, actor))
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn cache(&self) -> &Arc<AggregateCache> {
        &self.cache
    }

    pub fn sync(&self) -> Option<&SyncEngine> {
        self.sync.as_ref()
    }

    /// Route new files to `engine` and invalidate what its pulls bring in.
    pub fn attach_sync(&mut self, engine: SyncEngine) {
        let cache = Arc::clone(&self.cache);
        engine.on_files_pulled(move |files| {
            match cache.invalidate_pulled(files) {
                Ok(items) => debug!(items = items.len(), "invalidated pulled items"),
                Err(err) => warn!(error = %err, "failed to invalidate pulled items"),
            }
            match cache.dependency_adjacency() {
                Ok(adjacency) => {
                    for cycle in graph::find_cycles(&adjacency) {
                        warn!(%cycle, "dependency cycle after merge");
                    }
                }
                Err(err) => warn!(error = %err, "cannot scan dependencies after merge"),
            }
        });
        self.sync = Some(engine);
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    pub fn create_item(&self, tagline: &str, status: Option<&str>) -> Result<Aggregate> {
        let tagline = required("tagline", tagline)?;
        let status = status.unwrap_or(&self.config.statuses.default);
        if !self.config.statuses.is_known(status) {
            return Err(Error::InvalidArgument(format!(
                "unknown status '{status}' (expected one of: {})",
                self.config.statuses.values.join(", ")
            )));
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let item = ItemId::random();
            let encoded = codec::encode(&item, EventKind::Creation);
            let payload = self
                .payload(encoded.at)
                .with_tagline(tagline)
                .with_status(status);
            if !self.storage.write_event(&encoded.filename, &payload)? {
                debug!(%item, "item id already used; retrying");
                continue;
            }
            info!(%item, "created item");
            let created = self.publish(&encoded.name, &encoded.filename, payload)?;
            return created.ok_or_else(|| {
                Error::OperationFailed(format!("item {item} vanished after creation"))
            });
        }
        Err(Error::OperationFailed(
            "could not find an unused item id".to_string(),
        ))
    }

    pub fn set_tagline(&self, item: &ItemId, tagline: &str) -> Result<Aggregate> {
        let tagline = required("tagline", tagline)?;
        self.require(item)?;
        self.record(item, EventKind::Tagline, |payload| payload.with_tagline(tagline))
    }

    pub fn set_status(&self, item: &ItemId, status: &str) -> Result<Aggregate> {
        let status = required("status", status)?;
        let current = self.require(item)?;
        self.config.statuses.check_transition(&current.status, status)?;
        self.record(item, EventKind::Status, |payload| payload.with_status(status))
    }

    pub fn add_entry(&self, item: &ItemId, text: &str) -> Result<Aggregate> {
        let text = required("entry text", text)?;
        self.require(item)?;
        self.record(item, EventKind::Entry, |payload| payload.with_text(text))
    }

    /// Record that `item` needs `target`.
    pub fn link_dependency(&self, item: &ItemId, target: &ItemId) -> Result<Aggregate> {
        let current = self.require(item)?;
        self.require(target)?;
        if current.depends_on.contains(target) {
            return Err(Error::InvalidArgument(format!(
                "{item} already depends on {target}"
            )));
        }

        let adjacency = self.cache.dependency_adjacency()?;
        if let Some(cycle) = graph::cycle_on_add(item, target, &adjacency) {
            debug!(%cycle, "rejected dependency");
            return Err(Error::DependencyCycle {
                from: item.to_string(),
                to: target.to_string(),
            });
        }

        self.record(
            item,
            EventKind::Dependency {
                action: LinkAction::Linked,
                target: target.clone(),
            },
            |payload| payload,
        )
    }

    pub fn unlink_dependency(&self, item: &ItemId, target: &ItemId) -> Result<Aggregate> {
        let current = self.require(item)?;
        if !current.depends_on.contains(target) {
            return Err(Error::InvalidArgument(format!(
                "{item} does not depend on {target}"
            )));
        }
        self.record(
            item,
            EventKind::Dependency {
                action: LinkAction::Unlinked,
                target: target.clone(),
            },
            |payload| payload,
        )
    }

    /// Watch `item`; already watching is a no-op.
    pub fn monitor(&self, item: &ItemId) -> Result<Aggregate> {
        let current = self.require(item)?;
        if self.is_monitoring(&current) {
            return Ok(current);
        }
        self.record_actor_event(item, |actor| EventKind::Monitor {
            action: MonitorAction::Added,
            actor,
        })
    }

    pub fn unmonitor(&self, item: &ItemId) -> Result<Aggregate> {
        let current = self.require(item)?;
        if !self.is_monitoring(&current) {
            return Err(Error::InvalidArgument(format!(
                "{} is not monitoring {item}",
                self.actor
            )));
        }
        self.record_actor_event(item, |actor| EventKind::Monitor {
            action: MonitorAction::Removed,
            actor,
        })
    }

    pub fn set_ignored(&self, item: &ItemId, ignored: bool) -> Result<Aggregate> {
        let current = self.require(item)?;
        if current.ignored == ignored {
            return Ok(current);
        }
        let action = if ignored {
            IgnoreAction::Ignored
        } else {
            IgnoreAction::Unignored
        };
        self.record(item, EventKind::Ignored { action }, |payload| payload)
    }

    /// Take responsibility for `item`.
    ///
    /// Taking over from another actor is only allowed when the caller names
    /// that actor as `expected_holder`.
    pub fn take(&self, item: &ItemId, expected_holder: Option<&str>) -> Result<Aggregate> {
        let current = self.require(item)?;
        match current.taken_by.as_deref() {
            Some(holder) if same_actor(holder, &self.actor) => return Ok(current),
            Some(holder) if Some(holder) != expected_holder => {
                return Err(Error::TakeConflict {
                    item: item.to_string(),
                    holder: holder.to_string(),
                });
            }
            _ => {}
        }
        self.record_actor_event(item, |actor| EventKind::Taken {
            action: TakeAction::Taken,
            actor,
        })
    }

    pub fn surrender(&self, item: &ItemId) -> Result<Aggregate> {
        let current = self.require(item)?;
        match current.taken_by.as_deref() {
            None => Err(Error::InvalidArgument(format!("{item} is not taken"))),
            Some(holder) if !same_actor(holder, &self.actor) => Err(Error::TakeConflict {
                item: item.to_string(),
                holder: holder.to_string(),
            }),
            Some(_) => self.record_actor_event(item, |actor| EventKind::Taken {
                action: TakeAction::Surrendered,
                actor,
            }),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn find(&self, item: &ItemId) -> Result<Option<Aggregate>> {
        self.cache.load(item)
    }

    pub fn get(&self, item: &ItemId) -> Result<Aggregate> {
        self.require(item)
    }

    pub fn get_all_aggregates(&self) -> Result<Vec<Aggregate>> {
        self.cache.get_all()
    }

    pub fn adjacency(&self) -> Result<Adjacency> {
        self.cache.dependency_adjacency()
    }

    /// Walk the dependency forest from `roots`, or from every top-level item
    /// when `roots` is empty.
    pub fn tree(&self, roots: &[ItemId]) -> TreeWalk<'_> {
        TreeWalk::new(&self.cache, roots.to_vec())
    }

    pub fn rebuild(&self, item: &ItemId) -> Result<Option<Aggregate>> {
        self.cache.rebuild(item)
    }

    pub fn integrity_report(&self) -> Result<IntegrityReport> {
        let reports = self.cache.validate_all()?;
        let cycles = graph::find_cycles(&self.cache.dependency_adjacency()?);
        for cycle in &cycles {
            warn!(%cycle, "dependency cycle in event log");
        }
        Ok(IntegrityReport { reports, cycles })
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn require(&self, item: &ItemId) -> Result<Aggregate> {
        self.cache
            .load(item)?
            .ok_or_else(|| Error::ItemNotFound(item.to_string()))
    }

    fn is_monitoring(&self, aggregate: &Aggregate) -> bool {
        aggregate
            .monitors
            .iter()
            .any(|monitor| same_actor(monitor, &self.actor))
    }

    fn payload(&self, at: chrono::DateTime<chrono::Utc>) -> EventPayload {
        EventPayload::new(at, Some(self.actor.clone()))
    }

    fn record_actor_event(
        &self,
        item: &ItemId,
        kind: impl FnOnce(ActorHash) -> EventKind,
    ) -> Result<Aggregate> {
        let actor = self.actor.clone();
        self.record(item, kind(ActorHash::of(&actor)), |payload| {
            payload.with_actor(actor)
        })
    }

    fn record(
        &self,
        item: &ItemId,
        kind: EventKind,
        fill: impl FnOnce(EventPayload) -> EventPayload,
    ) -> Result<Aggregate> {
        let encoded = codec::encode(item, kind);
        let payload = fill(self.payload(encoded.at));
        if !self.storage.write_event(&encoded.filename, &payload)? {
            return Err(Error::OperationFailed(format!(
                "event file {} already exists",
                encoded.filename
            )));
        }
        debug!(filename = %encoded.filename, "recorded event");

        self.publish(&encoded.name, &encoded.filename, payload)?
            .ok_or_else(|| Error::ItemNotFound(item.to_string()))
    }

    /// Index a freshly written event, fold it into every item it touches and
    /// schedule a commit. Returns the owning item's new state.
    fn publish(
        &self,
        name: &EventName,
        filename: &str,
        payload: EventPayload,
    ) -> Result<Option<Aggregate>> {
        self.cache.add_to_index(filename)?;

        let mut owner = None;
        for affected in name.affected_items() {
            let updated = self.cache.apply_incremental(
                &affected,
                filename,
                PayloadState::Known(payload.clone()),
            )?;
            if affected == name.item {
                owner = updated;
            }
        }

        if let Some(sync) = &self.sync {
            sync.notify_file_created(filename);
        }
        Ok(owner)
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidArgument(format!("{field} cannot be empty")));
    }
    Ok(trimmed)
}

fn same_actor(a: &str, b: &str) -> bool {
    ActorHash::of(a) == ActorHash::of(b)
}
