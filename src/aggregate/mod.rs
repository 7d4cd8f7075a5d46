//! Materialized item state
//!
//! An [`Aggregate`] is a disposable projection of the event log. It can be
//! deleted at any time and re-derived by replaying every event whose
//! filename references the item; the `_meta` block is the only part that
//! is allowed to differ between two derivations.

pub mod cache;
pub mod index;
pub mod reconstruct;
pub mod validate;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ItemId;

pub use cache::{AggregateCache, CacheStats};
pub use index::{EventIndex, IndexFilter};
pub use reconstruct::{fold, reconstruct, RecordedEvent};
pub use validate::{FieldDifference, ValidationReport};

/// One note appended to an item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub author: Option<String>,
}

/// Bookkeeping that is excluded from consistency checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateMeta {
    /// Sort key of the last event folded in (empty when only the creation was applied)
    pub last_event_timestamp: String,
    pub built_at: DateTime<Utc>,
}

/// Current state of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregate {
    pub id: ItemId,
    pub tagline: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
    #[serde(default)]
    pub entries: Vec<Entry>,
    /// Items this one needs
    #[serde(default)]
    pub depends_on: BTreeSet<ItemId>,
    /// Items that need this one; derived from other items' events
    #[serde(default)]
    pub provides_to: BTreeSet<ItemId>,
    #[serde(default)]
    pub monitors: BTreeSet<String>,
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub taken_by: Option<String>,
    #[serde(rename = "_meta")]
    pub meta: AggregateMeta,
}

impl Aggregate {
    /// Compare everything except `_meta`
    pub fn same_state(&self, other: &Aggregate) -> bool {
        let mut a = self.clone();
        a.meta = other.meta.clone();
        a == *other
    }

    pub fn is_taken_by(&self, actor: &str) -> bool {
        self.taken_by.as_deref() == Some(actor)
    }
}
