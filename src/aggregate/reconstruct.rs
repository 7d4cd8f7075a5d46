//! Pure fold from ordered events to an [`Aggregate`].
//!
//! Full rebuilds and incremental updates both go through [`fold`], so the
//! two paths can only disagree if they are fed events in a different order.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::{Aggregate, AggregateMeta, Entry};
use crate::error::Result;
use crate::event::{
    codec, ActorHash, EventKind, EventName, EventPayload, IgnoreAction, ItemId, LinkAction,
    MonitorAction, TakeAction,
};

/// Status used when a creation payload carries none.
pub const FALLBACK_STATUS: &str = "open";

/// A decoded event filename together with its body.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub name: EventName,
    pub filename: String,
    pub payload: EventPayload,
}

impl RecordedEvent {
    pub fn decode(filename: impl Into<String>, payload: EventPayload) -> Result<Self> {
        let filename = filename.into();
        let name = codec::decode(&filename)?;
        Ok(Self {
            name,
            filename,
            payload,
        })
    }

    pub fn from_name(name: EventName, payload: EventPayload) -> Self {
        Self {
            filename: name.encode(),
            name,
            payload,
        }
    }

    pub fn sort_key(&self) -> String {
        self.name.sort_key()
    }

    fn order(&self, other: &RecordedEvent) -> Ordering {
        codec::compare(&self.name, &self.filename, &other.name, &other.filename)
    }
}

/// Sort events by timestamp, ties broken by filename.
pub fn sort_events(events: &mut [RecordedEvent]) {
    events.sort_by(|a, b| a.order(b));
}

/// Replay every event that references `item`.
///
/// Events that do not reference `item` are skipped, so callers may pass a
/// superset. Returns `None` when no creation event for `item` is present.
pub fn reconstruct(
    item: &ItemId,
    events: &[RecordedEvent],
    built_at: DateTime<Utc>,
) -> Option<Aggregate> {
    let mut relevant: Vec<&RecordedEvent> =
        events.iter().filter(|e| e.name.references(item)).collect();
    relevant.sort_by(|a, b| a.order(b));

    let mut state = None;
    for event in relevant {
        state = fold(state, item, event);
    }
    state.map(|mut aggregate| {
        aggregate.meta.built_at = built_at;
        aggregate
    })
}

/// Apply one event to the state of `item`.
pub fn fold(state: Option<Aggregate>, item: &ItemId, event: &RecordedEvent) -> Option<Aggregate> {
    let name = &event.name;
    let payload = &event.payload;

    let mut aggregate = match (state, &name.kind) {
        (None, EventKind::Creation) if &name.item == item => {
            return Some(seed(item, payload));
        }
        // A second creation for an already-seeded item; the first one wins.
        (Some(aggregate), EventKind::Creation) => return Some(aggregate),
        // Nothing to attach to until the item exists.
        (None, _) => return None,
        (Some(aggregate), _) => aggregate,
    };

    let owned = &name.item == item;
    match &name.kind {
        EventKind::Creation => {}
        EventKind::Tagline => {
            if let Some(tagline) = &payload.tagline {
                aggregate.tagline = tagline.clone();
            }
        }
        EventKind::Status => {
            if let Some(status) = &payload.status {
                aggregate.status = status.clone();
            }
        }
        EventKind::Entry => aggregate.entries.push(Entry {
            text: payload.text.clone().unwrap_or_default(),
            timestamp: payload.timestamp,
            author: payload.author.clone(),
        }),
        EventKind::Dependency { action, target } => {
            if owned {
                match action {
                    LinkAction::Linked => aggregate.depends_on.insert(target.clone()),
                    LinkAction::Unlinked => aggregate.depends_on.remove(target),
                };
            }
            if target == item {
                match action {
                    LinkAction::Linked => aggregate.provides_to.insert(name.item.clone()),
                    LinkAction::Unlinked => aggregate.provides_to.remove(&name.item),
                };
            }
        }
        EventKind::Monitor { action, actor } => {
            aggregate.monitors.retain(|m| ActorHash::of(m) != *actor);
            if *action == MonitorAction::Added {
                aggregate.monitors.insert(actor_name(payload, actor));
            }
        }
        EventKind::Ignored { action } => {
            aggregate.ignored = *action == IgnoreAction::Ignored;
        }
        EventKind::Taken { action, actor } => match action {
            TakeAction::Taken => aggregate.taken_by = Some(actor_name(payload, actor)),
            // Latest event wins, whoever held the item before it.
            TakeAction::Surrendered => aggregate.taken_by = None,
        },
    }

    let key = name.sort_key();
    if key > aggregate.meta.last_event_timestamp {
        aggregate.meta.last_event_timestamp = key;
    }
    Some(aggregate)
}

fn seed(item: &ItemId, payload: &EventPayload) -> Aggregate {
    Aggregate {
        id: item.clone(),
        tagline: payload.tagline.clone().unwrap_or_default(),
        status: payload
            .status
            .clone()
            .unwrap_or_else(|| FALLBACK_STATUS.to_string()),
        created_at: payload.timestamp,
        created_by: payload.author.clone(),
        entries: Vec::new(),
        depends_on: Default::default(),
        provides_to: Default::default(),
        monitors: Default::default(),
        ignored: false,
        taken_by: None,
        meta: AggregateMeta {
            last_event_timestamp: String::new(),
            built_at: payload.timestamp,
        },
    }
}

/// The payload names the actor; fall back to the hash if it was stripped.
fn actor_name(payload: &EventPayload, hash: &ActorHash) -> String {
    payload
        .actor
        .clone()
        .unwrap_or_else(|| hash.as_str().to_string())
}
