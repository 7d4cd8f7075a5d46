//! Filename wire format for events.
//!
//! Every fact about an item lives in its own immutable file whose name
//! carries the owning item, the event kind, any kind-specific action and
//! target, a millisecond UTC timestamp and a short random disambiguator:
//!
//! ```text
//! 12345678.json                                              creation
//! 12345678.status.20240105093000123.x7Qa.json                tagline | entry | status
//! 12345678.ignored.unignored.20240105093000123.x7Qa.json     ignored
//! 12345678.dependency.linked.23456789.20240105093000123.x7Qa.json
//! 12345678.taken.surrendered.3fa94c1e.20240105093000123.x7Qa.json
//! ```
//!
//! This is the only module that parses or builds event filenames.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use chrono::{DateTime, NaiveDate, SecondsFormat, TimeZone, Utc};
use ulid::Ulid;

use super::id::{ActorHash, ItemId};
use crate::error::{Error, Result};

pub const EVENT_EXTENSION: &str = "json";

const TIMESTAMP_LEN: usize = 17;
const NONCE_LEN: usize = 4;
const NONCE_CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Kind discriminant without kind-specific data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KindTag {
    Creation,
    Tagline,
    Entry,
    Status,
    Dependency,
    Monitor,
    Ignored,
    Taken,
}

impl KindTag {
    pub fn as_str(self) -> &'static str {
        match self {
            KindTag::Creation => "creation",
            KindTag::Tagline => "tagline",
            KindTag::Entry => "entry",
            KindTag::Status => "status",
            KindTag::Dependency => "dependency",
            KindTag::Monitor => "monitor",
            KindTag::Ignored => "ignored",
            KindTag::Taken => "taken",
        }
    }

    /// Parse a kind token as it appears in a typed event filename.
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "tagline" => Some(KindTag::Tagline),
            "entry" => Some(KindTag::Entry),
            "status" => Some(KindTag::Status),
            "dependency" => Some(KindTag::Dependency),
            "monitor" => Some(KindTag::Monitor),
            "ignored" => Some(KindTag::Ignored),
            "taken" => Some(KindTag::Taken),
            _ => None,
        }
    }
}

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkAction {
    Linked,
    Unlinked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MonitorAction {
    Added,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IgnoreAction {
    Ignored,
    Unignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TakeAction {
    Taken,
    Surrendered,
}

macro_rules! action_tokens {
    ($ty:ident { $($variant:ident => $token:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $token,)+
                }
            }

            fn from_token(token: &str) -> Option<Self> {
                match token {
                    $($token => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

action_tokens!(LinkAction { Linked => "linked", Unlinked => "unlinked" });
action_tokens!(MonitorAction { Added => "added", Removed => "removed" });
action_tokens!(IgnoreAction { Ignored => "ignored", Unignored => "unignored" });
action_tokens!(TakeAction { Taken => "taken", Surrendered => "surrendered" });

/// What an event says about its item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Creation,
    Tagline,
    Entry,
    Status,
    Dependency { action: LinkAction, target: ItemId },
    Monitor { action: MonitorAction, actor: ActorHash },
    Ignored { action: IgnoreAction },
    Taken { action: TakeAction, actor: ActorHash },
}

impl EventKind {
    pub fn tag(&self) -> KindTag {
        match self {
            EventKind::Creation => KindTag::Creation,
            EventKind::Tagline => KindTag::Tagline,
            EventKind::Entry => KindTag::Entry,
            EventKind::Status => KindTag::Status,
            EventKind::Dependency { .. } => KindTag::Dependency,
            EventKind::Monitor { .. } => KindTag::Monitor,
            EventKind::Ignored { .. } => KindTag::Ignored,
            EventKind::Taken { .. } => KindTag::Taken,
        }
    }

    fn action_token(&self) -> Option<&'static str> {
        match self {
            EventKind::Dependency { action, .. } => Some(action.as_str()),
            EventKind::Monitor { action, .. } => Some(action.as_str()),
            EventKind::Ignored { action } => Some(action.as_str()),
            EventKind::Taken { action, .. } => Some(action.as_str()),
            _ => None,
        }
    }

    fn target_token(&self) -> Option<&str> {
        match self {
            EventKind::Dependency { target, .. } => Some(target.as_str()),
            EventKind::Monitor { actor, .. } | EventKind::Taken { actor, .. } => {
                Some(actor.as_str())
            }
            _ => None,
        }
    }
}

/// Timestamp and disambiguator carried by every non-creation event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Stamp {
    pub at: DateTime<Utc>,
    pub nonce: String,
}

impl Stamp {
    fn new(at: DateTime<Utc>) -> Self {
        Self {
            at: truncate_millis(at),
            nonce: random_nonce(),
        }
    }

    /// `YYYYMMDDHHmmssSSS`, lexically sortable.
    pub fn key(&self) -> String {
        format_timestamp(self.at)
    }
}

/// A decoded event filename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventName {
    pub item: ItemId,
    pub kind: EventKind,
    /// `None` only for creation events.
    pub stamp: Option<Stamp>,
}

/// Result of encoding a new event.
#[derive(Debug, Clone)]
pub struct Encoded {
    pub name: EventName,
    pub filename: String,
    /// RFC 3339 timestamp (millisecond precision) to store in the payload.
    pub timestamp: String,
    pub at: DateTime<Utc>,
}

/// Encode a new event for `item` at the current time.
///
/// Events encoded by one process get strictly increasing timestamps, so a
/// burst of writes keeps its order even within a single millisecond.
pub fn encode(item: &ItemId, kind: EventKind) -> Encoded {
    encode_at(item, kind, monotonic_now())
}

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

fn monotonic_now() -> DateTime<Utc> {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_MILLIS.load(AtomicOrdering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_MILLIS.compare_exchange_weak(
            last,
            next,
            AtomicOrdering::Relaxed,
            AtomicOrdering::Relaxed,
        ) {
            Ok(_) => return DateTime::from_timestamp_millis(next).unwrap_or_else(Utc::now),
            Err(actual) => last = actual,
        }
    }
}

/// Encode a new event for `item` at a given instant.
pub fn encode_at(item: &ItemId, kind: EventKind, at: DateTime<Utc>) -> Encoded {
    let at = truncate_millis(at);
    let name = EventName::new(item.clone(), kind, at);
    Encoded {
        filename: name.encode(),
        timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        at,
        name,
    }
}

/// Decode an event filename, rejecting anything `encode` could not have produced.
pub fn decode(filename: &str) -> Result<EventName> {
    EventName::decode(filename)
}

impl EventName {
    pub fn new(item: ItemId, kind: EventKind, at: DateTime<Utc>) -> Self {
        let stamp = match kind {
            EventKind::Creation => None,
            _ => Some(Stamp::new(at)),
        };
        Self { item, kind, stamp }
    }

    pub fn creation(item: ItemId) -> Self {
        Self {
            item,
            kind: EventKind::Creation,
            stamp: None,
        }
    }

    pub fn tag(&self) -> KindTag {
        self.kind.tag()
    }

    pub fn encode(&self) -> String {
        let Some(stamp) = &self.stamp else {
            return format!("{}.{}", self.item, EVENT_EXTENSION);
        };
        let key = stamp.key();
        let mut parts: Vec<&str> = vec![self.item.as_str(), self.kind.tag().as_str()];
        if let Some(action) = self.kind.action_token() {
            parts.push(action);
        }
        if let Some(target) = self.kind.target_token() {
            parts.push(target);
        }
        parts.push(&key);
        parts.push(&stamp.nonce);
        parts.push(EVENT_EXTENSION);
        parts.join(".")
    }

    pub fn decode(filename: &str) -> Result<Self> {
        let reject = |reason: &str| Error::InvalidEventName {
            name: filename.to_string(),
            reason: reason.to_string(),
        };

        let stem = filename
            .strip_suffix(".json")
            .ok_or_else(|| reject("missing .json suffix"))?;
        let parts: Vec<&str> = stem.split('.').collect();
        let item = ItemId::parse(parts[0]).map_err(|_| reject("invalid item id"))?;

        if parts.len() == 1 {
            return Ok(Self::creation(item));
        }

        let tag = KindTag::from_token(parts[1]).ok_or_else(|| reject("unknown event kind"))?;
        let expected = match tag {
            KindTag::Tagline | KindTag::Entry | KindTag::Status => 4,
            KindTag::Ignored => 5,
            KindTag::Dependency | KindTag::Monitor | KindTag::Taken => 6,
            KindTag::Creation => unreachable!("creation has no kind token"),
        };
        if parts.len() != expected {
            return Err(reject(&format!(
                "{} events have {} parts, found {}",
                tag,
                expected,
                parts.len()
            )));
        }

        let action = parts.get(2).copied().unwrap_or_default();
        let kind = match tag {
            KindTag::Tagline => EventKind::Tagline,
            KindTag::Entry => EventKind::Entry,
            KindTag::Status => EventKind::Status,
            KindTag::Ignored => EventKind::Ignored {
                action: IgnoreAction::from_token(action)
                    .ok_or_else(|| reject("unknown ignored action"))?,
            },
            KindTag::Dependency => EventKind::Dependency {
                action: LinkAction::from_token(action)
                    .ok_or_else(|| reject("unknown dependency action"))?,
                target: ItemId::parse(parts[3]).map_err(|_| reject("invalid target item id"))?,
            },
            KindTag::Monitor => EventKind::Monitor {
                action: MonitorAction::from_token(action)
                    .ok_or_else(|| reject("unknown monitor action"))?,
                actor: ActorHash::parse(parts[3]).ok_or_else(|| reject("invalid actor hash"))?,
            },
            KindTag::Taken => EventKind::Taken {
                action: TakeAction::from_token(action)
                    .ok_or_else(|| reject("unknown taken action"))?,
                actor: ActorHash::parse(parts[3]).ok_or_else(|| reject("invalid actor hash"))?,
            },
            KindTag::Creation => unreachable!("creation has no kind token"),
        };

        let nonce = parts[expected - 1];
        if nonce.len() != NONCE_LEN || !nonce.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(reject("invalid disambiguator"));
        }
        let at = parse_timestamp(parts[expected - 2]).ok_or_else(|| reject("invalid timestamp"))?;

        Ok(Self {
            item,
            kind,
            stamp: Some(Stamp {
                at,
                nonce: nonce.to_string(),
            }),
        })
    }

    /// Ordering key: creation events sort before every stamped event.
    pub fn sort_key(&self) -> String {
        self.stamp.as_ref().map(Stamp::key).unwrap_or_default()
    }

    /// Items whose aggregate this event contributes to.
    pub fn affected_items(&self) -> Vec<ItemId> {
        match &self.kind {
            EventKind::Dependency { target, .. } if *target != self.item => {
                vec![self.item.clone(), target.clone()]
            }
            _ => vec![self.item.clone()],
        }
    }

    /// Whether this event contributes to `item`'s aggregate.
    pub fn references(&self, item: &ItemId) -> bool {
        if &self.item == item {
            return true;
        }
        matches!(&self.kind, EventKind::Dependency { target, .. } if target == item)
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Total order over event filenames: sort key, then filename.
pub fn compare(a: &EventName, a_file: &str, b: &EventName, b_file: &str) -> Ordering {
    a.sort_key()
        .cmp(&b.sort_key())
        .then_with(|| a_file.cmp(b_file))
}

pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%d%H%M%S%3f").to_string()
}

/// Parse the fixed-width `YYYYMMDDHHmmssSSS` form.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if raw.len() != TIMESTAMP_LEN || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let field = |range: std::ops::Range<usize>| raw[range].parse::<u32>().ok();
    let year = raw[0..4].parse::<i32>().ok()?;
    let date = NaiveDate::from_ymd_opt(year, field(4..6)?, field(6..8)?)?;
    let naive = date.and_hms_milli_opt(field(8..10)?, field(10..12)?, field(12..14)?, field(14..17)?)?;
    Some(Utc.from_utc_datetime(&naive))
}

fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}

fn random_nonce() -> String {
    let mut bits = Ulid::new().random();
    let base = NONCE_CHARSET.len() as u128;
    (0..NONCE_LEN)
        .map(|_| {
            let ch = NONCE_CHARSET[(bits % base) as usize] as char;
            bits /= base;
            ch
        })
        .collect()
}
