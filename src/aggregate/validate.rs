//! Field-level comparison between a stored aggregate and a fresh replay.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::{Map, Value};

use super::Aggregate;
use crate::error::Result;
use crate::event::ItemId;

/// Name reported when the whole document is missing on one side.
pub const WHOLE_AGGREGATE: &str = "aggregate";

/// Name reported when the stored file exists but cannot be parsed.
pub const STORED_FILE: &str = "_file";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldDifference {
    pub field: String,
    pub stored: Value,
    pub expected: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub item: ItemId,
    pub valid: bool,
    /// Whether a materialized file was present at all
    pub materialized: bool,
    pub differences: Vec<FieldDifference>,
}

impl ValidationReport {
    pub fn new(item: ItemId, materialized: bool, differences: Vec<FieldDifference>) -> Self {
        Self {
            item,
            valid: differences.is_empty(),
            materialized,
            differences,
        }
    }

    /// A stored file with no events behind it
    pub fn is_orphan(&self) -> bool {
        self.differences
            .iter()
            .any(|d| d.field == WHOLE_AGGREGATE && d.expected.is_null())
    }
}

/// Diff two aggregates field by field, ignoring `_meta`.
pub fn diff(stored: Option<&Aggregate>, expected: Option<&Aggregate>) -> Result<Vec<FieldDifference>> {
    match (stored, expected) {
        (None, None) => Ok(Vec::new()),
        (Some(stored), Some(expected)) => {
            let stored = fields(stored)?;
            let expected = fields(expected)?;
            let names: BTreeSet<&String> = stored.keys().chain(expected.keys()).collect();
            Ok(names
                .into_iter()
                .filter_map(|name| {
                    let a = stored.get(name).cloned().unwrap_or(Value::Null);
                    let b = expected.get(name).cloned().unwrap_or(Value::Null);
                    (a != b).then(|| FieldDifference {
                        field: name.clone(),
                        stored: a,
                        expected: b,
                    })
                })
                .collect())
        }
        (stored, expected) => Ok(vec![FieldDifference {
            field: WHOLE_AGGREGATE.to_string(),
            stored: stored.map(serde_json::to_value).transpose()?.unwrap_or(Value::Null),
            expected: expected
                .map(serde_json::to_value)
                .transpose()?
                .unwrap_or(Value::Null),
        }]),
    }
}

fn fields(aggregate: &Aggregate) -> Result<Map<String, Value>> {
    let mut map = match serde_json::to_value(aggregate)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.remove("_meta");
    Ok(map)
}
