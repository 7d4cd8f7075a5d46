//! Cache maintenance commands: rebuild, validate, stats.

use serde::Serialize;

use crate::aggregate::CacheStats;
use crate::cli::{parse_ids, Common};
use crate::error::Result;
use crate::event::ItemId;
use crate::output::{emit_success, HumanOutput};
use crate::tracker::IntegrityReport;

pub struct RebuildOptions {
    pub ids: Vec<String>,
    pub common: Common,
}

pub struct ValidateOptions {
    pub common: Common,
}

pub struct StatsOptions {
    pub common: Common,
}

#[derive(Serialize)]
struct RebuildReport {
    rebuilt: Vec<ItemId>,
    /// Requested items with no creation event
    missing: Vec<ItemId>,
}

#[derive(Serialize)]
struct StatsReport {
    items: usize,
    events: usize,
    cache: CacheStats,
}

pub fn run_rebuild(options: RebuildOptions) -> Result<()> {
    let tracker = options.common.open(false)?;
    let targets: Vec<ItemId> = if options.ids.is_empty() {
        // The index is derived too; start from the files themselves.
        tracker.cache().invalidate_index()?;
        tracker.cache().created_items()?.into_iter().collect()
    } else {
        parse_ids(&options.ids)?
    };

    let mut report = RebuildReport {
        rebuilt: Vec::new(),
        missing: Vec::new(),
    };
    for item in targets {
        match tracker.rebuild(&item)? {
            Some(_) => report.rebuilt.push(item),
            None => report.missing.push(item),
        }
    }

    let mut human = HumanOutput::new(format!(
        "tally rebuild: {} item(s)",
        report.rebuilt.len()
    ));
    for item in &report.missing {
        human.push_warning(format!("{item} has no events"));
    }

    emit_success(options.common.output(), "rebuild", &report, Some(&human))
}

pub fn run_validate(options: ValidateOptions) -> Result<()> {
    let tracker = options.common.open(false)?;
    let report: IntegrityReport = tracker.integrity_report()?;

    let problems: Vec<_> = report.problems().collect();
    let header = if report.is_clean() {
        format!("tally validate: {} item(s) consistent", report.reports.len())
    } else {
        format!(
            "tally validate: {} drifted, {} cycle(s)",
            problems.len(),
            report.cycles.len()
        )
    };

    let mut human = HumanOutput::new(header);
    for problem in &problems {
        let fields: Vec<&str> = problem.differences.iter().map(|d| d.field.as_str()).collect();
        human.push_detail(format!("{}: {}", problem.item, fields.join(", ")));
    }
    for cycle in &report.cycles {
        human.push_warning(format!("dependency cycle: {cycle}"));
    }
    if !problems.is_empty() {
        human.push_next_step("tally rebuild");
    }

    emit_success(options.common.output(), "validate", &report, Some(&human))
}

pub fn run_stats(options: StatsOptions) -> Result<()> {
    let tracker = options.common.open(false)?;
    let items = tracker.get_all_aggregates()?.len();
    let events = tracker.storage().list_event_files()?.len();
    let cache = tracker.cache().stats();

    let mut human = HumanOutput::new("tally stats");
    human.push_summary("items", items.to_string());
    human.push_summary("events", events.to_string());
    human.push_summary(
        "incremental applies",
        format!("{} ({} us)", cache.incremental_applies, cache.incremental_micros),
    );
    human.push_summary(
        "rebuilds",
        format!("{} ({} us)", cache.rebuilds, cache.rebuild_micros),
    );
    human.push_summary("fallbacks", cache.fallbacks.to_string());
    human.push_summary("invalidations", cache.invalidations.to_string());

    emit_success(
        options.common.output(),
        "stats",
        &StatsReport {
            items,
            events,
            cache,
        },
        Some(&human),
    )
}
