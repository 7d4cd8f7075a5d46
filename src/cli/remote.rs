//! Remote commands: sync, pull, fetch.

use serde::Serialize;

use crate::cli::{short_sha, Common};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::sync::{FetchResult, PullOutcome, SyncEngine};
use crate::tracker::Tracker;

pub struct SyncOptions {
    pub common: Common,
}

pub struct PullOptions {
    pub common: Common,
}

pub struct FetchOptions {
    pub common: Common,
}

#[derive(Serialize)]
struct FetchReport {
    remote: String,
    branch: String,
    remote_empty: bool,
}

fn open(common: &Common) -> Result<Tracker> {
    if common.no_sync {
        return Err(Error::InvalidArgument(
            "--no-sync cannot be combined with remote commands".to_string(),
        ));
    }
    let tracker = common.open(true)?;
    if tracker.sync().is_none() {
        return Err(Error::InvalidConfig(
            "sync is disabled (sync.enabled = false)".to_string(),
        ));
    }
    Ok(tracker)
}

fn engine(tracker: &Tracker) -> Result<&SyncEngine> {
    tracker
        .sync()
        .ok_or_else(|| Error::InvalidConfig("sync is disabled".to_string()))
}

pub async fn run_sync(options: SyncOptions) -> Result<()> {
    let tracker = open(&options.common)?;
    let outcome = engine(&tracker)?.flush().await;
    if let Some(error) = &outcome.error {
        return Err(Error::OperationFailed(error.clone()));
    }

    let header = match &outcome.sha {
        Some(sha) => format!("tally sync: committed {}", short_sha(sha)),
        None => "tally sync: nothing to commit".to_string(),
    };
    let mut human = HumanOutput::new(header);
    human.push_summary("events", outcome.files.len().to_string());
    human.push_summary("push attempts", outcome.attempts.to_string());

    emit_success(options.common.output(), "sync", &outcome, Some(&human))
}

pub async fn run_pull(options: PullOptions) -> Result<()> {
    let tracker = open(&options.common)?;
    let outcome = engine(&tracker)?.pull().await?;

    let mut human = match &outcome {
        PullOutcome::NothingNew => HumanOutput::new("tally pull: already up to date"),
        PullOutcome::Synchronized { files } => {
            let mut human = HumanOutput::new(format!("tally pull: {} event(s)", files.len()));
            for file in files {
                human.push_detail(file.clone());
            }
            human
        }
    };
    let cycles = crate::graph::find_cycles(&tracker.adjacency()?);
    for cycle in &cycles {
        human.push_warning(format!("dependency cycle: {cycle}"));
    }

    emit_success(options.common.output(), "pull", &outcome, Some(&human))
}

pub async fn run_fetch(options: FetchOptions) -> Result<()> {
    let tracker = open(&options.common)?;
    let engine = engine(&tracker)?;
    let result = engine.fetch().await?;

    let config = engine.config();
    let report = FetchReport {
        remote: config.remote.clone(),
        branch: config.branch.clone(),
        remote_empty: result == FetchResult::RemoteEmpty,
    };

    let header = if report.remote_empty {
        format!("tally fetch: {}/{} does not exist yet", report.remote, report.branch)
    } else {
        format!("tally fetch: {}/{}", report.remote, report.branch)
    };
    let mut human = HumanOutput::new(header);
    human.push_next_step("tally pull");

    emit_success(options.common.output(), "fetch", &report, Some(&human))
}
