//! Item commands: create, change, show, list, tree.

use serde::Serialize;

use crate::aggregate::Aggregate;
use crate::cli::{flush, parse_id, parse_ids, Common};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};
use crate::sync::CommitOutcome;
use crate::tree::TreeNode;

pub struct CreateOptions {
    pub tagline: String,
    pub status: Option<String>,
    pub common: Common,
}

/// One mutation of an existing item
#[derive(Debug, Clone)]
pub enum Change {
    Tagline(String),
    Status(String),
    Note(String),
    Link(String),
    Unlink(String),
    Monitor,
    Unmonitor,
    Ignore(bool),
    /// Expected current holder when taking over
    Take(Option<String>),
    Surrender,
}

impl Change {
    fn command(&self) -> &'static str {
        match self {
            Change::Tagline(_) => "tagline",
            Change::Status(_) => "status",
            Change::Note(_) => "note",
            Change::Link(_) => "link",
            Change::Unlink(_) => "unlink",
            Change::Monitor => "monitor",
            Change::Unmonitor => "unmonitor",
            Change::Ignore(true) => "ignore",
            Change::Ignore(false) => "unignore",
            Change::Take(_) => "take",
            Change::Surrender => "surrender",
        }
    }
}

pub struct ChangeOptions {
    pub id: String,
    pub change: Change,
    pub common: Common,
}

pub struct ShowOptions {
    pub id: String,
    pub common: Common,
}

pub struct ListOptions {
    pub status: Option<String>,
    pub taken_by: Option<String>,
    pub all: bool,
    pub common: Common,
}

pub struct TreeOptions {
    pub ids: Vec<String>,
    pub common: Common,
}

#[derive(Serialize)]
struct ItemReport {
    item: Aggregate,
    #[serde(skip_serializing_if = "Option::is_none")]
    sync: Option<CommitOutcome>,
}

#[derive(Serialize)]
struct ListReport {
    count: usize,
    items: Vec<Aggregate>,
}

pub async fn run_create(options: CreateOptions) -> Result<()> {
    let tracker = options.common.open(true)?;
    let item = tracker.create_item(&options.tagline, options.status.as_deref())?;

    let mut human = HumanOutput::new(format!("tally create: {}", item.id));
    describe(&item, &mut human);
    let sync = flush(&tracker, &mut human).await;
    human.push_next_step(format!("tally note {} \"<text>\"", item.id));

    emit_success(
        options.common.output(),
        "create",
        &ItemReport { item, sync },
        Some(&human),
    )
}

pub async fn run_change(options: ChangeOptions) -> Result<()> {
    let tracker = options.common.open(true)?;
    let id = parse_id(&options.id)?;

    let item = match &options.change {
        Change::Tagline(tagline) => tracker.set_tagline(&id, tagline)?,
        Change::Status(status) => tracker.set_status(&id, status)?,
        Change::Note(text) => tracker.add_entry(&id, text)?,
        Change::Link(target) => tracker.link_dependency(&id, &parse_id(target)?)?,
        Change::Unlink(target) => tracker.unlink_dependency(&id, &parse_id(target)?)?,
        Change::Monitor => tracker.monitor(&id)?,
        Change::Unmonitor => tracker.unmonitor(&id)?,
        Change::Ignore(ignored) => tracker.set_ignored(&id, *ignored)?,
        Change::Take(expected) => tracker.take(&id, expected.as_deref())?,
        Change::Surrender => tracker.surrender(&id)?,
    };

    let command = options.change.command();
    let mut human = HumanOutput::new(format!("tally {command}: {}", item.id));
    describe(&item, &mut human);
    let sync = flush(&tracker, &mut human).await;

    emit_success(
        options.common.output(),
        command,
        &ItemReport { item, sync },
        Some(&human),
    )
}

pub fn run_show(options: ShowOptions) -> Result<()> {
    let tracker = options.common.open(false)?;
    let item = tracker.get(&parse_id(&options.id)?)?;

    let mut human = HumanOutput::new(format!("tally show: {}", item.id));
    describe(&item, &mut human);
    for entry in &item.entries {
        human.push_detail(format!(
            "{} {}: {}",
            entry.timestamp.format("%Y-%m-%d %H:%M"),
            entry.author.as_deref().unwrap_or("unknown"),
            entry.text
        ));
    }

    emit_success(
        options.common.output(),
        "show",
        &ItemReport { item, sync: None },
        Some(&human),
    )
}

pub fn run_list(options: ListOptions) -> Result<()> {
    let tracker = options.common.open(false)?;
    let items: Vec<Aggregate> = tracker
        .get_all_aggregates()?
        .into_iter()
        .filter(|item| options.all || !item.ignored)
        .filter(|item| {
            options
                .status
                .as_deref()
                .map_or(true, |status| item.status == status)
        })
        .filter(|item| {
            options
                .taken_by
                .as_deref()
                .map_or(true, |actor| item.is_taken_by(actor))
        })
        .collect();

    let mut human = HumanOutput::new(format!("tally list: {} item(s)", items.len()));
    for item in &items {
        human.push_detail(line(item));
    }
    if items.is_empty() && !options.all {
        human.push_next_step("tally list --all");
    }

    emit_success(
        options.common.output(),
        "list",
        &ListReport {
            count: items.len(),
            items,
        },
        Some(&human),
    )
}

pub fn run_tree(options: TreeOptions) -> Result<()> {
    let tracker = options.common.open(false)?;
    let roots = parse_ids(&options.ids)?;
    let nodes: Vec<TreeNode> = tracker.tree(&roots).collect::<Result<_>>()?;

    let mut human = HumanOutput::new(format!("tally tree: {} node(s)", nodes.len()));
    for node in &nodes {
        let mut text = format!("{}{}", "  ".repeat(node.depth), line(&node.item));
        if node.full.is_none() {
            text.push_str(" (shown above)");
        }
        human.push_detail(text);
    }

    emit_success(options.common.output(), "tree", &nodes, Some(&human))
}

fn line(item: &Aggregate) -> String {
    let mut text = format!("{} [{}] {}", item.id, item.status, item.tagline);
    if let Some(holder) = &item.taken_by {
        text.push_str(&format!(" @{holder}"));
    }
    if item.ignored {
        text.push_str(" (ignored)");
    }
    text
}

fn describe(item: &Aggregate, human: &mut HumanOutput) {
    human.push_summary("tagline", item.tagline.clone());
    human.push_summary("status", item.status.clone());
    if let Some(holder) = &item.taken_by {
        human.push_summary("taken by", holder.clone());
    }
    if !item.depends_on.is_empty() {
        human.push_summary("depends on", join(item.depends_on.iter()));
    }
    if !item.provides_to.is_empty() {
        human.push_summary("needed by", join(item.provides_to.iter()));
    }
    if !item.monitors.is_empty() {
        human.push_summary("monitors", join(item.monitors.iter()));
    }
    if item.ignored {
        human.push_summary("ignored", "");
    }
}

fn join<T: std::fmt::Display>(values: impl Iterator<Item = T>) -> String {
    values.map(|v| v.to_string()).collect::<Vec<_>>().join(", ")
}
