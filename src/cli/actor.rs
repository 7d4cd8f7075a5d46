//! tally actor command implementation
//!
//! Provides actor identity helpers (set/show).

use std::path::PathBuf;

use crate::actor;
use crate::cli::Common;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::event::ActorHash;
use crate::output::{emit_success, HumanOutput};
use crate::storage::Storage;

/// Options for `tally actor set`
pub struct SetOptions {
    pub name: String,
    pub common: Common,
}

/// Options for `tally actor show`
pub struct ShowOptions {
    pub common: Common,
}

#[derive(serde::Serialize)]
struct ActorSetReport {
    actor: String,
    hash: String,
    path: PathBuf,
}

#[derive(serde::Serialize)]
struct ActorShowReport {
    actor: String,
    hash: String,
}

fn open_storage(common: &Common) -> Result<(Storage, Config)> {
    let repo_root = common.repo_root()?;
    let config = Config::load_from_repo(&repo_root)?;
    let storage = Storage::new(repo_root, &config.data_dir);
    if !storage.is_initialized() {
        return Err(Error::NotInitialized(storage.repo_root().to_path_buf()));
    }
    Ok((storage, config))
}

pub fn run_set(options: SetOptions) -> Result<()> {
    let (storage, _config) = open_storage(&options.common)?;

    actor::persist_actor(&storage, &options.name)?;
    let actor_name = options.name.trim().to_string();
    let actor_path = storage.actor_file();

    let report = ActorSetReport {
        actor: actor_name.clone(),
        hash: ActorHash::of(&actor_name).to_string(),
        path: actor_path.clone(),
    };

    let mut human = HumanOutput::new(format!("tally actor set: {actor_name}"));
    human.push_summary("actor", actor_name);
    human.push_summary("path", actor_path.display().to_string());
    if options.common.actor.is_some() {
        human.push_warning("--actor or TALLY_ACTOR still overrides the persisted name");
    }

    emit_success(options.common.output(), "actor set", &report, Some(&human))
}

pub fn run_show(options: ShowOptions) -> Result<()> {
    let (storage, config) = open_storage(&options.common)?;

    let actor_name = actor::resolve_actor(Some(&storage), &config, options.common.actor.as_deref());

    let report = ActorShowReport {
        actor: actor_name.clone(),
        hash: ActorHash::of(&actor_name).to_string(),
    };

    let header = if actor_name == "unknown" {
        "tally actor: not set".to_string()
    } else {
        format!("tally actor: {actor_name}")
    };

    let mut human = HumanOutput::new(header);
    human.push_summary("actor", actor_name.clone());
    human.push_summary("hash", report.hash.clone());

    if actor_name == "unknown" {
        human.push_warning("actor not set; using default".to_string());
        human.push_next_step("tally actor set <name>");
    }

    emit_success(options.common.output(), "actor show", &report, Some(&human))
}
