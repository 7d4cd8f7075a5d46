//! tally init command implementation
//!
//! Writes `.tally.toml` when absent and creates the data directory tree.

use std::path::{Path, PathBuf};

use crate::actor;
use crate::cli::Common;
use crate::config::{Config, CONFIG_FILE};
use crate::error::{Error, Result};
use crate::output::{emit_success, HumanOutput};
use crate::storage::Storage;

pub struct InitOptions {
    pub as_actor: Option<String>,
    pub common: Common,
}

#[derive(serde::Serialize)]
struct InitReport {
    repo: PathBuf,
    data_dir: PathBuf,
    created: InitCreated,
    #[serde(skip_serializing_if = "Option::is_none")]
    actor: Option<String>,
}

#[derive(serde::Serialize)]
struct InitCreated {
    config: bool,
    data_dir: bool,
}

pub fn run(options: InitOptions) -> Result<()> {
    let repo_root = options.common.repo_root()?;

    let created_config = ensure_config(&repo_root)?;
    let config = Config::load_from_repo(&repo_root)?;
    let storage = Storage::new(repo_root.clone(), &config.data_dir);

    let created_data_dir = !storage.is_initialized();
    ensure_not_file(&storage.data_dir())?;
    storage.init()?;

    if let Some(name) = options.as_actor.as_deref() {
        actor::persist_actor(&storage, name)?;
    }
    let persisted = storage.read_actor();

    let report = InitReport {
        repo: repo_root.clone(),
        data_dir: storage.data_dir(),
        created: InitCreated {
            config: created_config,
            data_dir: created_data_dir,
        },
        actor: persisted.clone(),
    };

    let mut created_items = Vec::new();
    if created_config {
        created_items.push(CONFIG_FILE.to_string());
    }
    if created_data_dir {
        created_items.push(format!("{}/", config.data_dir));
    }

    let header = if created_items.is_empty() {
        "tally init: nothing to do".to_string()
    } else {
        "tally init: initialized repo".to_string()
    };

    let mut human = HumanOutput::new(header);
    human.push_summary("repo", repo_root.display().to_string());
    human.push_summary(
        "created",
        if created_items.is_empty() {
            "none".to_string()
        } else {
            created_items.join(", ")
        },
    );
    match persisted {
        Some(name) => human.push_summary("actor", name),
        None => human.push_next_step("tally actor set <name>"),
    }
    human.push_next_step("tally create \"<tagline>\"");

    emit_success(options.common.output(), "init", &report, Some(&human))
}

fn ensure_config(repo_root: &Path) -> Result<bool> {
    let config_path = repo_root.join(CONFIG_FILE);
    if config_path.exists() {
        if !config_path.is_file() {
            return Err(Error::OperationFailed(format!(
                "{CONFIG_FILE} exists but is not a file: {}",
                config_path.display()
            )));
        }
        return Ok(false);
    }

    Config::default().save(&config_path)?;
    Ok(true)
}

fn ensure_not_file(path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        return Err(Error::OperationFailed(format!(
            "Expected directory at {}",
            path.display()
        )));
    }
    Ok(())
}
