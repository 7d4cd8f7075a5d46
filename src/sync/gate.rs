//! Push gate for deterministic multi-replica tests.
//!
//! Only active when `TALLY_TEST_MODE=1`, `TALLY_TEST_ID` and
//! `TALLY_PUSH_GATE_DIR` are all set. While `<dir>/<test id>.block` exists
//! the engine parks right before pushing, after touching
//! `<dir>/<test id>.reached` so the test knows the commit is ready.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

pub const TEST_MODE_ENV: &str = "TALLY_TEST_MODE";
pub const TEST_ID_ENV: &str = "TALLY_TEST_ID";
pub const GATE_DIR_ENV: &str = "TALLY_PUSH_GATE_DIR";

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct PushGate {
    dir: PathBuf,
    test_id: String,
}

impl PushGate {
    pub fn new(dir: impl Into<PathBuf>, test_id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            test_id: test_id.into(),
        }
    }

    /// Gate configured by the environment, if test mode is on
    pub fn from_env() -> Option<Self> {
        if std::env::var(TEST_MODE_ENV).ok().as_deref() != Some("1") {
            return None;
        }
        let test_id = std::env::var(TEST_ID_ENV).ok().filter(|id| !id.is_empty())?;
        let dir = std::env::var(GATE_DIR_ENV).ok().filter(|dir| !dir.is_empty())?;
        Some(Self::new(dir, test_id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn block_path(&self) -> PathBuf {
        self.dir.join(format!("{}.block", self.test_id))
    }

    pub fn reached_path(&self) -> PathBuf {
        self.dir.join(format!("{}.reached", self.test_id))
    }

    pub fn block(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.block_path(), b"")?;
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        match std::fs::remove_file(self.block_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.block_path().exists()
    }

    pub fn has_been_reached(&self) -> bool {
        self.reached_path().exists()
    }

    /// Park until the block file is gone.
    pub async fn wait(&self) -> Result<()> {
        if !self.is_blocked() {
            return Ok(());
        }
        tokio::fs::write(self.reached_path(), b"").await?;
        debug!(test_id = %self.test_id, "push gate closed; waiting");
        while self.is_blocked() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        debug!(test_id = %self.test_id, "push gate released");
        Ok(())
    }
}
