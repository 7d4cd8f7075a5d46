//! Debounced commit scheduling.
//!
//! Every new event file is recorded as pending and (re)starts one shared
//! timer. When the timer runs out without another write, a trigger is sent
//! to the sync worker. Pending files are only forgotten once a commit that
//! contains them has been pushed.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct State {
    pending: BTreeSet<String>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug)]
pub struct CommitScheduler {
    delay: Duration,
    state: Mutex<State>,
    trigger: UnboundedSender<()>,
}

impl CommitScheduler {
    pub fn new(delay: Duration, trigger: UnboundedSender<()>) -> Self {
        Self {
            delay,
            state: Mutex::new(State::default()),
            trigger,
        }
    }

    /// Scheduler plus the receiving end of its trigger channel
    pub fn channel(delay: Duration) -> (Self, UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(delay, tx), rx)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record a new file and restart the debounce window.
    pub fn notify_file_created(&self, filename: &str) {
        self.lock().pending.insert(filename.to_string());
        self.reset();
    }

    /// Restart the timer from now, replacing any running one.
    pub fn reset(&self) {
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime; pending files wait for an explicit flush");
            return;
        };
        let delay = self.delay;
        let trigger = self.trigger.clone();
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            // The worker may already be gone at shutdown.
            let _ = trigger.send(());
        }));
        debug!(pending = state.pending.len(), ?delay, "commit scheduled");
    }

    /// Stop the timer without firing it. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        match state.timer.take() {
            Some(timer) => {
                let running = !timer.is_finished();
                timer.abort();
                running
            }
            None => false,
        }
    }

    /// Whether a timer is counting down
    pub fn is_scheduled(&self) -> bool {
        self.lock()
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    pub fn pending_files(&self) -> Vec<String> {
        self.lock().pending.iter().cloned().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Forget files that reached the remote.
    pub fn mark_committed(&self, files: &[String]) {
        let mut state = self.lock();
        for file in files {
            state.pending.remove(file);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CommitScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.lock().timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn burst_of_writes_fires_once() {
        let (scheduler, mut rx) = CommitScheduler::channel(Duration::from_millis(80));

        for n in 0..5 {
            scheduler.notify_file_created(&format!("1234567{n}.json"));
            sleep(Duration::from_millis(20)).await;
        }
        assert!(scheduler.is_scheduled());

        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("trigger")
            .expect("channel open");
        assert!(
            timeout(Duration::from_millis(200), rx.recv()).await.is_err(),
            "only one trigger per burst"
        );
        assert_eq!(scheduler.pending_files().len(), 5);
    }

    #[tokio::test]
    async fn cancel_prevents_trigger_and_keeps_pending() {
        let (scheduler, mut rx) = CommitScheduler::channel(Duration::from_millis(50));
        scheduler.notify_file_created("12345678.json");

        assert!(scheduler.cancel());
        assert!(!scheduler.is_scheduled());
        assert!(timeout(Duration::from_millis(150), rx.recv()).await.is_err());
        assert!(scheduler.has_pending());
        assert!(!scheduler.cancel());
    }

    #[tokio::test]
    async fn mark_committed_only_removes_given_files() {
        let (scheduler, _rx) = CommitScheduler::channel(Duration::from_secs(60));
        scheduler.notify_file_created("12345678.json");
        scheduler.notify_file_created("23456789.json");

        scheduler.mark_committed(&["12345678.json".to_string()]);
        assert_eq!(scheduler.pending_files(), vec!["23456789.json".to_string()]);
        scheduler.cancel();
    }

    #[test]
    fn without_runtime_files_still_pend() {
        let (scheduler, _rx) = CommitScheduler::channel(Duration::from_millis(10));
        scheduler.notify_file_created("12345678.json");
        assert!(!scheduler.is_scheduled());
        assert!(scheduler.has_pending());
    }
}
