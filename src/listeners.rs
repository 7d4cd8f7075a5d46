//! Callback lists for change notifications.
//!
//! Every registered listener sees every emitted value. A listener that
//! panics is logged and skipped; the remaining listeners still run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{PoisonError, RwLock};

use tracing::warn;

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

pub struct ListenerSet<T> {
    name: &'static str,
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T> ListenerSet<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener. Listeners must not register further listeners
    /// on the same set from inside a callback.
    pub fn register<F>(&self, listener: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(listener));
    }

    /// Deliver `value` to every listener; returns how many panicked.
    pub fn emit(&self, value: &T) -> usize {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut failures = 0;
        for (position, listener) in listeners.iter().enumerate() {
            if panic::catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
                failures += 1;
                warn!(listeners = self.name, position, "listener panicked");
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
