//! Owned scheduled work: a single-task slot and a teardown registry.

use std::{
    future::Future,
    sync::{Mutex, PoisonError},
};

use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

/// Holds at most one scheduled task. Scheduling a new task aborts the previous one.
#[derive(Debug, Default)]
pub struct TaskSlot {
    current: Mutex<Option<AbortHandle>>,
}

impl TaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task`, replacing (and aborting) whatever was scheduled before.
    pub fn replace<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(task);
        let previous = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
        handle
    }

    /// True while the scheduled task has not yet finished.
    pub fn is_pending(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn cancel(&self) {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = current {
            handle.abort();
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

type Teardown = Box<dyn FnOnce() + Send + Sync>;

/// Registrations owned by an application shell. Torn down in reverse order of
/// registration, either explicitly or on drop.
#[derive(Default)]
pub struct Subscriptions {
    entries: Vec<(&'static str, Teardown)>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &'static str,
        teardown: impl FnOnce() + Send + Sync + 'static,
    ) {
        debug!(subscription = name, "Registered subscription");
        self.entries.push((name, Box::new(teardown)));
    }

    /// Register a background task; teardown aborts it.
    pub fn register_task<T: Send + 'static>(&mut self, name: &'static str, handle: JoinHandle<T>) {
        let abort = handle.abort_handle();
        self.register(name, move || abort.abort());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(name, _)| *name).collect()
    }

    pub fn teardown_all(&mut self) {
        while let Some((name, teardown)) = self.entries.pop() {
            debug!(subscription = name, "Tearing down subscription");
            teardown();
        }
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.teardown_all();
    }
}
