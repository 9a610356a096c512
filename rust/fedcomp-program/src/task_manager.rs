//! Fire-and-forget background tasks with a join barrier.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

use futures::FutureExt;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error};

#[derive(Default)]
struct Inner {
    pending: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
    finished: Notify,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        // the map stays consistent even if a holder of the lock panicked
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, id: u64) {
        self.pending().remove(&id);
        self.finished.notify_waiters();
    }
}

#[derive(Clone, Default)]
/// A set of background tasks.
///
/// Tasks are spawned on the tokio runtime as soon as they are added and remove themselves from
/// the set when they complete, whether they succeed, fail or panic. Failures are logged and
/// never returned.
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` in the background.
    pub fn add_task<F, E>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let wrapped = async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => debug!("task `{}` finished", name),
                Ok(Err(err)) => error!("task `{}` failed: {}", name, err),
                Err(_) => error!("task `{}` panicked", name),
            }
            inner.finish(id);
        };

        // the task can only remove itself once it is registered
        let mut pending = self.inner.pending();
        pending.insert(id, tokio::spawn(wrapped));
    }

    /// Gets the number of tasks that did not complete yet.
    pub fn pending_tasks(&self) -> usize {
        self.inner.pending().len()
    }

    /// Waits until every task added so far, and every task added while waiting, completed.
    pub async fn wait_for_all_tasks(&self) {
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            // register before checking, a completion in between must not get lost
            notified.as_mut().enable();
            if self.pending_tasks() == 0 {
                return;
            }
            notified.await;
        }
    }
}
