//! Supervised background tasks and isolated observer delivery.
//!
//! Every task spawned here is tracked by a [`TaskTracker`] and wrapped so that
//! a panic is caught and logged with the task label instead of disappearing
//! with a dropped `JoinHandle`.

use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};

/// Error returned by an observer callback.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ObserverError(String);

impl ObserverError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Owns the background tasks of one gateway instance.
#[derive(Debug, Clone)]
pub struct Supervisor {
    name: &'static str,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawn a tracked task. Panics are caught and logged with `label`.
    pub fn spawn<F>(&self, label: impl Into<String>, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let component = self.name;
        self.tracker.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                error!(
                    component,
                    task = %label,
                    panic = %panic_message(panic.as_ref()),
                    "Supervised task panicked"
                );
            }
        })
    }

    /// Token cancelled when the supervisor shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel all tasks and wait up to `grace` for them to finish.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                component = self.name,
                remaining = self.tracker.len(),
                "Supervised tasks still running after shutdown grace period"
            );
        } else {
            debug!(component = self.name, "All supervised tasks finished");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run one observer callback, containing both errors and panics.
///
/// Returns `true` when the observer accepted the delivery.
pub(crate) async fn deliver_isolated<F>(observer: &str, subject: &str, fut: F) -> bool
where
    F: Future<Output = Result<(), ObserverError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(observer, subject, error = %e, "Observer failed to handle notification");
            false
        }
        Err(panic) => {
            error!(
                observer,
                subject,
                panic = %panic_message(panic.as_ref()),
                "Observer panicked while handling notification"
            );
            false
        }
    }
}

/// Handle returned by observer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverHandle(u64);

impl std::fmt::Display for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

/// A list of independently registered observers.
pub struct ObserverSet<O: ?Sized> {
    next_id: AtomicU64,
    observers: RwLock<Vec<(ObserverHandle, Arc<O>)>>,
}

impl<O: ?Sized> Default for ObserverSet<O> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: RwLock::new(Vec::new()),
        }
    }
}

impl<O: ?Sized> ObserverSet<O> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<O>) -> ObserverHandle {
        let handle = ObserverHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((handle, observer));
        handle
    }

    /// Returns `false` if the handle was not registered.
    pub fn unregister(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(h, _)| *h != handle);
        observers.len() != before
    }

    pub fn snapshot(&self) -> Vec<(ObserverHandle, Arc<O>)> {
        self.observers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }
}
