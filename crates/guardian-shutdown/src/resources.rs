//! Tracked process resources released during shutdown.
//!
//! The tracker owns handles the host hands over: spawned tasks, periodic
//! tasks, child processes, closeable I/O resources and custom cleanup
//! callbacks. Shutdown drains them in a fixed order:
//!
//! ```text
//! tasks → intervals → sockets → streams → databases → servers → children → custom
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use guardian_runtime::{PeriodicTask, ServiceError};
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::handler::ShutdownHandler;

/// Kind of a tracked resource. Declaration order is release order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Spawned tokio task
    Task,
    /// Periodic task
    Interval,
    /// Network socket
    Socket,
    /// File or pipe stream
    Stream,
    /// Database handle
    Database,
    /// Listening server
    Server,
    /// Child process
    ChildProcess,
    /// Host-defined cleanup callback
    Custom,
}

/// An I/O resource that can be closed asynchronously.
#[async_trait]
pub trait Closeable: Send + Sync {
    /// Closes the resource.
    async fn close(&self) -> Result<(), ServiceError>;
}

/// Outcome of releasing tracked resources.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Resources released without error.
    pub released: usize,
    /// `(resource name, error)` for each failure.
    pub failures: Vec<(String, String)>,
}

impl ReleaseReport {
    /// Returns true when nothing failed.
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Default)]
struct Tracked {
    tasks: Vec<(String, JoinHandle<()>)>,
    intervals: Vec<PeriodicTask>,
    children: Vec<(String, Child)>,
    closeables: Vec<(String, ResourceKind, Arc<dyn Closeable>)>,
    custom: Vec<(String, Arc<dyn ShutdownHandler>)>,
}

/// Registry of resources to release on shutdown.
#[derive(Default)]
pub struct ResourceTracker {
    inner: Mutex<Tracked>,
}

enum Pending {
    Task(String, JoinHandle<()>),
    Interval(PeriodicTask),
    Child(String, Child),
    Close(String, Arc<dyn Closeable>),
    Custom(String, Arc<dyn ShutdownHandler>),
}

impl Pending {
    fn name(&self) -> String {
        match self {
            Self::Task(name, _)
            | Self::Child(name, _)
            | Self::Close(name, _)
            | Self::Custom(name, _) => name.clone(),
            Self::Interval(task) => task.name().to_string(),
        }
    }

    async fn release(self, timeout: Duration) -> Result<(), String> {
        let name = self.name();
        let fut = async move {
            match self {
                Self::Task(_, handle) => {
                    handle.abort();
                    match handle.await {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_cancelled() => Ok(()),
                        Err(e) => Err(e.to_string()),
                    }
                }
                Self::Interval(task) => {
                    task.shutdown().await;
                    Ok(())
                }
                Self::Child(_, mut child) => child.kill().await.map_err(|e| e.to_string()),
                Self::Close(_, resource) => resource.close().await.map_err(|e| e.to_string()),
                Self::Custom(_, callback) => callback.shutdown().await.map_err(|e| e.to_string()),
            }
        };
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(resource = %name, "resource release timed out");
                Err(ServiceError::Timeout(timeout.as_millis() as u64).to_string())
            }
        }
    }
}

impl ResourceTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Tracks a spawned task; it is aborted on shutdown.
    pub fn track_task(&self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.lock().tasks.push((name.into(), handle));
    }

    /// Tracks a periodic task; it is cancelled on shutdown.
    pub fn track_interval(&self, task: PeriodicTask) {
        self.lock().intervals.push(task);
    }

    /// Tracks a child process; it is killed on shutdown.
    pub fn track_child(&self, name: impl Into<String>, child: Child) {
        self.lock().children.push((name.into(), child));
    }

    /// Tracks a closeable resource of the given kind.
    pub fn track_closeable(
        &self,
        name: impl Into<String>,
        kind: ResourceKind,
        resource: Arc<dyn Closeable>,
    ) {
        self.lock().closeables.push((name.into(), kind, resource));
    }

    /// Registers a custom cleanup callback, run last.
    pub fn register_cleanup(&self, name: impl Into<String>, callback: Arc<dyn ShutdownHandler>) {
        self.lock().custom.push((name.into(), callback));
    }

    /// Number of tracked resources per kind.
    pub fn counts(&self) -> BTreeMap<ResourceKind, usize> {
        let inner = self.lock();
        let mut counts = BTreeMap::new();
        let mut add = |kind, n: usize| {
            if n > 0 {
                *counts.entry(kind).or_insert(0) += n;
            }
        };
        add(ResourceKind::Task, inner.tasks.len());
        add(ResourceKind::Interval, inner.intervals.len());
        add(ResourceKind::ChildProcess, inner.children.len());
        add(ResourceKind::Custom, inner.custom.len());
        for (_, kind, _) in &inner.closeables {
            add(*kind, 1);
        }
        counts
    }

    /// Total tracked resources.
    pub fn len(&self) -> usize {
        self.counts().values().sum()
    }

    /// Returns true when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_all(&self) -> Vec<Pending> {
        let mut inner = self.lock();
        let mut pending: Vec<Pending> = Vec::new();
        pending.extend(inner.tasks.drain(..).map(|(n, h)| Pending::Task(n, h)));
        pending.extend(inner.intervals.drain(..).map(Pending::Interval));

        let mut closeables: Vec<_> = inner.closeables.drain(..).collect();
        closeables.sort_by_key(|(_, kind, _)| *kind);
        let (before_children, after_children): (Vec<_>, Vec<_>) = closeables
            .into_iter()
            .partition(|(_, kind, _)| *kind < ResourceKind::ChildProcess);
        pending.extend(before_children.into_iter().map(|(n, _, r)| Pending::Close(n, r)));
        pending.extend(inner.children.drain(..).map(|(n, c)| Pending::Child(n, c)));
        pending.extend(after_children.into_iter().map(|(n, _, r)| Pending::Close(n, r)));

        pending.extend(inner.custom.drain(..).map(|(n, c)| Pending::Custom(n, c)));
        pending
    }

    /// Releases every resource one at a time in release order, each bounded
    /// by `per_resource`.
    pub async fn release_sequential(&self, per_resource: Duration) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for pending in self.take_all() {
            let name = pending.name();
            match pending.release(per_resource).await {
                Ok(()) => report.released += 1,
                Err(e) => {
                    warn!(resource = %name, error = %e, "resource release failed");
                    report.failures.push((name, e));
                }
            }
        }
        debug!(released = report.released, failed = report.failures.len(), "resources released");
        report
    }

    /// Releases every resource concurrently, each bounded by `per_resource`.
    pub async fn release_concurrent(&self, per_resource: Duration) -> ReleaseReport {
        let handles: Vec<_> = self
            .take_all()
            .into_iter()
            .map(|pending| {
                let name = pending.name();
                (name, tokio::spawn(pending.release(per_resource)))
            })
            .collect();

        let mut report = ReleaseReport::default();
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => report.released += 1,
                Ok(Err(e)) => report.failures.push((name, e)),
                Err(e) => report.failures.push((name, e.to_string())),
            }
        }
        report
    }

    /// Synchronous teardown: aborts tasks, cancels intervals and starts
    /// killing children without waiting. Closeables and callbacks are
    /// dropped. Returns the number of resources touched.
    pub fn terminate_now(&self) -> usize {
        let mut touched = 0;
        for pending in self.take_all() {
            touched += 1;
            match pending {
                Pending::Task(_, handle) => handle.abort(),
                Pending::Interval(task) => task.cancel(),
                Pending::Child(name, mut child) => {
                    if let Err(e) = child.start_kill() {
                        warn!(child = %name, error = %e, "failed to signal child process");
                    }
                }
                Pending::Close(..) | Pending::Custom(..) => {}
            }
        }
        touched
    }

    /// Aborts tracked tasks and cancels intervals, leaving the rest in
    /// place. Used to clear pending timers during stack recovery.
    pub fn clear_timers(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.tasks.len() + inner.intervals.len();
        for (_, handle) in inner.tasks.drain(..) {
            handle.abort();
        }
        for task in inner.intervals.drain(..) {
            task.cancel();
        }
        count
    }
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("counts", &self.counts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        order: Arc<Mutex<Vec<String>>>,
        name: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Closeable for Recorder {
        async fn close(&self) -> Result<(), ServiceError> {
            self.order.lock().unwrap().push(self.name.to_string());
            if self.fail {
                Err(ServiceError::failed("close failed"))
            } else {
                Ok(())
            }
        }
    }

    fn recorder(order: &Arc<Mutex<Vec<String>>>, name: &'static str, fail: bool) -> Arc<dyn Closeable> {
        Arc::new(Recorder {
            order: Arc::clone(order),
            name,
            fail,
        })
    }

    #[tokio::test]
    async fn test_release_order_follows_kind() {
        let tracker = ResourceTracker::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        tracker.track_closeable("server", ResourceKind::Server, recorder(&order, "server", false));
        tracker.track_closeable("db", ResourceKind::Database, recorder(&order, "db", false));
        tracker.track_closeable("sock", ResourceKind::Socket, recorder(&order, "sock", false));

        let report = tracker.release_sequential(Duration::from_secs(1)).await;
        assert!(report.is_clean());
        assert_eq!(report.released, 3);
        assert_eq!(*order.lock().unwrap(), vec!["sock", "db", "server"]);
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_release() {
        let tracker = ResourceTracker::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        tracker.track_closeable("a", ResourceKind::Stream, recorder(&order, "a", true));
        tracker.track_closeable("b", ResourceKind::Stream, recorder(&order, "b", false));

        let report = tracker.release_sequential(Duration::from_secs(1)).await;
        assert_eq!(report.released, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "a");
    }

    #[tokio::test]
    async fn test_tasks_are_aborted() {
        let tracker = ResourceTracker::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        tracker.track_task("sleeper", handle);
        assert_eq!(tracker.counts().get(&ResourceKind::Task), Some(&1));

        let report = tracker.release_concurrent(Duration::from_secs(1)).await;
        assert_eq!(report.released, 1);
    }

    #[tokio::test]
    async fn test_custom_callbacks_run() {
        let tracker = ResourceTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        tracker.register_cleanup(
            "flush",
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Ok::<(), ServiceError>(()) }
            }),
        );

        tracker.release_sequential(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_timers_leaves_io_resources() {
        let tracker = ResourceTracker::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        tracker.track_task("t", tokio::spawn(async {}));
        tracker.track_interval(PeriodicTask::spawn("i", Duration::from_secs(60), || {}));
        tracker.track_closeable("db", ResourceKind::Database, recorder(&order, "db", false));

        assert_eq!(tracker.clear_timers(), 2);
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.terminate_now(), 1);
        assert!(tracker.is_empty());
    }
}
