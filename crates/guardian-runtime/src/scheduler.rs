//! Cancellable periodic tasks.
//!
//! Monitors never hold a raw timer. They hold a [`PeriodicTask`], which owns
//! the spawned loop and a stop signal. Cancelling lets an in-flight tick
//! finish and prevents any further tick; dropping the handle aborts the
//! loop outright.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a fixed-interval task running on the tokio runtime.
///
/// # Example
///
/// ```rust
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use std::time::Duration;
/// use guardian_runtime::PeriodicTask;
///
/// let task = PeriodicTask::spawn("noop", Duration::from_millis(5), || {});
/// tokio::time::sleep(Duration::from_millis(20)).await;
/// task.cancel();
/// # }
/// ```
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
    ticks: Arc<AtomicU64>,
}

impl PeriodicTask {
    /// Spawns a task calling the synchronous `tick` every `period`.
    ///
    /// The first call happens one full period after spawning.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<F>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn_async(name, period, move || {
            tick();
            std::future::ready(())
        })
    }

    /// Spawns a task awaiting the future returned by `tick` every `period`.
    ///
    /// Ticks never overlap: a slow tick delays the next one.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn_async<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let (stop, mut stop_rx) = watch::channel(false);
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);
        let task_name = name.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a tokio interval completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        tick().await;
                        counter.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            debug!(task = %task_name, "periodic task stopped");
        });

        debug!(task = %name, period_ms = period.as_millis() as u64, "periodic task started");
        Self {
            name,
            stop,
            handle,
            ticks,
        }
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of completed ticks.
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Returns true until the loop has exited.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops scheduling further ticks. An in-flight tick runs to completion.
    pub fn cancel(&self) {
        let _ = self.stop.send(true);
    }

    /// Cancels and waits for the loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel();
        let _ = (&mut self.handle).await;
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_period() {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let task = PeriodicTask::spawn("counter", Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(task.tick_count(), 3);
        task.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_future_ticks() {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let task = PeriodicTask::spawn("counter", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(25)).await;
        task.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let seen = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(hits.load(Ordering::SeqCst), seen);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_ticks_do_not_overlap() {
        let active = Arc::new(AtomicU64::new(0));
        let max_seen = Arc::new(AtomicU64::new(0));
        let (a, m) = (Arc::clone(&active), Arc::clone(&max_seen));
        let task = PeriodicTask::spawn_async("slow", Duration::from_millis(10), move || {
            let (a, m) = (Arc::clone(&a), Arc::clone(&m));
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                m.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(25)).await;
                a.fetch_sub(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        task.shutdown().await;
    }
}
