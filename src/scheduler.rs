// src/scheduler.rs

use dashmap::DashMap;
use log::debug;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub type TaskId = u64;

/// Resolves once `shutdown` reads `true`, or its sender is gone.
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Delayed one-shot tasks that can be cancelled one by one or all at once.
///
/// After [`shutdown`](Self::shutdown) nothing new is accepted and nothing
/// still waiting will run.
pub struct TaskScheduler {
    shutdown: watch::Sender<bool>,
    pending: Arc<DashMap<TaskId, JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskScheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            pending: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Runs `task` after `delay`. Returns `None` once the scheduler is shut down.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> Option<TaskId>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut stop = self.shutdown.subscribe();
        let pending = Arc::clone(&self.pending);

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => task.await,
                _ = shutdown_signalled(&mut stop) => debug!("Scheduled task {} cancelled", id),
            }
            pending.remove(&id);
        });
        if !handle.is_finished() {
            self.pending.insert(id, handle);
        }
        Some(id)
    }

    pub fn cancel(&self, id: TaskId) -> bool {
        match self.pending.remove(&id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Tasks that have not run yet.
    pub fn pending_count(&self) -> usize {
        self.pending.retain(|_, h| !h.is_finished());
        self.pending.len()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Cancels everything still waiting and refuses new work.
    pub fn shutdown(&self) -> usize {
        self.shutdown.send_replace(true);
        let ids: Vec<TaskId> = self.pending.iter().map(|e| *e.key()).collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, handle)) = self.pending.remove(&id) {
                if !handle.is_finished() {
                    cancelled += 1;
                }
                handle.abort();
            }
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_runs_after_delay() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        scheduler
            .schedule(Duration::from_millis(20), async move {
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_and_shutdown() {
        let scheduler = TaskScheduler::new();
        let ran = Arc::new(AtomicU64::new(0));

        let r = Arc::clone(&ran);
        let first = scheduler
            .schedule(Duration::from_millis(50), async move {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let r = Arc::clone(&ran);
        scheduler.schedule(Duration::from_millis(50), async move {
            r.fetch_add(1, Ordering::SeqCst);
        });

        assert!(scheduler.cancel(first));
        assert!(!scheduler.cancel(first));
        assert_eq!(scheduler.shutdown(), 1);
        assert!(scheduler
            .schedule(Duration::ZERO, async {})
            .is_none());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
