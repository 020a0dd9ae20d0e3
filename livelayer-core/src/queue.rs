//! A concurrency-limited task queue.

use std::{fmt, future::Future, sync::Arc};
use mea::semaphore::Semaphore;


/// Runs futures with at most `permits` of them in flight at once.
///
/// Clones share the same limit. A queue with a single permit serializes every task
/// submitted through it, in submission order.
#[derive(Clone)]
pub struct TaskQueue {
    permits: usize,
    semaphore: Arc<Semaphore>,
}

impl TaskQueue {
    /// Creates a queue admitting `permits` concurrent tasks (at least one).
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);

        Self {
            permits,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Waits for a free slot, then drives `task` to completion while holding it.
    pub async fn run<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.semaphore.acquire(1).await;
        task.await
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(1)
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("permits", &self.permits)
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_limits_concurrency() {
        let queue = TaskQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..6).map(|_| {
            let queue = queue.clone();
            let running = running.clone();
            let peak = peak.clone();

            async move {
                queue
                    .run(async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }
        });

        futures::future::join_all(tasks).await;

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_permits_is_clamped() {
        assert_eq!(TaskQueue::new(0).permits(), 1);
    }
}
