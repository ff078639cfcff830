//! # Worker Pool
//!
//! Bounded fan-out of blocking tasks with fan-in over a channel.
//!
//! ```text
//!   tasks ──► queue ──► worker 0 ─┐
//!                  ├──► worker 1 ─┼──► results ──► collector
//!                  └──► worker N ─┘
//! ```
//!
//! Each task runs on tokio's blocking pool. The first failure (error or panic)
//! cancels the remaining workers and is returned; a cancelled caller token stops
//! the collector immediately. Results come back in completion order; callers
//! restore input order themselves.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("batch cancelled")]
    Cancelled,
    #[error("worker {worker} panicked")]
    Panicked { worker: usize },
    #[error(transparent)]
    Task(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Runs `work` over every task; all-or-nothing.
    #[instrument(level = "debug", skip_all, fields(tasks = tasks.len(), workers = self.workers))]
    pub async fn run<T, R, F>(
        &self,
        tasks: Vec<T>,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<Vec<R>, PoolError>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }
        let total = tasks.len();
        if total == 0 {
            return Ok(Vec::new());
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let work = Arc::new(work);
        let pool_cancel = cancel.child_token();
        let (result_tx, mut result_rx) = mpsc::channel(total);

        for worker in 0..self.workers.min(total) {
            let queue = Arc::clone(&queue);
            let work = Arc::clone(&work);
            let cancel = pool_cancel.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        debug!(worker, "worker cancelled");
                        break;
                    }
                    let next = queue.lock().pop_front();
                    let Some(task) = next else {
                        break;
                    };
                    let work = Arc::clone(&work);
                    let handle = tokio::task::spawn_blocking(move || work(task));
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(worker, "worker cancelled mid-task");
                            break;
                        }
                        joined = handle => match joined {
                            Ok(result) => result.map_err(PoolError::Task),
                            Err(err) if err.is_panic() => {
                                warn!(worker, "worker panicked");
                                Err(PoolError::Panicked { worker })
                            }
                            Err(err) => Err(PoolError::Task(anyhow::Error::new(err))),
                        },
                    };
                    let failed = outcome.is_err();
                    if result_tx.send(outcome).await.is_err() || failed {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut results = Vec::with_capacity(total);
        while results.len() < total {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pool_cancel.cancel();
                    return Err(PoolError::Cancelled);
                }
                message = result_rx.recv() => match message {
                    Some(Ok(result)) => results.push(result),
                    Some(Err(err)) => {
                        warn!(error = %err, "batch task failed, cancelling remaining workers");
                        pool_cancel.cancel();
                        return Err(err);
                    }
                    None if cancel.is_cancelled() => return Err(PoolError::Cancelled),
                    None => {
                        return Err(PoolError::Task(anyhow::anyhow!(
                            "workers exited with {} of {} tasks unfinished",
                            total - results.len(),
                            total
                        )));
                    }
                },
            }
        }
        Ok(results)
    }
}

/// Child of `parent` that is also cancelled once `timeout` elapses.
pub fn deadline_token(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let child = parent.child_token();
    let guard = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => guard.cancel(),
            _ = guard.cancelled() => {}
        }
    });
    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn runs_every_task() {
        let pool = WorkerPool::new(3);
        let cancel = CancellationToken::new();
        let mut results = pool
            .run((0..10).collect(), &cancel, |n: u32| Ok(n * 2))
            .await
            .unwrap();
        results.sort_unstable();
        assert_eq!(results, (0..10).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn empty_batch_is_ok() {
        let pool = WorkerPool::new(2);
        let results: Vec<u8> = pool
            .run(Vec::<u8>::new(), &CancellationToken::new(), Ok)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_error_stops_the_batch() {
        let pool = WorkerPool::new(1);
        let executed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&executed);
        let err = pool
            .run((0..20).collect(), &CancellationToken::new(), move |n: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
                if n == 2 {
                    anyhow::bail!("shard {n} unavailable");
                }
                Ok(n)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Task(_)));
        assert!(err.to_string().contains("shard 2 unavailable"));
        assert!(executed.load(Ordering::SeqCst) < 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panics_become_task_failures() {
        let pool = WorkerPool::new(2);
        let err = pool
            .run(vec![1u32, 2, 3], &CancellationToken::new(), |n| {
                if n == 2 {
                    panic!("boom");
                }
                Ok(n)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Panicked { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn caller_cancellation_returns_promptly() {
        let pool = WorkerPool::new(2);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = pool
            .run(vec![1u32, 2, 3, 4], &cancel, |n| {
                std::thread::sleep(Duration::from_millis(300));
                Ok(n)
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Cancelled));
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancellation_is_never_reported_as_a_task_failure() {
        let pool = WorkerPool::new(8);
        for _ in 0..50 {
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                trigger.cancel();
            });
            let err = pool
                .run((0..8u32).collect(), &cancel, |n| {
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(n)
                })
                .await
                .unwrap_err();
            assert!(matches!(err, PoolError::Cancelled), "got {err}");
        }
    }

    #[tokio::test]
    async fn already_cancelled_token_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = WorkerPool::new(2)
            .run(vec![1u8], &cancel, Ok)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Cancelled));
    }

    #[tokio::test]
    async fn deadline_token_fires_without_touching_parent() {
        let parent = CancellationToken::new();
        let child = deadline_token(&parent, Duration::from_millis(10));
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .unwrap();
        assert!(!parent.is_cancelled());
    }
}
