//! The ordered runner.

use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::RunnerError;

/// How often idle workers and the delivery loop re-check the pause flag.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared pause flag of a runner.
///
/// Pausing is cooperative: workers finish the task they are running, then
/// idle until resumed. No result is delivered while paused.
#[derive(Debug, Clone, Default)]
pub struct PauseHandle {
    paused: Arc<AtomicBool>,
}

impl PauseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            debug!("Runner paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!("Runner resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn wait_while_paused(&self) {
        while self.is_paused() {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
    }
}

/// Runs tasks with bounded concurrency and delivers results in order.
#[derive(Debug, Clone)]
pub struct OrderedRunner {
    concurrency: usize,
    pause: PauseHandle,
    cancel: CancellationToken,
}

impl OrderedRunner {
    /// Create a runner executing at most `concurrency` tasks at once.
    /// A concurrency of zero is treated as one.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            pause: PauseHandle::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the run when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Handle for pausing and resuming from other tasks.
    pub fn pause_handle(&self) -> PauseHandle {
        self.pause.clone()
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    /// Run `work` over every task and call `on_finish(result, index)` in
    /// submission order.
    ///
    /// Returns once every task has finished and its result was delivered.
    /// A panicking task fails the run and aborts the remaining workers.
    pub async fn run<T, R, W, Fut, F>(
        &self,
        tasks: Vec<T>,
        work: W,
        mut on_finish: F,
    ) -> Result<(), RunnerError>
    where
        T: Send + 'static,
        R: Send + 'static,
        W: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        F: FnMut(R, usize),
    {
        let total = tasks.len();
        if total == 0 {
            return Ok(());
        }

        let queue = Arc::new(Mutex::new(
            tasks.into_iter().enumerate().collect::<VecDeque<_>>(),
        ));
        let work = Arc::new(work);
        let (results_tx, mut results_rx) = mpsc::unbounded_channel();

        let mut workers = JoinSet::new();
        for worker_id in 0..self.concurrency.min(total) {
            let queue = queue.clone();
            let work = work.clone();
            let results = results_tx.clone();
            let pause = self.pause.clone();
            workers.spawn(async move {
                loop {
                    pause.wait_while_paused().await;
                    let Some((index, task)) = queue.lock().pop_front() else {
                        break;
                    };
                    trace!(worker_id, index, "Task started");
                    let result = work(task).await;
                    if results.send((index, result)).is_err() {
                        break;
                    }
                }
                trace!(worker_id, "Worker finished");
            });
        }
        drop(results_tx);

        let mut pending = BTreeMap::new();
        let mut next = 0usize;

        while next < total {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    workers.abort_all();
                    return Err(RunnerError::Cancelled { delivered: next, total });
                }
                Some((index, result)) = results_rx.recv() => {
                    pending.insert(index, result);
                }
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined
                        && e.is_panic()
                    {
                        warn!(error = %e, "Runner worker panicked");
                        workers.abort_all();
                        return Err(RunnerError::WorkerPanicked(e.to_string()));
                    }
                }
                _ = tokio::time::sleep(PAUSE_POLL_INTERVAL), if self.pause.is_paused() => {}
                else => break,
            }

            if self.pause.is_paused() {
                continue;
            }
            while let Some(result) = pending.remove(&next) {
                on_finish(result, next);
                next += 1;
            }
        }

        if next < total {
            return Err(RunnerError::Incomplete {
                delivered: next,
                total,
            });
        }
        debug!(total, "All results delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeping_work(delay_ms: u64) -> impl Future<Output = u64> {
        async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            delay_ms
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_delivered_in_submission_order() {
        let runner = OrderedRunner::new(2);
        let mut delivered = Vec::new();

        runner
            .run(vec![300, 100, 200, 50], sleeping_work, |result, index| {
                delivered.push((index, result))
            })
            .await
            .unwrap();

        assert_eq!(delivered, vec![(0, 300), (1, 100), (2, 200), (3, 50)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let runner = OrderedRunner::new(3);

        let work = {
            let running = running.clone();
            let peak = peak.clone();
            move |delay: u64| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }
            }
        };
        let mut count = 0;
        runner
            .run(vec![10u64; 12], work, |_, _| count += 1)
            .await
            .unwrap();

        assert_eq!(count, 12);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_run_completes() {
        let runner = OrderedRunner::new(4);
        let mut called = false;
        runner
            .run(Vec::<u64>::new(), sleeping_work, |_, _| called = true)
            .await
            .unwrap();
        assert!(!called);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_panic_fails_run() {
        let runner = OrderedRunner::new(2);
        let result = runner
            .run(
                vec![1u64, 2, 3],
                |n| async move {
                    if n == 2 {
                        panic!("bad task");
                    }
                    n
                },
                |_, _| {},
            )
            .await;
        assert!(matches!(result, Err(RunnerError::WorkerPanicked(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_run() {
        let token = CancellationToken::new();
        let runner = OrderedRunner::new(1).with_cancellation(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            token.cancel();
        });
        let mut delivered = 0;
        let result = runner
            .run(vec![100u64; 5], sleeping_work, |_, _| delivered += 1)
            .await;
        canceller.await.unwrap();

        assert!(matches!(
            result,
            Err(RunnerError::Cancelled {
                delivered: 1,
                total: 5
            })
        ));
        assert_eq!(delivered, 1);
    }
}
