//! Bounded worker pool with ordered, fail-fast reassembly.
//!
//! A call to [`WorkerPool::process_chunks`] feeds chunks through a shared
//! bounded queue to at most `worker_count` tasks. Every chunk yields exactly
//! one [`WorkResult`]; results are returned sorted by chunk index regardless
//! of completion order. The first failing chunk cancels the rest of the call.

use crate::error::{PipelineError, PipelineResult};
use crate::record::{Chunk, Record, WorkResult};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Fixed-size pool of chunk workers.
///
/// The pool itself holds no threads; each `process_chunks` call spawns its
/// own tokio tasks and joins or aborts them before returning. Shutdown is a
/// one-way `closed` flag plus a count of calls still in flight.
#[derive(Debug)]
pub struct WorkerPool {
    worker_count: usize,
    closed: AtomicBool,
    in_flight: AtomicUsize,
    drained: Notify,
}

/// Marks one `process_chunks` call as in flight for its whole lifetime.
struct InFlight<'a> {
    pool: &'a WorkerPool,
}

impl<'a> InFlight<'a> {
    fn enter(pool: &'a WorkerPool) -> Self {
        pool.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { pool }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.pool.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pool.drained.notify_waiters();
        }
    }
}

impl WorkerPool {
    /// Create a pool running at most `worker_count` tasks per call.
    pub fn new(worker_count: usize) -> PipelineResult<Self> {
        if worker_count == 0 {
            return Err(PipelineError::InvalidConfig(
                "worker count must be > 0".to_string(),
            ));
        }
        Ok(Self {
            worker_count,
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of `process_chunks` calls currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `task` over every chunk and return the results in chunk order.
    ///
    /// Fails with [`PipelineError::PoolClosed`] after [`close`](Self::close),
    /// with [`PipelineError::Cancelled`] when `cancel` fires, and otherwise
    /// with the first task error observed. A panicking task is reported as
    /// [`PipelineError::TaskPanic`]. On any failure no partial results are
    /// returned and the remaining workers are stopped.
    pub async fn process_chunks<F, Fut>(
        &self,
        cancel: &CancellationToken,
        chunks: Vec<Chunk>,
        task: F,
    ) -> PipelineResult<Vec<WorkResult>>
    where
        F: Fn(CancellationToken, Chunk) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PipelineResult<Vec<Record>>> + Send + 'static,
    {
        // Counted before the closed check so close_with_* cannot miss us.
        let _in_flight = InFlight::enter(self);
        if self.is_closed() {
            return Err(PipelineError::PoolClosed);
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let total = chunks.len();
        let workers = self.worker_count.min(total);
        tracing::debug!("Processing {} chunks on {} workers", total, workers);

        let child = cancel.child_token();
        let task = Arc::new(task);
        let (work_tx, work_rx) = async_channel::bounded::<Chunk>(workers);
        let (result_tx, mut result_rx) = mpsc::channel::<WorkResult>(workers);
        let mut tasks = JoinSet::new();

        // Dispatcher: feeds the queue in index order, stops early on cancel.
        {
            let child = child.clone();
            tasks.spawn(async move {
                for chunk in chunks {
                    tokio::select! {
                        biased;
                        _ = child.cancelled() => break,
                        sent = work_tx.send(chunk) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                work_tx.close();
            });
        }

        for _ in 0..workers {
            let child = child.clone();
            let task = task.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();

            tasks.spawn(async move {
                loop {
                    let chunk = tokio::select! {
                        biased;
                        _ = child.cancelled() => break,
                        chunk = work_rx.recv() => match chunk {
                            Ok(chunk) => chunk,
                            Err(_) => break,
                        },
                    };

                    let result = run_task(task.as_ref(), child.clone(), chunk).await;

                    tokio::select! {
                        biased;
                        _ = child.cancelled() => break,
                        sent = result_tx.send(result) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        drop(work_rx);
        drop(result_tx);

        match collect_results(cancel, &mut result_rx, total).await {
            Ok(mut results) => {
                while tasks.join_next().await.is_some() {}
                results.sort_by_key(|r| r.index);
                Ok(results)
            }
            Err(e) => {
                child.cancel();
                tasks.abort_all();
                if !e.is_cancellation() {
                    tracing::warn!("Worker pool call failed: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Mark the pool closed. Calls already running finish normally; new calls
    /// fail with [`PipelineError::PoolClosed`]. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("Worker pool closed");
        }
    }

    /// Close, then wait for in-flight calls to drain or `cancel` to fire.
    ///
    /// Only the first close waits; later calls return `Ok(())` immediately.
    pub async fn close_with_context(&self, cancel: &CancellationToken) -> PipelineResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = self.wait_drained() => Ok(()),
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        }
    }

    /// Close, then wait at most `timeout` for in-flight calls to drain.
    pub async fn close_with_timeout(&self, timeout: Duration) -> PipelineResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tokio::time::timeout(timeout, self.wait_drained())
            .await
            .map_err(|_| PipelineError::CloseTimeout(timeout))
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent drop cannot be missed.
            notified.as_mut().enable();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn run_task<F, Fut>(task: &F, token: CancellationToken, chunk: Chunk) -> WorkResult
where
    F: Fn(CancellationToken, Chunk) -> Fut,
    Fut: Future<Output = PipelineResult<Vec<Record>>>,
{
    let index = chunk.index();
    let outcome = AssertUnwindSafe(async move { task(token, chunk).await })
        .catch_unwind()
        .await;

    match outcome {
        Ok(Ok(data)) => WorkResult::success(index, data),
        Ok(Err(e)) => WorkResult::failure(index, e),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!("Task for chunk {} panicked: {}", index, message);
            WorkResult::failure(index, PipelineError::TaskPanic { index, message })
        }
    }
}

/// Gather `total` results, stopping at the first failure or cancellation.
async fn collect_results(
    cancel: &CancellationToken,
    results_rx: &mut mpsc::Receiver<WorkResult>,
    total: usize,
) -> PipelineResult<Vec<WorkResult>> {
    let mut results = Vec::with_capacity(total);
    while results.len() < total {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            received = results_rx.recv() => received,
        };

        match received {
            Some(WorkResult {
                error: Some(err), ..
            }) => {
                // A task that noticed the caller's cancellation is not a task failure.
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                return Err(err);
            }
            Some(result) => results.push(result),
            None => {
                if cancel.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                return Err(PipelineError::processing(
                    "worker_pool",
                    format!("workers exited after {} of {} results", results.len(), total),
                ));
            }
        }
    }
    Ok(results)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::record::record_from;
    use serde_json::json;

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| Chunk::new(i, i, vec![record_from([("i", json!(i))])]))
            .collect()
    }

    async fn identity(_cancel: CancellationToken, chunk: Chunk) -> PipelineResult<Vec<Record>> {
        Ok(chunk.into_data())
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = WorkerPool::new(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let pool = WorkerPool::new(4).unwrap();
        let results = pool
            .process_chunks(&CancellationToken::new(), Vec::new(), identity)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_more_workers_than_chunks() {
        let pool = WorkerPool::new(16).unwrap();
        let results = pool
            .process_chunks(&CancellationToken::new(), chunks(3), identity)
            .await
            .unwrap();
        let indices: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(results.iter().all(WorkResult::is_ok));
    }

    #[tokio::test]
    async fn test_already_cancelled() {
        let pool = WorkerPool::new(2).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pool.process_chunks(&cancel, chunks(3), identity).await.unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_without_running_tasks() {
        let pool = WorkerPool::new(2).unwrap();
        pool.close();
        pool.close();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let err = pool
            .process_chunks(&CancellationToken::new(), chunks(3), move |_, chunk| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(chunk.into_data()) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::PoolClosed));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_task_panic() {
        let pool = WorkerPool::new(2).unwrap();
        let err = pool
            .process_chunks(&CancellationToken::new(), chunks(4), |_, chunk| async move {
                if chunk.index() == 2 {
                    panic!("bad chunk");
                }
                Ok(chunk.into_data())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Processing);
        match err {
            PipelineError::TaskPanic { index, message } => {
                assert_eq!(index, 2);
                assert!(message.contains("bad chunk"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_close_with_timeout_waits_for_in_flight() {
        let pool = Arc::new(WorkerPool::new(2).unwrap());
        let running = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.process_chunks(&CancellationToken::new(), chunks(2), |_, chunk| async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(chunk.into_data())
                })
                .await
            })
        };
        while pool.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        pool.close_with_timeout(Duration::from_secs(5)).await.unwrap();
        assert_eq!(pool.in_flight(), 0);

        // Closing never interrupts the call that was already running.
        let results = running.await.unwrap().unwrap();
        assert_eq!(results.len(), 2);

        // Second close is a no-op.
        pool.close_with_timeout(Duration::from_millis(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_with_timeout_expires() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let cancel = CancellationToken::new();
        let running = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pool.process_chunks(&cancel, chunks(1), |token, chunk| async move {
                    token.cancelled().await;
                    Ok(chunk.into_data())
                })
                .await
            })
        };
        while pool.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let err = pool
            .close_with_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        cancel.cancel();
        assert!(running.await.unwrap().unwrap_err().is_cancellation());
    }

    #[tokio::test]
    async fn test_close_with_context_cancelled() {
        let pool = Arc::new(WorkerPool::new(1).unwrap());
        let work_cancel = CancellationToken::new();
        let running = {
            let pool = pool.clone();
            let work_cancel = work_cancel.clone();
            tokio::spawn(async move {
                pool.process_chunks(&work_cancel, chunks(1), |token, chunk| async move {
                    token.cancelled().await;
                    Ok(chunk.into_data())
                })
                .await
            })
        };
        while pool.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let close_cancel = CancellationToken::new();
        close_cancel.cancel();
        let err = pool.close_with_context(&close_cancel).await.unwrap_err();
        assert!(err.is_cancellation());
        assert!(pool.close_with_context(&close_cancel).await.is_ok());

        work_cancel.cancel();
        let _ = running.await.unwrap();
    }

    #[test]
    fn test_panic_message_payloads() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
