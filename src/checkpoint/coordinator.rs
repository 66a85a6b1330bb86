//! Async checkpoint coordinator
//!
//! Owns the two checkpoint pools: a lazily built rayon pool for the page
//! sort, and a bounded set of blocking workers that persist page batches.
//! A dedicated blocking thread drains the batch queue and dispatches one
//! task per batch; the returned [`Completion`] resolves once the queue is
//! drained and every dispatched task has finished.

use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::countdown::{Completion, CountDown};
use super::sort::{self, BatchMessage, BatchReceiver, BatchSender, SortHandle};
use super::{CheckpointScope, FullPageId};
use crate::config::CheckpointConfig;
use crate::error::{Error, Result};

/// Coordinates sorting and parallel persistence of checkpoint pages
pub struct AsyncCheckpointer {
    handle: Handle,
    workers: Arc<Semaphore>,
    worker_threads: usize,
    worker_tracker: TaskTracker,
    sort_tracker: TaskTracker,
    sort_pool: Mutex<Option<Arc<rayon::ThreadPool>>>,
    sort_threads: usize,
    batch_pages: usize,
    cancel: CancellationToken,
    worker_timeout: Duration,
    sort_timeout: Duration,
    shut_down: AtomicBool,
}

/// What the submission thread needs to dispatch batches
#[derive(Clone)]
struct Dispatcher {
    handle: Handle,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl AsyncCheckpointer {
    /// Create a coordinator on the current tokio runtime
    pub fn new(config: &CheckpointConfig) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Internal(format!("Checkpointer needs a tokio runtime: {}", e)))?;

        let worker_threads = config.worker_threads().max(1);

        tracing::info!(
            workers = worker_threads,
            batch_pages = config.batch_pages,
            "Checkpoint coordinator started"
        );

        Ok(Self {
            handle,
            workers: Arc::new(Semaphore::new(worker_threads)),
            worker_threads,
            worker_tracker: TaskTracker::new(),
            sort_tracker: TaskTracker::new(),
            sort_pool: Mutex::new(None),
            sort_threads: config.sort_pool_threads().max(1),
            batch_pages: config.batch_pages.max(1),
            cancel: CancellationToken::new(),
            worker_timeout: config.worker_shutdown_timeout(),
            sort_timeout: config.sort_shutdown_timeout(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Page write parallelism
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Maximum pages per batch
    pub fn batch_pages(&self) -> usize {
        self.batch_pages
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// The sort pool, built on first use
    fn sort_pool(&self) -> Result<Arc<rayon::ThreadPool>> {
        let mut slot = self.sort_pool.lock();
        if let Some(pool) = slot.as_ref() {
            return Ok(Arc::clone(pool));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.sort_threads)
            .thread_name(|i| format!("checkpoint-sort-{}", i))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build sort pool: {}", e)))?;
        let pool = Arc::new(pool);
        *slot = Some(Arc::clone(&pool));

        tracing::debug!(threads = self.sort_threads, "Created checkpoint sort pool");
        Ok(pool)
    }

    /// Sort the scope on the sort pool, feeding `queue` with batches
    ///
    /// `EndOfBatches` is pushed once every batch has been queued. A failed or
    /// cancelled sort closes the queue without it and reports the error
    /// through the handle.
    pub fn split_and_sort(&self, scope: &CheckpointScope, queue: BatchSender) -> Result<SortHandle> {
        if self.is_shut_down() {
            return Err(Error::ShuttingDown);
        }

        let pool = self.sort_pool()?;
        let mut pages = scope.to_vec();
        let batch_pages = self.batch_pages;
        let cancel = self.cancel.clone();
        let token = self.sort_tracker.token();
        let (tx, rx) = oneshot::channel();

        pool.spawn(move || {
            let _token = token;
            let result = sort::split_and_sort(&mut pages, batch_pages, &cancel, &queue);
            if result.is_ok() {
                let _ = queue.send(BatchMessage::EndOfBatches);
            }
            let _ = tx.send(result);
        });

        Ok(SortHandle::new(rx))
    }

    /// Drain `queue` and persist every batch with a task built by `factory`
    ///
    /// Batch failures do not stop other batches; the first one fails the
    /// returned completion. An interrupted drain fails it with
    /// [`Error::Interrupted`] once the batches already dispatched are done.
    pub fn submit_batches<F, T>(&self, sort: SortHandle, queue: BatchReceiver, factory: F) -> Completion
    where
        F: Fn(Vec<FullPageId>) -> T + Send + 'static,
        T: FnOnce() -> Result<()> + Send + 'static,
    {
        let (countdown, completion) = CountDown::new(1);
        let dispatcher = Dispatcher {
            handle: self.handle.clone(),
            workers: Arc::clone(&self.workers),
            tracker: self.worker_tracker.clone(),
            cancel: self.cancel.clone(),
        };

        self.handle.spawn_blocking(move || {
            let mut queue = queue;
            let result = dispatcher.drain(sort, &mut queue, &factory, &countdown);
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Checkpoint batch submission stopped");
            }
            countdown.on_done(result);
        });

        completion
    }

    /// Stop both pools
    ///
    /// Cancels the sort and any submission loop, stops accepting page write
    /// tasks, then waits (bounded) for in-flight writes and for the sort
    /// pool. Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!("Checkpoint coordinator already shut down");
            return;
        }

        self.cancel.cancel();

        self.worker_tracker.close();
        if tokio::time::timeout(self.worker_timeout, self.worker_tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pending = self.worker_tracker.len(),
                timeout_secs = self.worker_timeout.as_secs(),
                "Timed out waiting for checkpoint writers"
            );
        }

        let pool = self.sort_pool.lock().take();
        self.sort_tracker.close();
        if tokio::time::timeout(self.sort_timeout, self.sort_tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_secs = self.sort_timeout.as_secs(),
                "Timed out waiting for checkpoint sort pool"
            );
        }
        drop(pool);

        tracing::info!("Checkpoint coordinator stopped");
    }
}

impl Dispatcher {
    /// Submission loop, run on a blocking thread
    fn drain<F, T>(
        &self,
        sort: SortHandle,
        queue: &mut BatchReceiver,
        factory: &F,
        countdown: &CountDown,
    ) -> Result<()>
    where
        F: Fn(Vec<FullPageId>) -> T,
        T: FnOnce() -> Result<()> + Send + 'static,
    {
        let mut batch = 0usize;

        loop {
            let message = self.handle.block_on(async {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    message = queue.recv() => Some(message),
                }
            });

            match message {
                None => return Err(Error::Interrupted),
                Some(Some(BatchMessage::Batch(pages))) => {
                    countdown.increment();
                    let len = pages.len();
                    let task = factory(pages);
                    self.dispatch(batch, len, task, countdown.clone());
                    batch += 1;
                }
                Some(Some(BatchMessage::EndOfBatches)) => break,
                Some(None) => {
                    // Producer gone without the end marker
                    return match self.handle.block_on(sort.wait()) {
                        Err(e) => Err(e),
                        Ok(_) => Err(Error::Internal(
                            "Batch queue closed before end of batches".into(),
                        )),
                    };
                }
            }
        }

        let produced = self.handle.block_on(sort.wait())?;
        tracing::debug!(batches = batch, produced = produced, "Checkpoint batches dispatched");
        Ok(())
    }

    /// Run one batch on a worker, or inline when the workers are closed
    fn dispatch<T>(&self, batch: usize, pages: usize, task: T, countdown: CountDown)
    where
        T: FnOnce() -> Result<()> + Send + 'static,
    {
        let run = move || run_batch(batch, pages, task);

        if self.tracker.is_closed() {
            tracing::debug!(batch = batch, "Worker pool closed, writing batch on submitting thread");
            countdown.on_done(run());
            return;
        }

        let workers = Arc::clone(&self.workers);
        self.tracker.spawn_on(
            async move {
                let result = match workers.acquire_owned().await {
                    Ok(permit) => tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        run()
                    })
                    .await
                    .unwrap_or_else(|e| {
                        Err(Error::CheckpointFailed {
                            pages,
                            batch,
                            reason: format!("worker aborted: {}", e),
                        })
                    }),
                    Err(_) => Err(Error::ShuttingDown),
                };
                countdown.on_done(result);
            },
            &self.handle,
        );
    }
}

/// Persist one batch, turning failures and panics into a contextual error
fn run_batch<T>(batch: usize, pages: usize, task: T) -> Result<()>
where
    T: FnOnce() -> Result<()>,
{
    let result = match std::panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(result) => result,
        Err(_) => Err(Error::Internal("page write task panicked".into())),
    };

    result.map_err(|e| {
        tracing::error!(batch = batch, pages = pages, error = %e, "Checkpoint batch failed");
        match e {
            Error::CheckpointFailed { .. } => e,
            other => Error::CheckpointFailed {
                pages,
                batch,
                reason: other.to_string(),
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::sort::batch_channel;
    use std::sync::atomic::AtomicUsize;

    fn test_config(threads: usize) -> CheckpointConfig {
        CheckpointConfig {
            threads,
            sort_threads: 2,
            batch_pages: 16,
            worker_shutdown_timeout_secs: 5,
            sort_shutdown_timeout_secs: 1,
            ..Default::default()
        }
    }

    fn scope(groups: i32, per_group: u32) -> CheckpointScope {
        let mut scope = CheckpointScope::new();
        for g in 0..groups {
            scope.add_group(g, (0..per_group).rev());
        }
        scope
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_batch_is_persisted() {
        let coordinator = AsyncCheckpointer::new(&test_config(4)).unwrap();
        let scope = scope(3, 100);

        let written = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = batch_channel();
        let sort = coordinator.split_and_sort(&scope, tx).unwrap();

        let sink = Arc::clone(&written);
        let completion = coordinator.submit_batches(sort, rx, move |batch| {
            let sink = Arc::clone(&sink);
            move || {
                assert!(batch.windows(2).all(|w| w[0] < w[1]));
                sink.lock().push(batch);
                Ok(())
            }
        });
        completion.wait().await.unwrap();

        let batches = written.lock();
        let mut all: Vec<FullPageId> = batches.iter().flatten().copied().collect();
        all.sort();
        assert_eq!(all, {
            let mut expected = scope.to_vec();
            expected.sort();
            expected
        });
        assert!(batches.iter().all(|b| b.len() <= 16));

        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_marker_stops_submission_after_k_batches() {
        let coordinator = AsyncCheckpointer::new(&test_config(2)).unwrap();
        let (tx, rx) = batch_channel();
        for i in 0..5u32 {
            tx.send(BatchMessage::Batch(vec![FullPageId::new(1, i)])).unwrap();
        }
        tx.send(BatchMessage::EndOfBatches).unwrap();
        // Anything after the end marker is never taken
        tx.send(BatchMessage::Batch(vec![FullPageId::new(9, 9)])).unwrap();

        let created = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let (c, r) = (Arc::clone(&created), Arc::clone(&ran));
        let completion = coordinator.submit_batches(SortHandle::completed(5), rx, move |_batch| {
            c.fetch_add(1, Ordering::SeqCst);
            let r = Arc::clone(&r);
            move || {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        completion.wait().await.unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 5);
        assert_eq!(ran.load(Ordering::SeqCst), 5);

        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_batch_fails_checkpoint_but_not_siblings() {
        let coordinator = AsyncCheckpointer::new(&test_config(4)).unwrap();
        let (tx, rx) = batch_channel();
        for i in 0..8u32 {
            tx.send(BatchMessage::Batch(vec![FullPageId::new(0, i); 3])).unwrap();
        }
        tx.send(BatchMessage::EndOfBatches).unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let completion = coordinator.submit_batches(SortHandle::completed(8), rx, move |batch| {
            let r = Arc::clone(&r);
            move || {
                r.fetch_add(1, Ordering::SeqCst);
                if batch[0].page_idx == 3 {
                    return Err(Error::PageStore("short write".into()));
                }
                Ok(())
            }
        });

        let err = completion.wait().await.unwrap_err();
        match err {
            Error::CheckpointFailed { pages, batch, .. } => {
                assert_eq!(pages, 3);
                assert_eq!(batch, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 8);

        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completion_waits_for_slow_batches() {
        let coordinator = AsyncCheckpointer::new(&test_config(4)).unwrap();
        let (tx, rx) = batch_channel();

        let finished = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&finished);
        let mut completion = coordinator.submit_batches(SortHandle::completed(4), rx, move |batch| {
            let f = Arc::clone(&f);
            move || {
                std::thread::sleep(Duration::from_millis(20 * batch[0].page_idx as u64));
                f.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        for i in (0..4u32).rev() {
            tx.send(BatchMessage::Batch(vec![FullPageId::new(0, i)])).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(completion.try_result().is_none());

        tx.send(BatchMessage::EndOfBatches).unwrap();
        completion.await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 4);

        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_interrupts_submission() {
        let coordinator = AsyncCheckpointer::new(&test_config(2)).unwrap();
        let (_tx, rx) = batch_channel();

        let completion =
            coordinator.submit_batches(SortHandle::completed(0), rx, |_batch| || Ok(()));

        coordinator.shutdown().await;
        let err = completion.wait().await.unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_is_idempotent() {
        let coordinator = AsyncCheckpointer::new(&test_config(2)).unwrap();
        coordinator.sort_pool().unwrap();

        coordinator.shutdown().await;
        coordinator.shutdown().await;

        assert!(coordinator.is_shut_down());
        assert!(coordinator.sort_pool.lock().is_none());
        let (tx, _rx) = batch_channel();
        assert!(matches!(
            coordinator.split_and_sort(&scope(1, 4), tx),
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_closed_pool_runs_batch_inline() {
        let coordinator = AsyncCheckpointer::new(&test_config(2)).unwrap();
        coordinator.shutdown().await;

        let dispatcher = Dispatcher {
            handle: Handle::current(),
            workers: Arc::clone(&coordinator.workers),
            tracker: coordinator.worker_tracker.clone(),
            cancel: CancellationToken::new(),
        };

        let caller = std::thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&ran_on);

        let (countdown, mut completion) = CountDown::new(1);
        dispatcher.dispatch(
            0,
            1,
            move || {
                *slot.lock() = Some(std::thread::current().id());
                Ok(())
            },
            countdown,
        );

        // Ran synchronously before dispatch returned
        assert_eq!(*ran_on.lock(), Some(caller));
        assert!(completion.try_result().unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sort_pool_created_once() {
        let coordinator = Arc::new(AsyncCheckpointer::new(&test_config(2)).unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&coordinator);
            handles.push(std::thread::spawn(move || c.sort_pool().unwrap()));
        }
        let pools: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(pools.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

        coordinator.shutdown().await;
    }
}
