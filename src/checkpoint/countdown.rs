//! Checkpoint completion tracking
//!
//! An outstanding-task counter that resolves a single [`Completion`] when it
//! drops to zero. The submission loop holds one count for itself, so the
//! completion cannot fire while batches are still being dispatched, however
//! fast they finish.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

use crate::error::{Error, Result};

struct Inner {
    outstanding: AtomicUsize,
    failures: AtomicUsize,
    first_error: Mutex<Option<Error>>,
    done: Mutex<Option<oneshot::Sender<Result<()>>>>,
}

/// Counter of outstanding checkpoint tasks
#[derive(Clone)]
pub struct CountDown {
    inner: Arc<Inner>,
}

/// Resolves once when the counter reaches zero
pub struct Completion {
    rx: oneshot::Receiver<Result<()>>,
}

impl CountDown {
    /// Create a counter starting at `initial`
    ///
    /// A counter starting at zero is complete immediately.
    pub fn new(initial: usize) -> (CountDown, Completion) {
        let (tx, rx) = oneshot::channel();
        let countdown = CountDown {
            inner: Arc::new(Inner {
                outstanding: AtomicUsize::new(initial),
                failures: AtomicUsize::new(0),
                first_error: Mutex::new(None),
                done: Mutex::new(Some(tx)),
            }),
        };
        if initial == 0 {
            countdown.complete();
        }
        (countdown, Completion { rx })
    }

    /// Register one more outstanding task
    pub fn increment(&self) {
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Record that one task finished
    pub fn on_done(&self, result: Result<()>) {
        if let Err(e) = result {
            self.inner.failures.fetch_add(1, Ordering::AcqRel);
            let mut first = self.inner.first_error.lock();
            if first.is_none() {
                *first = Some(e);
            }
        }

        let previous = self
            .inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        match previous {
            Ok(1) => self.complete(),
            Ok(_) => {}
            Err(_) => tracing::error!("Checkpoint countdown completed more tasks than it counted"),
        }
    }

    /// Outstanding tasks
    pub fn remaining(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Failed tasks so far
    pub fn failures(&self) -> usize {
        self.inner.failures.load(Ordering::Acquire)
    }

    fn complete(&self) {
        let Some(tx) = self.inner.done.lock().take() else {
            return;
        };
        let result = match self.inner.first_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        let _ = tx.send(result);
    }
}

impl Completion {
    /// Wait for every counted task
    pub async fn wait(self) -> Result<()> {
        self.await
    }

    /// Result if already complete
    pub fn try_result(&mut self) -> Option<Result<()>> {
        self.rx.try_recv().ok()
    }
}

impl Future for Completion {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(Error::Internal("Checkpoint countdown dropped".into())))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;

    #[test]
    fn test_completes_only_at_zero() {
        let (countdown, mut completion) = CountDown::new(1);
        countdown.increment();
        countdown.increment();

        countdown.on_done(Ok(()));
        countdown.on_done(Ok(()));
        assert!(completion.try_result().is_none());
        assert_eq!(countdown.remaining(), 1);

        // The submission loop's own count
        countdown.on_done(Ok(()));
        assert!(completion.try_result().unwrap().is_ok());
    }

    #[test]
    fn test_batches_finishing_before_loop_ends() {
        let (countdown, mut completion) = CountDown::new(1);
        for _ in 0..10 {
            countdown.increment();
            countdown.on_done(Ok(()));
            assert!(completion.try_result().is_none());
        }
        countdown.on_done(Ok(()));
        assert!(completion.try_result().unwrap().is_ok());
    }

    #[test]
    fn test_first_failure_wins() {
        let (countdown, completion) = CountDown::new(1);
        countdown.increment();
        countdown.increment();

        countdown.on_done(Err(Error::CheckpointFailed {
            pages: 4,
            batch: 1,
            reason: "disk full".into(),
        }));
        countdown.on_done(Err(Error::Checkpoint("second".into())));
        countdown.on_done(Ok(()));
        assert_eq!(countdown.failures(), 2);

        let err = futures::executor::block_on(completion.wait()).unwrap_err();
        assert!(matches!(err, Error::CheckpointFailed { batch: 1, .. }));
    }

    #[test]
    fn test_extra_done_is_ignored() {
        let (countdown, mut completion) = CountDown::new(1);
        countdown.on_done(Ok(()));
        countdown.on_done(Ok(()));
        assert_eq!(countdown.remaining(), 0);
        assert!(completion.try_result().unwrap().is_ok());
    }

    #[test]
    fn test_zero_start_is_complete() {
        let (_countdown, mut completion) = CountDown::new(0);
        assert!(completion.try_result().unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_threads_complete_once() {
        const TASKS: usize = 200;

        let (countdown, completion) = CountDown::new(1);
        let mut delays: Vec<u64> = (0..TASKS as u64).map(|i| i % 7).collect();
        delays.shuffle(&mut rand::thread_rng());

        let mut handles = Vec::new();
        for delay in delays {
            countdown.increment();
            let cd = countdown.clone();
            handles.push(std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(delay));
                cd.on_done(Ok(()));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(countdown.remaining(), 1);

        countdown.on_done(Ok(()));
        completion.wait().await.unwrap();
        assert_eq!(countdown.remaining(), 0);
    }
}
