//! FIFO serialization of consistency-sensitive operations.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};

type Job = BoxFuture<'static, ()>;

/// Runs queued tasks strictly one at a time, in the order they were queued.
///
/// A task is queued by [`CriticalSection::sync`] itself, not when its handle is
/// first polled. Dropping a handle does not cancel the task. A failing (or
/// panicking) task only fails its own handle.
///
/// Must be created inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct CriticalSection {
    queue: mpsc::UnboundedSender<Job>,
}

impl CriticalSection {
    pub fn new() -> Self {
        let (queue, mut jobs) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = jobs.recv().await {
                job.await;
            }
        });
        Self { queue }
    }

    pub fn sync<F, T>(&self, task: F) -> TaskHandle<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (done, result) = oneshot::channel();
        let job = async move {
            let outcome = AssertUnwindSafe(task)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(Error::Other("critical section task panicked".into())));
            let _ = done.send(outcome);
        }
        .boxed();

        if self.queue.send(job).is_err() {
            tracing::error!("critical section worker is gone");
        }
        TaskHandle { result }
    }
}

impl Default for CriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

/// Eventual result of a task queued on a [`CriticalSection`]
#[derive(Debug)]
pub struct TaskHandle<T> {
    result: oneshot::Receiver<Result<T>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(Error::Other("critical section stopped".into())))
        })
    }
}
