//! Run a dynamic set of tasks under one scope: the first error tears the
//! scope down, and dropping the runner cancels everything at its next
//! suspension point. Long-lived activities compose with `tokio::try_join!`
//! around [`TaskRunner::run`].

use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use std::future::Future;
use tokio::sync::mpsc;

use crate::error::NagareResult;

#[derive(Clone)]
pub struct TaskGroup {
    tx: mpsc::UnboundedSender<BoxFuture<'static, NagareResult<()>>>,
}

impl TaskGroup {
    pub fn new() -> (Self, TaskRunner) {
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = TaskRunner {
            rx,
            tasks: FuturesUnordered::new(),
        };
        (Self { tx }, runner)
    }

    /// Add a task to the scope. A task spawned after the runner is gone is
    /// dropped unpolled, matching a scope that has already terminated.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = NagareResult<()>> + Send + 'static,
    {
        let _ = self.tx.send(task.boxed());
    }
}

pub struct TaskRunner {
    rx: mpsc::UnboundedReceiver<BoxFuture<'static, NagareResult<()>>>,
    tasks: FuturesUnordered<BoxFuture<'static, NagareResult<()>>>,
}

impl TaskRunner {
    /// Drive every task in the scope. Returns the first task error, or `Ok`
    /// once all spawners are dropped and every task has finished.
    pub async fn run(mut self) -> NagareResult<()> {
        loop {
            tokio::select! {
                task = self.rx.recv() => match task {
                    Some(task) => self.tasks.push(task),
                    None => {
                        while let Some(result) = self.tasks.next().await {
                            result?;
                        }
                        return Ok(());
                    }
                },
                Some(result) = self.tasks.next(), if !self.tasks.is_empty() => result?,
            }
        }
    }
}
