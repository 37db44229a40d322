// SPDX-License-Identifier: Apache-2.0

//! A fixed pool of worker threads with task groups.
//!
//! Tasks are closures returning a `Result`; a [`TaskGroup`] tracks the tasks
//! added through it and [`TaskGroup::wait_all`] blocks until they finish,
//! returning the first error encountered. There is no task priority and no
//! cancellation.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

/// Error aggregated from a task group.
#[derive(Debug, thiserror::Error)]
#[error("task failed: {0}")]
pub struct TaskError(pub String);

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed worker pool.
pub struct Executor {
    tx: Option<flume::Sender<Task>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl Executor {
    /// Spawns `num_workers` worker threads named after `name`.
    pub fn new(num_workers: usize, name: &str) -> Self {
        let (tx, rx) = flume::unbounded::<Task>();
        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let rx = rx.clone();
            let builder = thread::Builder::new().name(format!("{name}-{i}"));
            let handle = builder
                .spawn(move || {
                    while let Ok(task) = rx.recv() {
                        task();
                    }
                })
                .expect("failed to spawn executor worker");
            workers.push(handle);
        }
        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// Creates a new, empty task group bound to this executor.
    pub fn new_task_group(&self) -> TaskGroup {
        TaskGroup {
            tx: self.tx.as_ref().expect("executor already shut down").clone(),
            state: Arc::new(GroupState::default()),
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // Closing the channel lets workers drain outstanding tasks and exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[derive(Default)]
struct GroupState {
    inner: Mutex<GroupInner>,
    cond: Condvar,
}

#[derive(Default)]
struct GroupInner {
    outstanding: usize,
    first_error: Option<TaskError>,
}

/// Tracks a batch of tasks submitted to an [`Executor`].
pub struct TaskGroup {
    tx: flume::Sender<Task>,
    state: Arc<GroupState>,
}

impl TaskGroup {
    /// Enqueues a fallible task.
    pub fn add_task<F>(&self, task: F)
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        self.state.inner.lock().outstanding += 1;
        let state = Arc::clone(&self.state);
        let boxed: Task = Box::new(move || {
            let result = task();
            let mut inner = state.inner.lock();
            if let Err(e) = result {
                if inner.first_error.is_none() {
                    inner.first_error = Some(e);
                }
            }
            inner.outstanding -= 1;
            if inner.outstanding == 0 {
                state.cond.notify_all();
            }
        });
        self.tx.send(boxed).expect("executor shut down with live task group");
    }

    /// Enqueues an infallible task.
    pub fn add_task_no_status<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_task(move || {
            task();
            Ok(())
        });
    }

    /// Blocks until every task added so far has finished. Returns the first
    /// task error, if any.
    pub fn wait_all(self) -> Result<(), TaskError> {
        let mut inner = self.state.inner.lock();
        while inner.outstanding > 0 {
            self.state.cond.wait(&mut inner);
        }
        match inner.first_error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Like [`TaskGroup::wait_all`] for groups whose tasks cannot fail.
    pub fn wait_all_no_status(self) {
        self.wait_all().expect("task in no-status group failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_tasks() {
        let exec = Executor::new(4, "test-exec");
        let group = exec.new_task_group();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            group.add_task_no_status(move || {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        group.wait_all_no_status();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn propagates_first_error() {
        let exec = Executor::new(2, "test-exec");
        let group = exec.new_task_group();
        group.add_task(|| Ok(()));
        group.add_task(|| Err(TaskError("boom".into())));
        group.add_task(|| Ok(()));
        let err = group.wait_all().unwrap_err();
        assert_eq!(err.0, "boom");
    }

    #[test]
    fn groups_are_independent() {
        let exec = Executor::new(2, "test-exec");
        let g1 = exec.new_task_group();
        let g2 = exec.new_task_group();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let hits1 = Arc::clone(&hits);
            g1.add_task_no_status(move || {
                let _ = hits1.fetch_add(1, Ordering::SeqCst);
            });
            let hits2 = Arc::clone(&hits);
            g2.add_task_no_status(move || {
                let _ = hits2.fetch_add(1, Ordering::SeqCst);
            });
        }
        g1.wait_all_no_status();
        g2.wait_all_no_status();
        assert_eq!(hits.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn empty_group_returns_immediately() {
        let exec = Executor::new(1, "test-exec");
        let group = exec.new_task_group();
        assert!(group.wait_all().is_ok());
    }
}
