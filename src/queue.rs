//! Serialized task execution.
//!
//! Every mutation of persisted state runs as a task on one dedicated worker
//! thread, in submission order. Callers on other threads only enqueue and may
//! wait on the returned [`TaskHandle`] with a deadline.
//!
//! A task that submits another task runs the nested work inline on the worker
//! instead of enqueuing it; enqueuing would make the outer task wait on work
//! that can only start after the outer task returns.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{ExecutionError, GeoError, GeoResult};

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    /// Maximum queued tasks before `submit` fails with `QueueFull`.
    pub queue_capacity: usize,
    /// Name of the worker thread.
    pub thread_name: String,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            thread_name: "geokeeper-worker".to_string(),
        }
    }
}

/// A named unit of work waiting for the worker.
struct PendingTask {
    id: Uuid,
    name: String,
    job: Box<dyn FnOnce() + Send + 'static>,
}

impl PendingTask {
    fn run(self) {
        debug!(task = %self.name, task_id = %self.id, "Running task");
        (self.job)();
    }
}

/// Handle to a submitted task's result.
#[derive(Debug)]
pub struct TaskHandle<T> {
    name: String,
    rx: Receiver<GeoResult<T>>,
}

impl<T> TaskHandle<T> {
    /// Name the task was submitted with.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true once the result is available.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        !self.rx.is_empty()
    }

    /// Waits for the task to complete.
    ///
    /// # Errors
    ///
    /// Returns the task's own error, or `Disconnected` if the worker went away.
    pub fn join(self) -> GeoResult<T> {
        let name = self.name;
        self.rx
            .recv()
            .map_err(|_| GeoError::Execution(ExecutionError::Disconnected { name }))?
    }

    /// Waits for the task to complete with a timeout.
    ///
    /// The task keeps running after a timeout; only the wait is abandoned.
    ///
    /// # Errors
    ///
    /// Returns `Timeout`, `Disconnected`, or the task's own error.
    pub fn join_timeout(self, timeout: Duration) -> GeoResult<T> {
        let name = self.name;
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => GeoError::Execution(ExecutionError::Timeout {
                name,
                duration_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
            }),
            RecvTimeoutError::Disconnected => GeoError::Execution(ExecutionError::Disconnected { name }),
        })?
    }
}

/// Single-worker FIFO executor with inline nested submission.
pub struct TaskQueue {
    tx: Option<Sender<PendingTask>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
    queue_capacity: usize,
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue")
            .field("worker_id", &self.worker_id)
            .field("queue_capacity", &self.queue_capacity)
            .field("pending", &self.pending())
            .finish()
    }
}

impl TaskQueue {
    /// Starts the worker thread.
    ///
    /// # Errors
    ///
    /// Returns `WorkerSpawn` if the OS refuses to create the thread.
    pub fn new(config: TaskQueueConfig) -> GeoResult<Self> {
        let queue_capacity = config.queue_capacity.max(1);
        let (tx, rx) = bounded::<PendingTask>(queue_capacity);

        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task.run();
                }
                debug!("Task worker exiting");
            })
            .map_err(|e| ExecutionError::WorkerSpawn { message: e.to_string() })?;

        Ok(Self {
            tx: Some(tx),
            worker_id: worker.thread().id(),
            worker: Some(worker),
            queue_capacity,
        })
    }

    /// Returns true when called from the worker thread.
    #[must_use]
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Number of tasks waiting behind the running one.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.as_ref().map_or(0, Sender::len)
    }

    /// Submits `work` under `name`.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` or `Disconnected` if the task could not be queued.
    pub fn submit<T, F>(&self, name: &str, work: F) -> GeoResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> GeoResult<T> + Send + 'static,
    {
        self.submit_with_callback(name, work, |_| {})
    }

    /// Submits `work` and runs `on_complete` on the worker right after it.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` or `Disconnected` if the task could not be queued.
    pub fn submit_with_callback<T, F, C>(&self, name: &str, work: F, on_complete: C) -> GeoResult<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> GeoResult<T> + Send + 'static,
        C: FnOnce(&GeoResult<T>) + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded::<GeoResult<T>>(1);
        let handle = TaskHandle {
            name: name.to_string(),
            rx: reply_rx,
        };

        let task_name = name.to_string();
        let job = move || {
            let result = run_guarded(&task_name, work);
            if panic::catch_unwind(AssertUnwindSafe(|| on_complete(&result))).is_err() {
                error!(task = %task_name, "Task completion callback panicked");
            }
            let _ = reply_tx.send(result);
        };

        if self.is_worker_thread() {
            debug!(task = %name, "Running nested task inline");
            job();
            return Ok(handle);
        }

        let Some(tx) = self.tx.as_ref() else {
            return Err(ExecutionError::Disconnected { name: name.to_string() }.into());
        };
        let task = PendingTask {
            id: Uuid::new_v4(),
            name: name.to_string(),
            job: Box::new(job),
        };
        match tx.try_send(task) {
            Ok(()) => Ok(handle),
            Err(TrySendError::Full(_)) => {
                warn!(task = %name, capacity = self.queue_capacity, "Task queue full; dropping submission");
                Err(ExecutionError::QueueFull {
                    capacity: self.queue_capacity,
                }
                .into())
            }
            Err(TrySendError::Disconnected(_)) => {
                Err(ExecutionError::Disconnected { name: name.to_string() }.into())
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain queued tasks and exit.
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if self.is_worker_thread() {
                // Dropped from inside a task; the worker exits on its own.
                return;
            }
            let _ = worker.join();
        }
    }
}

fn run_guarded<T>(name: &str, work: impl FnOnce() -> GeoResult<T>) -> GeoResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(work)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(task = %name, error = %e, "Task failed");
            Err(e)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(task = %name, %message, "Task panicked; worker continues");
            Err(ExecutionError::TaskPanicked {
                name: name.to_string(),
                message,
            }
            .into())
        }
    }
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

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn queue() -> Arc<TaskQueue> {
        Arc::new(TaskQueue::new(TaskQueueConfig::default()).unwrap())
    }

    #[test]
    fn nested_submit_runs_inline_and_is_already_complete() {
        let queue = queue();
        let log = Arc::new(Mutex::new(Vec::new()));

        let q = Arc::clone(&queue);
        let l = Arc::clone(&log);
        let outer = queue
            .submit("outer", move || {
                l.lock().unwrap().push("outer-start");
                let l2 = Arc::clone(&l);
                let inner = q.submit("inner", move || {
                    l2.lock().unwrap().push("inner");
                    Ok(7)
                })?;
                assert!(inner.is_finished());
                let value = inner.join()?;
                l.lock().unwrap().push("outer-end");
                Ok(value)
            })
            .unwrap();

        assert_eq!(outer.join_timeout(Duration::from_secs(5)).unwrap(), 7);
        assert_eq!(*log.lock().unwrap(), vec!["outer-start", "inner", "outer-end"]);
    }

    #[test]
    fn foreign_submission_waits_for_running_task() {
        let queue = queue();
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        let first = queue
            .submit("blocker", move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok("first")
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let second = queue.submit("follower", || Ok("second")).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!second.is_finished());

        release_tx.send(()).unwrap();
        assert_eq!(first.join().unwrap(), "first");
        assert_eq!(second.join_timeout(Duration::from_secs(5)).unwrap(), "second");
    }

    #[test]
    fn tasks_never_overlap_and_keep_fifo_order() {
        let queue = queue();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..50)
            .map(|i| {
                let in_flight = Arc::clone(&in_flight);
                let max_seen = Arc::clone(&max_seen);
                let order = Arc::clone(&order);
                queue
                    .submit("count", move || {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        order.lock().unwrap().push(i);
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock().unwrap(), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn panic_is_caught_and_worker_survives() {
        let queue = queue();
        let bad = queue
            .submit::<(), _>("explodes", || panic!("boom"))
            .unwrap();
        let err = bad.join().unwrap_err();
        let GeoError::Execution(ExecutionError::TaskPanicked { name, message }) = err else {
            panic!("expected TaskPanicked, got {err:?}");
        };
        assert_eq!(name, "explodes");
        assert_eq!(message, "boom");

        let good = queue.submit("after", || Ok(1)).unwrap();
        assert_eq!(good.join().unwrap(), 1);
    }

    #[test]
    fn join_timeout_does_not_cancel_the_task() {
        let queue = queue();
        let done = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&done);
        let slow = queue
            .submit("slow", move || {
                thread::sleep(Duration::from_millis(150));
                d.store(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let err = slow.join_timeout(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, GeoError::Execution(ExecutionError::Timeout { .. })));

        queue.submit("barrier", || Ok(())).unwrap().join().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_queue_rejects_without_blocking() {
        let queue = Arc::new(
            TaskQueue::new(TaskQueueConfig {
                queue_capacity: 1,
                ..TaskQueueConfig::default()
            })
            .unwrap(),
        );
        let (release_tx, release_rx) = bounded::<()>(0);
        let (started_tx, started_rx) = bounded::<()>(1);

        let running = queue
            .submit("running", move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                Ok(())
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let queued = queue.submit("queued", || Ok(())).unwrap();
        let err = queue.submit("overflow", || Ok(())).unwrap_err();
        assert!(matches!(err, GeoError::Execution(ExecutionError::QueueFull { capacity: 1 })));

        release_tx.send(()).unwrap();
        running.join().unwrap();
        queued.join().unwrap();
    }

    #[test]
    fn completion_callback_sees_result() {
        let queue = queue();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let handle = queue
            .submit_with_callback(
                "with-callback",
                || Ok(41 + 1),
                move |result: &GeoResult<i32>| {
                    *s.lock().unwrap() = result.as_ref().ok().copied();
                },
            )
            .unwrap();
        assert_eq!(handle.join().unwrap(), 42);
        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn drop_drains_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let queue = TaskQueue::new(TaskQueueConfig::default()).unwrap();
            for _ in 0..10 {
                let c = Arc::clone(&counter);
                let _ = queue.submit("inc", move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }
}
