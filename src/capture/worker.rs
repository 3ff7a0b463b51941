//! Single-thread task executor with ordered submission.

use crate::error::HostError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, warn};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A named background thread running posted tasks in submission order.
pub struct BackgroundWorker {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl BackgroundWorker {
    /// Spawns the worker thread.
    pub fn start(name: &str) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Task>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            debug!(worker = %thread_name, "Worker thread started");
            while let Ok(task) = receiver.recv() {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(worker = %thread_name, "Worker task panicked");
                }
            }
            debug!(worker = %thread_name, "Worker thread exiting");
        })?;

        Ok(Self {
            name: name.to_string(),
            thread_id: handle.thread().id(),
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queues a task. Returns false once the worker has quit.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => {
                warn!(worker = %self.name, "Task posted after worker quit, dropping it");
                false
            }
        }
    }

    /// True when called from the worker thread itself.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Runs `task` on the worker and waits for its result.
    ///
    /// Runs inline when already on the worker or after it has quit, so it
    /// never waits on itself. A task that panics on the worker yields an error.
    pub fn run_sync<F, R>(&self, task: F) -> Result<R, HostError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(task());
        }

        let (tx, rx) = mpsc::sync_channel(1);
        let slot = std::sync::Arc::new(Mutex::new(Some(task)));
        let queued = std::sync::Arc::clone(&slot);
        let posted = self.post(move || {
            let task = queued.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(task) = task {
                let _ = tx.send(task());
            }
        });

        if posted {
            if let Ok(result) = rx.recv() {
                return Ok(result);
            }
        }

        // Still in the slot means the worker never ran it.
        let task = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
        match task {
            Some(task) => Ok(task()),
            None => Err(HostError::Backend(format!("task on worker {} panicked", self.name))),
        }
    }

    /// Lets queued tasks finish, then joins the thread.
    pub fn quit_safely(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if self.is_current() {
                // Cannot join ourselves; the loop ends once the queue drains.
                return;
            }
            if handle.join().is_err() {
                warn!(worker = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.quit_safely();
    }
}

impl std::fmt::Debug for BackgroundWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundWorker").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tasks_run_in_submission_order() {
        let worker = BackgroundWorker::start("order-test").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let log = Arc::clone(&log);
            worker.post(move || log.lock().unwrap().push(i));
        }
        worker.quit_safely();
        assert_eq!(*log.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn run_sync_returns_value_and_is_reentrant() {
        let worker = Arc::new(BackgroundWorker::start("sync-test").unwrap());
        let inner = Arc::clone(&worker);
        let value = worker.run_sync(move || inner.run_sync(|| 41).unwrap() + 1);
        assert_eq!(value, Ok(42));
    }

    #[test]
    fn post_after_quit_is_rejected_and_run_sync_falls_back() {
        let worker = BackgroundWorker::start("quit-test").unwrap();
        worker.quit_safely();
        assert!(!worker.post(|| {}));
        assert_eq!(worker.run_sync(|| 7), Ok(7));
    }

    #[test]
    fn panicking_task_is_an_error_and_worker_survives() {
        let worker = BackgroundWorker::start("panic-test").unwrap();
        let result = worker.run_sync(|| -> u32 { panic!("host call failed") });
        assert!(matches!(result, Err(HostError::Backend(_))));

        assert_eq!(worker.run_sync(|| 3), Ok(3));
        assert!(worker.post(|| {}));
    }
}
