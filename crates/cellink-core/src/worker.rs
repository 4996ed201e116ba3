// ── Worker context ──
//
// A dedicated OS thread running its own current-thread runtime. Work
// posted to it runs isolated from the caller's runtime, so a slow
// protocol exchange never stalls the supervising context.

use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::CoreError;

#[derive(Debug)]
pub struct Worker {
    name: String,
    handle: Handle,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start the worker thread and wait until its runtime is up.
    pub fn spawn(name: &str) -> Result<Self, CoreError> {
        let (handle_tx, handle_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let thread = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));
                runtime.block_on(async {
                    let _ = stop_rx.await;
                });
            })
            .map_err(|e| CoreError::Internal(format!("spawn worker thread {name}: {e}")))?;

        let handle = handle_rx
            .recv()
            .map_err(|_| CoreError::Internal(format!("worker {name} exited during startup")))?
            .map_err(|e| CoreError::Internal(format!("worker {name} runtime: {e}")))?;

        debug!(worker = name, "worker started");
        Ok(Self {
            name: name.to_owned(),
            handle,
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Runtime of the worker, for spawning onto it.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `f` on the worker and block until it returns.
    ///
    /// Meant for construction only: the calling thread is parked for the
    /// duration.
    pub fn run_and_wait<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = std_mpsc::channel();
        self.handle.spawn(async move {
            let _ = tx.send(f());
        });
        rx.recv()
            .map_err(|_| CoreError::Internal(format!("worker {} dropped a task", self.name)))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(thread) = self.thread.take() else {
            return;
        };
        // Dropped from one of its own tasks: the thread exits on its own.
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            warn!(worker = %self.name, "worker thread panicked");
        } else {
            debug!(worker = %self.name, "worker stopped");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn runs_work_on_its_own_thread() {
        let worker = Worker::spawn("cellink-test-worker").unwrap();
        let name = worker
            .run_and_wait(|| thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(name.as_deref(), Some("cellink-test-worker"));
    }

    #[test]
    fn spawned_tasks_see_the_worker_runtime() {
        let worker = Worker::spawn("cellink-test-runtime").unwrap();
        let rx = worker
            .run_and_wait(|| {
                let (tx, rx) = std_mpsc::channel();
                tokio::spawn(async move {
                    let _ = tx.send(7_u8);
                });
                rx
            })
            .unwrap();
        assert_eq!(rx.recv().unwrap(), 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn usable_from_inside_another_runtime() {
        let worker = Worker::spawn("cellink-test-nested").unwrap();
        let value = worker.run_and_wait(|| 40 + 2).unwrap();
        assert_eq!(value, 42);
        drop(worker);
    }
}
