//! Management-thread executor
//!
//! All native enumeration, activation, and teardown calls against audio
//! endpoints must happen on exactly one thread. This module owns that
//! thread: a dedicated worker that executes submitted tasks strictly in
//! submission order, one at a time, never concurrently with each other or
//! with the platform init/deinit hooks (which run inside the same loop).
//!
//! Callers on arbitrary threads submit boxed closures, either
//! fire-and-forget ([`ManagementThread::submit`]) or blocking until the
//! task has run ([`ManagementThread::submit_and_wait`]).
//!
//! # Deadlock contract
//!
//! A caller must **never** hold a device's bookkeeping lock while calling
//! [`ManagementThread::submit_and_wait`]: a previously queued task (for
//! example a disconnect teardown updating shared device state) may itself
//! need that same lock, and because tasks run strictly in order the wait
//! can then never complete. This is a guaranteed deadlock, not merely a
//! risk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{BackendError, BackendResult};
use crate::platform::PlatformHooks;

/// A unit of work for the management thread
type Task = Box<dyn FnOnce() -> BackendResult<()> + Send + 'static>;

/// A task queued for execution, tagged with its submission sequence number
struct QueuedTask {
    seq: u64,
    run: Task,
    /// Present when the submitter is blocked waiting for completion
    done: Option<oneshot::Sender<BackendResult<()>>>,
}

enum Message {
    Task(QueuedTask),
    /// Graceful shutdown marker; queued behind all previously accepted tasks
    Shutdown,
}

/// Sequence assignment and channel send happen under one lock so that
/// sequence numbers match queue order exactly.
struct SubmitState {
    tx: mpsc::UnboundedSender<Message>,
    next_seq: u64,
}

/// Handle to the process-wide management thread
///
/// Modeled as an explicit service with `spawn`/`stop` lifecycle rather than
/// ambient global state; device handles carry an `Arc` to it.
pub struct ManagementThread {
    submit: Mutex<SubmitState>,
    accepting: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ManagementThread {
    /// Spawn the management thread.
    ///
    /// `platform.init()` runs on the new thread before any task; its failure
    /// fails the spawn. `platform.deinit()` runs on the same thread after
    /// the queue has drained during shutdown.
    pub fn spawn(platform: Arc<dyn PlatformHooks>) -> BackendResult<Arc<Self>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let (init_tx, init_rx) = oneshot::channel::<BackendResult<()>>();

        let worker = std::thread::Builder::new()
            .name("audio-mgmt".to_string())
            .spawn(move || {
                let init_result = platform.init();
                let failed = init_result.is_err();
                let _ = init_tx.send(init_result);
                if failed {
                    return;
                }
                debug!("management thread running");

                // The shutdown marker is queued under the same lock that
                // accepts submissions, so no task can follow it.
                while let Some(msg) = rx.blocking_recv() {
                    match msg {
                        Message::Task(task) => Self::run_task(task),
                        Message::Shutdown => {
                            info!("management thread shutting down");
                            platform.deinit_start();
                            break;
                        }
                    }
                }

                platform.deinit();
                debug!("management thread exited");
            })
            .map_err(|e| BackendError::ResourceExhausted {
                reason: format!("failed to spawn management thread: {}", e),
            })?;

        match init_rx.blocking_recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(e);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(BackendError::ResourceExhausted {
                    reason: "management thread died during platform init".to_string(),
                });
            }
        }

        Ok(Arc::new(Self {
            submit: Mutex::new(SubmitState { tx, next_seq: 0 }),
            accepting: AtomicBool::new(true),
            worker: Mutex::new(Some(worker)),
        }))
    }

    fn run_task(task: QueuedTask) {
        debug!(seq = task.seq, "running management task");
        let result = (task.run)();
        match task.done {
            Some(done) => {
                // Submitter may have given up waiting; nothing to do then.
                let _ = done.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(seq = task.seq, error = %e, "fire-and-forget management task failed");
                }
            }
        }
    }

    fn enqueue(
        &self,
        run: Task,
        done: Option<oneshot::Sender<BackendResult<()>>>,
    ) -> BackendResult<u64> {
        let mut submit = self.submit.lock();
        // Checked under the lock: begin_shutdown flips the flag and queues
        // the shutdown marker in one critical section, so a task accepted
        // here is always ahead of the marker and guaranteed to run.
        if !self.accepting.load(Ordering::Acquire) {
            return Err(BackendError::TaskRejected);
        }
        let seq = submit.next_seq;
        submit.next_seq += 1;
        submit
            .tx
            .send(Message::Task(QueuedTask { seq, run, done }))
            .map_err(|_| BackendError::TaskRejected)?;
        Ok(seq)
    }

    /// Enqueue a task without waiting for it.
    ///
    /// The task's result is logged and otherwise discarded. This is the form
    /// the I/O thread must use to request its own teardown, so it never
    /// waits on itself.
    pub fn submit(
        &self,
        task: impl FnOnce() -> BackendResult<()> + Send + 'static,
    ) -> BackendResult<()> {
        self.enqueue(Box::new(task), None)?;
        Ok(())
    }

    /// Enqueue a task and block the calling thread until it has fully run,
    /// returning the task's own result.
    ///
    /// See the module-level deadlock contract: do not call this while
    /// holding a device's bookkeeping lock. Must not be called from the
    /// management thread itself, or from an async executor thread.
    pub fn submit_and_wait(
        &self,
        task: impl FnOnce() -> BackendResult<()> + Send + 'static,
    ) -> BackendResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(Box::new(task), Some(done_tx))?;
        done_rx.blocking_recv().map_err(|_| BackendError::TaskRejected)?
    }

    /// Stop accepting new tasks and queue the graceful shutdown marker.
    ///
    /// Tasks accepted before this call still run; later submissions fail
    /// with [`BackendError::TaskRejected`] without being enqueued.
    pub fn begin_shutdown(&self) {
        let submit = self.submit.lock();
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        if submit.tx.send(Message::Shutdown).is_err() {
            error!("management thread gone before shutdown marker was queued");
        }
    }

    /// Begin shutdown and join the management thread.
    pub fn stop(&self) {
        self.begin_shutdown();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("management thread panicked");
            }
        }
    }
}

impl Drop for ManagementThread {
    fn drop(&mut self) {
        // Do not join here; dropping from an arbitrary thread must not block.
        self.begin_shutdown();
    }
}
