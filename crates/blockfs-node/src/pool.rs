//! Bounded task pools
//!
//! The node schedules work onto distinct pools (work, read, write,
//! heartbeat) so one saturated path cannot starve the others. A pool is a
//! fixed set of workers draining a bounded queue of futures; a worker
//! awaiting a downstream call multiplexes on the runtime instead of
//! pinning an OS thread, so the worker count bounds in-flight stages
//! rather than threads. `pending_num` is the queue backlog and feeds
//! write admission.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct TaskPool {
    name: &'static str,
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    pending: Arc<AtomicI64>,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Back-reference for delayed enqueues; a delayed task must not hold
    /// the queue open across its sleep.
    weak: Weak<TaskPool>,
}

impl TaskPool {
    /// Spawn `workers` workers over a queue of `queue_depth` slots.
    pub fn new(name: &'static str, workers: usize, queue_depth: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<Task>(queue_depth.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let pending = Arc::new(AtomicI64::new(0));

        let mut handles = Vec::with_capacity(workers.max(1));
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let pending = Arc::clone(&pending);
            handles.push(tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => {
                            pending.fetch_sub(1, Ordering::Relaxed);
                            task.await;
                        }
                        None => break,
                    }
                }
            }));
        }

        Arc::new_cyclic(|weak| Self {
            name,
            tx: Mutex::new(Some(tx)),
            pending,
            workers: Mutex::new(handles),
            weak: weak.clone(),
        })
    }

    /// Number of queued, not-yet-started tasks.
    pub fn pending_num(&self) -> i64 {
        self.pending.load(Ordering::Relaxed)
    }

    /// Enqueue a task. A full queue parks the enqueue on the runtime
    /// rather than dropping the task; admission control is expected to
    /// shed load before that point.
    pub fn add_task<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(tx) = self.tx.lock().clone() else {
            debug!("pool {} stopped, task dropped", self.name);
            return;
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        let task: Task = Box::pin(fut);
        match tx.try_send(task) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                let pending = Arc::clone(&self.pending);
                tokio::spawn(async move {
                    if tx.send(task).await.is_err() {
                        pending.fetch_sub(1, Ordering::Relaxed);
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Enqueue a task after `delay_ms` milliseconds. The task counts
    /// toward `pending_num` only once enqueued; it is dropped if the pool
    /// stopped during the delay.
    pub fn delay_task<F>(&self, delay_ms: u64, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let weak = self.weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(pool) = weak.upgrade() {
                pool.add_task(fut);
            }
        });
    }

    /// Run a task on the pool and hand its output back. `None` means the
    /// pool shut down before the task ran.
    pub async fn run<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.add_task(async move {
            let _ = tx.send(fut.await);
        });
        rx.await.ok()
    }

    /// Stop accepting work and drain the queue.
    pub async fn stop(&self) {
        self.tx.lock().take();
        let handles = std::mem::take(&mut *self.workers.lock());
        for h in handles {
            let _ = h.await;
        }
        debug!("pool {} drained", self.name);
    }
}
