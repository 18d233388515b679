//! Fixed-size worker pool executing connection tasks.
//!
//! Workers block on a condition variable over a shared FIFO queue. A panic
//! inside a task is caught and logged; it never takes a worker down. After
//! [`ThreadPool::stop`] workers finish the task they are running and exit
//! without draining the queue.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

/// A unit of work owned entirely by the pool once enqueued.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Returns the default worker count: `max(4, 2 × hardware threads)`.
pub fn default_workers() -> usize {
    (2 * num_cpus::get()).max(4)
}

struct QueueState {
    queue: VecDeque<Task>,
    stop: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    task_ready: Condvar,
    /// Tasks enqueued but not yet finished; zero means quiescent.
    pending: AtomicUsize,
    idle_lock: Mutex<()>,
    idle: Condvar,
}

/// A fixed-size pool of OS threads consuming a FIFO task queue.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use hearth::pool::ThreadPool;
///
/// let pool = ThreadPool::spawn(4);
/// let counter = Arc::new(AtomicUsize::new(0));
/// for _ in 0..10 {
///     let counter = Arc::clone(&counter);
///     pool.enqueue(Box::new(move || {
///         counter.fetch_add(1, Ordering::SeqCst);
///     }));
/// }
/// pool.wait_for_all();
/// assert_eq!(counter.load(Ordering::SeqCst), 10);
/// ```
pub struct ThreadPool {
    inner: Arc<Inner>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns a pool with `workers` threads (at least one).
    pub fn spawn(workers: usize) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                stop: false,
            }),
            task_ready: Condvar::new(),
            pending: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        });

        let workers = (0..workers.max(1))
            .map(|id| {
                let inner = Arc::clone(&inner);
                std::thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || worker_loop(&inner, id))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { inner, workers }
    }

    /// Enqueues a task. Tasks run FIFO across the queue with no fairness
    /// guarantee across workers. After [`stop`](Self::stop) the task is
    /// dropped with a warning.
    pub fn enqueue(&self, task: Task) {
        let mut state = self.inner.state.lock();
        if state.stop {
            warn!("task enqueued after stop, dropping");
            return;
        }
        self.inner.pending.fetch_add(1, Ordering::AcqRel);
        state.queue.push_back(task);
        drop(state);
        self.inner.task_ready.notify_one();
    }

    /// Blocks until every enqueued task has finished.
    pub fn wait_for_all(&self) {
        let mut guard = self.inner.idle_lock.lock();
        while self.inner.pending.load(Ordering::Acquire) > 0 {
            self.inner.idle.wait(&mut guard);
        }
    }

    /// Requests shutdown: wakes all workers, drops queued-but-unstarted
    /// tasks, and lets running tasks finish. Idempotent, and safe to call
    /// from `Drop`.
    pub fn stop(&self) {
        let dropped = {
            let mut state = self.inner.state.lock();
            if state.stop {
                return;
            }
            state.stop = true;
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        if dropped > 0 {
            self.inner.pending.fetch_sub(dropped, Ordering::AcqRel);
            warn!(dropped, "dropped queued tasks on stop");
        }
        self.inner.task_ready.notify_all();
        {
            let _guard = self.inner.idle_lock.lock();
            self.inner.idle.notify_all();
        }
        info!("thread pool stop requested");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                // Worker loops catch task panics, so this is unreachable in
                // practice; log rather than propagate from Drop.
                error!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(inner: &Inner, id: usize) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if state.stop {
                    debug!(worker = id, "worker exiting");
                    return;
                }
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                inner.task_ready.wait(&mut state);
            }
        };

        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!(worker = id, "task panicked");
        }

        if inner.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = inner.idle_lock.lock();
            inner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn tasks_run_to_completion() {
        let pool = ThreadPool::spawn(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            pool.enqueue(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.wait_for_all();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn single_worker_preserves_fifo_order() {
        let pool = ThreadPool::spawn(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let order = Arc::clone(&order);
            pool.enqueue(Box::new(move || {
                order.lock().push(i);
            }));
        }
        pool.wait_for_all();
        assert_eq!(*order.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = ThreadPool::spawn(1);
        pool.enqueue(Box::new(|| panic!("boom")));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        pool.enqueue(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        pool.wait_for_all();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn wait_for_all_returns_immediately_when_idle() {
        let pool = ThreadPool::spawn(2);
        pool.wait_for_all();
    }

    #[test]
    fn stop_is_idempotent_and_blocks_new_work() {
        let pool = ThreadPool::spawn(2);
        pool.stop();
        pool.stop();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);
        pool.enqueue(Box::new(move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn running_tasks_finish_after_stop() {
        let pool = ThreadPool::spawn(1);
        let done = Arc::new(AtomicUsize::new(0));
        let done_clone = Arc::clone(&done);
        pool.enqueue(Box::new(move || {
            std::thread::sleep(Duration::from_millis(50));
            done_clone.fetch_add(1, Ordering::SeqCst);
        }));
        // Give the worker a moment to pick the task up, then stop.
        std::thread::sleep(Duration::from_millis(10));
        pool.stop();
        drop(pool); // joins the worker
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
