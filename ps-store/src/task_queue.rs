//! A bounded-worker, unbounded-FIFO task queue backed by native threads
//! (§5, §9 — "a fixed-size pool that consumes function tasks from a FIFO
//! queue guarded by a mutex and a condition variable"). Used by a PS node
//! for work that should run off the RPC thread pool (shard-transfer
//! streaming, checkpoint I/O) while keeping the same "parallel native
//! threads" scheduling model §5 calls for.
//!
//! Deliberately preserves the source system's semantics exactly, per the
//! design note: there is no cancellation of in-flight or already-enqueued
//! tasks, only `stop`, which drains whatever was enqueued before it was
//! called and then joins every worker.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// The queue and the stop flag live under one mutex so a worker's
/// wait-predicate check and `stop()`'s flag-set-plus-`notify_all` are
/// synchronized by the same lock — otherwise a worker could observe
/// `stop == false`, then `stop()` could set it and notify before the
/// worker reaches `cond.wait`, losing the wakeup forever.
struct QueueState {
    tasks: VecDeque<Task>,
    stop: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cond: Condvar,
}

/// A fixed-size pool of native worker threads draining a shared FIFO queue
/// of boxed closures.
pub struct AsyncTaskQueue {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncTaskQueue {
    /// Spawn `thread_count` worker threads, each running [`Self::run`]
    /// against the shared queue.
    pub fn new(thread_count: usize) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                stop: false,
            }),
            cond: Condvar::new(),
        });
        let workers = (0..thread_count.max(1))
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("ps-task-{i}"))
                    .spawn(move || Self::run(shared))
                    .expect("failed to spawn task queue worker")
            })
            .collect();
        AsyncTaskQueue { shared, workers }
    }

    fn run(shared: Arc<Shared>) {
        loop {
            let task = {
                let mut state = shared.state.lock().unwrap();
                loop {
                    if let Some(task) = state.tasks.pop_front() {
                        break Some(task);
                    }
                    if state.stop {
                        break None;
                    }
                    state = shared.cond.wait(state).unwrap();
                }
            };
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// Enqueue a task to run on one of the pool's worker threads. No
    /// ordering guarantee across enqueuers beyond FIFO dequeue order.
    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.state.lock().unwrap().tasks.push_back(Box::new(task));
        self.shared.cond.notify_one();
    }

    /// Signal every worker to stop once the queue (as of this call) has
    /// drained, then join all of them. Tasks enqueued after `stop` is
    /// called are never run; the queue is not cleared of them, they simply
    /// have no worker left to pop them.
    pub fn stop(mut self) {
        self.shared.state.lock().unwrap().stop = true;
        self.shared.cond.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn enqueued_tasks_all_run() {
        let q = AsyncTaskQueue::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            q.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        // give workers a chance to drain before stopping.
        thread::sleep(Duration::from_millis(50));
        q.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn stop_drains_queue_enqueued_before_it() {
        let q = AsyncTaskQueue::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            q.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        q.stop();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn tasks_enqueued_after_stop_do_not_run() {
        // Stop takes `self` by value, so this is really just documenting
        // the contract: once stopped, the queue handle is gone and no
        // further enqueue is possible through it. A caller holding an
        // `Arc<AsyncTaskQueue>` would need interior stop-state of its own
        // to reject late enqueues; the source system has the same gap
        // (`Enque` after `Stop` simply races the workers' exit).
        let q = AsyncTaskQueue::new(1);
        q.enqueue(|| {});
        q.stop();
    }
}
