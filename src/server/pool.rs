//! Batching worker pool.
//!
//! Decouples task production (the reactor) from task execution (worker
//! threads), trading a bounded amount of latency for throughput. ReadWrite
//! tasks accumulate in a batch buffer that is flushed as a single Batch
//! task when it reaches `max_batch_size`, or when the flush timer fires,
//! whichever comes first. Accept tasks skip batching entirely and go
//! straight onto the work queue.
//!
//! One monitor (mutex + condvar) guards both the batch buffer and the work
//! queue, so a flush is an atomic swap-and-enqueue: no submission can land
//! between the swap and the enqueue, and no task is ever lost or
//! duplicated across a flush. Every enqueue wakes exactly one worker.

use super::task::{ReadWriteTask, Task};
use std::collections::VecDeque;
use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error};

/// Fixed-size pool of worker threads draining a shared FIFO queue.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    workers: usize,
    max_batch_latency: Duration,
}

struct PoolInner {
    state: Mutex<PoolState>,
    available: Condvar,
    max_batch_size: usize,
}

/// Batch buffer and work queue, guarded together.
struct PoolState {
    batch: Vec<ReadWriteTask>,
    queue: VecDeque<Task>,
}

impl WorkerPool {
    pub fn new(workers: usize, max_batch_size: usize, max_batch_latency: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    batch: Vec::with_capacity(max_batch_size),
                    queue: VecDeque::new(),
                }),
                available: Condvar::new(),
                max_batch_size,
            }),
            workers,
            max_batch_latency,
        }
    }

    /// Spawn the worker threads and the flush timer. Workers run
    /// indefinitely; there is no shutdown path.
    pub fn start(&self) {
        for worker_id in 0..self.workers {
            let inner = Arc::clone(&self.inner);
            thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(&inner))
                .unwrap_or_else(|e| {
                    error!(worker_id, error = %e, "Failed to spawn worker");
                    std::process::exit(1);
                });
        }
        self.spawn_flush_timer();
    }

    /// Append a task to the batch buffer, flushing if it reaches the size
    /// threshold.
    pub fn submit_batched(&self, task: ReadWriteTask) {
        let mut state = self.lock_state();
        state.batch.push(task);
        if state.batch.len() >= self.inner.max_batch_size {
            self.inner.flush_locked(&mut state);
        }
    }

    /// Enqueue a task directly, bypassing the batch buffer. Used for Accept
    /// tasks, which must not wait behind a batch window.
    pub fn submit_immediate(&self, task: Task) {
        let mut state = self.lock_state();
        state.queue.push_back(task);
        self.inner.available.notify_one();
    }

    /// Flush whatever is in the batch buffer. An empty buffer is a no-op;
    /// no empty Batch task is ever enqueued.
    pub fn flush(&self) {
        let mut state = self.lock_state();
        self.inner.flush_locked(&mut state);
    }

    /// Timer thread guaranteeing that no batched task waits longer than one
    /// latency window, even under low load.
    pub(crate) fn spawn_flush_timer(&self) {
        let inner = Arc::clone(&self.inner);
        let interval = self.max_batch_latency;
        thread::Builder::new()
            .name("batch-flush".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
                inner.flush_locked(&mut state);
            })
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to spawn flush timer");
                std::process::exit(1);
            });
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Take every queued task without executing it. Only meaningful before
    /// `start` has spawned the workers.
    #[cfg(test)]
    pub(crate) fn drain_queue(&self) -> Vec<Task> {
        self.lock_state().queue.drain(..).collect()
    }

    #[cfg(test)]
    pub(crate) fn buffered_len(&self) -> usize {
        self.lock_state().batch.len()
    }
}

impl PoolInner {
    /// Swap the batch buffer for a fresh one and enqueue it as a Batch
    /// task, waking one worker. Caller holds the state lock, making the
    /// swap and the enqueue a single critical section.
    fn flush_locked(&self, state: &mut PoolState) {
        if state.batch.is_empty() {
            return;
        }
        let batch = mem::replace(&mut state.batch, Vec::with_capacity(self.max_batch_size));
        debug!(tasks = batch.len(), "Flushing batch");
        state.queue.push_back(Task::Batch(batch));
        self.available.notify_one();
    }
}

/// Worker loop: wait while the queue is empty, dequeue exactly one task,
/// execute it synchronously, resume waiting.
fn worker_loop(inner: &PoolInner) {
    loop {
        let task = {
            let mut state = inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }
                state = inner
                    .available
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        task.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testutil::{connection, fixture, tuning};
    use crate::server::task::AcceptTask;

    fn read_write_tasks(count: usize) -> (crate::server::testutil::Fixture, Vec<ReadWriteTask>) {
        let fx = fixture(count, tuning(16, Duration::from_secs(1)));
        let tasks = (0..count)
            .map(|id| ReadWriteTask::new(Arc::clone(&fx.shared), connection(&fx, id), id))
            .collect();
        (fx, tasks)
    }

    fn batch_ids(task: &Task) -> Vec<usize> {
        match task {
            Task::Batch(tasks) => tasks.iter().map(ReadWriteTask::conn_id).collect(),
            _ => panic!("expected a batch task"),
        }
    }

    #[test]
    fn test_size_flush_splits_into_full_batches() {
        let pool = WorkerPool::new(1, 10, Duration::from_secs(3600));
        let (_fx, tasks) = read_write_tasks(25);
        for task in tasks {
            pool.submit_batched(task);
        }

        // 25 tasks at batch size 10: two full batches flushed, 5 buffered
        let queued = pool.drain_queue();
        assert_eq!(queued.len(), 2);
        assert_eq!(batch_ids(&queued[0]), (0..10).collect::<Vec<_>>());
        assert_eq!(batch_ids(&queued[1]), (10..20).collect::<Vec<_>>());
        assert_eq!(pool.buffered_len(), 5);

        // The remainder flushes as a short batch, in submission order
        pool.flush();
        let queued = pool.drain_queue();
        assert_eq!(queued.len(), 1);
        assert_eq!(batch_ids(&queued[0]), (20..25).collect::<Vec<_>>());
        assert_eq!(pool.buffered_len(), 0);
    }

    #[test]
    fn test_empty_flush_is_skipped() {
        let pool = WorkerPool::new(1, 10, Duration::from_secs(3600));
        pool.flush();
        assert!(pool.drain_queue().is_empty());
    }

    #[test]
    fn test_timer_flushes_partial_batch() {
        let pool = WorkerPool::new(1, 10, Duration::from_millis(50));
        let (_fx, tasks) = read_write_tasks(3);

        pool.spawn_flush_timer();
        for task in tasks {
            pool.submit_batched(task);
        }

        // Well past one latency window the buffer must have been flushed,
        // even though the size threshold was never reached
        thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.buffered_len(), 0);
        let queued = pool.drain_queue();
        assert_eq!(queued.len(), 1);
        assert_eq!(batch_ids(&queued[0]), vec![0, 1, 2]);
    }

    #[test]
    fn test_immediate_path_bypasses_batch_buffer() {
        let pool = WorkerPool::new(1, 10, Duration::from_secs(3600));
        let (fx, tasks) = read_write_tasks(3);
        for task in tasks {
            pool.submit_batched(task);
        }

        // Batch buffer is partially full and unflushed; the accept task
        // still lands on the queue at once
        pool.submit_immediate(Task::Accept(AcceptTask::new(Arc::clone(&fx.shared))));

        let queued = pool.drain_queue();
        assert_eq!(queued.len(), 1);
        assert!(matches!(queued[0], Task::Accept(_)));
        assert_eq!(pool.buffered_len(), 3);
    }

    #[test]
    fn test_workers_execute_queued_batches() {
        use crate::digest::wire_digest;
        use std::io::{Read, Write};

        let pool = WorkerPool::new(2, 2, Duration::from_millis(20));
        let (mut fx, tasks) = read_write_tasks(4);
        pool.start();

        let payloads: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 16]).collect();
        for (peer, payload) in fx.peers.iter_mut().zip(&payloads) {
            peer.write_all(payload).unwrap();
        }
        for task in tasks {
            pool.submit_batched(task);
        }

        for (peer, payload) in fx.peers.iter_mut().zip(&payloads) {
            let mut response = [0u8; 40];
            peer.read_exact(&mut response).unwrap();
            assert_eq!(response, wire_digest(payload, 40).as_bytes());
        }
    }
}
