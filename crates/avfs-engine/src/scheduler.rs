//! Priority queue and worker pool.
//!
//! Jobs wait in a max-heap ordered by priority, then by submission order.
//! Workers are plain threads that sleep on a condition variable until a job
//! is queued, run it to completion, record its final state and post its
//! result. The pool can grow or shrink while jobs run: surplus workers retire
//! the next time they look for work.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use avfs_core::VfsError;
use tokio_util::sync::CancellationToken;

use crate::arena::Arena;
use crate::channel::{Notification, NotificationResult};
use crate::job::{Job, JobEnv, JobHandle, JobState};
use crate::operation::{Operation, OperationKind};

/// Heap entry for a queued job.
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: i32,
    seq: u64,
    handle: JobHandle,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct JobEntry {
    state: JobState,
    kind: OperationKind,
    cancel: CancellationToken,
    /// Present while the job is queued.
    job: Option<Job>,
}

struct State {
    queue: BinaryHeap<Queued>,
    jobs: Arena<JobEntry>,
    next_seq: u64,
    limit: usize,
    workers: usize,
    shutting_down: bool,
}

impl State {
    fn pop(&mut self) -> Option<Job> {
        while let Some(queued) = self.queue.pop() {
            let Some(entry) = self.jobs.get_mut(queued.handle.0) else {
                continue;
            };
            if let Some(job) = entry.job.take() {
                entry.state = JobState::Running;
                return Some(job);
            }
        }
        None
    }
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
    env: JobEnv,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What a cancel request found.
#[derive(Debug)]
pub(crate) enum CancelOutcome {
    /// The job never started; here is its result.
    Dequeued(NotificationResult),
    /// The job is running and will stop at its next checkpoint.
    Signalled,
    /// The job already produced its result.
    Finished,
    Unknown,
}

pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
    spawned: usize,
}

impl Scheduler {
    pub fn new(env: JobEnv, limit: usize) -> Result<Self, VfsError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: BinaryHeap::new(),
                jobs: Arena::new(),
                next_seq: 0,
                limit: 0,
                workers: 0,
                shutting_down: false,
            }),
            available: Condvar::new(),
            env,
        });
        let mut scheduler = Self {
            shared,
            threads: Vec::new(),
            spawned: 0,
        };
        scheduler.set_limit(limit)?;
        Ok(scheduler)
    }

    /// Queue a job.
    pub fn submit(&self, operation: Operation, priority: i32) -> Result<JobHandle, VfsError> {
        let kind = operation.kind();
        let file = operation.file();
        let cancel = CancellationToken::new();

        let mut state = self.shared.lock();
        if state.shutting_down {
            return Err(VfsError::ShutDown);
        }
        let handle = JobHandle(state.jobs.insert(JobEntry {
            state: JobState::Queued,
            kind,
            cancel: cancel.clone(),
            job: None,
        }));
        if let Some(entry) = state.jobs.get_mut(handle.0) {
            entry.job = Some(Job {
                handle,
                operation,
                priority,
                cancel,
            });
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Queued {
            priority,
            seq,
            handle,
        });
        drop(state);

        tracing::trace!(target: "avfs::scheduler", job = %handle, %kind, ?file, priority, "queued");
        self.shared.available.notify_one();
        Ok(handle)
    }

    pub fn cancel(&self, handle: JobHandle) -> CancelOutcome {
        let mut state = self.shared.lock();
        let Some(entry) = state.jobs.get_mut(handle.0) else {
            return CancelOutcome::Unknown;
        };
        match entry.state {
            JobState::Queued => {
                entry.state = JobState::Cancelled;
                entry.cancel.cancel();
                entry.job = None;
                let kind = entry.kind;
                state.queue.retain(|queued| queued.handle != handle);
                tracing::debug!(target: "avfs::scheduler", job = %handle, "cancelled before dispatch");
                CancelOutcome::Dequeued(NotificationResult::cancelled(handle, kind))
            }
            JobState::Running => {
                entry.cancel.cancel();
                tracing::debug!(target: "avfs::scheduler", job = %handle, "cancel signalled");
                CancelOutcome::Signalled
            }
            _ => CancelOutcome::Finished,
        }
    }

    pub fn state(&self, handle: JobHandle) -> Option<JobState> {
        self.shared.lock().jobs.get(handle.0).map(|entry| entry.state)
    }

    /// Forget a job whose result has been delivered.
    pub fn release(&self, handle: JobHandle) {
        self.shared.lock().jobs.remove(handle.0);
    }

    pub fn queued(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn limit(&self) -> usize {
        self.shared.lock().limit
    }

    /// Resize the pool. Running jobs are never interrupted.
    pub fn set_limit(&mut self, limit: usize) -> Result<(), VfsError> {
        if limit == 0 {
            return Err(VfsError::bad_parameters("job limit must be at least 1"));
        }

        let missing = {
            let mut state = self.shared.lock();
            if state.shutting_down {
                return Err(VfsError::ShutDown);
            }
            state.limit = limit;
            let missing = limit.saturating_sub(state.workers);
            state.workers += missing;
            missing
        };

        self.threads.retain(|thread| !thread.is_finished());
        for spawned in 0..missing {
            if let Err(err) = self.spawn_worker() {
                self.shared.lock().workers -= missing - spawned;
                tracing::error!(target: "avfs::scheduler", %err, "could not spawn worker");
                return Err(VfsError::Backend(err.into()));
            }
        }
        // Wake idle workers so surplus ones retire.
        self.shared.available.notify_all();
        tracing::debug!(target: "avfs::scheduler", limit, "job limit set");
        Ok(())
    }

    fn spawn_worker(&mut self) -> io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let id = self.spawned;
        let thread = thread::Builder::new()
            .name(format!("avfs-worker-{id}"))
            .spawn(move || worker_loop(shared))?;
        self.spawned += 1;
        self.threads.push(thread);
        Ok(())
    }

    /// Stop accepting work, drop everything still queued and signal running
    /// jobs. Returns the results of the dropped jobs.
    pub fn shutdown(&self) -> Vec<NotificationResult> {
        let mut state = self.shared.lock();
        state.shutting_down = true;

        let queued: Vec<Queued> = state.queue.drain().collect();
        let mut dropped = Vec::with_capacity(queued.len());
        for queued in queued {
            if let Some(entry) = state.jobs.get_mut(queued.handle.0) {
                entry.state = JobState::Cancelled;
                entry.cancel.cancel();
                entry.job = None;
                dropped.push(NotificationResult::cancelled(queued.handle, entry.kind));
            }
        }
        for (_, entry) in state.jobs.iter() {
            if entry.state == JobState::Running {
                entry.cancel.cancel();
            }
        }
        drop(state);

        self.shared.available.notify_all();
        tracing::debug!(target: "avfs::scheduler", dropped = dropped.len(), "shutting down");
        dropped
    }

    /// Wait for every worker thread to exit.
    pub fn join(&mut self) {
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!(target: "avfs::scheduler", "worker thread panicked");
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                if state.shutting_down || state.workers > state.limit {
                    state.workers -= 1;
                    return;
                }
                if let Some(job) = state.pop() {
                    break job;
                }
                state = shared
                    .available
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
        };

        let handle = job.handle;
        let result = job.run(&shared.env);

        if let Some(entry) = shared.lock().jobs.get_mut(handle.0) {
            entry.state = if result.cancelled {
                JobState::Cancelled
            } else if result.outcome.is_ok() {
                JobState::Completed
            } else {
                JobState::Failed
            };
        }
        if !shared.env.notifier.post(Notification::Completed(result)) {
            tracing::debug!(target: "avfs::scheduler", job = %handle, "result dropped, caller is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(priority: i32, seq: u64) -> Queued {
        Queued {
            priority,
            seq,
            handle: JobHandle(Arena::<()>::new().insert(())),
        }
    }

    #[test]
    fn test_heap_order() {
        let mut heap = BinaryHeap::new();
        heap.push(queued(0, 0));
        heap.push(queued(5, 1));
        heap.push(queued(0, 2));
        heap.push(queued(-3, 3));
        heap.push(queued(5, 4));

        let order: Vec<(i32, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|q| (q.priority, q.seq))
            .collect();
        assert_eq!(order, vec![(5, 1), (5, 4), (0, 0), (0, 2), (-3, 3)]);
    }
}
