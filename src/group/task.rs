//! Group worker task
//!
//! One [`GroupTask`] exists per group id. Groups that share an id share the
//! task through its reference count. The task owns a named OS thread that
//! executes queued shots one at a time, plus the resource semaphore that caps
//! how many shots (including those of nested children) are outstanding.
//!
//! # Responsibilities
//!
//! - **Lazy start**: the thread is spawned by the first `start` and joined by
//!   the `stop` that drops the last reference
//! - **Priority**: workers of hardware-pipelined sources run `SCHED_FIFO`
//! - **Draining**: `clear_pending` discards queued work without running it

use super::semaphore::Semaphore;
use crate::error::{GroupError, Result};
use crate::id::{GroupHandle, GroupId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const TASK_STARTED: u32 = 1 << 0;
const TASK_REQUEST_STOP: u32 = 1 << 1;

/// Executes one shot on behalf of a worker
pub type ShotRunner = Arc<dyn Fn(GroupHandle, usize) + Send + Sync>;

/// Work items delivered to a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Work {
    Shot { group: GroupHandle, frame: usize },
    Exit,
}

/// Scheduling class requested for a worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPriority {
    Normal,
    Fifo(i32),
}

struct Worker {
    tx: Sender<Work>,
    rx: Receiver<Work>,
    handle: JoinHandle<()>,
}

/// Worker shared by every group using one group id
pub struct GroupTask {
    id: GroupId,
    refcount: AtomicU32,
    flags: AtomicU32,
    resource: Semaphore,
    worker: Mutex<Option<Worker>>,
}

impl GroupTask {
    pub fn new(id: GroupId) -> Self {
        Self {
            id,
            refcount: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            resource: Semaphore::new(0),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.flags.load(Ordering::Acquire) & TASK_STARTED != 0
    }

    pub fn is_stop_requested(&self) -> bool {
        self.flags.load(Ordering::Acquire) & TASK_REQUEST_STOP != 0
    }

    /// Resource semaphore bounding outstanding shots
    pub fn resource(&self) -> &Semaphore {
        &self.resource
    }

    /// Take a reference, spawning the worker thread on first use
    pub fn start(&self, priority: WorkerPriority, runner: ShotRunner) -> Result<()> {
        let mut worker = self.worker.lock();
        if !self.is_started() {
            let (tx, rx) = unbounded();
            let thread_rx = rx.clone();
            let id = self.id;
            let handle = thread::Builder::new()
                .name(format!("group-worker-{}", id.0))
                .spawn(move || run_worker(id, priority, thread_rx, runner))
                .map_err(GroupError::Io)?;
            *worker = Some(Worker { tx, rx, handle });

            // At least one shot must always be able to run
            self.resource.reset(1);
            self.flags.store(TASK_STARTED, Ordering::Release);
            tracing::info!(task = %self.id, ?priority, "group task started");
        }
        self.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop a reference, joining the worker thread when the last one goes
    pub fn stop(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if !self.is_started() {
            return Err(GroupError::InvalidState(format!(
                "task {} is already stopped",
                self.id
            )));
        }
        let remaining = self.refcount.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining > 0 {
            tracing::debug!(task = %self.id, refcount = remaining, "group task still referenced");
            return Ok(());
        }

        self.flags.fetch_or(TASK_REQUEST_STOP, Ordering::AcqRel);
        if self.resource.has_waiters() {
            tracing::warn!(task = %self.id, "resource waiters are interrupted on stop");
            self.resource.interrupt();
        }

        if let Some(w) = worker.take() {
            let _ = w.tx.send(Work::Exit);
            if w.handle.thread().id() != thread::current().id() && w.handle.join().is_err() {
                tracing::error!(task = %self.id, "worker thread panicked");
            }
        }
        self.flags.store(0, Ordering::Release);
        tracing::info!(task = %self.id, "group task stopped");
        Ok(())
    }

    /// Queue a shot for the worker thread
    pub fn queue(&self, group: GroupHandle, frame: usize) -> Result<()> {
        let worker = self.worker.lock();
        let w = worker.as_ref().ok_or_else(|| {
            GroupError::InvalidState(format!("task {} has no worker", self.id))
        })?;
        w.tx.send(Work::Shot { group, frame }).map_err(|_| {
            GroupError::InvalidState(format!("task {} worker has exited", self.id))
        })
    }

    /// Discard queued work without running it. Returns the number dropped.
    pub fn clear_pending(&self) -> usize {
        let worker = self.worker.lock();
        let Some(w) = worker.as_ref() else {
            return 0;
        };
        let mut dropped = 0;
        while let Ok(work) = w.rx.try_recv() {
            if work == Work::Exit {
                let _ = w.tx.send(Work::Exit);
                break;
            }
            dropped += 1;
        }
        dropped
    }

    /// Number of queued, not yet running work items
    pub fn pending(&self) -> usize {
        self.worker.lock().as_ref().map(|w| w.rx.len()).unwrap_or(0)
    }
}

fn run_worker(id: GroupId, priority: WorkerPriority, rx: Receiver<Work>, runner: ShotRunner) {
    if let WorkerPriority::Fifo(prio) = priority {
        elevate_priority(id, prio);
    }
    tracing::debug!(task = %id, "worker thread running");
    for work in rx.iter() {
        match work {
            Work::Shot { group, frame } => runner(group, frame),
            Work::Exit => break,
        }
    }
    tracing::debug!(task = %id, "worker thread exiting");
}

#[cfg(target_os = "linux")]
fn elevate_priority(id: GroupId, priority: i32) {
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: pthread_self is always a valid handle for the calling thread and
    // `param` outlives the call.
    let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if ret != 0 {
        tracing::warn!(task = %id, priority, errno = ret, "SCHED_FIFO not permitted, running at normal priority");
    }
}

#[cfg(not(target_os = "linux"))]
fn elevate_priority(id: GroupId, priority: i32) {
    tracing::debug!(task = %id, priority, "real-time priority unsupported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_runner() -> (ShotRunner, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let runner: ShotRunner = Arc::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (runner, count)
    }

    #[test]
    fn test_refcounted_start_stop() {
        let task = GroupTask::new(GroupId(2));
        let (runner, _) = counting_runner();
        task.start(WorkerPriority::Normal, runner.clone()).unwrap();
        task.start(WorkerPriority::Normal, runner).unwrap();
        assert_eq!(task.refcount(), 2);
        assert_eq!(task.resource().permits(), 1);

        task.stop().unwrap();
        assert!(task.is_started());
        task.stop().unwrap();
        assert!(!task.is_started());
        assert!(task.stop().is_err());
    }

    #[test]
    fn test_queued_shots_run() {
        let task = GroupTask::new(GroupId(0));
        let (runner, count) = counting_runner();
        task.start(WorkerPriority::Normal, runner).unwrap();
        for frame in 0..3 {
            task.queue(GroupHandle(0), frame).unwrap();
        }
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) == 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
        task.stop().unwrap();
    }

    #[test]
    fn test_queue_without_worker_fails() {
        let task = GroupTask::new(GroupId(1));
        assert!(task.queue(GroupHandle(0), 0).is_err());
        assert_eq!(task.clear_pending(), 0);
    }

    #[test]
    fn test_clear_pending_drops_queued_work() {
        let task = GroupTask::new(GroupId(4));
        let gate = Arc::new(Semaphore::new(0));
        let g = gate.clone();
        let runner: ShotRunner = Arc::new(move |_, _| {
            let _ = g.down();
        });
        task.start(WorkerPriority::Normal, runner).unwrap();
        for frame in 0..4 {
            task.queue(GroupHandle(0), frame).unwrap();
        }
        // First item may already be executing and blocked on the gate
        std::thread::sleep(Duration::from_millis(20));
        let dropped = task.clear_pending();
        assert!(dropped >= 3);
        assert_eq!(task.pending(), 0);
        gate.up();
        task.stop().unwrap();
    }
}
