//! Interruptible counting semaphore
//!
//! Shots block on two of these: the worker's resource semaphore and the
//! group's trigger semaphore. Both waits must be abortable during teardown,
//! so [`Semaphore::interrupt`] wakes every current waiter with
//! [`GroupError::Interrupted`] without handing out permits.

use crate::error::{GroupError, Result};
use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct SemaphoreState {
    permits: i64,
    waiters: usize,
    /// Bumped by `interrupt`; a waiter that sees it change gives up
    epoch: u64,
}

/// Counting semaphore built on a mutex and condition variable
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<SemaphoreState>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(permits: i64) -> Self {
        Self {
            state: Mutex::new(SemaphoreState {
                permits,
                waiters: 0,
                epoch: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Take a permit, blocking until one is available or the wait is interrupted
    pub fn down(&self) -> Result<()> {
        let mut state = self.state.lock();
        let epoch = state.epoch;
        state.waiters += 1;
        while state.permits <= 0 {
            self.cond.wait(&mut state);
            if state.epoch != epoch {
                state.waiters -= 1;
                return Err(GroupError::Interrupted);
            }
        }
        state.waiters -= 1;
        state.permits -= 1;
        Ok(())
    }

    /// Take a permit if one is available
    pub fn try_down(&self) -> bool {
        let mut state = self.state.lock();
        if state.permits > 0 {
            state.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Return a permit
    pub fn up(&self) {
        let mut state = self.state.lock();
        state.permits += 1;
        if state.waiters > 0 {
            self.cond.notify_one();
        }
    }

    /// Return a permit unless `max` are already available
    pub fn up_capped(&self, max: i64) -> bool {
        let mut state = self.state.lock();
        if state.permits >= max {
            return false;
        }
        state.permits += 1;
        if state.waiters > 0 {
            self.cond.notify_one();
        }
        true
    }

    /// Wake every current waiter with an error
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Replace the permit count
    pub fn reset(&self, permits: i64) {
        let mut state = self.state.lock();
        state.permits = permits;
        if permits > 0 && state.waiters > 0 {
            self.cond.notify_all();
        }
    }

    pub fn permits(&self) -> i64 {
        self.state.lock().permits
    }

    pub fn has_waiters(&self) -> bool {
        self.state.lock().waiters > 0
    }

    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }
}
