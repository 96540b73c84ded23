//! Counting semaphore limiting concurrent stream writers

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
struct State {
    permits: usize,
    aborted: bool,
}

/// Counting semaphore with RAII permits
///
/// After [`Semaphore::abort`] every waiter is released without a permit and
/// later acquisitions fail immediately.
#[derive(Debug)]
pub struct Semaphore {
    state: Mutex<State>,
    changed: Condvar,
}

/// A held permit, returned to its semaphore on drop
#[derive(Debug)]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release(1);
    }
}

impl Semaphore {
    /// Create a semaphore with `permits` available
    pub fn new(permits: usize) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                aborted: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Block until a permit is available; `None` once aborted
    pub fn acquire(&self) -> Option<Permit<'_>> {
        self.acquire_unless(&AtomicBool::new(false))
    }

    /// Like [`Semaphore::acquire`], but also give up when `cancelled` is set
    ///
    /// Whoever sets `cancelled` must call [`Semaphore::wake`] afterwards.
    pub fn acquire_unless(&self, cancelled: &AtomicBool) -> Option<Permit<'_>> {
        let mut state = self.state.lock();
        loop {
            if state.aborted || cancelled.load(Ordering::Acquire) {
                return None;
            }
            if state.permits > 0 {
                state.permits -= 1;
                return Some(Permit { semaphore: self });
            }
            self.changed.wait(&mut state);
        }
    }

    /// Take a permit if one is available right now
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut state = self.state.lock();
        if state.aborted || state.permits == 0 {
            return None;
        }
        state.permits -= 1;
        Some(Permit { semaphore: self })
    }

    /// Return `count` permits
    pub fn release(&self, count: usize) {
        let mut state = self.state.lock();
        state.permits += count;
        self.changed.notify_all();
    }

    /// Release all waiters and refuse further acquisitions
    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.changed.notify_all();
    }

    /// Wake waiters so they re-check their cancellation flags
    pub fn wake(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    /// Permits currently available
    pub fn available(&self) -> usize {
        self.state.lock().permits
    }

    /// Check if [`Semaphore::abort`] was called
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}
