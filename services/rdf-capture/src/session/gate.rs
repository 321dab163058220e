//! One-shot broadcast gate
//!
//! Many tasks block on a gate; a single `open` releases all of them at once.
//! A gate can instead be cancelled, which releases waiters with
//! [`GateWait::Cancelled`]. Either transition happens at most once.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Closed,
    Open,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateWait {
    Opened,
    Cancelled,
    TimedOut,
}

#[derive(Debug)]
pub struct Gate {
    name: &'static str,
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(GateState::Closed),
            changed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Release every waiter. Returns false if the gate was already settled.
    pub fn open(&self) -> bool {
        self.settle(GateState::Open)
    }

    /// Release every waiter with `Cancelled`. No effect once opened.
    pub fn cancel(&self) -> bool {
        self.settle(GateState::Cancelled)
    }

    pub fn is_open(&self) -> bool {
        *self.lock() == GateState::Open
    }

    pub fn is_cancelled(&self) -> bool {
        *self.lock() == GateState::Cancelled
    }

    pub fn wait(&self) -> GateWait {
        let guard = self
            .changed
            .wait_while(self.lock(), |state| *state == GateState::Closed)
            .unwrap_or_else(PoisonError::into_inner);
        Self::outcome(*guard)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> GateWait {
        let (guard, _) = self
            .changed
            .wait_timeout_while(self.lock(), timeout, |state| *state == GateState::Closed)
            .unwrap_or_else(PoisonError::into_inner);
        Self::outcome(*guard)
    }

    fn settle(&self, to: GateState) -> bool {
        let mut state = self.lock();
        if *state != GateState::Closed {
            return false;
        }
        *state = to;
        drop(state);
        self.changed.notify_all();
        true
    }

    fn outcome(state: GateState) -> GateWait {
        match state {
            GateState::Open => GateWait::Opened,
            GateState::Cancelled => GateWait::Cancelled,
            GateState::Closed => GateWait::TimedOut,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
