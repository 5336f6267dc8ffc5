//! Counting semaphore bounding concurrently admitted connections.
//!
//! `acquire` is the one intentionally blocking call in the server and only the
//! accept thread makes it.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::error;

use crate::error::{Error, Result};

struct GateState {
    available: u32,
    closed: bool,
}

pub struct AdmissionGate {
    state: Mutex<GateState>,
    slot_freed: Condvar,
    capacity: u32,
}

impl AdmissionGate {
    pub fn new(capacity: u32) -> Self {
        Self {
            state: Mutex::new(GateState {
                available: capacity,
                closed: false,
            }),
            slot_freed: Condvar::new(),
            capacity,
        }
    }

    /// Block until a slot is free and take it.
    ///
    /// # Errors
    /// `Error::Shutdown` once the gate has been closed.
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(Error::Shutdown);
            }
            if state.available > 0 {
                state.available -= 1;
                return Ok(());
            }
            state = self
                .slot_freed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut state = self.lock();
        if state.closed || state.available == 0 {
            return false;
        }
        state.available -= 1;
        true
    }

    /// Return one slot and wake at most one waiter.
    pub fn release(&self) {
        let mut state = self.lock();
        debug_assert!(
            state.available < self.capacity,
            "admission gate over-release"
        );
        if state.available >= self.capacity {
            error!(capacity = self.capacity, "admission gate released more than acquired");
            return;
        }
        state.available += 1;
        drop(state);
        self.slot_freed.notify_one();
    }

    /// Fail every current and future `acquire`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.slot_freed.notify_all();
    }

    pub fn available(&self) -> u32 {
        self.lock().available
    }

    pub fn in_use(&self) -> u32 {
        self.capacity - self.available()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn n_acquires_succeed_then_next_blocks_until_release() {
        let gate = Arc::new(AdmissionGate::new(3));
        for _ in 0..3 {
            gate.acquire().expect("acquire failed");
        }
        assert_eq!(gate.in_use(), 3);
        assert!(!gate.try_acquire());

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || {
                gate.acquire().expect("acquire failed");
                tx.send(()).expect("send failed");
            })
        };

        assert!(
            rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "fourth acquire must block"
        );
        gate.release();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("waiter not admitted after release");
        waiter.join().expect("waiter panicked");
        assert_eq!(gate.in_use(), 3);
    }

    #[test]
    fn release_wakes_one_waiter_per_slot() {
        let gate = Arc::new(AdmissionGate::new(1));
        gate.acquire().expect("acquire failed");

        let (tx, rx) = mpsc::channel();
        let waiters: Vec<_> = (0..2)
            .map(|i| {
                let gate = gate.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    if gate.acquire().is_ok() {
                        tx.send(i).expect("send failed");
                    }
                })
            })
            .collect();

        gate.release();
        rx.recv_timeout(Duration::from_secs(5))
            .expect("one waiter should be admitted");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        gate.close();
        for w in waiters {
            w.join().expect("waiter panicked");
        }
    }

    #[test]
    fn close_fails_blocked_and_future_acquires() {
        let gate = Arc::new(AdmissionGate::new(1));
        gate.acquire().expect("acquire failed");
        let blocked = {
            let gate = gate.clone();
            thread::spawn(move || gate.acquire())
        };
        thread::sleep(Duration::from_millis(20));
        gate.close();
        assert!(matches!(
            blocked.join().expect("waiter panicked"),
            Err(Error::Shutdown)
        ));
        assert!(matches!(gate.acquire(), Err(Error::Shutdown)));
        assert!(!gate.try_acquire());
    }

    #[test]
    fn try_acquire_respects_capacity() {
        let gate = AdmissionGate::new(2);
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        gate.release();
        assert_eq!(gate.available(), 1);
        assert_eq!(gate.capacity(), 2);
    }
}
