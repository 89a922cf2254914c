//! Quiescence barrier: the "requests held" flag plus the in-flight request count that lifecycle
//! transitions drain before touching shared bus state.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use bitflags::bitflags;

use crate::error::{BusError, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusFlags: u32 {
        /// Non-lifecycle requests are deferred.
        const IRPS_HELD = 1 << 0;
    }
}

#[derive(Debug)]
pub struct QuiescenceBarrier {
    flags: AtomicU32,
    active: Mutex<usize>,
    drained: Condvar,
    torn_down: AtomicBool,
}

impl QuiescenceBarrier {
    pub fn new(flags: BusFlags) -> Self {
        Self {
            flags: AtomicU32::new(flags.bits()),
            active: Mutex::new(0),
            drained: Condvar::new(),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn flags(&self) -> BusFlags {
        BusFlags::from_bits_retain(self.flags.load(Ordering::SeqCst))
    }

    pub fn is_held(&self) -> bool {
        self.flags().contains(BusFlags::IRPS_HELD)
    }

    /// Sets the held bit, returning the previous flags.
    pub fn raise(&self) -> BusFlags {
        BusFlags::from_bits_retain(
            self.flags
                .fetch_or(BusFlags::IRPS_HELD.bits(), Ordering::SeqCst),
        )
    }

    /// Clears the held bit, returning the previous flags.
    pub fn lower(&self) -> BusFlags {
        BusFlags::from_bits_retain(
            self.flags
                .fetch_and(!BusFlags::IRPS_HELD.bits(), Ordering::SeqCst),
        )
    }

    /// Registers an in-flight non-lifecycle request.
    ///
    /// Returns `None` when the held bit is set; the caller must defer the request instead. The
    /// count is bumped before the flag is tested.
    pub fn enter(&self) -> Option<ActiveRequest<'_>> {
        *self.active.lock().expect("barrier lock poisoned") += 1;
        let guard = ActiveRequest(self);
        if self.is_held() || self.is_torn_down() {
            return None;
        }
        Some(guard)
    }

    pub fn active_count(&self) -> usize {
        *self.active.lock().expect("barrier lock poisoned")
    }

    /// Blocks until no non-lifecycle request is in flight.
    ///
    /// Fails with [`BusError::NoSuchDevice`] once the bus has been torn down.
    pub fn wait_for_active(&self) -> Result<()> {
        let mut active = self.active.lock().expect("barrier lock poisoned");
        loop {
            if self.is_torn_down() {
                return Err(BusError::NoSuchDevice);
            }
            if *active == 0 {
                return Ok(());
            }
            active = self.drained.wait(active).expect("barrier lock poisoned");
        }
    }

    pub fn tear_down(&self) {
        let _active = self.active.lock().expect("barrier lock poisoned");
        self.torn_down.store(true, Ordering::SeqCst);
        self.drained.notify_all();
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

/// Scope of one in-flight non-lifecycle request; dropping it releases the count.
pub struct ActiveRequest<'a>(&'a QuiescenceBarrier);

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        let mut active = self.0.active.lock().expect("barrier lock poisoned");
        *active -= 1;
        if *active == 0 {
            self.0.drained.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn raise_and_lower_report_previous_flags() {
        let barrier = QuiescenceBarrier::new(BusFlags::empty());
        assert_eq!(barrier.raise(), BusFlags::empty());
        assert!(barrier.is_held());
        assert_eq!(barrier.raise(), BusFlags::IRPS_HELD);
        assert_eq!(barrier.lower(), BusFlags::IRPS_HELD);
        assert!(!barrier.is_held());
    }

    #[test]
    fn enter_is_refused_while_held() {
        let barrier = QuiescenceBarrier::new(BusFlags::IRPS_HELD);
        assert!(barrier.enter().is_none());
        assert_eq!(barrier.active_count(), 0);

        barrier.lower();
        let guard = barrier.enter().expect("not held");
        assert_eq!(barrier.active_count(), 1);
        drop(guard);
        assert_eq!(barrier.active_count(), 0);
    }

    #[test]
    fn wait_for_active_blocks_until_requests_drain() {
        let barrier = Arc::new(QuiescenceBarrier::new(BusFlags::empty()));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let worker = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let _guard = barrier.enter().expect("not held");
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        entered_rx.recv().unwrap();

        let waiter = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || barrier.wait_for_active())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        release_tx.send(()).unwrap();
        worker.join().unwrap();
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn wait_for_active_reports_teardown() {
        let barrier = Arc::new(QuiescenceBarrier::new(BusFlags::empty()));
        let _guard = barrier.enter().expect("not held");

        let waiter = {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || barrier.wait_for_active())
        };
        barrier.tear_down();
        assert!(matches!(waiter.join().unwrap(), Err(BusError::NoSuchDevice)));
    }
}
