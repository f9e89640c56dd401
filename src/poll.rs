//! Poll waiter bookkeeping and the wake primitive.
//!
//! Devices keep a small fixed set of outstanding poll registrations. A
//! caller registers interest in a set of [`Events`] together with a
//! [`WakeHandle`]; producers later push events through
//! [`PollWaiterSet::notify`]. Readiness is edge-accumulating: events OR into
//! the waiter's observed mask and stay there until the caller consumes them,
//! so an infrequent poller never silently misses an event.
//!
//! All set operations run under the owning device's lock (see
//! [`crate::device`]), which serializes setup/teardown against notification
//! and closes the check-then-register race: registration itself evaluates
//! current readiness under the same lock a producer would take to notify.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::error::{DeviceError, Result};

bitflags! {
    /// Readiness events a device can report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Events: u32 {
        /// At least one staged record is available to read
        const DATA_READY = 1 << 0;
        /// The device observed an error condition
        const ERROR = 1 << 1;
        /// Staged data was overwritten before being read
        const OVERRUN = 1 << 2;
    }
}

/// Maximum outstanding poll registrations per device.
pub const MAX_POLL_WAITERS: usize = 8;

struct WakeInner {
    /// True between `signal()` and the consumer's `clear_pending()`.
    /// Doubles as the "already signaled, don't wake again" marker that
    /// notification checks, so a waiter that has not consumed a prior
    /// signal is not woken redundantly.
    pending: Mutex<bool>,
    cond: Condvar,
}

/// Cloneable wake primitive handed to a device at poll setup.
///
/// Identity is pointer identity: clones of one handle name the same
/// registration, and teardown matches on that identity. The external caller
/// parks on [`WakeHandle::wait_timeout`]; this crate only ever signals.
#[derive(Clone)]
pub struct WakeHandle(Arc<WakeInner>);

impl WakeHandle {
    pub fn new() -> Self {
        Self(Arc::new(WakeInner {
            pending: Mutex::new(false),
            cond: Condvar::new(),
        }))
    }

    /// Mark the handle signaled and wake any parked caller. Idempotent.
    pub fn signal(&self) {
        let mut pending = self.0.pending.lock();
        if !*pending {
            *pending = true;
            self.0.cond.notify_all();
        }
    }

    /// True when a signal has been delivered but not yet consumed.
    pub fn is_pending(&self) -> bool {
        *self.0.pending.lock()
    }

    /// Consume a delivered signal so the next event wakes again.
    pub fn clear_pending(&self) {
        *self.0.pending.lock() = false;
    }

    /// Park until signaled or the timeout elapses. Returns whether a signal
    /// is pending. This is caller-side; no device lock is held here.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut pending = self.0.pending.lock();
        if !*pending {
            self.0.cond.wait_for(&mut pending, timeout);
        }
        *pending
    }

    fn same_as(&self, other: &WakeHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for WakeHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WakeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeHandle")
            .field("pending", &self.is_pending())
            .finish()
    }
}

struct PollWaiter {
    interest: Events,
    observed: Events,
    wake: WakeHandle,
}

/// Bounded slot array of outstanding poll registrations for one device.
pub struct PollWaiterSet {
    slots: [Option<PollWaiter>; MAX_POLL_WAITERS],
}

impl PollWaiterSet {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Store a waiter in the first free slot and evaluate `current`
    /// readiness immediately, signaling if anything of interest is already
    /// pending.
    pub fn insert(&mut self, interest: Events, wake: WakeHandle, current: Events) -> Result<()> {
        if self.slot_of(&wake).is_some() {
            return Err(DeviceError::InvalidArgument(
                "waiter already registered".into(),
            ));
        }

        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or_else(|| DeviceError::NoSpace("poll waiter slots exhausted".into()))?;

        let mut waiter = PollWaiter {
            interest,
            observed: current & interest,
            wake,
        };
        if !waiter.observed.is_empty() {
            waiter.wake.signal();
        }
        *slot = Some(waiter);
        Ok(())
    }

    /// Free the slot holding this exact waiter identity.
    ///
    /// A missing slot is a protocol violation by the caller and reported as
    /// `BadState`; it never happens in correct usage.
    pub fn remove(&mut self, wake: &WakeHandle) -> Result<()> {
        match self.slot_of(wake) {
            Some(i) => {
                self.slots[i] = None;
                Ok(())
            }
            None => Err(DeviceError::BadState("poll: bad fd state".into())),
        }
    }

    /// Deliver events to every occupied slot.
    ///
    /// Each waiter accumulates `events & interest`; a waiter whose observed
    /// mask is non-empty is signaled only if it is not already known to be
    /// signaled.
    pub fn notify(&mut self, events: Events) {
        for waiter in self.slots.iter_mut().flatten() {
            waiter.observed |= events & waiter.interest;
            if !waiter.observed.is_empty() && !waiter.wake.is_pending() {
                waiter.wake.signal();
            }
        }
    }

    /// Return and clear the accumulated readiness for one waiter, consuming
    /// any pending signal with it.
    pub fn take_observed(&mut self, wake: &WakeHandle) -> Result<Events> {
        let i = self
            .slot_of(wake)
            .ok_or_else(|| DeviceError::BadState("poll: bad fd state".into()))?;
        let waiter = self.slots[i].as_mut().ok_or_else(|| {
            // slot_of only returns occupied slots
            DeviceError::BadState("poll: bad fd state".into())
        })?;
        let observed = waiter.observed;
        waiter.observed = Events::empty();
        waiter.wake.clear_pending();
        Ok(observed)
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot_of(&self, wake: &WakeHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|w| w.wake.same_as(wake)))
    }
}

impl Default for PollWaiterSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_signals_when_already_ready() {
        let mut set = PollWaiterSet::new();
        let wake = WakeHandle::new();

        set.insert(Events::DATA_READY, wake.clone(), Events::DATA_READY)
            .unwrap();

        assert!(wake.is_pending());
        assert_eq!(set.take_observed(&wake).unwrap(), Events::DATA_READY);
        assert!(!wake.is_pending());
    }

    #[test]
    fn test_insert_quiet_until_notify() {
        let mut set = PollWaiterSet::new();
        let wake = WakeHandle::new();

        set.insert(Events::DATA_READY, wake.clone(), Events::empty())
            .unwrap();
        assert!(!wake.is_pending());

        set.notify(Events::DATA_READY);
        assert!(wake.is_pending());
    }

    #[test]
    fn test_notify_filters_by_interest() {
        let mut set = PollWaiterSet::new();
        let wake = WakeHandle::new();

        set.insert(Events::ERROR, wake.clone(), Events::empty())
            .unwrap();
        set.notify(Events::DATA_READY);
        assert!(!wake.is_pending());

        set.notify(Events::ERROR | Events::DATA_READY);
        assert_eq!(set.take_observed(&wake).unwrap(), Events::ERROR);
    }

    #[test]
    fn test_events_accumulate_across_notifies() {
        let mut set = PollWaiterSet::new();
        let wake = WakeHandle::new();

        set.insert(Events::all(), wake.clone(), Events::empty())
            .unwrap();
        set.notify(Events::DATA_READY);
        set.notify(Events::OVERRUN);

        assert_eq!(
            set.take_observed(&wake).unwrap(),
            Events::DATA_READY | Events::OVERRUN
        );
        assert_eq!(set.take_observed(&wake).unwrap(), Events::empty());
    }

    #[test]
    fn test_slots_exhaust_and_reuse() {
        let mut set = PollWaiterSet::new();
        let wakes: Vec<WakeHandle> = (0..MAX_POLL_WAITERS).map(|_| WakeHandle::new()).collect();
        for wake in &wakes {
            set.insert(Events::DATA_READY, wake.clone(), Events::empty())
                .unwrap();
        }

        let overflow = WakeHandle::new();
        let err = set
            .insert(Events::DATA_READY, overflow.clone(), Events::empty())
            .unwrap_err();
        assert!(err.is_no_space());

        set.remove(&wakes[3]).unwrap();
        set.insert(Events::DATA_READY, overflow, Events::empty())
            .unwrap();
    }

    #[test]
    fn test_remove_unknown_waiter_is_bad_state() {
        let mut set = PollWaiterSet::new();
        let err = set.remove(&WakeHandle::new()).unwrap_err();
        assert_eq!(err, DeviceError::BadState("poll: bad fd state".into()));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut set = PollWaiterSet::new();
        let wake = WakeHandle::new();
        set.insert(Events::DATA_READY, wake.clone(), Events::empty())
            .unwrap();
        assert!(set
            .insert(Events::DATA_READY, wake, Events::empty())
            .is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_no_redundant_signal_while_pending() {
        let mut set = PollWaiterSet::new();
        let wake = WakeHandle::new();
        set.insert(Events::DATA_READY, wake.clone(), Events::empty())
            .unwrap();

        set.notify(Events::DATA_READY);
        assert!(wake.is_pending());
        // second notify accumulates but leaves the pending signal alone
        set.notify(Events::DATA_READY);
        assert!(wake.is_pending());
        assert_eq!(set.take_observed(&wake).unwrap(), Events::DATA_READY);
    }

    #[test]
    fn test_wait_timeout_sees_signal_from_thread() {
        let wake = WakeHandle::new();
        let signaler = wake.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaler.signal();
        });

        assert!(wake.wait_timeout(Duration::from_secs(2)));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires_without_signal() {
        let wake = WakeHandle::new();
        assert!(!wake.wait_timeout(Duration::from_millis(10)));
    }
}
