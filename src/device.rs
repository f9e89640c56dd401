//! Character-device base layer.
//!
//! Every driver endpoint embeds a [`CDev`] and implements [`DeviceOps`].
//! The trait's provided methods carry the shared protocol — open/close
//! reference counting with first-open/last-close hooks, poll registration
//! and notification, and the base stage of ioctl dispatch — so a driver
//! only writes the hooks and commands it actually supports.
//!
//! Lock order: a device's state lock is always taken before any
//! driver-internal lock (such as the sampling engine's). Provided methods
//! call hooks (`open_first`, `poll_state`) while holding the device lock,
//! so hooks may take driver locks but must never call back into the
//! device's own lifecycle or poll methods.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::data::{AxisScale, SampleRecord};
use crate::error::{DeviceError, Result};
use crate::poll::{Events, PollWaiterSet, WakeHandle};
use crate::registry::DeviceRegistry;

/// Requested measurement cadence for `Ioctl::SetPollRate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollRate {
    /// No timer; each read triggers one measurement cycle
    Manual,
    /// The driver's default cadence
    Default,
    /// The fastest cadence the driver supports
    Max,
    /// An explicit rate in Hz
    Hz(u32),
}

/// Driver control commands.
///
/// Dispatch is two-stage: a driver's `ioctl` matches the commands it
/// understands and forwards everything else to [`DeviceOps::base_ioctl`],
/// which handles the device-generic commands and reports the rest as
/// [`DeviceError::Unsupported`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ioctl {
    /// Fetch the driver's private handle for in-process shortcuts
    GetPrivateHandle,
    /// Suppress or re-enable topic publication
    SetPublishBlocked(bool),
    GetPublishBlocked,
    GetDeviceId,
    /// Clear staged data and fault counters
    Reset,
    SetPollRate(PollRate),
    GetPollRate,
    /// Staging ring depth in records
    SetQueueDepth(usize),
    GetQueueDepth,
    /// Underlying measurement rate in Hz
    SetSampleRate(u32),
    GetSampleRate,
    SetScale(AxisScale),
    GetScale,
    GetRange,
}

/// Replies to [`Ioctl`] commands. `None` acknowledges a command that
/// returns no data.
#[derive(Clone)]
pub enum IoctlReply {
    None,
    PrivateHandle(Arc<dyn Any + Send + Sync>),
    Flag(bool),
    DeviceId(u32),
    PollRate(PollRate),
    QueueDepth(usize),
    SampleRate(u32),
    Scale(AxisScale),
    /// Full-scale range in SI units
    Range(f32),
}

impl std::fmt::Debug for IoctlReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::PrivateHandle(_) => write!(f, "PrivateHandle(..)"),
            Self::Flag(v) => write!(f, "Flag({v})"),
            Self::DeviceId(v) => write!(f, "DeviceId({v:#x})"),
            Self::PollRate(v) => write!(f, "PollRate({v:?})"),
            Self::QueueDepth(v) => write!(f, "QueueDepth({v})"),
            Self::SampleRate(v) => write!(f, "SampleRate({v})"),
            Self::Scale(v) => write!(f, "Scale({v:?})"),
            Self::Range(v) => write!(f, "Range({v})"),
        }
    }
}

struct CdevState {
    open_count: usize,
    waiters: PollWaiterSet,
}

/// Shared per-device state embedded by every driver endpoint.
pub struct CDev {
    name: String,
    /// Primary registry path, absent for devices that stay off the registry
    devname: Option<String>,
    device_id: AtomicU32,
    pub_blocked: AtomicBool,
    registered: AtomicBool,
    registry: Arc<DeviceRegistry>,
    /// Extra registry names (class instances) released on drop
    aliases: Mutex<Vec<String>>,
    state: Mutex<CdevState>,
}

impl CDev {
    pub fn new(
        name: impl Into<String>,
        devname: impl Into<String>,
        registry: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            name: name.into(),
            devname: Some(devname.into()),
            device_id: AtomicU32::new(0),
            pub_blocked: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            registry,
            aliases: Mutex::new(Vec::new()),
            state: Mutex::new(CdevState {
                open_count: 0,
                waiters: PollWaiterSet::new(),
            }),
        }
    }

    /// A device with no registry path. [`init`] is a no-op for it; callers
    /// reach it only through a handle they already hold.
    pub fn unnamed(name: impl Into<String>, registry: Arc<DeviceRegistry>) -> Self {
        Self {
            name: name.into(),
            devname: None,
            device_id: AtomicU32::new(0),
            pub_blocked: AtomicBool::new(false),
            registered: AtomicBool::new(false),
            registry,
            aliases: Mutex::new(Vec::new()),
            state: Mutex::new(CdevState {
                open_count: 0,
                waiters: PollWaiterSet::new(),
            }),
        }
    }

    /// Driver-friendly name for logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Primary registry path of this device, if it has one.
    pub fn devname(&self) -> Option<&str> {
        self.devname.as_deref()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn device_id(&self) -> u32 {
        self.device_id.load(Ordering::Relaxed)
    }

    pub fn set_device_id(&self, id: u32) {
        self.device_id.store(id, Ordering::Relaxed);
    }

    pub fn is_pub_blocked(&self) -> bool {
        self.pub_blocked.load(Ordering::Relaxed)
    }

    pub fn set_pub_blocked(&self, blocked: bool) {
        self.pub_blocked.store(blocked, Ordering::Relaxed);
    }

    /// Record an additional registry name owned by this device so it is
    /// released together with the primary name.
    pub fn add_alias(&self, name: impl Into<String>) {
        self.aliases.lock().push(name.into());
    }

    fn mark_registered(&self) {
        self.registered.store(true, Ordering::Release);
    }
}

impl Drop for CDev {
    fn drop(&mut self) {
        for alias in self.aliases.lock().drain(..) {
            if let Err(e) = self.registry.unregister(&alias) {
                warn!(name = %self.name, alias = %alias, error = %e, "alias unregister failed");
            }
        }
        if self.registered.swap(false, Ordering::AcqRel) {
            if let Some(devname) = self.devname.as_deref() {
                if let Err(e) = self.registry.unregister(devname) {
                    warn!(name = %self.name, devname = %devname, error = %e, "unregister failed");
                }
            }
        }
    }
}

/// Driver endpoint interface.
///
/// Required: [`cdev`](Self::cdev). Hook methods (`open_first`,
/// `close_last`, `poll_state`, `read`, `ioctl`, `private_data`) have
/// do-nothing defaults. The lifecycle and poll methods below them are the
/// shared protocol and are not meant to be overridden.
pub trait DeviceOps: Send + Sync {
    /// The embedded per-device state.
    fn cdev(&self) -> &CDev;

    /// Called when the open count goes 0 -> 1. An error aborts the open
    /// and rolls the count back.
    fn open_first(&self) -> Result<()> {
        Ok(())
    }

    /// Called when the open count returns to 0. An error is reported to
    /// the closing caller but the close itself has already happened.
    fn close_last(&self) -> Result<()> {
        Ok(())
    }

    /// Drain staged records into `out`, returning the number written.
    fn read(&self, _out: &mut [SampleRecord]) -> Result<usize> {
        Err(DeviceError::NotImplemented)
    }

    /// Accept records from the caller. Sensor endpoints are read-only.
    fn write(&self, _records: &[SampleRecord]) -> Result<usize> {
        Err(DeviceError::NotImplemented)
    }

    /// Reposition a read cursor. Staged-record devices are not seekable.
    fn seek(&self, _offset: i64) -> Result<u64> {
        Err(DeviceError::NotImplemented)
    }

    /// Readiness snapshot used when a poll waiter registers.
    fn poll_state(&self) -> Events {
        Events::empty()
    }

    /// Driver handle returned by `Ioctl::GetPrivateHandle`.
    fn private_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }

    /// First dispatch stage. Drivers override this, handle their own
    /// commands and forward the rest to [`base_ioctl`](Self::base_ioctl).
    fn ioctl(&self, cmd: Ioctl) -> Result<IoctlReply> {
        self.base_ioctl(cmd)
    }

    /// Second dispatch stage: the device-generic commands.
    fn base_ioctl(&self, cmd: Ioctl) -> Result<IoctlReply> {
        let cdev = self.cdev();
        match cmd {
            Ioctl::GetPrivateHandle => self
                .private_data()
                .map(IoctlReply::PrivateHandle)
                .ok_or(DeviceError::Unsupported),
            Ioctl::SetPublishBlocked(blocked) => {
                cdev.set_pub_blocked(blocked);
                Ok(IoctlReply::None)
            }
            Ioctl::GetPublishBlocked => Ok(IoctlReply::Flag(cdev.is_pub_blocked())),
            Ioctl::GetDeviceId => Ok(IoctlReply::DeviceId(cdev.device_id())),
            _ => Err(DeviceError::Unsupported),
        }
    }

    // ------------------------------------------------------------------
    // Shared protocol
    // ------------------------------------------------------------------

    /// Open a handle. The first concurrent open runs `open_first`; its
    /// failure rolls the count back and is returned to the caller.
    fn open(&self) -> Result<()> {
        let mut st = self.cdev().state.lock();
        st.open_count += 1;
        if st.open_count == 1 {
            if let Err(e) = self.open_first() {
                st.open_count = 0;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close a handle. Closing an unopened device is `BadState`. The last
    /// close runs `close_last` after the count has dropped; its error is
    /// passed through but cannot undo the close.
    fn close(&self) -> Result<()> {
        let mut st = self.cdev().state.lock();
        if st.open_count == 0 {
            return Err(DeviceError::BadState(format!(
                "{}: close without open",
                self.cdev().name
            )));
        }
        st.open_count -= 1;
        if st.open_count == 0 {
            return self.close_last();
        }
        Ok(())
    }

    /// Current number of open handles.
    fn open_count(&self) -> usize {
        self.cdev().state.lock().open_count
    }

    /// Register a poll waiter. Readiness existing at registration time is
    /// credited immediately, so a caller never misses events that predate
    /// its registration.
    fn poll_begin(&self, interest: Events, wake: WakeHandle) -> Result<()> {
        let mut st = self.cdev().state.lock();
        let current = self.poll_state();
        st.waiters.insert(interest, wake, current)
    }

    /// Remove a poll waiter registered with [`poll_begin`](Self::poll_begin).
    fn poll_end(&self, wake: &WakeHandle) -> Result<()> {
        self.cdev().state.lock().waiters.remove(wake)
    }

    /// Consume the events accumulated for one waiter.
    fn poll_take_events(&self, wake: &WakeHandle) -> Result<Events> {
        self.cdev().state.lock().waiters.take_observed(wake)
    }

    /// Deliver events to every registered waiter. Called by producers
    /// after staging data; never call while holding a driver lock that a
    /// `poll_state` hook also takes.
    fn notify(&self, events: Events) {
        self.cdev().state.lock().waiters.notify(events);
    }
}

/// Register a device under its primary name. Must be called once after
/// construction, before handing the device to callers; the matching
/// unregister happens automatically when the device is dropped. A device
/// built with [`CDev::unnamed`] has no name to register and this does
/// nothing.
pub fn init<T: DeviceOps + 'static>(dev: &Arc<T>) -> Result<()> {
    let cdev = dev.cdev();
    let Some(devname) = cdev.devname.as_deref() else {
        return Ok(());
    };
    let weak: Weak<dyn DeviceOps> = Arc::downgrade(dev) as Weak<dyn DeviceOps>;
    cdev.registry.register(devname, weak)?;
    cdev.mark_registered();
    debug!(name = %cdev.name, devname = %devname, "device initialized");
    Ok(())
}
