//! Process-wide virtual device registry.
//!
//! Devices publish themselves under path-like names (`/dev/imu_accel`,
//! `/obj/sensor_gyro`) in a bounded slot table. The registry holds weak
//! handles only: a dropped device never lingers as a live entry, and the
//! registry can never keep a device alive past its owner.
//!
//! There is one [`DeviceRegistry::global`] table for the process; tests
//! build private tables with [`DeviceRegistry::with_capacity`] to avoid
//! cross-test interference.

use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::device::DeviceOps;
use crate::error::{DeviceError, Result};

/// Slot count of the default registry table.
pub const MAX_DEVICES: usize = 100;

/// Number of instance suffixes tried when registering a class device.
pub const MAX_CLASS_INSTANCES: usize = 4;

/// Namespace prefix for character device nodes.
pub const DEV_NAMESPACE: &str = "/dev/";

/// Namespace prefix for published data topics.
pub const TOPIC_NAMESPACE: &str = "/obj/";

static GLOBAL: Lazy<Arc<DeviceRegistry>> =
    Lazy::new(|| Arc::new(DeviceRegistry::with_capacity(MAX_DEVICES)));

struct DeviceRecord {
    name: String,
    handle: Weak<dyn DeviceOps>,
}

/// Bounded name-to-device table.
pub struct DeviceRegistry {
    slots: Mutex<Vec<Option<DeviceRecord>>>,
}

impl DeviceRegistry {
    /// The process-wide registry.
    pub fn global() -> &'static Arc<DeviceRegistry> {
        &GLOBAL
    }

    /// Build a private registry with `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Claim a name for a device.
    ///
    /// Slots whose device has been dropped are reclaimed here, so a leaked
    /// unregister never permanently burns a slot.
    pub fn register(&self, name: &str, handle: Weak<dyn DeviceOps>) -> Result<()> {
        if name.is_empty() {
            return Err(DeviceError::InvalidArgument("device name is empty".into()));
        }
        if !name.starts_with('/') {
            return Err(DeviceError::InvalidArgument(format!(
                "device name '{name}' must be absolute"
            )));
        }

        let mut slots = self.slots.lock();

        let mut free = None;
        for (i, slot) in slots.iter().enumerate() {
            match slot {
                Some(rec) if rec.handle.strong_count() > 0 => {
                    if rec.name == name {
                        return Err(DeviceError::AlreadyExists(name.to_string()));
                    }
                }
                _ => {
                    if free.is_none() {
                        free = Some(i);
                    }
                }
            }
        }

        let i = free.ok_or_else(|| DeviceError::NoSpace("device registry full".into()))?;
        slots[i] = Some(DeviceRecord {
            name: name.to_string(),
            handle,
        });
        debug!(name, slot = i, "registered device");
        Ok(())
    }

    /// Claim the first free numbered name under a class prefix.
    ///
    /// Tries `{prefix}{0..MAX_CLASS_INSTANCES}` in order and returns the
    /// claimed instance number with its full name. All instances taken is
    /// `NoSpace`.
    pub fn register_class_instance(
        &self,
        class_prefix: &str,
        handle: Weak<dyn DeviceOps>,
    ) -> Result<(usize, String)> {
        for instance in 0..MAX_CLASS_INSTANCES {
            let name = format!("{class_prefix}{instance}");
            match self.register(&name, handle.clone()) {
                Ok(()) => return Ok((instance, name)),
                Err(e) if e.is_already_exists() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(DeviceError::NoSpace(format!(
            "no free instance under '{class_prefix}'"
        )))
    }

    /// Release the numbered name `{class_prefix}{instance}` claimed by
    /// [`register_class_instance`](Self::register_class_instance).
    pub fn unregister_class_instance(&self, class_prefix: &str, instance: usize) -> Result<()> {
        self.unregister(&format!("{class_prefix}{instance}"))
    }

    /// Release a name. Unknown names report `NotFound`.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|rec| rec.name == name) {
                *slot = None;
                debug!(name, "unregistered device");
                return Ok(());
            }
        }
        Err(DeviceError::NotFound(name.to_string()))
    }

    /// Resolve a name to a live device handle.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn DeviceOps>> {
        let slots = self.slots.lock();
        slots
            .iter()
            .flatten()
            .find(|rec| rec.name == name)
            .and_then(|rec| rec.handle.upgrade())
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))
    }

    /// Whether a live device currently owns this name.
    pub fn exists(&self, name: &str) -> bool {
        let slots = self.slots.lock();
        slots
            .iter()
            .flatten()
            .any(|rec| rec.name == name && rec.handle.strong_count() > 0)
    }

    /// Iterate names under a namespace prefix.
    ///
    /// The iterator is lazy: each step takes the registry lock briefly, so
    /// registrations may appear or vanish mid-walk. Names are reported in
    /// slot order.
    pub fn enumerate(self: &Arc<Self>, prefix: &str) -> Enumerator {
        Enumerator {
            registry: Arc::clone(self),
            prefix: prefix.to_string(),
            next_index: 0,
        }
    }
}

/// Lazy walk over registered names with a common prefix.
pub struct Enumerator {
    registry: Arc<DeviceRegistry>,
    prefix: String,
    next_index: usize,
}

impl Iterator for Enumerator {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let slots = self.registry.slots.lock();
        while self.next_index < slots.len() {
            let i = self.next_index;
            self.next_index += 1;
            if let Some(rec) = &slots[i] {
                if rec.handle.strong_count() > 0 && rec.name.starts_with(&self.prefix) {
                    return Some(rec.name.clone());
                }
            }
        }
        None
    }
}
