//! Error types for the device layer.
//!
//! Every fallible operation in this crate reports a [`DeviceError`]. The
//! variants mirror the classic character-device error taxonomy: callers can
//! match on them directly, and all of them are local and recoverable — the
//! device layer defines no fatal conditions. Producer-side transport faults
//! are deliberately *not* represented here; they are absorbed into counters
//! (see [`crate::sampling::FaultCounters`]) and surface through the
//! `error_count` field of staged samples.

use thiserror::Error;

/// Result type alias for device-layer operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors reported by registry, device and sampling operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// An argument failed validation (empty name, zero depth, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A registry name is already taken
    #[error("Device '{0}' is already registered")]
    AlreadyExists(String),

    /// No registry record matches the given name
    #[error("Device '{0}' not found")]
    NotFound(String),

    /// A bounded resource is exhausted (registry slots, waiter slots,
    /// caller buffer too small for one record)
    #[error("No space: {0}")]
    NoSpace(String),

    /// Operation is illegal in the current lifecycle state
    /// (close without open, teardown of an unknown poll waiter)
    #[error("Bad state: {0}")]
    BadState(String),

    /// Ioctl command not recognized at any dispatch stage
    #[error("Unsupported ioctl command")]
    Unsupported,

    /// No data available yet; the caller may retry (this layer never blocks)
    #[error("No data available")]
    WouldBlock,

    /// Operation not provided by this device type
    #[error("Operation not implemented")]
    NotImplemented,
}

impl DeviceError {
    /// Check whether this is the non-blocking "no data yet" case.
    pub fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// Check whether this is a name-collision error.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    /// Check whether a bounded resource was exhausted.
    pub fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeviceError::AlreadyExists("/dev/imu_accel".into());
        assert!(err.to_string().contains("/dev/imu_accel"));

        let err = DeviceError::NoSpace("registry full".into());
        assert!(err.to_string().contains("registry full"));
    }

    #[test]
    fn test_error_predicates() {
        assert!(DeviceError::WouldBlock.is_would_block());
        assert!(!DeviceError::Unsupported.is_would_block());
        assert!(DeviceError::AlreadyExists("x".into()).is_already_exists());
        assert!(DeviceError::NoSpace("y".into()).is_no_space());
    }
}
