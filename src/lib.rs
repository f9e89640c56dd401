//! Virtual character-device layer for a flight-control stack.
//!
//! `fcdev` provides the device abstraction a sensor driver builds on
//! without an operating-system filesystem underneath:
//!
//! - [`registry`] — a process-wide table mapping path-like names
//!   (`/dev/...`, `/obj/...`) to live devices, with class-instance naming
//!   and prefix enumeration.
//! - [`device`] — the shared device protocol: open/close reference
//!   counting with first-open/last-close hooks, two-stage ioctl dispatch,
//!   and poll registration/notification.
//! - [`poll`] — bounded waiter sets and the wake primitive callers park on.
//! - [`sampling`] — a timer-driven engine that pulls raw frames through a
//!   [`sampling::Transport`], converts and filters them, stages records in
//!   ring buffers, and fans out readiness and topic publication.
//! - [`imu`] — a concrete six-axis driver: two endpoints (accelerometer,
//!   gyro) sharing one engine.
//! - [`sim`] — a synthetic transport and in-memory sink for development
//!   and tests.
//!
//! Nothing in this crate blocks or sleeps on the caller's path: `read`
//! returns [`DeviceError::WouldBlock`] instead of waiting, and poll
//! waiting happens on the caller's side via [`poll::WakeHandle`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use fcdev::{DeviceRegistry, ImuConfig, ImuSensor, SampleRecord};
//! use fcdev::sim::{MemorySink, SimTransport};
//!
//! # fn main() -> fcdev::Result<()> {
//! let registry = Arc::new(DeviceRegistry::with_capacity(16));
//! let imu = ImuSensor::new(
//!     Box::new(SimTransport::new()),
//!     Arc::new(MemorySink::default()),
//!     Arc::clone(&registry),
//!     &ImuConfig::default(),
//! )?;
//!
//! // manual mode: each read takes one fresh sample
//! imu.engine().set_interval_us(0);
//! let accel = registry.lookup("/dev/imu_accel")?;
//! accel.open()?;
//! let mut out = [SampleRecord::default(); 1];
//! accel.read(&mut out)?;
//! accel.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod imu;
pub mod poll;
pub mod registry;
pub mod ring;
pub mod sampling;
pub mod sim;
pub mod trace;

pub use config::ImuConfig;
pub use data::{AxisScale, Rotation, SampleRecord, ONE_G};
pub use device::{CDev, DeviceOps, Ioctl, IoctlReply, PollRate};
pub use error::{DeviceError, Result};
pub use imu::ImuSensor;
pub use poll::{Events, WakeHandle};
pub use registry::{DeviceRegistry, DEV_NAMESPACE, TOPIC_NAMESPACE};
pub use ring::RingBuffer;
pub use sampling::{SampleFilter, SampleSink, SamplingEngine, Transport};
