//! Simulated six-axis IMU driver: one sampling engine, two endpoints.
//!
//! The accelerometer and gyro are two logical channels of one physical
//! sensor, so they share a single [`SamplingEngine`] that owns the
//! transport. Each endpoint is an independently openable device; dropping
//! one endpoint never tears down the engine while the other is live,
//! because the engine is held by `Arc` from both endpoints and the driver.

use std::any::Any;
use std::sync::{Arc, Weak};

use tracing::info;

use crate::config::ImuConfig;
use crate::data::{SampleRecord, ONE_G};
use crate::device::{self, CDev, DeviceOps, Ioctl, IoctlReply, PollRate};
use crate::error::{DeviceError, Result};
use crate::poll::Events;
use crate::registry::DeviceRegistry;
use crate::sampling::{
    ChannelConfig, ChannelId, FrameField, SampleSink, SamplingEngine, Transport,
};

pub const ACCEL_DEVICE_PATH: &str = "/dev/imu_accel";
pub const GYRO_DEVICE_PATH: &str = "/dev/imu_gyro";
pub const ACCEL_CLASS_PREFIX: &str = "/dev/accel";
pub const GYRO_CLASS_PREFIX: &str = "/dev/gyro";
pub const ACCEL_TOPIC: &str = "/obj/sensor_accel";
pub const GYRO_TOPIC: &str = "/obj/sensor_gyro";

pub const ACCEL_DEVICE_ID: u32 = 0x6a01;
pub const GYRO_DEVICE_ID: u32 = 0x6a02;

/// Poll rate selected by `PollRate::Default`.
pub const DEFAULT_RATE_HZ: u32 = 250;
/// Fastest supported poll rate.
pub const MAX_RATE_HZ: u32 = 1000;

/// Raw counts at positive full scale for the 16-bit sensor words.
const FULL_SCALE_COUNTS: f32 = 32768.0;

/// Driver top-level object. Owns the engine and both endpoints.
pub struct ImuSensor {
    engine: Arc<SamplingEngine>,
    accel: Arc<AccelEndpoint>,
    gyro: Arc<GyroEndpoint>,
}

impl ImuSensor {
    /// Build the engine and register both endpoints.
    ///
    /// A failure after the accelerometer registered rolls everything back
    /// through endpoint drop, which unregisters all claimed names.
    pub fn new(
        transport: Box<dyn Transport>,
        sink: Arc<dyn SampleSink>,
        registry: Arc<DeviceRegistry>,
        config: &ImuConfig,
    ) -> Result<Arc<Self>> {
        let engine = Arc::new(SamplingEngine::new(transport, sink));

        let accel_range = config.accel_range_g * ONE_G;
        let accel_channel = engine.add_channel(ChannelConfig {
            name: "accel".into(),
            topic: ACCEL_TOPIC.into(),
            field: FrameField::Accel,
            rotation: config.rotation,
            range_scale: accel_range / FULL_SCALE_COUNTS,
            range: accel_range,
            queue_depth: config.queue_depth,
            sample_rate_hz: config.sample_rate_hz,
            cutoff_hz: config.accel_cutoff_hz,
        });

        let gyro_range = config.gyro_range_dps.to_radians();
        let gyro_channel = engine.add_channel(ChannelConfig {
            name: "gyro".into(),
            topic: GYRO_TOPIC.into(),
            field: FrameField::Gyro,
            rotation: config.rotation,
            range_scale: gyro_range / FULL_SCALE_COUNTS,
            range: gyro_range,
            queue_depth: config.queue_depth,
            sample_rate_hz: config.sample_rate_hz,
            cutoff_hz: config.gyro_cutoff_hz,
        });

        let accel = Arc::new(AccelEndpoint {
            cdev: CDev::new("imu_accel", ACCEL_DEVICE_PATH, Arc::clone(&registry)),
            engine: Arc::clone(&engine),
            channel: accel_channel,
        });
        accel.cdev.set_device_id(ACCEL_DEVICE_ID);
        device::init(&accel)?;
        let (_, class_name) = registry
            .register_class_instance(ACCEL_CLASS_PREFIX, Arc::downgrade(&accel) as Weak<dyn DeviceOps>)?;
        accel.cdev.add_alias(class_name);
        engine.attach_endpoint(accel_channel, Arc::downgrade(&accel) as Weak<dyn DeviceOps>)?;

        let gyro = Arc::new(GyroEndpoint {
            cdev: CDev::new("imu_gyro", GYRO_DEVICE_PATH, Arc::clone(&registry)),
            engine: Arc::clone(&engine),
            channel: gyro_channel,
        });
        gyro.cdev.set_device_id(GYRO_DEVICE_ID);
        device::init(&gyro)?;
        let (_, class_name) = registry
            .register_class_instance(GYRO_CLASS_PREFIX, Arc::downgrade(&gyro) as Weak<dyn DeviceOps>)?;
        gyro.cdev.add_alias(class_name);
        engine.attach_endpoint(gyro_channel, Arc::downgrade(&gyro) as Weak<dyn DeviceOps>)?;

        if config.poll_rate_hz > 0 {
            engine.set_interval_us(1_000_000 / u64::from(config.poll_rate_hz));
        }

        info!(
            poll_rate_hz = config.poll_rate_hz,
            sample_rate_hz = config.sample_rate_hz,
            "imu driver ready"
        );
        Ok(Arc::new(Self {
            engine,
            accel,
            gyro,
        }))
    }

    /// Arm periodic sampling at the configured interval.
    pub fn start(&self) -> Result<()> {
        self.engine.start()
    }

    /// Cancel sampling; an in-flight tick completes.
    pub fn stop(&self) {
        self.engine.stop();
    }

    pub fn engine(&self) -> &Arc<SamplingEngine> {
        &self.engine
    }

    pub fn accel(&self) -> &Arc<AccelEndpoint> {
        &self.accel
    }

    pub fn gyro(&self) -> &Arc<GyroEndpoint> {
        &self.gyro
    }
}

impl Drop for ImuSensor {
    /// The ticker thread keeps the engine alive; without an explicit stop
    /// here a dropped driver would leave it sampling forever.
    fn drop(&mut self) {
        self.engine.stop();
    }
}

/// Accelerometer endpoint; delegates to the shared engine.
pub struct AccelEndpoint {
    cdev: CDev,
    engine: Arc<SamplingEngine>,
    channel: ChannelId,
}

/// Gyro endpoint; delegates to the shared engine.
pub struct GyroEndpoint {
    cdev: CDev,
    engine: Arc<SamplingEngine>,
    channel: ChannelId,
}

impl DeviceOps for AccelEndpoint {
    fn cdev(&self) -> &CDev {
        &self.cdev
    }

    fn read(&self, out: &mut [SampleRecord]) -> Result<usize> {
        self.engine.read(self.channel, out)
    }

    fn poll_state(&self) -> Events {
        self.engine.data_ready(self.channel)
    }

    fn private_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        Some(Arc::clone(&self.engine) as Arc<dyn Any + Send + Sync>)
    }

    fn ioctl(&self, cmd: Ioctl) -> Result<IoctlReply> {
        match sampling_ioctl(&self.engine, self.channel, cmd)? {
            Some(reply) => Ok(reply),
            None => self.base_ioctl(cmd),
        }
    }
}

impl DeviceOps for GyroEndpoint {
    fn cdev(&self) -> &CDev {
        &self.cdev
    }

    fn read(&self, out: &mut [SampleRecord]) -> Result<usize> {
        self.engine.read(self.channel, out)
    }

    fn poll_state(&self) -> Events {
        self.engine.data_ready(self.channel)
    }

    fn private_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        Some(Arc::clone(&self.engine) as Arc<dyn Any + Send + Sync>)
    }

    fn ioctl(&self, cmd: Ioctl) -> Result<IoctlReply> {
        match sampling_ioctl(&self.engine, self.channel, cmd)? {
            Some(reply) => Ok(reply),
            None => self.base_ioctl(cmd),
        }
    }
}

/// First dispatch stage shared by both endpoints. `Ok(None)` means the
/// command is not a sampling command and falls through to the base stage.
fn sampling_ioctl(
    engine: &Arc<SamplingEngine>,
    channel: ChannelId,
    cmd: Ioctl,
) -> Result<Option<IoctlReply>> {
    let reply = match cmd {
        Ioctl::Reset => {
            engine.reset();
            IoctlReply::None
        }
        Ioctl::SetPollRate(rate) => {
            let interval_us = interval_for(rate)?;
            engine.set_interval_us(interval_us);
            if interval_us == 0 {
                engine.stop();
            } else {
                engine.start()?;
            }
            IoctlReply::None
        }
        Ioctl::GetPollRate => {
            let interval_us = engine.interval_us();
            let rate = if interval_us == 0 {
                PollRate::Manual
            } else {
                PollRate::Hz((1_000_000 / interval_us) as u32)
            };
            IoctlReply::PollRate(rate)
        }
        Ioctl::SetQueueDepth(depth) => {
            engine.set_queue_depth(channel, depth)?;
            IoctlReply::None
        }
        Ioctl::GetQueueDepth => IoctlReply::QueueDepth(engine.queue_depth(channel)?),
        Ioctl::SetSampleRate(rate_hz) => {
            engine.set_sample_rate(channel, rate_hz)?;
            IoctlReply::None
        }
        Ioctl::GetSampleRate => IoctlReply::SampleRate(engine.sample_rate(channel)?),
        Ioctl::SetScale(scale) => {
            engine.set_calibration(channel, scale)?;
            IoctlReply::None
        }
        Ioctl::GetScale => IoctlReply::Scale(engine.calibration(channel)?),
        Ioctl::GetRange => IoctlReply::Range(engine.range(channel)?),
        _ => return Ok(None),
    };
    Ok(Some(reply))
}

fn interval_for(rate: PollRate) -> Result<u64> {
    match rate {
        PollRate::Manual => Ok(0),
        PollRate::Default => Ok(1_000_000 / u64::from(DEFAULT_RATE_HZ)),
        PollRate::Max => Ok(1_000_000 / u64::from(MAX_RATE_HZ)),
        PollRate::Hz(hz) if (1..=MAX_RATE_HZ).contains(&hz) => Ok(1_000_000 / u64::from(hz)),
        PollRate::Hz(hz) => Err(DeviceError::InvalidArgument(format!(
            "poll rate {hz} Hz outside 1..={MAX_RATE_HZ}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{MemorySink, SimTransport};
    use std::time::Duration;

    fn imu(registry: &Arc<DeviceRegistry>) -> (Arc<ImuSensor>, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        let transport = Box::new(SimTransport::new().with_values([0, 0, 4096], [10, -10, 5]));
        let imu = ImuSensor::new(
            transport,
            sink.clone(),
            Arc::clone(registry),
            &ImuConfig::default(),
        )
        .unwrap();
        (imu, sink)
    }

    #[test]
    fn test_endpoints_registered_with_class_instances() {
        let registry = Arc::new(DeviceRegistry::with_capacity(16));
        let (imu, _sink) = imu(&registry);

        assert!(registry.exists(ACCEL_DEVICE_PATH));
        assert!(registry.exists(GYRO_DEVICE_PATH));
        assert!(registry.exists("/dev/accel0"));
        assert!(registry.exists("/dev/gyro0"));

        drop(imu);
        assert!(!registry.exists(ACCEL_DEVICE_PATH));
        assert!(!registry.exists("/dev/accel0"));
    }

    #[test]
    fn test_manual_read_through_endpoint() {
        let registry = Arc::new(DeviceRegistry::with_capacity(16));
        let (imu, _sink) = imu(&registry);
        imu.engine().set_interval_us(0);

        let accel = imu.accel();
        accel.open().unwrap();
        let mut out = [SampleRecord::default(); 1];
        assert_eq!(accel.read(&mut out).unwrap(), 1);
        assert_eq!(out[0].raw, [0, 0, 4096]);
        // 4096 counts at 8 g full scale is 1 g on z
        assert!((out[0].value[2] - ONE_G).abs() < 1e-3);
        accel.close().unwrap();
    }

    #[test]
    fn test_raw_axes_realigned_to_board_frame() {
        let registry = Arc::new(DeviceRegistry::with_capacity(16));
        let sink = Arc::new(MemorySink::default());
        let transport = Box::new(SimTransport::new().with_values([100, 200, 300], [10, 20, 30]));
        let imu = ImuSensor::new(
            transport,
            sink,
            Arc::clone(&registry),
            &ImuConfig::default(),
        )
        .unwrap();
        imu.engine().set_interval_us(0);

        let mut out = [SampleRecord::default(); 1];
        imu.accel().read(&mut out).unwrap();
        assert_eq!(out[0].raw, [200, -100, 300]);
        imu.gyro().read(&mut out).unwrap();
        assert_eq!(out[0].raw, [20, -10, 30]);
    }

    #[test]
    fn test_gyro_shares_engine_commands() {
        let registry = Arc::new(DeviceRegistry::with_capacity(16));
        let (imu, _sink) = imu(&registry);

        imu.gyro().ioctl(Ioctl::SetQueueDepth(5)).unwrap();
        assert!(matches!(
            imu.gyro().ioctl(Ioctl::GetQueueDepth),
            Ok(IoctlReply::QueueDepth(5))
        ));
        // accel channel depth is independent
        assert!(matches!(
            imu.accel().ioctl(Ioctl::GetQueueDepth),
            Ok(IoctlReply::QueueDepth(2))
        ));

        // identity stays per-endpoint
        assert!(matches!(
            imu.gyro().ioctl(Ioctl::GetDeviceId),
            Ok(IoctlReply::DeviceId(GYRO_DEVICE_ID))
        ));
        assert!(matches!(
            imu.accel().ioctl(Ioctl::GetDeviceId),
            Ok(IoctlReply::DeviceId(ACCEL_DEVICE_ID))
        ));
    }

    #[test]
    fn test_poll_rate_round_trip() {
        let registry = Arc::new(DeviceRegistry::with_capacity(16));
        let (imu, _sink) = imu(&registry);

        imu.accel()
            .ioctl(Ioctl::SetPollRate(PollRate::Hz(500)))
            .unwrap();
        assert!(imu.engine().is_running());
        assert!(matches!(
            imu.accel().ioctl(Ioctl::GetPollRate),
            Ok(IoctlReply::PollRate(PollRate::Hz(500)))
        ));

        imu.accel()
            .ioctl(Ioctl::SetPollRate(PollRate::Manual))
            .unwrap();
        assert!(!imu.engine().is_running());

        assert!(matches!(
            imu.accel().ioctl(Ioctl::SetPollRate(PollRate::Hz(0))),
            Err(DeviceError::InvalidArgument(_))
        ));
        assert!(matches!(
            imu.accel().ioctl(Ioctl::SetPollRate(PollRate::Hz(MAX_RATE_HZ + 1))),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_publish_blocked_suppresses_topic_only() {
        let registry = Arc::new(DeviceRegistry::with_capacity(16));
        let (imu, sink) = imu(&registry);

        imu.accel()
            .ioctl(Ioctl::SetPublishBlocked(true))
            .unwrap();
        imu.engine().tick();

        // gyro still publishes, accel is suppressed but still staged
        assert_eq!(sink.count_for(ACCEL_TOPIC), 0);
        assert_eq!(sink.count_for(GYRO_TOPIC), 1);
        assert_eq!(imu.accel().poll_state(), Events::DATA_READY);
    }

    #[test]
    fn test_periodic_sampling_wakes_poller() {
        let registry = Arc::new(DeviceRegistry::with_capacity(16));
        let (imu, _sink) = imu(&registry);
        imu.engine().set_interval_us(2_000);

        let wake = crate::poll::WakeHandle::new();
        imu.accel()
            .poll_begin(Events::DATA_READY, wake.clone())
            .unwrap();

        imu.start().unwrap();
        assert!(wake.wait_timeout(Duration::from_secs(2)));
        imu.stop();

        assert_eq!(
            imu.accel().poll_take_events(&wake).unwrap(),
            Events::DATA_READY
        );
        imu.accel().poll_end(&wake).unwrap();
    }

    #[test]
    fn test_private_data_exposes_engine() {
        let registry = Arc::new(DeviceRegistry::with_capacity(16));
        let (imu, _sink) = imu(&registry);

        let handle = imu.accel().private_data().unwrap();
        assert!(handle.downcast::<SamplingEngine>().is_ok());
    }
}
