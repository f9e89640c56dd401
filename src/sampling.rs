//! Timer-driven sampling engine.
//!
//! One engine owns the transport to a physical sensor and stages finished
//! records into per-channel ring buffers. A ticker thread (or a manual-mode
//! read) drives measurement cycles; endpoints delegate their `read`,
//! readiness and most ioctls here.
//!
//! Concurrency contract: everything mutable sits behind one engine lock.
//! A tick stages records *under* that lock, then releases it before fanning
//! out readiness notification and publication, because notification takes
//! the endpoint's device lock and device locks are always taken before the
//! engine lock (`poll_state` runs under a device lock and queries readiness
//! here). Faults never surface to callers synchronously; they only move
//! counters and the `error_count` field of later records.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::data::{now_us, AxisScale, Rotation, SampleRecord};
use crate::device::DeviceOps;
use crate::error::{DeviceError, Result};
use crate::poll::Events;
use crate::ring::RingBuffer;

/// Wire size of one raw sensor frame: three 16-bit accelerometer axes, a
/// 16-bit temperature word, three 16-bit gyro axes, all big-endian.
pub const FRAME_LEN: usize = 14;

/// Largest accepted staging ring depth, in records.
pub const MAX_QUEUE_DEPTH: usize = 100;

/// One raw transfer result from the sensor transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame(pub [u8; FRAME_LEN]);

impl RawFrame {
    /// An all-zero frame is the transport's fault sentinel; real sensors
    /// always carry noise in at least one word.
    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    fn be16(&self, offset: usize) -> i16 {
        i16::from_be_bytes([self.0[offset], self.0[offset + 1]])
    }

    pub fn accel(&self) -> [i16; 3] {
        [self.be16(0), self.be16(2), self.be16(4)]
    }

    pub fn temperature(&self) -> i16 {
        self.be16(6)
    }

    pub fn gyro(&self) -> [i16; 3] {
        [self.be16(8), self.be16(10), self.be16(12)]
    }
}

/// Which words of the raw frame feed a channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameField {
    Accel,
    Gyro,
}

/// Sensor transport collaborator. One blocking-free transfer per tick.
pub trait Transport: Send {
    fn transfer(&mut self) -> Result<RawFrame>;
}

/// Per-axis signal conditioning applied after calibration.
pub trait SampleFilter: Send {
    fn apply(&mut self, value: f32) -> f32;
}

/// Pass-through filter.
#[derive(Debug, Default)]
pub struct IdentityFilter;

impl SampleFilter for IdentityFilter {
    fn apply(&mut self, value: f32) -> f32 {
        value
    }
}

/// One-pole IIR low-pass, seeded by the first sample to avoid a startup
/// transient from zero.
#[derive(Debug)]
pub struct LowPassFilter {
    alpha: f32,
    state: Option<f32>,
}

impl LowPassFilter {
    pub fn new(sample_rate_hz: f32, cutoff_hz: f32) -> Self {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * cutoff_hz);
        let dt = 1.0 / sample_rate_hz;
        Self {
            alpha: dt / (rc + dt),
            state: None,
        }
    }
}

impl SampleFilter for LowPassFilter {
    fn apply(&mut self, value: f32) -> f32 {
        let next = match self.state {
            None => value,
            Some(prev) => prev + self.alpha * (value - prev),
        };
        self.state = Some(next);
        next
    }
}

/// External topic sink receiving finished records.
pub trait SampleSink: Send + Sync {
    fn publish(&self, topic: &str, record: &SampleRecord);
}

/// Transport fault accounting. Counters only grow; `reset` zeroes them.
#[derive(Debug, Default)]
pub struct FaultCounters {
    bad_transfers: AtomicU64,
    bad_frames: AtomicU64,
}

impl FaultCounters {
    pub fn bad_transfers(&self) -> u64 {
        self.bad_transfers.load(Ordering::Relaxed)
    }

    pub fn bad_frames(&self) -> u64 {
        self.bad_frames.load(Ordering::Relaxed)
    }

    /// Combined fault count, the `error_count` base for staged records.
    pub fn total(&self) -> u64 {
        self.bad_transfers() + self.bad_frames()
    }

    fn clear(&self) {
        self.bad_transfers.store(0, Ordering::Relaxed);
        self.bad_frames.store(0, Ordering::Relaxed);
    }
}

/// Static description of one channel group fed by the engine.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Short name for logs
    pub name: String,
    /// Topic path the sink receives records under
    pub topic: String,
    /// Which frame words this channel decodes
    pub field: FrameField,
    /// Board mounting rotation
    pub rotation: Rotation,
    /// Counts-to-SI conversion factor
    pub range_scale: f32,
    /// Full-scale range in SI units
    pub range: f32,
    /// Initial staging ring depth in records
    pub queue_depth: usize,
    /// Underlying measurement rate in Hz
    pub sample_rate_hz: u32,
    /// Low-pass cutoff; `None` disables filtering
    pub cutoff_hz: Option<f32>,
}

/// Engine-assigned identifier of a channel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId(usize);

struct ChannelGroup {
    name: String,
    topic: Arc<str>,
    field: FrameField,
    rotation: Rotation,
    range_scale: f32,
    range: f32,
    calibration: AxisScale,
    sample_rate_hz: u32,
    cutoff_hz: Option<f32>,
    filters: [Box<dyn SampleFilter>; 3],
    ring: RingBuffer<SampleRecord>,
    endpoint: Weak<dyn DeviceOps>,
}

struct EngineState {
    transport: Box<dyn Transport>,
    /// Tick period in microseconds; 0 means manual mode (tick on read)
    interval_us: u64,
    channels: Vec<ChannelGroup>,
}

/// A record staged during a tick, carried out of the engine lock for
/// notification and publication.
struct Staged {
    endpoint: Weak<dyn DeviceOps>,
    topic: Arc<str>,
    record: SampleRecord,
}

/// Shared sampling core behind one or more device endpoints.
pub struct SamplingEngine {
    state: Mutex<EngineState>,
    faults: FaultCounters,
    sink: Arc<dyn SampleSink>,
    running: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SamplingEngine {
    pub fn new(transport: Box<dyn Transport>, sink: Arc<dyn SampleSink>) -> Self {
        Self {
            state: Mutex::new(EngineState {
                transport,
                interval_us: 0,
                channels: Vec::new(),
            }),
            faults: FaultCounters::default(),
            sink,
            running: Arc::new(AtomicBool::new(false)),
            ticker: Mutex::new(None),
        }
    }

    /// Add a channel group. Channels are fixed once sampling starts.
    pub fn add_channel(&self, config: ChannelConfig) -> ChannelId {
        let mut st = self.state.lock();
        let filters = build_filters(config.sample_rate_hz, config.cutoff_hz);
        st.channels.push(ChannelGroup {
            name: config.name,
            topic: Arc::from(config.topic.as_str()),
            field: config.field,
            rotation: config.rotation,
            range_scale: config.range_scale,
            range: config.range,
            calibration: AxisScale::default(),
            sample_rate_hz: config.sample_rate_hz,
            cutoff_hz: config.cutoff_hz,
            filters,
            ring: RingBuffer::new(config.queue_depth),
            endpoint: Weak::<NeverDevice>::new(),
        });
        ChannelId(st.channels.len() - 1)
    }

    /// Connect the device endpoint notified when this channel stages data.
    pub fn attach_endpoint(&self, channel: ChannelId, endpoint: Weak<dyn DeviceOps>) -> Result<()> {
        let mut st = self.state.lock();
        channel_mut(&mut st, channel)?.endpoint = endpoint;
        Ok(())
    }

    pub fn interval_us(&self) -> u64 {
        self.state.lock().interval_us
    }

    /// Set the tick period; 0 selects manual mode. Takes effect on the
    /// next [`start`](Self::start).
    pub fn set_interval_us(&self, interval_us: u64) {
        self.state.lock().interval_us = interval_us;
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Arm the ticker. Always stops a previous ticker first and flushes
    /// staged records, so a restart never mixes stale data with fresh.
    /// With a zero interval the engine stays in manual mode and no thread
    /// is spawned.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.stop();

        let interval_us = {
            let mut st = self.state.lock();
            for ch in &mut st.channels {
                ch.ring.flush();
            }
            st.interval_us
        };

        if interval_us == 0 {
            info!("sampler in manual mode, ticks on read");
            return Ok(());
        }

        self.running.store(true, Ordering::Relaxed);
        let engine = Arc::clone(self);
        let running = Arc::clone(&self.running);
        let period = Duration::from_micros(interval_us);

        let handle = std::thread::Builder::new()
            .name("sampler".into())
            .spawn(move || {
                debug!(interval_us, "sampler ticker started");
                while running.load(Ordering::Relaxed) {
                    let started = Instant::now();
                    engine.tick();
                    if let Some(remaining) = period.checked_sub(started.elapsed()) {
                        std::thread::sleep(remaining);
                    }
                }
                debug!("sampler ticker stopped");
            })
            .map_err(|e| DeviceError::BadState(format!("sampler thread spawn failed: {e}")))?;

        *self.ticker.lock() = Some(handle);
        info!(interval_us, "sampler started");
        Ok(())
    }

    /// Cancel future ticks and join the ticker. An in-flight tick runs to
    /// completion. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.ticker.lock().take() {
            if handle.join().is_err() {
                warn!("sampler ticker panicked");
            }
        }
    }

    /// Run one measurement cycle: transfer, validate, convert, stage,
    /// then notify and publish outside the engine lock.
    pub fn tick(&self) {
        let staged = {
            let mut st = self.state.lock();
            self.tick_locked(&mut st)
        };
        self.fan_out(staged);
    }

    fn tick_locked(&self, st: &mut EngineState) -> Vec<Staged> {
        let frame = match st.transport.transfer() {
            Ok(frame) => frame,
            Err(e) => {
                self.faults.bad_transfers.fetch_add(1, Ordering::Relaxed);
                trace!(error = %e, "transfer fault");
                return Vec::new();
            }
        };
        if frame.is_all_zero() {
            self.faults.bad_frames.fetch_add(1, Ordering::Relaxed);
            trace!("all-zero frame dropped");
            return Vec::new();
        }

        let error_count = self.faults.total();
        let timestamp_us = now_us();
        let mut staged = Vec::with_capacity(st.channels.len());

        for ch in &mut st.channels {
            let raw = swap_axes(match ch.field {
                FrameField::Accel => frame.accel(),
                FrameField::Gyro => frame.gyro(),
            });

            let in_si = [
                raw[0] as f32 * ch.range_scale,
                raw[1] as f32 * ch.range_scale,
                raw[2] as f32 * ch.range_scale,
            ];
            let rotated = ch.rotation.apply(in_si);
            let mut value = [0.0f32; 3];
            for axis in 0..3 {
                let calibrated = ch.calibration.apply(axis, rotated[axis]);
                value[axis] = ch.filters[axis].apply(calibrated);
            }

            let record = SampleRecord {
                timestamp_us,
                raw,
                value,
                error_count,
                scale: ch.range_scale,
                range: ch.range,
            };
            ch.ring.force(record);
            staged.push(Staged {
                endpoint: ch.endpoint.clone(),
                topic: Arc::clone(&ch.topic),
                record,
            });
        }
        staged
    }

    /// Deliver readiness and publication for records staged by one tick.
    /// Runs without the engine lock; notification takes device locks.
    fn fan_out(&self, staged: Vec<Staged>) {
        for item in staged {
            let endpoint = item.endpoint.upgrade();
            if let Some(dev) = &endpoint {
                dev.notify(Events::DATA_READY);
            }
            let blocked = endpoint
                .map(|dev| dev.cdev().is_pub_blocked())
                .unwrap_or(false);
            if !blocked {
                self.sink.publish(&item.topic, &item.record);
            }
        }
    }

    /// Drain staged records for one channel.
    ///
    /// A buffer that cannot hold one record is `NoSpace`. In manual mode
    /// the channel's ring is flushed and one synchronous tick runs first,
    /// so the caller always sees a fresh sample. An empty ring after that
    /// is `WouldBlock`; this method never sleeps.
    pub fn read(&self, channel: ChannelId, out: &mut [SampleRecord]) -> Result<usize> {
        if out.is_empty() {
            return Err(DeviceError::NoSpace(
                "buffer smaller than one record".into(),
            ));
        }

        let (count, staged) = {
            let mut st = self.state.lock();
            let staged = if st.interval_us == 0 {
                channel_mut(&mut st, channel)?.ring.flush();
                self.tick_locked(&mut st)
            } else {
                Vec::new()
            };

            let group = channel_mut(&mut st, channel)?;
            let mut count = 0;
            while count < out.len() {
                match group.ring.get() {
                    Some(record) => {
                        out[count] = record;
                        count += 1;
                    }
                    None => break,
                }
            }
            (count, staged)
        };

        self.fan_out(staged);

        if count == 0 {
            Err(DeviceError::WouldBlock)
        } else {
            Ok(count)
        }
    }

    /// Readiness snapshot for one channel, for poll registration.
    pub fn data_ready(&self, channel: ChannelId) -> Events {
        let st = self.state.lock();
        match st.channels.get(channel.0) {
            Some(group) if !group.ring.is_empty() => Events::DATA_READY,
            _ => Events::empty(),
        }
    }

    /// Change a channel's staging depth, discarding oldest overflow.
    /// Depth above [`MAX_QUEUE_DEPTH`] is `InvalidArgument`; zero is
    /// rejected by the ring itself.
    pub fn set_queue_depth(&self, channel: ChannelId, depth: usize) -> Result<()> {
        if depth > MAX_QUEUE_DEPTH {
            return Err(DeviceError::InvalidArgument(format!(
                "queue depth {depth} exceeds {MAX_QUEUE_DEPTH}"
            )));
        }
        let mut st = self.state.lock();
        channel_mut(&mut st, channel)?.ring.resize(depth)
    }

    pub fn queue_depth(&self, channel: ChannelId) -> Result<usize> {
        let mut st = self.state.lock();
        Ok(channel_mut(&mut st, channel)?.ring.capacity())
    }

    pub fn set_calibration(&self, channel: ChannelId, calibration: AxisScale) -> Result<()> {
        let mut st = self.state.lock();
        channel_mut(&mut st, channel)?.calibration = calibration;
        Ok(())
    }

    pub fn calibration(&self, channel: ChannelId) -> Result<AxisScale> {
        let mut st = self.state.lock();
        Ok(channel_mut(&mut st, channel)?.calibration)
    }

    pub fn range(&self, channel: ChannelId) -> Result<f32> {
        let mut st = self.state.lock();
        Ok(channel_mut(&mut st, channel)?.range)
    }

    /// Change the measurement rate; filters are rebuilt for the new rate
    /// and restart from their next input.
    pub fn set_sample_rate(&self, channel: ChannelId, rate_hz: u32) -> Result<()> {
        if rate_hz == 0 {
            return Err(DeviceError::InvalidArgument("sample rate 0 Hz".into()));
        }
        let mut st = self.state.lock();
        let group = channel_mut(&mut st, channel)?;
        group.sample_rate_hz = rate_hz;
        group.filters = build_filters(rate_hz, group.cutoff_hz);
        Ok(())
    }

    pub fn sample_rate(&self, channel: ChannelId) -> Result<u32> {
        let mut st = self.state.lock();
        Ok(channel_mut(&mut st, channel)?.sample_rate_hz)
    }

    /// Flush every staging ring and zero the fault counters.
    pub fn reset(&self) {
        let mut st = self.state.lock();
        for ch in &mut st.channels {
            ch.ring.flush();
        }
        self.faults.clear();
    }

    pub fn faults(&self) -> &FaultCounters {
        &self.faults
    }
}

impl Drop for SamplingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Realign sensor axes to the board frame: `x' = y`, `y' = -x`. Negating
/// the most negative count saturates instead of wrapping.
fn swap_axes(v: [i16; 3]) -> [i16; 3] {
    [v[1], v[0].saturating_neg(), v[2]]
}

fn channel_mut(st: &mut EngineState, channel: ChannelId) -> Result<&mut ChannelGroup> {
    st.channels
        .get_mut(channel.0)
        .ok_or_else(|| DeviceError::InvalidArgument(format!("unknown channel {}", channel.0)))
}

fn build_filters(sample_rate_hz: u32, cutoff_hz: Option<f32>) -> [Box<dyn SampleFilter>; 3] {
    std::array::from_fn(|_| match cutoff_hz {
        Some(cutoff) => {
            Box::new(LowPassFilter::new(sample_rate_hz as f32, cutoff)) as Box<dyn SampleFilter>
        }
        None => Box::new(IdentityFilter) as Box<dyn SampleFilter>,
    })
}

/// Placeholder target for channels with no endpoint attached yet.
struct NeverDevice;

impl DeviceOps for NeverDevice {
    fn cdev(&self) -> &crate::device::CDev {
        unreachable!("never constructed")
    }
}
