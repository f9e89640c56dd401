//! Simulated transport and sink for development and tests.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::SampleRecord;
use crate::error::Result;
use crate::sampling::{RawFrame, SampleSink, Transport, FRAME_LEN};

/// Synthetic sensor transport emitting configurable raw counts, optional
/// uniform noise, and optional periodic fault frames (the all-zero
/// sentinel) to exercise the fault-counting path.
pub struct SimTransport {
    accel: [i16; 3],
    gyro: [i16; 3],
    temperature: i16,
    noise_counts: i16,
    fault_every: Option<usize>,
    transfers: usize,
    rng: StdRng,
}

impl SimTransport {
    pub fn new() -> Self {
        Self {
            // roughly 1 g on z at 8 g full scale, mild rotation rates
            accel: [0, 0, 4096],
            gyro: [20, -15, 5],
            temperature: 2100,
            noise_counts: 0,
            fault_every: None,
            transfers: 0,
            rng: StdRng::seed_from_u64(0x5eed),
        }
    }

    /// Fix the emitted raw counts.
    pub fn with_values(mut self, accel: [i16; 3], gyro: [i16; 3]) -> Self {
        self.accel = accel;
        self.gyro = gyro;
        self
    }

    /// Add uniform noise of up to +/- `counts` to every word.
    pub fn with_noise(mut self, counts: i16) -> Self {
        self.noise_counts = counts;
        self
    }

    /// Make every `n`-th transfer return the all-zero fault frame.
    pub fn with_fault_every(mut self, n: usize) -> Self {
        self.fault_every = (n > 0).then_some(n);
        self
    }

    fn jitter(&mut self, value: i16) -> i16 {
        if self.noise_counts == 0 {
            return value;
        }
        let n = self.noise_counts as i32;
        let delta = self.rng.gen_range(-n..=n);
        (value as i32 + delta).clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SimTransport {
    fn transfer(&mut self) -> Result<RawFrame> {
        self.transfers += 1;
        if let Some(every) = self.fault_every {
            if self.transfers % every == 0 {
                return Ok(RawFrame([0u8; FRAME_LEN]));
            }
        }

        let mut bytes = [0u8; FRAME_LEN];
        for axis in 0..3 {
            let word = self.jitter(self.accel[axis]);
            bytes[axis * 2..axis * 2 + 2].copy_from_slice(&word.to_be_bytes());
        }
        bytes[6..8].copy_from_slice(&self.temperature.to_be_bytes());
        for axis in 0..3 {
            let word = self.jitter(self.gyro[axis]);
            bytes[8 + axis * 2..10 + axis * 2].copy_from_slice(&word.to_be_bytes());
        }
        Ok(RawFrame(bytes))
    }
}

/// In-memory topic sink collecting everything published.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<(String, SampleRecord)>>,
}

impl MemorySink {
    /// Total records published so far.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Records published under one topic.
    pub fn count_for(&self, topic: &str) -> usize {
        self.records.lock().iter().filter(|(t, _)| t == topic).count()
    }

    /// Most recent record published under one topic.
    pub fn last_for(&self, topic: &str) -> Option<SampleRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|(t, _)| t == topic)
            .map(|(_, r)| *r)
    }

    /// Drain everything collected so far.
    pub fn take(&self) -> Vec<(String, SampleRecord)> {
        std::mem::take(&mut self.records.lock())
    }
}

impl SampleSink for MemorySink {
    fn publish(&self, topic: &str, record: &SampleRecord) {
        self.records.lock().push((topic.to_string(), *record));
    }
}
