//! Sample record types shared between the device layer and the sampling
//! engine.
//!
//! A [`SampleRecord`] is the unit of transfer for `read()` and the payload
//! handed to the external topic sink. Records are immutable once staged;
//! they are destroyed when overwritten in the ring buffer or drained by a
//! reader.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One finished measurement for a three-axis channel group.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SampleRecord {
    /// Microseconds since the Unix epoch at staging time
    pub timestamp_us: u64,
    /// Raw counts as read from the transport, after axis swap
    pub raw: [i16; 3],
    /// Rotated, offset/scale-corrected, filtered values in SI units
    pub value: [f32; 3],
    /// Accumulated transport + validation fault count at staging time
    pub error_count: u64,
    /// Counts-to-SI conversion factor in effect for this record
    pub scale: f32,
    /// Full-scale measurement range in SI units
    pub range: f32,
}

/// Per-axis static offset and calibration scale.
///
/// The offset is what the sensor reports at a nominally zero input, so it is
/// subtracted before the calibration scale is applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisScale {
    pub offset: [f32; 3],
    pub scale: [f32; 3],
}

impl Default for AxisScale {
    fn default() -> Self {
        Self {
            offset: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

impl AxisScale {
    /// Apply offset and scale to one already-range-scaled axis value.
    pub fn apply(&self, axis: usize, value: f32) -> f32 {
        (value - self.offset[axis]) * self.scale[axis]
    }
}

/// Board mounting rotation applied to raw axis values before scaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    #[default]
    None,
    Yaw90,
    Yaw180,
    Yaw270,
    Roll180,
}

impl Rotation {
    /// Rotate an (x, y, z) triple into the body frame.
    pub fn apply(&self, v: [f32; 3]) -> [f32; 3] {
        let [x, y, z] = v;
        match self {
            Rotation::None => [x, y, z],
            Rotation::Yaw90 => [-y, x, z],
            Rotation::Yaw180 => [-x, -y, z],
            Rotation::Yaw270 => [y, -x, z],
            Rotation::Roll180 => [x, -y, -z],
        }
    }
}

/// Standard gravity, used to express accelerometer ranges in m/s^2.
pub const ONE_G: f32 = 9.80665;

/// Current wall-clock time in microseconds, the timestamp base for staged
/// records.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_scale_offset_then_scale() {
        let s = AxisScale {
            offset: [74.0, 0.0, 0.0],
            scale: [2.0, 1.0, 1.0],
        };
        // offset is subtracted before the scale multiplies
        assert_eq!(s.apply(0, 75.0), 2.0);
        assert_eq!(s.apply(1, 5.0), 5.0);
    }

    #[test]
    fn test_rotation_yaw_quadrants() {
        let v = [1.0, 2.0, 3.0];
        assert_eq!(Rotation::None.apply(v), [1.0, 2.0, 3.0]);
        assert_eq!(Rotation::Yaw90.apply(v), [-2.0, 1.0, 3.0]);
        assert_eq!(Rotation::Yaw180.apply(v), [-1.0, -2.0, 3.0]);
        assert_eq!(Rotation::Yaw270.apply(v), [2.0, -1.0, 3.0]);
        assert_eq!(Rotation::Roll180.apply(v), [1.0, -2.0, -3.0]);
    }

    #[test]
    fn test_now_us_monotonic_enough() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }
}
