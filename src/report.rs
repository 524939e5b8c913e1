//! Input report decoding
//!
//! Parses the full-rate `0x30` input report: button bitmap, raw analog stick,
//! and the three accelerometer/gyroscope samples packed into every report.
//!
//! Report layout (0-based):
//! - `0`: report id
//! - `1`: timestamp, wraps modulo 256
//! - `2`: battery level (high nibble) and connection info
//! - `3..=5`: button bytes, right / shared / left
//! - `6..=8`: left stick, `9..=11`: right stick
//! - `13 + 12n`: accelerometer, `19 + 12n`: gyroscope, for sample `n` in `0..3`

use serde::Serialize;

use crate::calibration::StickCalibration;
use crate::orientation::Vec3;

/// Accelerometer counts to G
pub const ACCEL_SCALE: f32 = 0.00025;
/// Gyroscope counts to the filter's angular unit
pub const GYRO_SCALE: f32 = 0.00122187695;

/// Number of IMU samples carried by one `0x30` report
pub const IMU_SAMPLES_PER_REPORT: usize = 3;

const SHARED_BUTTON_BYTE: usize = 4;

/// Which half of the controller pair the report comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Handedness {
    Left,
    Right,
}

impl Handedness {
    pub fn is_left(self) -> bool {
        self == Handedness::Left
    }

    fn side_button_byte(self) -> usize {
        3 + if self.is_left() { 2 } else { 0 }
    }

    fn stick_offset(self) -> usize {
        6 + if self.is_left() { 0 } else { 3 }
    }
}

/// Logical buttons. On the right controller the d-pad ids map to the face
/// buttons in the same physical position (B, A, X, Y).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Button {
    DpadDown = 0,
    DpadRight = 1,
    DpadLeft = 2,
    DpadUp = 3,
    Sl = 4,
    Sr = 5,
    Minus = 6,
    Home = 7,
    Plus = 8,
    Capture = 9,
    Stick = 10,
    Shoulder1 = 11,
    Shoulder2 = 12,
}

impl Button {
    pub const ALL: [Button; 13] = [
        Button::DpadDown,
        Button::DpadRight,
        Button::DpadLeft,
        Button::DpadUp,
        Button::Sl,
        Button::Sr,
        Button::Minus,
        Button::Home,
        Button::Plus,
        Button::Capture,
        Button::Stick,
        Button::Shoulder1,
        Button::Shoulder2,
    ];

    /// Byte offset and bit mask of this button in a report
    pub fn location(self, handedness: Handedness) -> (usize, u8) {
        let left = handedness.is_left();
        let side = handedness.side_button_byte();
        match self {
            Button::DpadDown => (side, if left { 0x01 } else { 0x04 }),
            Button::DpadRight => (side, if left { 0x04 } else { 0x08 }),
            Button::DpadUp => (side, 0x02),
            Button::DpadLeft => (side, if left { 0x08 } else { 0x01 }),
            Button::Sr => (side, 0x10),
            Button::Sl => (side, 0x20),
            Button::Shoulder1 => (side, 0x40),
            Button::Shoulder2 => (side, 0x80),
            Button::Minus => (SHARED_BUTTON_BYTE, 0x01),
            Button::Plus => (SHARED_BUTTON_BYTE, 0x02),
            Button::Stick => (SHARED_BUTTON_BYTE, if left { 0x08 } else { 0x04 }),
            Button::Home => (SHARED_BUTTON_BYTE, 0x10),
            Button::Capture => (SHARED_BUTTON_BYTE, 0x20),
        }
    }
}

/// Pressed buttons as a bitmap indexed by [`Button`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ButtonState(pub u16);

impl ButtonState {
    pub fn is_pressed(&self, button: Button) -> bool {
        self.0 & (1 << button as u16) != 0
    }

    pub fn pressed(&self) -> impl Iterator<Item = Button> + '_ {
        Button::ALL.into_iter().filter(move |b| self.is_pressed(*b))
    }
}

/// Normalized stick vector, nominally -1.0..1.0 per axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StickState {
    pub x: f32,
    pub y: f32,
}

/// One accelerometer + gyroscope sample, already scaled
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImuSample {
    pub accel: Vec3,
    pub gyro: Vec3,
}

impl ImuSample {
    /// The left controller is mounted mirrored: Y and Z point the other way.
    pub fn oriented(mut self, handedness: Handedness) -> Self {
        if handedness.is_left() {
            self.gyro.y = -self.gyro.y;
            self.gyro.z = -self.gyro.z;
            self.accel.y = -self.accel.y;
            self.accel.z = -self.accel.z;
        }
        self
    }
}

/// Decode the button bitmap
pub fn decode_buttons(buf: &[u8], handedness: Handedness) -> ButtonState {
    let mut bits = 0u16;
    for button in Button::ALL {
        let (offset, mask) = button.location(handedness);
        if buf.get(offset).map_or(false, |b| b & mask != 0) {
            bits |= 1 << button as u16;
        }
    }
    ButtonState(bits)
}

/// Unpack the two 12-bit stick axes, `None` if the report is too short
pub fn raw_stick(buf: &[u8], handedness: Handedness) -> Option<[u16; 2]> {
    let offset = handedness.stick_offset();
    let b = buf.get(offset..offset + 3)?;
    let x = b[0] as u16 | ((b[1] as u16 & 0xF) << 8);
    let y = (b[1] as u16 >> 4) | ((b[2] as u16) << 4);
    Some([x, y])
}

/// Map raw stick counts to a normalized vector around the calibrated center.
///
/// No clamping: a calibration range narrower than the physical travel yields
/// magnitudes above 1.
pub fn center_sticks(raw: [u16; 2], calibration: &StickCalibration, deadzone: u16) -> StickState {
    let mut out = [0.0f32; 2];
    for axis in 0..2 {
        let diff = raw[axis] as i32 - calibration.center[axis] as i32;
        if diff.abs() < deadzone as i32 {
            out[axis] = 0.0;
        } else if diff > 0 {
            out[axis] = diff as f32 / calibration.max_above_center[axis] as f32;
        } else {
            out[axis] = diff as f32 / calibration.min_below_center[axis] as f32;
        }
    }
    StickState {
        x: out[0],
        y: out[1],
    }
}

fn read_i16(buf: &[u8], offset: usize) -> Option<i16> {
    let b = buf.get(offset..offset + 2)?;
    Some(i16::from_le_bytes([b[0], b[1]]))
}

/// Extract and scale IMU sample `n` (0..3) of a report.
///
/// The gyro neutral point is subtracted before scaling.
pub fn extract_imu_values(buf: &[u8], n: usize, gyro_neutral: &[i16; 3]) -> Option<ImuSample> {
    let accel_base = 13 + 12 * n;
    let gyro_base = 19 + 12 * n;

    let mut accel = [0.0f32; 3];
    let mut gyro = [0.0f32; 3];
    for axis in 0..3 {
        accel[axis] = read_i16(buf, accel_base + axis * 2)? as f32 * ACCEL_SCALE;
        let raw = read_i16(buf, gyro_base + axis * 2)? as i32;
        gyro[axis] = (raw - gyro_neutral[axis] as i32) as f32 * GYRO_SCALE;
    }

    Some(ImuSample {
        accel: Vec3::new(accel[0], accel[1], accel[2]),
        gyro: Vec3::new(gyro[0], gyro[1], gyro[2]),
    })
}

/// Report id byte
pub fn report_id(buf: &[u8]) -> Option<u8> {
    buf.first().copied()
}

/// Device timestamp byte
pub fn timestamp(buf: &[u8]) -> Option<u8> {
    buf.get(1).copied()
}

/// Battery level, 0 (empty) to 8 (full)
pub fn battery_level(buf: &[u8]) -> Option<u8> {
    buf.get(2).map(|b| (b & 0xF0) >> 4)
}

/// Ticks elapsed between two 8-bit device timestamps, corrected for wraparound
pub fn timestamp_delta(previous: u8, current: u8) -> u32 {
    let mut dt = current as i32 - previous as i32;
    if current < previous {
        dt += 0x100;
    }
    dt as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pack_stick, standard_report};

    fn calibration() -> StickCalibration {
        StickCalibration {
            max_above_center: [500, 500],
            center: [2048, 2048],
            min_below_center: [500, 500],
        }
    }

    #[test]
    fn test_center_sticks() {
        let cal = calibration();
        assert_eq!(center_sticks([2048, 2048], &cal, 50), StickState { x: 0.0, y: 0.0 });
        assert_eq!(center_sticks([2088, 2048], &cal, 50).x, 0.0);

        let up = center_sticks([2148, 2048], &cal, 50);
        assert!((up.x - 0.2).abs() < 1e-6);

        let down = center_sticks([1948, 2048], &cal, 50);
        assert!((down.x + 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_center_sticks_unclamped() {
        let cal = StickCalibration {
            max_above_center: [100, 100],
            center: [2048, 2048],
            min_below_center: [100, 100],
        };
        let state = center_sticks([2348, 1748], &cal, 10);
        assert!((state.x - 3.0).abs() < 1e-6);
        assert!((state.y + 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_timestamp_wraparound() {
        assert_eq!(timestamp_delta(0xFE, 0x05), 7);
        assert_eq!(timestamp_delta(0x10, 0x13), 3);
        assert_eq!(timestamp_delta(0x42, 0x42), 0);
    }

    #[test]
    fn test_raw_stick_offsets() {
        let mut buf = vec![0u8; 49];
        buf[6..9].copy_from_slice(&pack_stick(0x123, 0xABC));
        buf[9..12].copy_from_slice(&pack_stick(0x800, 0x7FF));

        assert_eq!(raw_stick(&buf, Handedness::Left), Some([0x123, 0xABC]));
        assert_eq!(raw_stick(&buf, Handedness::Right), Some([0x800, 0x7FF]));
        assert_eq!(raw_stick(&buf[..10], Handedness::Right), None);
    }

    #[test]
    fn test_button_layout_by_handedness() {
        let mut buf = vec![0u8; 49];
        buf[3] = 0x08 | 0x40;
        buf[4] = 0x10 | 0x04;
        let right = decode_buttons(&buf, Handedness::Right);
        assert!(right.is_pressed(Button::DpadRight));
        assert!(right.is_pressed(Button::Shoulder1));
        assert!(right.is_pressed(Button::Home));
        assert!(right.is_pressed(Button::Stick));
        assert!(!right.is_pressed(Button::DpadDown));

        let left = decode_buttons(&buf, Handedness::Left);
        assert!(!left.is_pressed(Button::DpadRight));
        assert!(!left.is_pressed(Button::Stick));
        assert!(left.is_pressed(Button::Home));

        buf[5] = 0x01 | 0x20;
        let left = decode_buttons(&buf, Handedness::Left);
        assert!(left.is_pressed(Button::DpadDown));
        assert!(left.is_pressed(Button::Sl));
        assert_eq!(
            left.pressed().collect::<Vec<_>>(),
            vec![Button::DpadDown, Button::Sl, Button::Home]
        );
    }

    #[test]
    fn test_extract_imu_scaling() {
        let buf = standard_report(0x10, [4000, -4000, 0], [110, 10, -90]);
        let sample = extract_imu_values(&buf, 2, &[10, 10, 10]).unwrap();

        assert!((sample.accel.x - 1.0).abs() < 1e-6);
        assert!((sample.accel.y + 1.0).abs() < 1e-6);
        assert!((sample.gyro.x - 100.0 * GYRO_SCALE).abs() < 1e-6);
        assert_eq!(sample.gyro.y, 0.0);
        assert!((sample.gyro.z + 100.0 * GYRO_SCALE).abs() < 1e-6);

        assert!(extract_imu_values(&buf[..40], 2, &[0, 0, 0]).is_none());
    }

    #[test]
    fn test_left_axes_flipped() {
        let sample = ImuSample {
            accel: Vec3::new(1.0, 2.0, 3.0),
            gyro: Vec3::new(4.0, 5.0, 6.0),
        };
        let left = sample.oriented(Handedness::Left);
        assert_eq!(left.accel, Vec3::new(1.0, -2.0, -3.0));
        assert_eq!(left.gyro, Vec3::new(4.0, -5.0, -6.0));
        assert_eq!(sample.oriented(Handedness::Right), sample);
    }

    #[test]
    fn test_battery_level() {
        let buf = standard_report(0, [0; 3], [0; 3]);
        assert_eq!(battery_level(&buf), Some(8));
    }
}
