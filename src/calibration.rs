//! Stick and gyroscope calibration read from the controller's SPI flash
//!
//! Stick values are 12-bit and packed two per three bytes:
//!
//! ```text
//! x = ((b[1] << 8) & 0xF00) | b[0]
//! y = (b[2] << 4) | (b[1] >> 4)
//! ```
//!
//! User calibration is preferred; an all-`0xFF` user block means the flash
//! page was never written and the factory block is used instead.

use serde::Serialize;
use tracing::{debug, warn};

use crate::protocol::{hex, CommandChannel, Subcommand};
use crate::report::Handedness;
use crate::transport::{ControllerKind, Transport};

/// Flash page of user-written calibration
pub const SPI_PAGE_USER: u8 = 0x80;
/// Flash page of factory calibration
pub const SPI_PAGE_FACTORY: u8 = 0x60;

pub const USER_STICK_CAL_LEFT: u8 = 0x12;
pub const USER_STICK_CAL_RIGHT: u8 = 0x1D;
pub const FACTORY_STICK_CAL_LEFT: u8 = 0x3D;
pub const FACTORY_STICK_CAL_RIGHT: u8 = 0x46;
pub const STICK_PARAMS_LEFT: u8 = 0x86;
pub const STICK_PARAMS_RIGHT: u8 = 0x98;
pub const USER_GYRO_NEUTRAL: u8 = 0x34;
pub const FACTORY_GYRO_NEUTRAL: u8 = 0x29;

/// Attempts per SPI read before giving up on an address match
pub const DEFAULT_MAX_SPI_ATTEMPTS: usize = 100;

const STICK_CAL_LEN: u8 = 9;
const STICK_PARAMS_LEN: u8 = 16;
const GYRO_NEUTRAL_LEN: u8 = 10;

/// Offsets within an SPI read reply
const SPI_ECHO_LOW: usize = 15;
const SPI_ECHO_HIGH: usize = 16;
const SPI_PAYLOAD: usize = 20;

/// A neutral point component beyond this is treated as garbage
const GYRO_NEUTRAL_LIMIT: i32 = 100;

/// Per-axis stick calibration, `[x, y]` in raw 12-bit counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StickCalibration {
    pub max_above_center: [u16; 2],
    pub center: [u16; 2],
    pub min_below_center: [u16; 2],
}

fn unpack_pair(b: &[u8]) -> [u16; 2] {
    let x = (((b[1] as u16) << 8) & 0xF00) | b[0] as u16;
    let y = ((b[2] as u16) << 4) | (b[1] as u16 >> 4);
    [x, y]
}

impl StickCalibration {
    /// Decode a 9-byte calibration block. A short block is zero-padded.
    ///
    /// The left stick stores `max, center, min`; the right stores
    /// `center, min, max`.
    pub fn decode(block: &[u8], handedness: Handedness) -> Self {
        let mut b = [0u8; STICK_CAL_LEN as usize];
        let n = block.len().min(b.len());
        b[..n].copy_from_slice(&block[..n]);

        let first = unpack_pair(&b[0..3]);
        let second = unpack_pair(&b[3..6]);
        let third = unpack_pair(&b[6..9]);

        match handedness {
            Handedness::Left => Self {
                max_above_center: first,
                center: second,
                min_below_center: third,
            },
            Handedness::Right => Self {
                center: first,
                min_below_center: second,
                max_above_center: third,
            },
        }
    }

    /// `[xMax, yMax, xCenter, yCenter, xMin, yMin]`
    pub fn as_array(&self) -> [u16; 6] {
        [
            self.max_above_center[0],
            self.max_above_center[1],
            self.center[0],
            self.center[1],
            self.min_below_center[0],
            self.min_below_center[1],
        ]
    }
}

/// Everything read from flash during attach
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CalibrationData {
    pub stick: StickCalibration,
    pub deadzone: u16,
    /// Right stick of a Pro Controller; `stick` is then the left one
    pub stick2: Option<StickCalibration>,
    pub deadzone2: u16,
    pub gyro_neutral: [i16; 3],
}

/// Decode the deadzone from a stick parameter block
pub fn decode_deadzone(block: &[u8]) -> u16 {
    let b3 = block.get(3).copied().unwrap_or(0) as u16;
    let b4 = block.get(4).copied().unwrap_or(0) as u16;
    ((b4 << 8) & 0xF00) | b3
}

/// Decode three little-endian `i16` values starting at `offset`
pub fn decode_gyro_neutral(block: &[u8], offset: usize) -> [i16; 3] {
    let mut out = [0i16; 3];
    for (axis, value) in out.iter_mut().enumerate() {
        let lo = block.get(offset + axis * 2).copied().unwrap_or(0);
        let hi = block.get(offset + axis * 2 + 1).copied().unwrap_or(0);
        *value = i16::from_le_bytes([lo, hi]);
    }
    out
}

/// A blank or corrupt user neutral point that should not be trusted
pub fn gyro_neutral_implausible(neutral: &[i16; 3]) -> bool {
    let sum: i32 = neutral.iter().map(|&v| v as i32).sum();
    sum == -1 || sum == -3 || neutral.iter().any(|&v| (v as i32).abs() > GYRO_NEUTRAL_LIMIT)
}

/// Reads calibration through a [`CommandChannel`]
#[derive(Debug)]
pub struct CalibrationStore {
    max_attempts: usize,
    exhausted_reads: usize,
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SPI_ATTEMPTS)
    }
}

impl CalibrationStore {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            exhausted_reads: 0,
        }
    }

    /// SPI reads that ran out of attempts and returned stale data
    pub fn exhausted_reads(&self) -> usize {
        self.exhausted_reads
    }

    /// Read `len` bytes from flash at `(page << 8) | offset`.
    ///
    /// Retries until the reply echoes the requested address. When every
    /// attempt misses, whatever the last reply held is returned.
    pub fn read_spi<T: Transport>(
        &mut self,
        channel: &mut CommandChannel<T>,
        page: u8,
        offset: u8,
        len: u8,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut matched = false;

        for _ in 0..self.max_attempts {
            buf = channel
                .send_subcommand(Subcommand::SpiFlashRead, &[offset, page, 0x00, 0x00, len])
                .unwrap_or_default();
            if buf.get(SPI_ECHO_LOW) == Some(&offset) && buf.get(SPI_ECHO_HIGH) == Some(&page) {
                matched = true;
                break;
            }
        }

        if !matched {
            self.exhausted_reads += 1;
            warn!(
                "SPI read at 0x{:02x}{:02x} gave up after {} attempts",
                page, offset, self.max_attempts
            );
        }

        let end = (SPI_PAYLOAD + len as usize).min(buf.len());
        let data = buf.get(SPI_PAYLOAD..end).map(<[u8]>::to_vec).unwrap_or_default();
        debug!("SPI 0x{:02x}{:02x}: {}", page, offset, hex(&data));
        data
    }

    /// Stick calibration and deadzone of one stick
    fn load_stick<T: Transport>(
        &mut self,
        channel: &mut CommandChannel<T>,
        handedness: Handedness,
    ) -> (StickCalibration, u16) {
        let left = handedness.is_left();

        let user_offset = if left { USER_STICK_CAL_LEFT } else { USER_STICK_CAL_RIGHT };
        let mut block = self.read_spi(channel, SPI_PAGE_USER, user_offset, STICK_CAL_LEN);
        if block.iter().all(|&b| b == 0xFF) {
            debug!("Using factory stick calibration data.");
            let factory_offset = if left {
                FACTORY_STICK_CAL_LEFT
            } else {
                FACTORY_STICK_CAL_RIGHT
            };
            block = self.read_spi(channel, SPI_PAGE_FACTORY, factory_offset, STICK_CAL_LEN);
        } else {
            debug!("Using user stick calibration data.");
        }
        let stick = StickCalibration::decode(&block, handedness);
        debug!("{:?} stick calibration data: {:?}", handedness, stick.as_array());

        let params_offset = if left { STICK_PARAMS_LEFT } else { STICK_PARAMS_RIGHT };
        let params = self.read_spi(channel, SPI_PAGE_FACTORY, params_offset, STICK_PARAMS_LEN);
        (stick, decode_deadzone(&params))
    }

    /// Read stick calibration, deadzone and gyro neutral point. A Pro
    /// Controller gets both sticks.
    pub fn load<T: Transport>(
        &mut self,
        channel: &mut CommandChannel<T>,
        kind: ControllerKind,
    ) -> CalibrationData {
        let (first, second) = kind.stick_sides();
        let (stick, deadzone) = self.load_stick(channel, first);
        let (stick2, deadzone2) = match second {
            Some(side) => {
                let (cal, deadzone) = self.load_stick(channel, side);
                (Some(cal), deadzone)
            }
            None => (None, 0),
        };

        let user_neutral = self.read_spi(channel, SPI_PAGE_USER, USER_GYRO_NEUTRAL, GYRO_NEUTRAL_LEN);
        let mut gyro_neutral = decode_gyro_neutral(&user_neutral, 0);
        debug!("User gyro neutral position: {:?}", gyro_neutral);

        if gyro_neutral_implausible(&gyro_neutral) {
            let factory =
                self.read_spi(channel, SPI_PAGE_FACTORY, FACTORY_GYRO_NEUTRAL, GYRO_NEUTRAL_LEN);
            gyro_neutral = decode_gyro_neutral(&factory, 3);
            debug!("Factory gyro neutral position: {:?}", gyro_neutral);
        }

        CalibrationData {
            stick,
            deadzone,
            stick2,
            deadzone2,
            gyro_neutral,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{flash_transport, pro_controller_flash, spi_reply, MockTransport};
    use std::collections::HashMap;

    #[test]
    fn test_stick_decode_left() {
        let block = [0x34, 0x12, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x11];
        let cal = StickCalibration::decode(&block, Handedness::Left);

        let x_max = ((0x12u16 << 8) & 0xF00) | 0x34;
        let y_max = (0x56u16 << 4) | (0x12 >> 4);
        let x_center = ((0x9Au16 << 8) & 0xF00) | 0x78;
        let y_center = (0xBCu16 << 4) | (0x9A >> 4);
        let x_min = ((0xF0u16 << 8) & 0xF00) | 0xDE;
        let y_min = (0x11u16 << 4) | (0xF0 >> 4);

        assert_eq!(cal.as_array(), [x_max, y_max, x_center, y_center, x_min, y_min]);
        assert_eq!(cal.as_array(), [0x234, 0x561, 0xA78, 0xBC9, 0x0DE, 0x11F]);
    }

    #[test]
    fn test_stick_decode_right_order() {
        let block = [0x00, 0x08, 0x80, 0xF4, 0x41, 0x1F, 0x2C, 0xC1, 0x1C];
        let cal = StickCalibration::decode(&block, Handedness::Right);
        assert_eq!(cal.center, [0x800, 0x800]);
        assert_eq!(cal.min_below_center, [0x1F4, 0x1F4]);
        assert_eq!(cal.max_above_center, [0x12C, 0x1CC]);
    }

    #[test]
    fn test_short_block_is_padded() {
        let cal = StickCalibration::decode(&[0x34, 0x12], Handedness::Left);
        assert_eq!(cal.max_above_center, [0x234, 0x001]);
        assert_eq!(cal.center, [0, 0]);
    }

    #[test]
    fn test_gyro_neutral_sentinels() {
        assert!(gyro_neutral_implausible(&[-1, -1, -1]));
        assert!(gyro_neutral_implausible(&[0, 0, -1]));
        assert!(gyro_neutral_implausible(&[0, 101, 0]));
        assert!(gyro_neutral_implausible(&[-150, 0, 0]));
        assert!(!gyro_neutral_implausible(&[12, -7, 3]));
    }

    #[test]
    fn test_read_spi_retries_until_address_matches() {
        let mut calls = 0;
        let transport = MockTransport::new().with_responder(move |packet| {
            calls += 1;
            if calls < 3 {
                Some(spi_reply(0x00, 0x00, &[0xAA; 4]))
            } else {
                Some(spi_reply(packet[12], packet[11], &[1, 2, 3, 4]))
            }
        });
        let mut channel = CommandChannel::new(transport);
        let mut store = CalibrationStore::default();

        let data = store.read_spi(&mut channel, SPI_PAGE_FACTORY, 0x86, 4);
        assert_eq!(data, vec![1, 2, 3, 4]);
        assert_eq!(channel.transport().writes().len(), 3);
        assert_eq!(store.exhausted_reads(), 0);

        let request = &channel.transport().writes()[0];
        assert_eq!(request[10], Subcommand::SpiFlashRead as u8);
        assert_eq!(&request[11..16], &[0x86, 0x60, 0x00, 0x00, 4]);
    }

    #[test]
    fn test_read_spi_exhaustion_returns_last_buffer() {
        let transport = MockTransport::new()
            .with_responder(|_| Some(spi_reply(0x01, 0x02, &[9, 8, 7])));
        let mut channel = CommandChannel::new(transport);
        let mut store = CalibrationStore::new(5);

        let data = store.read_spi(&mut channel, SPI_PAGE_USER, 0x34, 3);
        assert_eq!(data, vec![9, 8, 7]);
        assert_eq!(channel.transport().writes().len(), 5);
        assert_eq!(store.exhausted_reads(), 1);
    }

    #[test]
    fn test_load_falls_back_to_factory() {
        let mut contents = HashMap::new();
        contents.insert(
            (SPI_PAGE_FACTORY, FACTORY_STICK_CAL_LEFT),
            vec![0x34, 0x12, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x11],
        );
        let mut params = vec![0u8; 16];
        params[3] = 0xAE;
        params[4] = 0x40;
        contents.insert((SPI_PAGE_FACTORY, STICK_PARAMS_LEFT), params);
        let mut factory_gyro = vec![0u8; 10];
        factory_gyro[3..9].copy_from_slice(&[0x10, 0x00, 0xF6, 0xFF, 0x05, 0x00]);
        contents.insert((SPI_PAGE_FACTORY, FACTORY_GYRO_NEUTRAL), factory_gyro);

        let mut channel = CommandChannel::new(flash_transport(contents));
        let data = CalibrationStore::default().load(&mut channel, ControllerKind::LeftJoyCon);

        assert_eq!(data.stick.as_array(), [0x234, 0x561, 0xA78, 0xBC9, 0x0DE, 0x11F]);
        assert_eq!(data.deadzone, 0x0AE);
        assert_eq!(data.gyro_neutral, [16, -10, 5]);
    }

    #[test]
    fn test_load_prefers_user_data() {
        let mut contents = HashMap::new();
        contents.insert(
            (SPI_PAGE_USER, USER_STICK_CAL_RIGHT),
            vec![0x00, 0x08, 0x80, 0xF4, 0x41, 0x1F, 0x2C, 0xC1, 0x1C],
        );
        contents.insert(
            (SPI_PAGE_USER, USER_GYRO_NEUTRAL),
            vec![0x03, 0x00, 0xFE, 0xFF, 0x00, 0x00, 0, 0, 0, 0],
        );

        let mut channel = CommandChannel::new(flash_transport(contents));
        let data = CalibrationStore::default().load(&mut channel, ControllerKind::RightJoyCon);

        assert_eq!(data.stick.center, [0x800, 0x800]);
        assert_eq!(data.gyro_neutral, [3, -2, 0]);

        let requested: Vec<(u8, u8)> = channel
            .transport()
            .writes()
            .iter()
            .map(|w| (w[12], w[11]))
            .collect();
        assert!(!requested.contains(&(SPI_PAGE_FACTORY, FACTORY_STICK_CAL_RIGHT)));
        assert!(!requested.contains(&(SPI_PAGE_FACTORY, FACTORY_GYRO_NEUTRAL)));
    }

    #[test]
    fn test_min_i16_neutral_is_implausible() {
        assert!(gyro_neutral_implausible(&[i16::MIN, 0, 0]));
        assert!(gyro_neutral_implausible(&[0, 0, i16::MAX]));
        assert!(!gyro_neutral_implausible(&[100, -100, 0]));
    }

    #[test]
    fn test_min_i16_user_neutral_falls_back_to_factory() {
        let mut contents = HashMap::new();
        contents.insert(
            (SPI_PAGE_USER, USER_GYRO_NEUTRAL),
            vec![0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0, 0, 0, 0],
        );
        let mut factory_gyro = vec![0u8; 10];
        factory_gyro[3..9].copy_from_slice(&[0x02, 0x00, 0x00, 0x00, 0xFF, 0xFF]);
        contents.insert((SPI_PAGE_FACTORY, FACTORY_GYRO_NEUTRAL), factory_gyro);

        let mut channel = CommandChannel::new(flash_transport(contents));
        let data = CalibrationStore::default().load(&mut channel, ControllerKind::RightJoyCon);
        assert_eq!(data.gyro_neutral, [2, 0, -1]);
    }

    #[test]
    fn test_pro_controller_loads_both_sticks() {
        let mut channel = CommandChannel::new(flash_transport(pro_controller_flash()));
        let data = CalibrationStore::default().load(&mut channel, ControllerKind::ProController);

        assert_eq!(data.stick.center, [2000, 2100]);
        assert_eq!(data.stick.max_above_center, [600, 600]);
        assert_eq!(data.deadzone, 40);
        let right = data.stick2.unwrap();
        assert_eq!(right.center, [2048, 2048]);
        assert_eq!(data.deadzone2, 50);
    }
}
