//! Output report framing and the subcommand request/response channel
//!
//! Every output report starts with a send type and a 4-bit message counter,
//! followed by 8 bytes of rumble data. Subcommand reports append the
//! subcommand id and its payload.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::transport::Transport;

/// Neutral rumble block for one motor: no vibration.
pub const RUMBLE_NEUTRAL: [u8; 4] = [0x00, 0x01, 0x40, 0x40];

/// How long to wait for a subcommand reply
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(50);

/// Full-rate streaming input report (buttons, sticks, 3 IMU samples)
pub const INPUT_MODE_STANDARD_FULL: u8 = 0x30;
/// Simple HID report mode, sent only on button events
pub const INPUT_MODE_SIMPLE_HID: u8 = 0x3F;

/// Report id of a full-rate streaming input report
pub const STANDARD_FULL_REPORT_ID: u8 = 0x30;

/// Output report id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SendType {
    Subcommand = 0x01,
    Rumble = 0x10,
}

/// Subcommand ids understood by the controller firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Subcommand {
    BluetoothManualPairing = 0x01,
    RequestDeviceInfo = 0x02,
    SetInputReportMode = 0x03,
    TriggerButtonsElapsedTime = 0x04,
    GetPageListState = 0x05,
    SetHciState = 0x06,
    ResetPairingInfo = 0x07,
    SetLowPowerState = 0x08,
    SpiFlashRead = 0x10,
    SpiFlashWrite = 0x11,
    ResetMcu = 0x20,
    SetMcuConfiguration = 0x21,
    SetMcuState = 0x22,
    SetGpio = 0x2A,
    SetLed = 0x30,
    GetLed = 0x31,
    SetHomeLight = 0x38,
    EnableImu = 0x40,
    SetImuSensitivity = 0x41,
    WriteImu = 0x42,
    ReadImu = 0x43,
    EnableVibration = 0x48,
    GetVoltage = 0x50,
}

/// Player LED bits for [`Subcommand::SetLed`]
pub struct LedMask;

impl LedMask {
    pub const ONE: u8 = 0x01;
    pub const TWO: u8 = 0x02;
    pub const THREE: u8 = 0x04;
    pub const FOUR: u8 = 0x08;
    pub const ONE_FLASH: u8 = 0x10;
    pub const TWO_FLASH: u8 = 0x20;
    pub const THREE_FLASH: u8 = 0x40;
    pub const FOUR_FLASH: u8 = 0x80;
}

/// Render bytes as a compact hex string for logging
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Request/response channel over a [`Transport`].
///
/// Methods take `&mut self`, so only one request can be in flight per channel.
pub struct CommandChannel<T: Transport> {
    transport: T,
    message_counter: u8,
    timeout: Duration,
}

impl<T: Transport> CommandChannel<T> {
    pub fn new(transport: T) -> Self {
        Self::with_timeout(transport, DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            message_counter: 0,
            timeout,
        }
    }

    /// Counter value the next packet will carry
    pub fn message_counter(&self) -> u8 {
        self.message_counter
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Frame `data` behind the send type and counter, then write it.
    pub fn send_raw(&mut self, data: &[u8], send_type: SendType) -> Result<usize> {
        let mut buf = Vec::with_capacity(data.len() + 2);
        buf.push(send_type as u8);
        buf.push(self.message_counter);
        buf.extend_from_slice(data);

        self.message_counter = (self.message_counter + 1) & 0x0F;

        debug!("Data sent: {}", hex(&buf));
        self.transport.write(&buf)
    }

    /// Send a subcommand and wait for one reply.
    ///
    /// Returns `None` when nothing arrived within the timeout or the
    /// transport failed; the caller decides whether to retry.
    pub fn send_subcommand(&mut self, subcommand: Subcommand, payload: &[u8]) -> Option<Vec<u8>> {
        let mut data = Vec::with_capacity(9 + payload.len());
        data.extend_from_slice(&RUMBLE_NEUTRAL);
        data.extend_from_slice(&RUMBLE_NEUTRAL);
        data.push(subcommand as u8);
        data.extend_from_slice(payload);

        if let Err(e) = self.send_raw(&data, SendType::Subcommand) {
            warn!("Failed to send {:?}: {}", subcommand, e);
            return None;
        }

        match self.transport.read_timeout(self.timeout) {
            Ok(Some(response)) if !response.is_empty() => {
                let shown = response.len().min(49);
                debug!(
                    "Response ID 0x{:02x}. Data: 0x{}",
                    response[0],
                    hex(&response[1..shown])
                );
                Some(response)
            }
            Ok(_) => {
                debug!("No response to {:?}", subcommand);
                None
            }
            Err(e) => {
                warn!("Read after {:?} failed: {}", subcommand, e);
                None
            }
        }
    }
}
