//! HID transport layer
//!
//! The driver talks to the controller through the [`Transport`] trait so the
//! protocol and polling logic never touch `hidapi` directly. [`HidTransport`]
//! is the production implementation; tests script their own.

use std::ffi::{CStr, CString};
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{JoyConError, Result};
use crate::report::Handedness;

/// Nintendo vendor ID
pub const NINTENDO_VENDOR_ID: u16 = 0x057E;
/// Joy-Con (L) product ID
pub const JOYCON_LEFT_PRODUCT_ID: u16 = 0x2006;
/// Joy-Con (R) product ID
pub const JOYCON_RIGHT_PRODUCT_ID: u16 = 0x2007;
/// Pro Controller product ID
pub const PRO_CONTROLLER_PRODUCT_ID: u16 = 0x2009;

/// Largest input report the controller sends over Bluetooth.
pub const MAX_REPORT_SIZE: usize = 0x40;

/// Bidirectional byte channel to one controller.
pub trait Transport {
    /// Write one output report. The first byte is the report id.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Wait up to `timeout` for one input report. `Ok(None)` means nothing arrived.
    fn read_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Block until one input report arrives.
    fn read_blocking(&mut self) -> Result<Vec<u8>>;

    /// Release the underlying handle. Calling it twice is a no-op.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Which controller model a HID device is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControllerKind {
    LeftJoyCon,
    RightJoyCon,
    ProController,
}

impl ControllerKind {
    pub fn from_product_id(product_id: u16) -> Option<Self> {
        match product_id {
            JOYCON_LEFT_PRODUCT_ID => Some(Self::LeftJoyCon),
            JOYCON_RIGHT_PRODUCT_ID => Some(Self::RightJoyCon),
            PRO_CONTROLLER_PRODUCT_ID => Some(Self::ProController),
            _ => None,
        }
    }

    /// IMU axis convention. Only the left Joy-Con is mounted mirrored.
    pub fn handedness(&self) -> Handedness {
        match self {
            Self::LeftJoyCon => Handedness::Left,
            Self::RightJoyCon | Self::ProController => Handedness::Right,
        }
    }

    /// Button halves and sticks the reports carry, primary first.
    ///
    /// A Pro Controller reports both halves: the left one (d-pad, L/ZL, left
    /// stick) is primary, the right one (face buttons, R/ZR, right stick)
    /// secondary.
    pub fn stick_sides(&self) -> (Handedness, Option<Handedness>) {
        match self {
            Self::LeftJoyCon => (Handedness::Left, None),
            Self::RightJoyCon => (Handedness::Right, None),
            Self::ProController => (Handedness::Left, Some(Handedness::Right)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LeftJoyCon => "Joy-Con (L)",
            Self::RightJoyCon => "Joy-Con (R)",
            Self::ProController => "Pro Controller",
        }
    }
}

/// An enumerated controller that can be opened
#[derive(Debug, Clone)]
pub struct DeviceDescriptor {
    pub path: CString,
    pub kind: ControllerKind,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
}

/// Check whether a vendor/product pair is a supported controller
pub fn is_supported(vendor_id: u16, product_id: u16) -> bool {
    vendor_id == NINTENDO_VENDOR_ID && ControllerKind::from_product_id(product_id).is_some()
}

/// List every connected Joy-Con and Pro Controller
pub fn find_controllers(api: &HidApi) -> Vec<DeviceDescriptor> {
    api.device_list()
        .filter(|d| is_supported(d.vendor_id(), d.product_id()))
        .filter_map(|d| {
            let kind = ControllerKind::from_product_id(d.product_id())?;
            Some(DeviceDescriptor {
                path: d.path().to_owned(),
                kind,
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                serial: d.serial_number().map(str::to_owned),
            })
        })
        .collect()
}

/// hidapi treats a negative timeout as "block forever"; saturate instead.
fn timeout_millis(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX)
}

/// `hidapi`-backed transport
pub struct HidTransport {
    device: Option<HidDevice>,
}

impl HidTransport {
    /// Open the device at `path` in blocking mode
    pub fn open(api: &HidApi, path: &CStr) -> Result<Self> {
        if path.to_bytes().is_empty() {
            return Err(JoyConError::MissingPath);
        }

        let device = api.open_path(path)?;
        device.set_blocking_mode(true)?;
        info!("Opened HID device at {:?}", path);

        Ok(Self {
            device: Some(device),
        })
    }

    fn device(&self) -> Result<&HidDevice> {
        self.device.as_ref().ok_or(JoyConError::Closed)
    }
}

impl Transport for HidTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.device()?.write(data)?)
    }

    fn read_timeout(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let mut buf = [0u8; MAX_REPORT_SIZE];
        let bytes_read = self
            .device()?
            .read_timeout(&mut buf, timeout_millis(timeout))?;

        if bytes_read == 0 {
            return Ok(None);
        }
        Ok(Some(buf[..bytes_read].to_vec()))
    }

    fn read_blocking(&mut self) -> Result<Vec<u8>> {
        let mut buf = [0u8; MAX_REPORT_SIZE];
        let bytes_read = self.device()?.read(&mut buf)?;
        Ok(buf[..bytes_read].to_vec())
    }

    fn close(&mut self) {
        if self.device.take().is_some() {
            debug!("HID device closed");
        }
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }
}
