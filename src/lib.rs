//! Joy-Con Command Library
//!
//! User-space driver for Nintendo Switch Joy-Cons and the Pro Controller
//! over HID: attach handshake, SPI calibration, input report decoding,
//! DCM orientation tracking and HD rumble.

pub mod calibration;
pub mod config;
pub mod error;
pub mod joycon;
pub mod orientation;
pub mod protocol;
pub mod queue;
pub mod report;
pub mod rumble;
pub mod schedule;
pub mod smoothing;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::DriverConfig;
pub use error::{JoyConError, Result};
pub use joycon::{AttachmentState, ControllerState, JoyCon};
pub use transport::{ControllerKind, Transport};
