//! Error types for the Joy-Con driver

use thiserror::Error;

#[derive(Error, Debug)]
pub enum JoyConError {
    #[error("HID API error: {0}")]
    HidApi(#[from] hidapi::HidError),

    #[error("No Joy-Con or Pro Controller found")]
    NotFound,

    #[error("Device has no usable HID path")]
    MissingPath,

    #[error("Transport already closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, JoyConError>;
