//! HD rumble encoding and timing
//!
//! The actuator has a high and a low frequency band. Each band is sent as a
//! log-scaled frequency code plus an amplitude code, packed into 4 bytes per
//! motor:
//!
//! ```text
//! byte 0: hf & 0xFF
//! byte 1: (hf >> 8) + hf_amp
//! byte 2: lf + (lf_amp >> 8)
//! byte 3: 0x40 + (lf_amp & 0xFF)
//! ```

use serde::Serialize;
use tracing::debug;

use crate::protocol::RUMBLE_NEUTRAL;

pub const LOW_FREQ_MIN: f64 = 40.875885;
pub const LOW_FREQ_MAX: f64 = 626.286133;
pub const HIGH_FREQ_MIN: f64 = 81.75177;
pub const HIGH_FREQ_MAX: f64 = 1252.572266;

/// Resonance frequencies the motor idles at
pub const NEUTRAL_LOW_FREQ: f32 = 160.0;
pub const NEUTRAL_HIGH_FREQ: f32 = 320.0;

/// Amplitude code of the high band, piecewise in three ranges
fn high_band_amplitude(amplitude: f64) -> f64 {
    let log = (amplitude * 1000.0).log2() * 32.0 - 0x60 as f64;
    if amplitude < 0.117 {
        log / (5.0 - amplitude.powi(2)) - 1.0
    } else if amplitude < 0.23 {
        log - 0x5C as f64
    } else {
        log * 2.0 - 0xF6 as f64
    }
}

/// Encode frequencies (Hz) and amplitude (0..1) for both motors.
///
/// An amplitude of exactly zero yields the neutral block.
pub fn encode_rumble(freq_low: f32, freq_high: f32, amplitude: f32) -> [u8; 8] {
    let mut block = RUMBLE_NEUTRAL;

    if amplitude != 0.0 {
        let freq_low = (freq_low as f64).clamp(LOW_FREQ_MIN, LOW_FREQ_MAX);
        let freq_high = (freq_high as f64).clamp(HIGH_FREQ_MIN, HIGH_FREQ_MAX);
        let amplitude = (amplitude as f64).clamp(0.0, 1.0);

        let hf = ((32.0 * (freq_high * 0.1).log2()).round() as i32 - 0x60) * 4;
        let lf = (32.0 * (freq_low * 0.1).log2()).round() as i32 - 0x40;

        let hf_amp = high_band_amplitude(amplitude);

        let mut lf_amp = (hf_amp.round() * 0.5).floor() as i32;
        let parity = lf_amp % 2;
        if parity > 0 {
            lf_amp -= 1;
        }
        lf_amp >>= 1;
        lf_amp += 0x40;
        if parity > 0 {
            lf_amp |= 0x8000;
        }

        // Below about 0.008 the code goes negative; clamp to 0 rather than wrap
        let hf_amp = hf_amp.clamp(0.0, 255.0) as u8;

        block[0] = (hf & 0xFF) as u8;
        block[1] = ((hf >> 8) & 0xFF) as u8;
        block[2] = lf as u8;
        block[1] = block[1].wrapping_add(hf_amp);
        block[2] = block[2].wrapping_add(((lf_amp >> 8) & 0xFF) as u8);
        block[3] = block[3].wrapping_add((lf_amp & 0xFF) as u8);
    }

    let mut packet = [0u8; 8];
    packet[..4].copy_from_slice(&block);
    packet[4..].copy_from_slice(&block);
    packet
}

/// One rumble setting and how long it lasts
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RumbleRequest {
    pub low_freq: f32,
    pub high_freq: f32,
    pub amplitude: f32,
    /// Seconds
    pub duration: f32,
}

impl RumbleRequest {
    pub fn neutral() -> Self {
        Self {
            low_freq: NEUTRAL_LOW_FREQ,
            high_freq: NEUTRAL_HIGH_FREQ,
            amplitude: 0.0,
            duration: 0.0,
        }
    }
}

/// Active rumble plus at most one request waiting for it to finish
#[derive(Debug, Clone)]
pub struct RumbleState {
    low_freq: f32,
    high_freq: f32,
    amplitude: f32,
    remaining: f32,
    pending: Option<RumbleRequest>,
}

impl Default for RumbleState {
    fn default() -> Self {
        let mut state = Self {
            low_freq: 0.0,
            high_freq: 0.0,
            amplitude: 0.0,
            remaining: 0.0,
            pending: None,
        };
        state.apply(RumbleRequest::neutral());
        state
    }
}

impl RumbleState {
    pub fn new() -> Self {
        Self::default()
    }

    fn apply(&mut self, request: RumbleRequest) {
        self.low_freq = request.low_freq;
        self.high_freq = request.high_freq;
        self.amplitude = request.amplitude;
        self.remaining = request.duration;
    }

    /// Apply `request` once the current rumble has run out.
    ///
    /// A newer request replaces one that is still waiting.
    pub fn schedule(&mut self, request: RumbleRequest) {
        if self.remaining > 0.0 {
            debug!("Rumble deferred by {:.3}s", self.remaining);
            self.pending = Some(request);
        } else {
            self.apply(request);
        }
    }

    /// Advance by `dt` seconds
    pub fn tick(&mut self, dt: f32) {
        if self.remaining < 0.0 {
            self.apply(RumbleRequest::neutral());
        } else if self.remaining != 0.0 {
            self.remaining -= dt;
        }

        if self.remaining <= 0.0 {
            if let Some(request) = self.pending.take() {
                self.apply(request);
            }
        }
    }

    /// Whether the poll task should transmit rumble
    pub fn is_active(&self) -> bool {
        self.remaining != 0.0
    }

    pub fn remaining(&self) -> f32 {
        self.remaining
    }

    pub fn pending(&self) -> Option<&RumbleRequest> {
        self.pending.as_ref()
    }

    pub fn current(&self) -> RumbleRequest {
        RumbleRequest {
            low_freq: self.low_freq,
            high_freq: self.high_freq,
            amplitude: self.amplitude,
            duration: self.remaining,
        }
    }

    /// Encoded packet for the current setting
    pub fn packet(&self) -> [u8; 8] {
        encode_rumble(self.low_freq, self.high_freq, self.amplitude)
    }
}
