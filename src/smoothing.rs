//! Per-channel moving average

use std::collections::VecDeque;

pub const DEFAULT_WINDOW: usize = 6;

/// Mean of the last `window` samples of one channel
#[derive(Debug, Clone)]
pub struct RollingAverage {
    samples: VecDeque<f32>,
    window: usize,
}

impl Default for RollingAverage {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl RollingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
        }
    }

    /// Add a sample and return the updated mean
    pub fn push(&mut self, value: f32) -> f32 {
        self.samples.push_back(value);
        if self.samples.len() > self.window {
            self.samples.pop_front();
        }
        self.mean()
    }

    pub fn mean(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f32>() / self.samples.len() as f32
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}
