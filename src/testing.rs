//! Test doubles: a scripted transport and a virtual-time scheduler.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

use crate::error::{JoyConError, Result};
use crate::protocol::Subcommand;
use crate::schedule::Scheduler;
use crate::transport::Transport;

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>>>;

/// Scripted [`Transport`]: records writes, replays queued reads.
pub(crate) struct MockTransport {
    writes: Vec<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
    reports: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    open: bool,
    close_calls: usize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self {
            writes: Vec::new(),
            responses: VecDeque::new(),
            reports: VecDeque::new(),
            responder: None,
            open: true,
            close_calls: 0,
        }
    }

    /// Answer every timed read by calling `f` with the last written packet.
    pub(crate) fn with_responder<F>(mut self, f: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + 'static,
    {
        self.responder = Some(Box::new(f));
        self
    }

    /// Queue a reply for the next timed read
    pub(crate) fn push_response(&mut self, response: Vec<u8>) {
        self.responses.push_back(response);
    }

    /// Queue an input report for the next blocking read
    pub(crate) fn push_report(&mut self, report: Vec<u8>) {
        self.reports.push_back(report);
    }

    pub(crate) fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls
    }
}

impl Transport for MockTransport {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if !self.open {
            return Err(JoyConError::Closed);
        }
        self.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn read_timeout(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>> {
        if let Some(response) = self.responses.pop_front() {
            return Ok(Some(response));
        }
        match (self.responder.as_mut(), self.writes.last()) {
            (Some(responder), Some(last)) => Ok(responder(last)),
            _ => Ok(None),
        }
    }

    fn read_blocking(&mut self) -> Result<Vec<u8>> {
        self.reports
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "no report queued").into())
    }

    fn close(&mut self) {
        self.close_calls += 1;
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Virtual clock: sleeping advances time instantly.
pub(crate) struct FakeScheduler {
    start: Instant,
    elapsed: Duration,
    pub(crate) sleeps: usize,
}

impl FakeScheduler {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Duration::ZERO,
            sleeps: 0,
        }
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl Scheduler for FakeScheduler {
    fn now(&self) -> Instant {
        self.start + self.elapsed
    }

    fn sleep_until(&mut self, deadline: Instant) {
        self.sleeps += 1;
        let now = self.now();
        if deadline > now {
            self.elapsed += deadline - now;
        }
    }
}

/// Build a 0x30 input report with the given timestamp and IMU samples.
pub(crate) fn standard_report(timestamp: u8, accel: [i16; 3], gyro: [i16; 3]) -> Vec<u8> {
    let mut buf = vec![0u8; 49];
    buf[0] = 0x30;
    buf[1] = timestamp;
    buf[2] = 0x8E;
    for n in 0..3 {
        let base = 13 + 12 * n;
        for axis in 0..3 {
            buf[base + axis * 2..base + axis * 2 + 2].copy_from_slice(&accel[axis].to_le_bytes());
            buf[base + 6 + axis * 2..base + 6 + axis * 2 + 2]
                .copy_from_slice(&gyro[axis].to_le_bytes());
        }
    }
    buf
}

/// Pack two 12-bit stick values the way the controller does
pub(crate) fn pack_stick(x: u16, y: u16) -> [u8; 3] {
    [
        (x & 0xFF) as u8,
        ((x >> 8) & 0x0F) as u8 | ((y & 0x0F) << 4) as u8,
        (y >> 4) as u8,
    ]
}

/// Build an SPI read reply carrying `payload`
pub(crate) fn spi_reply(page: u8, offset: u8, payload: &[u8]) -> Vec<u8> {
    let mut reply = vec![0u8; 49];
    reply[0] = 0x21;
    reply[15] = offset;
    reply[16] = page;
    reply[20..20 + payload.len()].copy_from_slice(payload);
    reply
}

/// A transport that serves SPI reads out of a fake flash map.
///
/// Unmapped addresses read as erased flash (`0xFF`).
pub(crate) fn flash_transport(contents: HashMap<(u8, u8), Vec<u8>>) -> MockTransport {
    MockTransport::new().with_responder(move |packet| {
        if packet.len() < 16 || packet[10] != Subcommand::SpiFlashRead as u8 {
            return None;
        }
        let offset = packet[11];
        let page = packet[12];
        let len = packet[15] as usize;
        let data = contents
            .get(&(page, offset))
            .cloned()
            .unwrap_or_else(|| vec![0xFF; len]);
        Some(spi_reply(page, offset, &data[..len.min(data.len())]))
    })
}

/// Flash contents of a right controller: center 2048, range ±500, deadzone 50,
/// gyro neutral point zero.
pub(crate) fn right_controller_flash() -> HashMap<(u8, u8), Vec<u8>> {
    let mut contents = HashMap::new();
    let mut stick = Vec::new();
    stick.extend_from_slice(&pack_stick(2048, 2048));
    stick.extend_from_slice(&pack_stick(500, 500));
    stick.extend_from_slice(&pack_stick(500, 500));
    contents.insert((0x80, 0x1D), stick);

    let mut params = vec![0u8; 16];
    params[3] = 50;
    contents.insert((0x60, 0x98), params);

    contents.insert((0x80, 0x34), vec![0u8; 10]);
    contents
}

/// Right controller flash plus a left stick: center (2000, 2100), range ±600,
/// deadzone 40. Left blocks store `max, center, min`.
pub(crate) fn pro_controller_flash() -> HashMap<(u8, u8), Vec<u8>> {
    let mut contents = right_controller_flash();
    let mut stick = Vec::new();
    stick.extend_from_slice(&pack_stick(600, 600));
    stick.extend_from_slice(&pack_stick(2000, 2100));
    stick.extend_from_slice(&pack_stick(600, 600));
    contents.insert((0x80, 0x12), stick);

    let mut params = vec![0u8; 16];
    params[3] = 40;
    contents.insert((0x60, 0x86), params);
    contents
}
