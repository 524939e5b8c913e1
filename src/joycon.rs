//! Joy-Con / Pro Controller driver: attach handshake, polling and decoding

use std::ffi::CStr;
use std::time::{Duration, Instant};

use hidapi::HidApi;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::calibration::{CalibrationData, CalibrationStore};
use crate::config::DriverConfig;
use crate::error::{JoyConError, Result};
use crate::orientation::OrientationFilter;
use crate::protocol::{
    CommandChannel, SendType, Subcommand, INPUT_MODE_SIMPLE_HID, INPUT_MODE_STANDARD_FULL,
    STANDARD_FULL_REPORT_ID,
};
use crate::queue::{Report, ReportQueue};
use crate::report::{
    self, ButtonState, Handedness, StickState, IMU_SAMPLES_PER_REPORT,
};
use crate::rumble::{RumbleRequest, RumbleState};
use crate::schedule::PollStep;
use crate::smoothing::RollingAverage;
use crate::transport::{find_controllers, ControllerKind, DeviceDescriptor, HidTransport, Transport};

/// Seconds per IMU timestamp tick
pub const IMU_TICK_SECONDS: f32 = 0.005;

/// Link lifecycle, ordered so that `>` comparisons gate behavior
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AttachmentState {
    #[default]
    NotAttached,
    Dropped,
    NoJoyCons,
    Attached,
    InputModeSet,
    ImuDataOk,
}

/// Decoded snapshot handed to the consumer every frame
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerState {
    pub attachment: AttachmentState,
    pub buttons: ButtonState,
    pub stick: StickState,
    /// Right half of a Pro Controller (face buttons, R/ZR)
    pub buttons2: Option<ButtonState>,
    /// Right stick of a Pro Controller
    pub stick2: Option<StickState>,
    /// Last accelerometer sample, in G
    pub accel: [f32; 3],
    /// Last gyroscope sample, in rad/s
    pub gyro: [f32; 3],
    /// Body axes `i_b, j_b, k_b` in world coordinates
    pub basis: [[f32; 3]; 3],
    /// Roll, pitch, yaw in radians
    pub euler: [f32; 3],
    /// Orientation quaternion `[w, i, j, k]`
    pub orientation: [f32; 4],
    pub battery: u8,
    /// Device timestamp of the newest report
    pub timestamp: u8,
}

/// A connected controller
pub struct JoyCon<T: Transport> {
    channel: CommandChannel<T>,
    kind: ControllerKind,
    config: DriverConfig,
    attachment: AttachmentState,
    calibration_store: CalibrationStore,
    calibration: Option<CalibrationData>,
    filter: OrientationFilter,
    queue: ReportQueue,
    rumble: RumbleState,
    state: ControllerState,
    poll_attempt: u32,
    last_imu_timestamp: u8,
    imu_samples: u64,
    stick_smoothing: Option<[[RollingAverage; 2]; 2]>,
}

impl JoyCon<HidTransport> {
    /// Open a specific controller
    pub fn open(api: &HidApi, device: &DeviceDescriptor, config: DriverConfig) -> Result<Self> {
        let transport = HidTransport::open(api, &device.path)?;
        info!(
            "Connected to {} ({:04x}:{:04x})",
            device.kind.name(),
            device.vendor_id,
            device.product_id
        );
        Ok(Self::new(transport, device.kind, config))
    }

    /// Open the first controller found
    pub fn find_and_open(api: &HidApi, config: DriverConfig) -> Result<Self> {
        let device = find_controllers(api)
            .into_iter()
            .next()
            .ok_or(JoyConError::NotFound)?;
        Self::open(api, &device, config)
    }

    /// Open by HID path
    pub fn open_path(
        api: &HidApi,
        path: &CStr,
        kind: ControllerKind,
        config: DriverConfig,
    ) -> Result<Self> {
        let transport = HidTransport::open(api, path)?;
        Ok(Self::new(transport, kind, config))
    }
}

impl<T: Transport> JoyCon<T> {
    pub fn new(transport: T, kind: ControllerKind, config: DriverConfig) -> Self {
        let channel = CommandChannel::with_timeout(transport, config.command_timeout());
        let filter =
            OrientationFilter::with_correction(config.filter_weight, config.orthogonality_correction);
        let stick_smoothing = (config.stick_smoothing > 1).then(|| {
            let axes = [
                RollingAverage::new(config.stick_smoothing),
                RollingAverage::new(config.stick_smoothing),
            ];
            [axes.clone(), axes]
        });

        Self {
            channel,
            kind,
            calibration_store: CalibrationStore::new(config.max_spi_attempts),
            config,
            attachment: AttachmentState::NotAttached,
            calibration: None,
            filter,
            queue: ReportQueue::new(),
            rumble: RumbleState::new(),
            state: ControllerState::default(),
            poll_attempt: 0,
            last_imu_timestamp: 0,
            imu_samples: 0,
            stick_smoothing,
        }
    }

    pub fn kind(&self) -> ControllerKind {
        self.kind
    }

    pub fn handedness(&self) -> Handedness {
        self.kind.handedness()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn attachment_state(&self) -> AttachmentState {
        self.attachment
    }

    pub fn calibration(&self) -> Option<&CalibrationData> {
        self.calibration.as_ref()
    }

    pub fn calibration_store(&self) -> &CalibrationStore {
        &self.calibration_store
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn queue(&self) -> &ReportQueue {
        &self.queue
    }

    pub fn rumble(&self) -> &RumbleState {
        &self.rumble
    }

    pub fn filter(&self) -> &OrientationFilter {
        &self.filter
    }

    /// IMU samples processed since creation
    pub fn imu_samples(&self) -> u64 {
        self.imu_samples
    }

    pub fn channel(&self) -> &CommandChannel<T> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut CommandChannel<T> {
        &mut self.channel
    }

    /// Run the attach handshake with the configured player LEDs
    pub fn attach(&mut self) -> Result<()> {
        self.attach_with_leds(self.config.leds)
    }

    /// Run the attach handshake: read calibration, pair, light `leds`, enable
    /// the IMU and vibration and switch to full-rate standard reports.
    pub fn attach_with_leds(&mut self, leds: u8) -> Result<()> {
        if !self.channel.transport().is_open() {
            return Err(JoyConError::Closed);
        }
        info!("Attaching {}", self.kind.name());

        self.channel
            .send_subcommand(Subcommand::SetInputReportMode, &[INPUT_MODE_SIMPLE_HID]);

        let kind = self.kind;
        let calibration = self.calibration_store.load(&mut self.channel, kind);
        debug!("Calibration: {:?}", calibration);
        self.calibration = Some(calibration);

        for step in [0x01, 0x02, 0x03] {
            self.channel
                .send_subcommand(Subcommand::BluetoothManualPairing, &[step]);
        }
        self.channel.send_subcommand(Subcommand::SetLed, &[leds]);
        self.channel
            .send_subcommand(Subcommand::EnableImu, &[self.config.enable_imu as u8]);
        self.channel
            .send_subcommand(Subcommand::SetInputReportMode, &[INPUT_MODE_STANDARD_FULL]);
        self.channel.send_subcommand(Subcommand::EnableVibration, &[0x01]);

        self.queue.clear();
        self.filter.recenter();
        self.poll_attempt = 0;
        self.last_imu_timestamp = 0;
        self.attachment = AttachmentState::Attached;
        self.state.attachment = self.attachment;
        info!("Done with init.");
        Ok(())
    }

    /// One poll-task step: push pending rumble, read two reports into the
    /// queue and report whether to keep polling.
    pub fn poll(&mut self, now: Instant) -> PollStep {
        if self.attachment <= AttachmentState::NoJoyCons {
            return PollStep::Stop;
        }

        if self.rumble.is_active() {
            let packet = self.rumble.packet();
            if let Err(e) = self.channel.send_raw(&packet, SendType::Rumble) {
                debug!("Rumble write failed: {}", e);
            }
        }

        let previous = self.queue.last_enqueued_timestamp();
        let first = self.receive_raw(now);
        let second = self.receive_raw(now);
        let fresh = [first, second]
            .into_iter()
            .flatten()
            .any(|ts| Some(ts) != previous);

        if fresh {
            if self.attachment < AttachmentState::ImuDataOk {
                debug!("IMU data flowing");
            }
            self.attachment = AttachmentState::ImuDataOk;
            self.poll_attempt = 0;
            return PollStep::Reschedule(self.config.poll_interval());
        }

        if self.poll_attempt > self.config.max_poll_attempts {
            self.attachment = AttachmentState::Dropped;
            self.state.attachment = self.attachment;
            warn!("Connection lost. Is the Joy-Con connected?");
            return PollStep::Stop;
        }

        self.poll_attempt += 1;
        trace!("Pause {:?}", self.config.poll_interval());
        PollStep::Reschedule(self.config.poll_interval())
    }

    fn receive_raw(&mut self, now: Instant) -> Option<u8> {
        match self.channel.transport_mut().read_blocking() {
            Ok(bytes) if !bytes.is_empty() => self.queue.push(bytes, now),
            Ok(_) => None,
            Err(e) => {
                trace!("Report read failed: {}", e);
                None
            }
        }
    }

    /// Consumer-task step: drain the queue, then advance rumble by `frame`.
    pub fn consume(&mut self, now: Instant, frame: Duration) -> &ControllerState {
        self.drain(now);
        self.rumble.tick(frame.as_secs_f32());
        &self.state
    }

    /// Decode every queued report. IMU data is taken from all of them;
    /// buttons and stick come from the newest one.
    pub fn drain(&mut self, now: Instant) {
        if self.attachment <= AttachmentState::NoJoyCons {
            return;
        }

        let mut newest: Option<Report> = None;
        while let Some(report) = self.queue.pop(now) {
            if self.config.enable_imu {
                if self.config.localize_imu {
                    self.process_imu(report.bytes());
                } else if let Some(sample) = self.calibration.as_ref().and_then(|cal| {
                    report::extract_imu_values(report.bytes(), 0, &cal.gyro_neutral)
                }) {
                    self.state.accel = sample.accel.into();
                    self.state.gyro = sample.gyro.into();
                }
            }
            newest = Some(report);
        }

        if let Some(report) = newest {
            self.decode_inputs(report.bytes());
        }
        self.refresh_orientation();
        self.state.attachment = self.attachment;
    }

    fn process_imu(&mut self, buf: &[u8]) {
        if self.attachment < AttachmentState::ImuDataOk
            || report::report_id(buf) != Some(STANDARD_FULL_REPORT_ID)
        {
            return;
        }
        let (Some(timestamp), Some(calibration)) = (report::timestamp(buf), self.calibration) else {
            return;
        };

        let handedness = self.handedness();
        let mut ticks = report::timestamp_delta(self.last_imu_timestamp, timestamp);
        for n in 0..IMU_SAMPLES_PER_REPORT {
            let Some(sample) = report::extract_imu_values(buf, n, &calibration.gyro_neutral) else {
                break;
            };
            let sample = sample.oriented(handedness);
            self.state.accel = sample.accel.into();
            self.state.gyro = sample.gyro.into();
            self.filter
                .update(sample.accel, sample.gyro, IMU_TICK_SECONDS * ticks as f32);
            self.imu_samples += 1;
            ticks = 1;
        }
        self.last_imu_timestamp = timestamp;
    }

    fn decode_inputs(&mut self, buf: &[u8]) {
        let (primary, secondary) = self.kind.stick_sides();
        self.state.buttons = report::decode_buttons(buf, primary);
        self.state.buttons2 = secondary.map(|side| report::decode_buttons(buf, side));

        if let Some(cal) = self.calibration {
            if let Some(raw) = report::raw_stick(buf, primary) {
                let stick = report::center_sticks(raw, &cal.stick, cal.deadzone);
                self.state.stick = self.smooth(0, stick);
            }
            if let (Some(side), Some(cal2)) = (secondary, cal.stick2) {
                if let Some(raw) = report::raw_stick(buf, side) {
                    let stick = report::center_sticks(raw, &cal2, cal.deadzone2);
                    self.state.stick2 = Some(self.smooth(1, stick));
                }
            }
        }
        if let Some(battery) = report::battery_level(buf) {
            self.state.battery = battery;
        }
        if let Some(timestamp) = report::timestamp(buf) {
            self.state.timestamp = timestamp;
        }
    }

    fn smooth(&mut self, index: usize, mut stick: StickState) -> StickState {
        if let Some([x, y]) = self.stick_smoothing.as_mut().map(|s| &mut s[index]) {
            stick.x = x.push(stick.x);
            stick.y = y.push(stick.y);
        }
        stick
    }

    fn refresh_orientation(&mut self) {
        let (i_b, j_b, k_b) = self.filter.basis();
        self.state.basis = [i_b.into(), j_b.into(), k_b.into()];
        let (roll, pitch, yaw) = self.filter.euler_angles();
        self.state.euler = [roll, pitch, yaw];
        let q = self.filter.rotation();
        self.state.orientation = [q.w, q.i, q.j, q.k];
    }

    /// Queue a rumble. Ignored until IMU data is flowing.
    pub fn set_rumble(&mut self, request: RumbleRequest) -> bool {
        if self.attachment <= AttachmentState::Attached {
            debug!("Rumble ignored in state {:?}", self.attachment);
            return false;
        }
        self.rumble.schedule(request);
        true
    }

    /// Reset orientation to the world frame on the next IMU sample
    pub fn recenter(&mut self) {
        self.filter.recenter();
    }

    /// Turn off LEDs, IMU and vibration, restore simple reports and close the
    /// link. Safe to call more than once.
    pub fn detach(&mut self) {
        if self.attachment > AttachmentState::NoJoyCons {
            info!("Detaching {}", self.kind.name());
            self.channel.send_subcommand(Subcommand::SetLed, &[0x00]);
            self.channel.send_subcommand(Subcommand::EnableImu, &[0x00]);
            self.channel.send_subcommand(Subcommand::EnableVibration, &[0x00]);
            self.channel
                .send_subcommand(Subcommand::SetInputReportMode, &[INPUT_MODE_SIMPLE_HID]);
        }
        if self.attachment > AttachmentState::Dropped {
            self.channel.transport_mut().close();
        }
        self.attachment = AttachmentState::NotAttached;
        self.state.attachment = self.attachment;
        self.poll_attempt = 0;
        self.queue.clear();
    }
}

impl<T: Transport> Drop for JoyCon<T> {
    fn drop(&mut self) {
        self.detach();
    }
}
