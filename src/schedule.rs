//! Single-threaded cooperative scheduling of the poll and consumer tasks
//!
//! The poll task reads the HID link every few milliseconds and the consumer
//! task drains the report queue at frame rate. Both run on the calling thread,
//! so the queue is never touched concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::joycon::{AttachmentState, ControllerState, JoyCon};
use crate::transport::Transport;

/// What the poll task wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    /// Run again after the given delay
    Reschedule(Duration),
    /// The link is gone or detached; stop polling
    Stop,
}

/// Clock and sleep, swappable for virtual time in tests
pub trait Scheduler {
    fn now(&self) -> Instant;
    fn sleep_until(&mut self, deadline: Instant);
}

/// Wall clock backed by `std::thread::sleep`
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&mut self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
    }
}

/// Interleave polling and consuming until `running` is cleared or the poll
/// task stops. `on_frame` sees the snapshot after every consumer tick.
///
/// Returns the attachment state the loop ended in.
pub fn run_loop<T, S, F>(
    joycon: &mut JoyCon<T>,
    scheduler: &mut S,
    running: &AtomicBool,
    mut on_frame: F,
) -> AttachmentState
where
    T: Transport,
    S: Scheduler,
    F: FnMut(&ControllerState),
{
    let frame = joycon.config().consumer_interval();
    let mut next_poll = Some(scheduler.now());
    let mut next_frame = scheduler.now() + frame;

    info!("Driver loop started ({:?} per frame)", frame);

    while running.load(Ordering::SeqCst) {
        if let Some(due) = next_poll {
            let now = scheduler.now();
            if now >= due {
                next_poll = match joycon.poll(now) {
                    PollStep::Reschedule(delay) => Some(scheduler.now() + delay),
                    PollStep::Stop => None,
                };
            }
        }

        let now = scheduler.now();
        if now >= next_frame {
            on_frame(joycon.consume(now, frame));
            next_frame += frame;
            if next_frame <= now {
                // Fell behind; skip the missed frames instead of bursting
                next_frame = now + frame;
            }
        }

        let Some(due) = next_poll else {
            debug!("Poll task stopped in state {:?}", joycon.attachment_state());
            break;
        };
        scheduler.sleep_until(due.min(next_frame));
    }

    joycon.attachment_state()
}
