//! FIFO of raw input reports between the poll task and the consumer task

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::report;

/// A raw input report and when it was read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    bytes: Vec<u8>,
    received_at: Instant,
}

impl Report {
    pub fn new(bytes: Vec<u8>, received_at: Instant) -> Self {
        Self { bytes, received_at }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn timestamp(&self) -> Option<u8> {
        report::timestamp(&self.bytes)
    }
}

/// Ordered report buffer with timestamp-continuity diagnostics.
///
/// Duplicate device timestamps are logged and counted, never rejected.
#[derive(Debug, Default)]
pub struct ReportQueue {
    reports: VecDeque<Report>,
    prev_enqueue_timestamp: Option<u8>,
    prev_dequeue_timestamp: Option<u8>,
    prev_dequeue_time: Option<Instant>,
    duplicate_enqueues: usize,
    duplicate_dequeues: usize,
    last_packet_gap: Option<Duration>,
}

impl ReportQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    /// Append a report read at `now`, returning its device timestamp
    pub fn push(&mut self, bytes: Vec<u8>, now: Instant) -> Option<u8> {
        let report = Report::new(bytes, now);
        let timestamp = report.timestamp();

        if timestamp.is_some() && timestamp == self.prev_enqueue_timestamp {
            self.duplicate_enqueues += 1;
            trace!(
                "Duplicate timestamp enqueued. TS: {:02x}",
                timestamp.unwrap_or_default()
            );
        }
        trace!(
            "Enqueue. Bytes read: {}. Timestamp: {:?}",
            report.bytes.len(),
            timestamp
        );

        self.prev_enqueue_timestamp = timestamp;
        self.reports.push_back(report);
        timestamp
    }

    /// Remove the oldest report
    pub fn pop(&mut self, now: Instant) -> Option<Report> {
        let report = self.reports.pop_front()?;
        let timestamp = report.timestamp();

        if timestamp.is_some() && timestamp == self.prev_dequeue_timestamp {
            self.duplicate_dequeues += 1;
            trace!(
                "Duplicate timestamp dequeued. TS: {:02x}",
                timestamp.unwrap_or_default()
            );
        }

        let gap = self
            .prev_dequeue_time
            .map(|prev| report.received_at.saturating_duration_since(prev));
        trace!(
            "Dequeue. Queue length: {}. Packet ID: {:?}. Timestamp: {:?}. Lag to dequeue: {:?}. Lag between packets (expect 15ms): {:?}",
            self.reports.len(),
            report::report_id(&report.bytes),
            timestamp,
            now.saturating_duration_since(report.received_at),
            gap
        );

        self.prev_dequeue_timestamp = timestamp;
        self.prev_dequeue_time = Some(report.received_at);
        self.last_packet_gap = gap;
        Some(report)
    }

    /// Device timestamp of the most recently pushed report
    pub fn last_enqueued_timestamp(&self) -> Option<u8> {
        self.prev_enqueue_timestamp
    }

    pub fn duplicate_enqueues(&self) -> usize {
        self.duplicate_enqueues
    }

    pub fn duplicate_dequeues(&self) -> usize {
        self.duplicate_dequeues
    }

    /// Arrival gap between the last two dequeued reports
    pub fn last_packet_gap(&self) -> Option<Duration> {
        self.last_packet_gap
    }

    /// Drop everything, including diagnostics history
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
