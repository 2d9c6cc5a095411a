//! Bookkeeping of one retrieval session.

use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::config::MAX_BLOCK_SIZE;
use crate::storage::PACKET_SIZE;

const PACKET_BYTES: u32 = PACKET_SIZE as u32;

/// Which samples a session delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Up to `max` samples, oldest available first
    Oldest { max: u32 },
    /// The `count` most recent samples, newest first
    Newest { count: u32 },
}

impl Selection {
    /// Number of samples the session plans to send out of `available`
    pub fn requested_count(&self, available: u32) -> u32 {
        match *self {
            Self::Oldest { max } => available.min(max),
            Self::Newest { count } => available.min(count),
        }
    }

    /// Logical log index of the `position`-th sample sent.
    pub fn logical_index(&self, available: u32, position: u32) -> u32 {
        match self {
            Self::Oldest { .. } => position,
            Self::Newest { .. } => available - 1 - position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The transport reported an I/O error
    Transport,
    /// The transport accepted nothing within the write timeout
    Stalled,
    /// The session ran past its deadline
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Aborted(AbortReason),
}

/// What a finished session did.
///
/// Delivery is complete only if [`is_complete`](Self::is_complete) holds; an
/// aborted session still reports what it managed to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    /// Samples selected from the snapshot taken at session start
    pub requested_count: u32,
    /// Samples read back with a valid CRC and packed for sending
    pub valid_sample_count: u32,
    /// Slots skipped for CRC or storage errors
    pub skipped_count: u32,
    pub bytes_planned: u32,
    pub bytes_sent: u32,
    pub elapsed: Duration,
}

impl SessionReport {
    pub fn is_complete(&self) -> bool {
        self.bytes_sent == self.bytes_planned
    }
}

/// Running counters of a session in progress
#[derive(Debug, Clone, Copy)]
pub(crate) struct Session {
    pub started: Instant,
    pub deadline: Instant,
    pub requested_count: u32,
    pub valid_sample_count: u32,
    pub skipped_count: u32,
    pub bytes_planned: u32,
    pub bytes_sent: u32,
}

impl Session {
    pub fn new(started: Instant, max_duration: Duration, requested_count: u32) -> Self {
        Self {
            started,
            deadline: started + max_duration,
            requested_count,
            valid_sample_count: 0,
            skipped_count: 0,
            bytes_planned: requested_count * PACKET_BYTES,
            bytes_sent: 0,
        }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// A slot that will not be sent no longer counts towards the plan.
    pub fn skip(&mut self) {
        self.skipped_count += 1;
        self.bytes_planned -= PACKET_BYTES;
    }

    pub fn finish(&self, outcome: SessionOutcome, now: Instant) -> SessionReport {
        SessionReport {
            outcome,
            requested_count: self.requested_count,
            valid_sample_count: self.valid_sample_count,
            skipped_count: self.skipped_count,
            bytes_planned: self.bytes_planned,
            bytes_sent: self.bytes_sent,
            elapsed: now.saturating_duration_since(self.started),
        }
    }
}

/// Staging buffer holding at most one transport block.
pub(crate) struct StagingBlock {
    buf: Vec<u8, MAX_BLOCK_SIZE>,
    size: usize,
}

impl StagingBlock {
    /// `size` is clamped to `1..=MAX_BLOCK_SIZE`.
    pub fn new(size: usize) -> Self {
        Self {
            buf: Vec::new(),
            size: size.clamp(1, MAX_BLOCK_SIZE),
        }
    }

    /// Copy as much of `data` as fits, returning the number of bytes taken.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let take = data.len().min(self.size - self.buf.len());
        match self.buf.extend_from_slice(&data[..take]) {
            Ok(()) => take,
            Err(_) => 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.size
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
