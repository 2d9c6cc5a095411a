//! Test doubles for the hardware collaborators.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};

use embassy_futures::{block_on, yield_now};
use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;

use crate::retrieval::{Transport, TransportError};
use crate::storage::{
    LogLayout, MemoryRegion, NUM_RADFETS, PACKET_SIZE, READINGS_PER_RADFET, Readings, Sample,
    SampleLog, SharedSampleLog, decode_packet,
};
use crate::time::{Clock, Heartbeat};

/// Simulated time, only moved by [`ManualDelay`]
#[derive(Clone, Default)]
pub struct ManualClock {
    nanos: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(&self) -> ManualDelay {
        ManualDelay {
            nanos: self.nanos.clone(),
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        Instant::from_micros(self.nanos.get() / 1000)
    }
}

/// Delay that advances the shared clock, then yields once
pub struct ManualDelay {
    nanos: Rc<Cell<u64>>,
}

impl DelayNs for ManualDelay {
    async fn delay_ns(&mut self, ns: u32) {
        self.nanos.set(self.nanos.get() + ns as u64);
        yield_now().await;
    }
}

#[derive(Clone, Default)]
pub struct CountingHeartbeat {
    beats: Rc<Cell<u32>>,
}

impl CountingHeartbeat {
    pub fn count(&self) -> u32 {
        self.beats.get()
    }
}

impl Heartbeat for CountingHeartbeat {
    fn beat(&mut self) {
        self.beats.set(self.beats.get() + 1);
    }
}

/// Shared state behind a [`ScriptedTransport`]
#[derive(Default)]
pub struct Link {
    /// Results handed out by `read_byte`; an empty script times out
    pub incoming: VecDeque<Result<u8, TransportError>>,
    /// Everything the transport accepted
    pub outgoing: Vec<u8>,
    /// Number of `write` calls so far
    pub write_calls: usize,
    /// Most bytes accepted by a single write
    pub max_chunk: Option<usize>,
    /// Accept nothing from this write call on (0-based)
    pub stall_from_call: Option<usize>,
    /// Fail this write call (0-based)
    pub fail_call: Option<usize>,
}

impl Link {
    /// Decoded packets sent so far, with their CRC status
    pub fn packets(&self) -> Vec<(Sample, bool)> {
        self.outgoing
            .chunks_exact(PACKET_SIZE)
            .map(|chunk| {
                let mut bytes = [0u8; PACKET_SIZE];
                bytes.copy_from_slice(chunk);
                decode_packet(&bytes)
            })
            .collect()
    }

    pub fn sent_indices(&self) -> Vec<u32> {
        self.packets().iter().map(|(s, _)| s.index).collect()
    }
}

#[derive(Clone, Default)]
pub struct ScriptedTransport {
    pub link: Rc<RefCell<Link>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_commands(&self, bytes: &[u8]) {
        let mut link = self.link.borrow_mut();
        link.incoming.extend(bytes.iter().map(|b| Ok(*b)));
    }
}

impl Transport for ScriptedTransport {
    async fn read_byte(&mut self, _timeout: Duration) -> Result<u8, TransportError> {
        self.link
            .borrow_mut()
            .incoming
            .pop_front()
            .unwrap_or(Err(TransportError::Timeout))
    }

    async fn write(&mut self, buf: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut link = self.link.borrow_mut();
        let call = link.write_calls;
        link.write_calls += 1;

        if link.fail_call == Some(call) {
            return Err(TransportError::Io);
        }
        if link.stall_from_call.is_some_and(|first| call >= first) {
            return Ok(0);
        }

        let accepted = buf.len().min(link.max_chunk.unwrap_or(usize::MAX));
        link.outgoing.extend_from_slice(&buf[..accepted]);
        Ok(accepted)
    }
}

/// Readings that identify the sample they belong to
pub fn readings_for(index: u32) -> Readings {
    let mut readings: Readings = [[0; READINGS_PER_RADFET]; NUM_RADFETS];
    for (radfet, pair) in readings.iter_mut().enumerate() {
        pair[0] = index as i16;
        pair[1] = radfet as i16 * 100 - index as i16;
    }
    readings
}

/// Log over a fresh region with `capacity` slots holding samples `0..count`
pub fn filled_log(capacity: u32, count: u32) -> SampleLog<MemoryRegion> {
    let ring_size = capacity * PACKET_SIZE as u32;
    let layout = LogLayout::trailing(0, ring_size, 64);
    let region = MemoryRegion::new(layout.metadata_address + 64);
    let mut log = SampleLog::new(region, layout, 60_000).unwrap();
    block_on(log.load_metadata());
    for index in 0..count {
        block_on(log.append(&Sample::new(index, readings_for(index)))).unwrap();
    }
    log
}

pub fn shared_log(capacity: u32, count: u32) -> SharedSampleLog<MemoryRegion> {
    SharedSampleLog::new(filled_log(capacity, count))
}
