//! Periodic sample producer.
//!
//! One cycle acquires the dosimeter readings, stamps them with the next
//! sequence number and appends them to the shared log. Production is gated
//! by [`SamplingControl`], which the ground toggles through the retrieval
//! protocol.

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info};
use thiserror_no_std::Error;

use crate::storage::{
    LogError, NUM_RADFETS, READINGS_PER_RADFET, Readings, Sample, SharedSampleLog, Storage,
};
use crate::time::Heartbeat;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    #[error("sensor sequence timed out")]
    Timeout,
    #[error("ADC read failed")]
    ReadError,
    #[error("I/O expander access failed")]
    ExpanderError,
}

/// Excitation and read-out of all dosimeters.
pub trait SampleSource {
    /// Run one full measurement sequence.
    fn acquire(&mut self) -> impl Future<Output = Result<Readings, SensorError>>;
}

/// Pause flag shared by the retrieval task (writer) and the producer (reader)
#[derive(Debug, Default)]
pub struct SamplingControl {
    paused: AtomicBool,
}

impl SamplingControl {
    pub const fn new() -> Self {
        Self {
            paused: AtomicBool::new(false),
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Paused,
    Recorded { index: u32 },
    Failed(LogError),
}

pub struct Producer<'a, S, P, D, H> {
    log: &'a SharedSampleLog<S>,
    control: &'a SamplingControl,
    source: P,
    delay: D,
    heartbeat: H,
    pause_poll_ms: u32,
}

impl<'a, S, P, D, H> Producer<'a, S, P, D, H>
where
    S: Storage,
    P: SampleSource,
    D: DelayNs,
    H: Heartbeat,
{
    pub fn new(
        log: &'a SharedSampleLog<S>,
        control: &'a SamplingControl,
        source: P,
        delay: D,
        heartbeat: H,
        pause_poll_ms: u32,
    ) -> Self {
        Self {
            log,
            control,
            source,
            delay,
            heartbeat,
            pause_poll_ms: pause_poll_ms.max(1),
        }
    }

    /// Run one sampling cycle.
    ///
    /// A failed acquisition is still recorded, with zeroed readings, so the
    /// sequence numbers in the log stay contiguous.
    pub async fn cycle(&mut self) -> CycleOutcome {
        self.heartbeat.beat();

        if self.control.is_paused() {
            debug!("Sampling paused, skipping cycle");
            return CycleOutcome::Paused;
        }

        let readings = match self.source.acquire().await {
            Ok(readings) => readings,
            Err(e) => {
                error!("Dosimeter acquisition failed: {}", e);
                [[0; READINGS_PER_RADFET]; NUM_RADFETS]
            }
        };

        let mut log = self.log.lock().await;
        let index = log.next_index();
        match log.append(&Sample::new(index, readings)).await {
            Ok(()) => {
                debug!("Recorded sample {}", index);
                CycleOutcome::Recorded { index }
            }
            Err(e) => {
                error!("Failed to record sample {}: {}", index, e);
                CycleOutcome::Failed(e)
            }
        }
    }

    /// Sample forever at the persisted rate.
    pub async fn run(&mut self) -> ! {
        info!("Producer started");
        loop {
            let wait_ms = match self.cycle().await {
                CycleOutcome::Paused => self.pause_poll_ms,
                _ => self.log.lock().await.sample_rate_ms(),
            };
            self.delay.delay_ms(wait_ms).await;
        }
    }
}
