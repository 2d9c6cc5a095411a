//! Time source and liveness signal used by the long-running loops.

use embassy_time::Instant;

/// Monotonic time source for deadlines and elapsed-time reporting
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Clock backed by the embassy time driver
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl<C: Clock> Clock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Liveness signal for the external supervisor (watchdog).
///
/// The producer beats once per cycle, the retrieval task once per command
/// poll and once per flushed block, so a long transfer keeps it alive.
pub trait Heartbeat {
    fn beat(&mut self);
}

/// For deployments without a supervisor
impl Heartbeat for () {
    fn beat(&mut self) {}
}

impl<H: Heartbeat> Heartbeat for &mut H {
    fn beat(&mut self) {
        (**self).beat()
    }
}
