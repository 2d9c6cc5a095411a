//! Ground retrieval protocol.
//!
//! A command-driven state machine: idle, it waits for one command byte with
//! a bounded timeout. `START_TRANSFER` and `SEND_LATEST` run a session that
//! streams packets from a snapshot of the sample log in fixed-size, paced
//! blocks under an overall deadline. `PAUSE`/`RESUME` only flip the sampling
//! control flag.
//!
//! The log is locked per slot read, never across a session, so the producer
//! keeps appending while a transfer runs.

pub mod command;
mod session;
mod transport;

pub use command::Command;
pub use session::{AbortReason, Selection, SessionOutcome, SessionReport};
pub use transport::{SerialTransport, Transport, TransportError};

use embedded_hal_async::delay::DelayNs;
use log::{debug, error, info, warn};

use crate::config::{ConfigError, RetrievalConfig};
use crate::sampling::SamplingControl;
use crate::storage::{LogError, LogSnapshot, SharedSampleLog, Storage, encode_packet};
use crate::time::{Clock, Heartbeat};
use session::{Session, StagingBlock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalState {
    Idle,
    Transferring,
    Completed,
    Aborted,
}

pub struct RetrievalProtocol<'a, S, T, C, D, H> {
    log: &'a SharedSampleLog<S>,
    control: &'a SamplingControl,
    transport: T,
    clock: C,
    delay: D,
    heartbeat: H,
    config: RetrievalConfig,
    state: RetrievalState,
}

impl<'a, S, T, C, D, H> RetrievalProtocol<'a, S, T, C, D, H>
where
    S: Storage,
    T: Transport,
    C: Clock,
    D: DelayNs,
    H: Heartbeat,
{
    pub fn new(
        log: &'a SharedSampleLog<S>,
        control: &'a SamplingControl,
        transport: T,
        clock: C,
        delay: D,
        heartbeat: H,
        config: RetrievalConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            log,
            control,
            transport,
            clock,
            delay,
            heartbeat,
            config,
            state: RetrievalState::Idle,
        })
    }

    /// State after the last poll; a finished session stays visible until the next one.
    pub fn state(&self) -> RetrievalState {
        self.state
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Wait for one command and act on it.
    ///
    /// Returns the report of the session the command started, if any.
    pub async fn poll(&mut self) -> Option<SessionReport> {
        self.state = RetrievalState::Idle;
        self.heartbeat.beat();

        let byte = match self.transport.read_byte(self.config.command_timeout()).await {
            Ok(byte) => byte,
            Err(TransportError::Timeout) => return None,
            Err(e) => {
                warn!("Command read failed: {}", e);
                return None;
            }
        };

        match Command::from_byte(byte) {
            Some(Command::StartTransfer) => {
                let max = self.config.max_samples_per_session;
                Some(self.run_session(Selection::Oldest { max }).await)
            }
            Some(Command::SendLatest) => {
                let count = self.config.latest_count;
                Some(self.run_session(Selection::Newest { count }).await)
            }
            Some(Command::EndTransferAck) => {
                debug!("Ground acknowledged transfer");
                None
            }
            Some(Command::Pause) => {
                self.control.pause();
                info!("Sampling paused by ground");
                None
            }
            Some(Command::Resume) => {
                self.control.resume();
                info!("Sampling resumed by ground");
                None
            }
            None => {
                warn!("Ignoring unknown command byte {:#04x}", byte);
                None
            }
        }
    }

    /// Serve commands forever.
    pub async fn run(&mut self) -> ! {
        loop {
            self.poll().await;
        }
    }

    /// Stream `selection` from a snapshot of the log taken now.
    pub async fn run_session(&mut self, selection: Selection) -> SessionReport {
        self.state = RetrievalState::Transferring;

        let snapshot = self.log.lock().await.snapshot();
        let available = snapshot.available();
        let requested = selection.requested_count(available);
        let mut session = Session::new(
            self.clock.now(),
            self.config.max_transmission(),
            requested,
        );
        info!(
            "Transfer started: {:?}, {} of {} samples, {} bytes",
            selection, requested, available, session.bytes_planned
        );

        let outcome = match self.transfer(&snapshot, selection, &mut session).await {
            Ok(()) => SessionOutcome::Completed,
            Err(reason) => SessionOutcome::Aborted(reason),
        };
        let report = session.finish(outcome, self.clock.now());

        match outcome {
            SessionOutcome::Completed => {
                self.state = RetrievalState::Completed;
                info!(
                    "Transfer complete: {} samples, {} bytes, {} skipped in {}ms",
                    report.valid_sample_count,
                    report.bytes_sent,
                    report.skipped_count,
                    report.elapsed.as_millis()
                );
            }
            SessionOutcome::Aborted(reason) => {
                self.state = RetrievalState::Aborted;
                warn!(
                    "Transfer aborted ({:?}): {}/{} bytes sent after {}ms",
                    reason,
                    report.bytes_sent,
                    report.bytes_planned,
                    report.elapsed.as_millis()
                );
            }
        }
        report
    }

    async fn transfer(
        &mut self,
        snapshot: &LogSnapshot,
        selection: Selection,
        session: &mut Session,
    ) -> Result<(), AbortReason> {
        let available = snapshot.available();
        let mut block = StagingBlock::new(self.config.block_size as usize);

        for position in 0..session.requested_count {
            self.check_deadline(session)?;

            let logical = selection.logical_index(available, position);
            let read = self.log.lock().await.read_at(snapshot, logical).await;
            let sample = match read {
                Ok(sample) => sample,
                Err(e) => {
                    match e {
                        LogError::Integrity { slot } => {
                            warn!("Skipping corrupted slot {} (logical {})", slot, logical)
                        }
                        LogError::Overwritten { slot, .. } => {
                            warn!("Skipping overwritten slot {} (logical {})", slot, logical)
                        }
                        e => error!("Skipping logical sample {}: {}", logical, e),
                    }
                    session.skip();
                    self.heartbeat.beat();
                    continue;
                }
            };

            let packet = encode_packet(&sample);
            let mut pending = &packet[..];
            while !pending.is_empty() {
                let taken = block.fill(pending);
                pending = &pending[taken..];
                if block.is_full() {
                    self.flush(&mut block, session).await?;
                }
            }
            session.valid_sample_count += 1;
        }

        if !block.is_empty() {
            self.flush(&mut block, session).await?;
        }
        Ok(())
    }

    fn check_deadline(&self, session: &Session) -> Result<(), AbortReason> {
        if session.expired(self.clock.now()) {
            warn!("Transfer deadline exceeded");
            return Err(AbortReason::DeadlineExceeded);
        }
        Ok(())
    }

    /// Send the staged block, then beat and pace.
    async fn flush(
        &mut self,
        block: &mut StagingBlock,
        session: &mut Session,
    ) -> Result<(), AbortReason> {
        self.check_deadline(session)?;

        let timeout = self.config.write_timeout();
        let mut pending = block.as_slice();
        while !pending.is_empty() {
            match self.transport.write(pending, timeout).await {
                Ok(0) | Err(TransportError::Timeout) => {
                    error!("Transport stalled with {} bytes pending", pending.len());
                    return Err(AbortReason::Stalled);
                }
                Ok(written) => {
                    let written = written.min(pending.len());
                    session.bytes_sent += written as u32;
                    pending = &pending[written..];
                }
                Err(e) => {
                    error!("Transport write failed: {}", e);
                    return Err(AbortReason::Transport);
                }
            }
        }
        block.clear();

        self.heartbeat.beat();
        self.delay.delay_ms(self.config.pacing_ms).await;
        Ok(())
    }
}
