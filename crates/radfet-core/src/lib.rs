//! Hardware-independent core library for the RADFET dosimeter payload
//!
//! This crate contains all platform-agnostic logic of the payload controller:
//! the persistent circular sample log, its binary packet and metadata
//! layouts, the producer loop that feeds it, and the command-driven retrieval
//! protocol that streams the log to the ground over a slow serial link.
//!
//! Hardware (flash region, UART, dosimeter sequencing, watchdog) is reached
//! only through the traits in [`storage::Storage`], [`retrieval::Transport`],
//! [`sampling::SampleSource`], [`time::Clock`] and [`time::Heartbeat`].
//!
//! It is `#![no_std]` with `extern crate alloc` so it compiles on both
//! embedded targets and desktop hosts (for the simulator and tests).

#![no_std]

extern crate alloc;

pub mod config;
pub mod retrieval;
pub mod sampling;
pub mod storage;
pub mod time;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, PayloadConfig, RetrievalConfig};
pub use storage::{LogError, LogLayout, Sample, SampleLog, SharedSampleLog};
