//! Desktop simulator for the RADFET dosimeter payload.
//!
//! Runs the radfet-core producer and retrieval protocol against a file-backed
//! flash region and synthetic dosimeters. The serial link to the ground is a
//! pair of in-memory pipes; a scripted ground station on the other end sends
//! commands and decodes what comes down.
//!
//! The flash file persists between runs, so a second run resumes the sample
//! sequence where the first one stopped.
//!
//! # Environment
//!
//! Read from the process environment and from `.env`:
//!
//! | Variable                | Meaning                                  |
//! |-------------------------|------------------------------------------|
//! | `RADFET_CONFIG`         | postcard config file (`radfet.cfg`)      |
//! | `RADFET_FLASH`          | flash image file (`radfet-flash.bin`)    |
//! | `RADFET_SAMPLE_RATE_MS` | persisted sampling interval override     |
//! | `RADFET_PACING_MS`      | inter-block pacing override              |
//! | `RADFET_BLOCK_SIZE`     | transport block size override            |
//! | `RADFET_WARMUP_SAMPLES` | samples to wait for before the first pass |

mod file_region;

use std::convert::Infallible;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use embassy_futures::block_on;
use embassy_futures::join::join;
use embassy_futures::select::{Either, select};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::pipe::Pipe;
use embassy_time::{Delay, Duration, Timer, with_timeout};
use embedded_io_async::{ErrorType, Read, Write};
use log::{info, trace, warn};
use static_cell::StaticCell;

use radfet_core::retrieval::{RetrievalProtocol, SerialTransport, command};
use radfet_core::sampling::{Producer, SampleSource, SamplingControl, SensorError};
use radfet_core::storage::{
    LogLayout, METADATA_SIZE, NUM_RADFETS, PACKET_SIZE, READINGS_PER_RADFET, Readings,
    decode_packet,
};
use radfet_core::time::{Heartbeat, SystemClock};
use radfet_core::{PayloadConfig, SampleLog, SharedSampleLog};

use file_region::FileRegion;

const UPLINK_SIZE: usize = 16;
const DOWNLINK_SIZE: usize = 1024;

/// Ground → payload commands
static UPLINK: Pipe<CriticalSectionRawMutex, UPLINK_SIZE> = Pipe::new();
/// Payload → ground packets
static DOWNLINK: Pipe<CriticalSectionRawMutex, DOWNLINK_SIZE> = Pipe::new();

static SAMPLE_LOG: StaticCell<SharedSampleLog<FileRegion>> = StaticCell::new();
static CONTROL: SamplingControl = SamplingControl::new();

// ---------------------------------------------------------------------------
// Simulated hardware
// ---------------------------------------------------------------------------

/// Payload side of the simulated UART
struct PipePort {
    rx: &'static Pipe<CriticalSectionRawMutex, UPLINK_SIZE>,
    tx: &'static Pipe<CriticalSectionRawMutex, DOWNLINK_SIZE>,
}

impl ErrorType for PipePort {
    type Error = Infallible;
}

impl Read for PipePort {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        Ok(self.rx.read(buf).await)
    }
}

impl Write for PipePort {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        Ok(self.tx.write(buf).await)
    }

    async fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

/// Dosimeters whose threshold voltage creeps up with accumulated dose.
struct SyntheticDosimeters {
    cycle: u32,
}

impl SyntheticDosimeters {
    fn new() -> Self {
        Self { cycle: 0 }
    }
}

impl SampleSource for SyntheticDosimeters {
    async fn acquire(&mut self) -> Result<Readings, SensorError> {
        // Excitation settle time of the real sequence
        Timer::after(Duration::from_millis(20)).await;

        let t = self.cycle as f64;
        self.cycle = self.cycle.wrapping_add(1);

        let mut readings: Readings = [[0; READINGS_PER_RADFET]; NUM_RADFETS];
        for (radfet, pair) in readings.iter_mut().enumerate() {
            let base = 8_000.0 + 500.0 * radfet as f64;
            let dose = 1.5 * t * (1.0 + radfet as f64 * 0.2);
            let ripple = 12.0 * (t / 7.0 + radfet as f64).sin();
            pair[0] = (base + dose + ripple) as i16;
            pair[1] = (base + dose * 0.8 - ripple) as i16;
        }
        Ok(readings)
    }
}

/// Stands in for the hardware watchdog
struct Watchdog {
    task: &'static str,
    beats: u64,
}

impl Watchdog {
    fn new(task: &'static str) -> Self {
        Self { task, beats: 0 }
    }
}

impl Heartbeat for Watchdog {
    fn beat(&mut self) {
        self.beats += 1;
        trace!("{} heartbeat #{}", self.task, self.beats);
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Small ring so wraparound shows up within minutes
fn simulator_defaults() -> PayloadConfig {
    let mut config = PayloadConfig::default();
    config.layout = LogLayout::trailing(0, 64 * PACKET_SIZE as u32, 256);
    config.default_sample_rate_ms = 500;
    config.pause_poll_ms = 200;
    config.retrieval.pacing_ms = 20;
    config.retrieval.command_timeout_ms = 250;
    config.retrieval.max_transmission_ms = 30_000;
    config.retrieval.latest_count = 3;
    config
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_override<T: FromStr>(key: &str) -> Option<T> {
    let value = std::env::var(key).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, value);
            None
        }
    }
}

/// Read the config file, writing the defaults first if there is none.
fn load_config(path: &Path) -> Result<PayloadConfig, Box<dyn Error>> {
    if !path.exists() {
        let config = simulator_defaults();
        let blob = config.to_vec().map_err(|e| e.to_string())?;
        std::fs::write(path, blob)?;
        info!("Wrote default configuration to {}", path.display());
        return Ok(config);
    }

    let blob = std::fs::read(path)?;
    let config = PayloadConfig::from_bytes(&blob)
        .map_err(|e| format!("{}: {}", path.display(), e))?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

// ---------------------------------------------------------------------------
// Ground station
// ---------------------------------------------------------------------------

/// Collect downlink bytes until the link stays quiet for `quiet`.
async fn receive_pass(quiet: Duration) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 256];
    while let Ok(n) = with_timeout(quiet, DOWNLINK.read(&mut buf)).await {
        received.extend_from_slice(&buf[..n]);
    }
    received
}

fn print_pass(name: &str, bytes: &[u8]) {
    let mut corrupt = 0;
    let chunks = bytes.chunks_exact(PACKET_SIZE);
    let trailing = chunks.remainder().len();

    for chunk in chunks {
        let mut packet = [0u8; PACKET_SIZE];
        packet.copy_from_slice(chunk);
        let (sample, crc_ok) = decode_packet(&packet);
        if !crc_ok {
            corrupt += 1;
            continue;
        }
        let r1: Vec<i16> = sample.readings.iter().map(|pair| pair[0]).collect();
        let r2: Vec<i16> = sample.readings.iter().map(|pair| pair[1]).collect();
        info!("[{}] #{:<6} R1={:?} R2={:?}", name, sample.index, r1, r2);
    }

    info!(
        "[{}] {} bytes received, {} packets, {} corrupt, {} trailing bytes",
        name,
        bytes.len(),
        bytes.len() / PACKET_SIZE,
        corrupt,
        trailing
    );
}

async fn send_command(byte: u8) {
    UPLINK.write(&[byte]).await;
}

/// One scripted contact: latest samples, then a full dump with sampling paused.
async fn ground_station(sample_rate_ms: u32, warmup_samples: u32) {
    let quiet = Duration::from_millis(1_000);

    info!("Ground: waiting for {} samples", warmup_samples);
    Timer::after(Duration::from_millis(
        sample_rate_ms as u64 * warmup_samples as u64 + 100,
    ))
    .await;

    info!("Ground: SEND_LATEST");
    send_command(command::SEND_LATEST).await;
    print_pass("latest", &receive_pass(quiet).await);

    info!("Ground: PAUSE + START_TRANSFER");
    send_command(command::PAUSE).await;
    send_command(command::START_TRANSFER).await;
    print_pass("dump", &receive_pass(quiet).await);

    send_command(command::END_TRANSFER_ACK).await;
    send_command(command::RESUME).await;
    // Let the payload consume the last commands
    Timer::after(Duration::from_millis(500)).await;
    info!("Ground: contact finished");
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = env_path("RADFET_CONFIG", "radfet.cfg");
    let flash_path = env_path("RADFET_FLASH", "radfet-flash.bin");

    let mut config = load_config(&config_path)?;
    if let Some(pacing_ms) = env_override("RADFET_PACING_MS") {
        config.retrieval.pacing_ms = pacing_ms;
    }
    if let Some(block_size) = env_override("RADFET_BLOCK_SIZE") {
        config.retrieval.block_size = block_size;
    }
    let warmup_samples = env_override("RADFET_WARMUP_SAMPLES").unwrap_or(6);

    let layout = config.layout;
    let flash_size = layout
        .ring_start
        .saturating_add(layout.ring_size)
        .max(layout.metadata_address.saturating_add(METADATA_SIZE as u32));
    config.validate(flash_size).map_err(|e| e.to_string())?;

    let region = FileRegion::open(&flash_path, flash_size)?;
    info!("Flash image {} ({} bytes)", flash_path.display(), flash_size);

    let mut sample_log = SampleLog::new(region, config.layout, config.default_sample_rate_ms)
        .map_err(|e| e.to_string())?;

    block_on(async {
        if sample_log.init().await {
            info!(
                "Recovered {} samples, next index {}",
                sample_log.available(),
                sample_log.next_index()
            );
        }
        if let Some(rate) = env_override("RADFET_SAMPLE_RATE_MS")
            && let Err(e) = sample_log.set_sample_rate_ms(rate).await
        {
            warn!("Sample rate override rejected: {}", e);
        }
    });
    let sample_rate_ms = sample_log.sample_rate_ms();

    let log: &'static SharedSampleLog<FileRegion> =
        SAMPLE_LOG.init(SharedSampleLog::new(sample_log));

    let mut producer = Producer::new(
        log,
        &CONTROL,
        SyntheticDosimeters::new(),
        Delay,
        Watchdog::new("producer"),
        config.pause_poll_ms,
    );

    let port = PipePort {
        rx: &UPLINK,
        tx: &DOWNLINK,
    };
    let mut protocol = RetrievalProtocol::new(
        log,
        &CONTROL,
        SerialTransport::new(port),
        SystemClock,
        Delay,
        Watchdog::new("retrieval"),
        config.retrieval,
    )
    .map_err(|e| e.to_string())?;

    let payload = join(producer.run(), protocol.run());
    match block_on(select(payload, ground_station(sample_rate_ms, warmup_samples))) {
        Either::First((never, _)) => match never {},
        Either::Second(()) => {}
    }

    let log = block_on(log.lock());
    let metadata = log.metadata();
    info!(
        "Shutting down: {} samples recorded, {} retrievable, offset {}",
        metadata.samples_saved,
        log.available(),
        metadata.write_offset
    );
    Ok(())
}
