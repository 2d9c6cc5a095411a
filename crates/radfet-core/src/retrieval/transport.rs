//! Byte-oriented link to the ground.

use embassy_time::{Duration, Instant, with_deadline, with_timeout};
use embedded_io_async::{Read, Write};
use log::{error, warn};
use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,
    #[error("serial I/O failure")]
    Io,
}

/// Half-duplex serial link carrying commands up and packets down.
///
/// Both calls are bounded by their timeout.
pub trait Transport {
    /// Wait up to `timeout` for one byte.
    fn read_byte(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<u8, TransportError>>;

    /// Write a prefix of `buf`, returning how many bytes the link accepted.
    ///
    /// Accepted bytes count as written even if draining them runs out of time.
    fn write(
        &mut self,
        buf: &[u8],
        timeout: Duration,
    ) -> impl Future<Output = Result<usize, TransportError>>;
}

/// [`Transport`] over any async serial port, e.g. a buffered UART.
pub struct SerialTransport<T> {
    port: T,
}

impl<T> SerialTransport<T> {
    pub const fn new(port: T) -> Self {
        Self { port }
    }

    pub fn into_inner(self) -> T {
        self.port
    }
}

impl<T: Read + Write> Transport for SerialTransport<T> {
    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, TransportError> {
        let mut byte = [0u8; 1];
        match with_timeout(timeout, self.port.read(&mut byte)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) => {
                error!("Serial read failed: {:?}", e);
                Err(TransportError::Io)
            }
            Ok(Ok(0)) => {
                error!("Serial port closed");
                Err(TransportError::Io)
            }
            Ok(Ok(_)) => Ok(byte[0]),
        }
    }

    async fn write(&mut self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let deadline = Instant::now() + timeout;

        let written = match with_deadline(deadline, self.port.write(buf)).await {
            Err(_) => return Err(TransportError::Timeout),
            Ok(Err(e)) => {
                error!("Serial write failed: {:?}", e);
                return Err(TransportError::Io);
            }
            Ok(Ok(written)) => written,
        };

        match with_deadline(deadline, self.port.flush()).await {
            Err(_) => {
                warn!("Serial flush timed out with {} bytes accepted", written);
                Ok(written)
            }
            Ok(Err(e)) => {
                error!("Serial flush failed: {:?}", e);
                Err(TransportError::Io)
            }
            Ok(Ok(())) => Ok(written),
        }
    }
}
