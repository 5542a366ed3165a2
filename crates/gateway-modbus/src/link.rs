//! Physical line abstraction.
//!
//! [`RtuLink`] is the seam between the bus master and the transceiver:
//! production traffic goes through [`SerialLink`] on a half-duplex RS-485
//! adapter, tests and hardware-free runs go through
//! [`crate::sim::SimLink`]. The link owns driver-enable gating and
//! silence-delimited frame reception; the master owns framing, CRC, and
//! transaction sequencing.

use crate::timing::{silence_window, tx_release_hold, DE_SETTLE};
use crate::MAX_FRAME_LEN;
use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{DataBits, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, trace, warn};

/// Byte transport for RTU frames.
#[async_trait]
pub trait RtuLink: Send {
    /// Active baud rate; silence windows derive from it.
    fn baud(&self) -> u32;

    /// Human-readable identifier of the underlying line.
    fn descriptor(&self) -> String;

    /// Whether the line is currently usable.
    fn is_open(&self) -> bool;

    /// Try to re-establish a closed line.
    async fn reopen(&mut self) -> io::Result<()>;

    /// Transmit one complete frame: assert driver-enable, wait the settling
    /// delay, write and flush, hold one character time plus guard, release.
    async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Receive one frame. The first byte is awaited up to
    /// `first_byte_timeout`; subsequent bytes are assembled until the line
    /// stays silent for the t3.5 window. Returns an empty buffer when no
    /// byte arrived at all (the caller maps that to a timeout).
    async fn recv_frame(
        &mut self,
        first_byte_timeout: Duration,
        max_len: usize,
    ) -> io::Result<Vec<u8>>;
}

/// RS-485 serial line, 8N1, with RTS driving the DE/RE pair.
pub struct SerialLink {
    path: String,
    baud: u32,
    stream: Option<SerialStream>,
}

impl SerialLink {
    /// Open the serial device.
    ///
    /// # Errors
    ///
    /// Returns an error when the device cannot be opened or configured.
    pub fn open(path: &str, baud: u32) -> io::Result<Self> {
        let stream = Self::open_stream(path, baud)?;
        debug!(path, baud, "serial port opened");
        Ok(Self {
            path: path.to_string(),
            baud,
            stream: Some(stream),
        })
    }

    fn open_stream(path: &str, baud: u32) -> io::Result<SerialStream> {
        tokio_serial::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(to_io)
    }

    async fn send_inner(stream: &mut SerialStream, frame: &[u8], baud: u32) -> io::Result<()> {
        stream.write_request_to_send(true).map_err(to_io)?;
        tokio::time::sleep(DE_SETTLE).await;

        let write_result = async {
            stream.write_all(frame).await?;
            stream.flush().await
        }
        .await;

        // The timeout clock starts once the line is released, so hold for
        // exactly one character plus guard and drop DE even on a failed
        // write; a stuck driver would jam the whole bus.
        tokio::time::sleep(tx_release_hold(baud)).await;
        let release_result = stream.write_request_to_send(false).map_err(to_io);

        write_result.and(release_result)
    }

    async fn recv_inner(
        stream: &mut SerialStream,
        first_byte_timeout: Duration,
        window: Duration,
        max_len: usize,
    ) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max_len];
        let mut len = 0usize;

        match timeout(first_byte_timeout, stream.read(&mut buf)).await {
            Err(_) => return Ok(Vec::new()),
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial port closed during receive",
                ))
            }
            Ok(Ok(n)) => len += n,
            Ok(Err(e)) => return Err(e),
        }

        // Reassemble until the line stays silent for the t3.5 window.
        loop {
            match timeout(window, stream.read(&mut buf[len..])).await {
                Err(_) => break,
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    len += n;
                    if len == buf.len() {
                        warn!(len, "receive buffer full before frame silence");
                        break;
                    }
                }
                Ok(Err(e)) => return Err(e),
            }
        }

        buf.truncate(len);
        trace!(len, "frame received");
        Ok(buf)
    }
}

#[async_trait]
impl RtuLink for SerialLink {
    fn baud(&self) -> u32 {
        self.baud
    }

    fn descriptor(&self) -> String {
        self.path.clone()
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn reopen(&mut self) -> io::Result<()> {
        self.stream = None;
        let stream = Self::open_stream(&self.path, self.baud)?;
        self.stream = Some(stream);
        debug!(path = %self.path, "serial port reopened");
        Ok(())
    }

    async fn send_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let baud = self.baud;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))?;

        let result = Self::send_inner(stream, frame, baud).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }

    async fn recv_frame(
        &mut self,
        first_byte_timeout: Duration,
        max_len: usize,
    ) -> io::Result<Vec<u8>> {
        let window = silence_window(self.baud);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))?;

        let result =
            Self::recv_inner(stream, first_byte_timeout, window, max_len.min(MAX_FRAME_LEN)).await;
        if result.is_err() {
            self.stream = None;
        }
        result
    }
}

fn to_io(e: tokio_serial::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}
