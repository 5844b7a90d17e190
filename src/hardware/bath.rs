//! Circulating Temperature Bath Driver
//!
//! Protocol Overview:
//! - Format: ASCII command terminated by carriage return (`\r`)
//! - Response: one line of text, optionally ending in a unit suffix (`20.00C`)
//! - Timing: Half-duplex request-response, every command is answered
//!
//! Commands used:
//!
//! | Command     | Meaning                 |
//! |-------------|-------------------------|
//! | `SO 1`      | Set status on / run     |
//! | `SS 20.00`  | Set setpoint (°C)       |
//! | `RS`        | Read setpoint           |
//! | `RT`        | Read bath temperature   |
//!
//! # Example Usage
//!
//! ```no_run
//! use flowcell_daq::hardware::bath::SerialBath;
//! use flowcell_daq::hardware::TemperatureBath;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bath = SerialBath::open("/dev/ttyUSB0", 19200, Duration::from_secs(1))?;
//!     bath.set_on().await?;
//!     bath.set_setpoint(25.0).await?;
//!     println!("Bath at {:.2} °C", bath.read_temperature().await?);
//!     Ok(())
//! }
//! ```

use crate::error::DaqError;
use crate::hardware::TemperatureBath;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Command terminator expected by the bath.
pub const TERMINATOR: &str = "\r";

/// Parse a numeric reading such as `"20.01C\r"` into °C.
///
/// Surrounding whitespace and a trailing `C` unit suffix are stripped before
/// parsing.
pub fn parse_reading(response: &str) -> std::result::Result<f64, DaqError> {
    let trimmed = response.trim();
    let numeric = trimmed
        .strip_suffix('C')
        .or_else(|| trimmed.strip_suffix('c'))
        .unwrap_or(trimmed)
        .trim();

    numeric
        .parse::<f64>()
        .map_err(|_| DaqError::Protocol(format!("unparseable bath reading: '{trimmed}'")))
}

/// Bath driver over any byte transport.
///
/// The transport is protected by a Mutex so each request/response exchange is
/// exclusive even if the handle is shared.
pub struct LineBath<T> {
    io: Mutex<BufStream<T>>,
    timeout: Duration,
}

impl<T> LineBath<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a connected transport.
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self {
            io: Mutex::new(BufStream::new(transport)),
            timeout,
        }
    }

    /// Send a command and return its (trimmed) response line.
    pub async fn transaction(&self, command: &str) -> Result<String> {
        let mut io = self.io.lock().await;

        let payload = format!("{command}{TERMINATOR}");
        io.write_all(payload.as_bytes())
            .await
            .with_context(|| format!("bath write failed for '{command}'"))?;
        io.flush().await.context("bath flush failed")?;
        trace!(command, "bath request sent");

        let line = tokio::time::timeout(self.timeout, read_line(&mut *io))
            .await
            .map_err(|_| DaqError::SerialTimeout(self.timeout))
            .with_context(|| format!("no response to '{command}'"))??;

        debug!(command, response = %line, "bath response");
        Ok(line)
    }

    async fn query(&self, command: &str) -> Result<f64> {
        let line = self.transaction(command).await?;
        parse_reading(&line).with_context(|| format!("reply to '{command}'"))
    }
}

/// Read one response line; either CR or LF ends it, empty lines are skipped.
async fn read_line<S>(io: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(32);
    loop {
        let byte = io.read_u8().await.context("bath closed the connection")?;
        match byte {
            b'\r' | b'\n' if buf.is_empty() => continue,
            b'\r' | b'\n' => break,
            other => buf.push(other),
        }
    }
    Ok(String::from_utf8_lossy(&buf).trim().to_string())
}

#[async_trait]
impl<T> TemperatureBath for LineBath<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn set_on(&self) -> Result<()> {
        self.transaction("SO 1").await.map(|_| ())
    }

    async fn set_setpoint(&self, celsius: f64) -> Result<()> {
        self.transaction(&format!("SS {celsius:.2}")).await.map(|_| ())
    }

    async fn read_setpoint(&self) -> Result<f64> {
        self.query("RS").await
    }

    async fn read_temperature(&self) -> Result<f64> {
        self.query("RT").await
    }
}

/// Bath attached to a serial port.
#[cfg(feature = "instrument_serial")]
pub type SerialBath = LineBath<tokio_serial::SerialStream>;

#[cfg(feature = "instrument_serial")]
impl LineBath<tokio_serial::SerialStream> {
    /// Open the bath on a serial port (8 data bits, no parity, one stop bit).
    ///
    /// # Errors
    /// Returns error if the serial port cannot be opened
    pub fn open(port_path: &str, baud_rate: u32, timeout: Duration) -> Result<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let port = tokio_serial::new(port_path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open bath serial port: {port_path}"))?;

        debug!(port = port_path, baud_rate, "bath serial port opened");
        Ok(Self::new(port, timeout))
    }
}
