//! Serial port transport for phone communication.
//!
//! This module provides [`SerialTransport`], which implements the
//! [`Transport`] trait for USB data cables and physical RS-232 links.
//! Every protocol in this workspace runs over 8N1; the baud rate is the
//! only negotiable line parameter, and protocols change it mid-session
//! (BFC and CGSN negotiate up from 115200, EBL echoes the new rate back
//! before the switch).
//!
//! # Example
//!
//! ```no_run
//! use sielink_transport::SerialTransport;
//! use sielink_core::transport::Transport;
//! use std::time::Duration;
//!
//! # async fn example() -> sielink_core::Result<()> {
//! let mut transport = SerialTransport::open("/dev/ttyUSB0", 115_200).await?;
//!
//! transport.send(b"AT\r\n").await?;
//!
//! let mut buf = [0u8; 256];
//! let n = transport.receive(&mut buf, Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sielink_core::error::{Error, Result};
use sielink_core::transport::{SerialSignals, Transport};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

/// Serial port transport for phone communication.
///
/// Implements the [`Transport`] trait for USB virtual COM ports and
/// physical RS-232 connections. The port is opened 8N1 with no flow
/// control; Siemens service interfaces use nothing else.
pub struct SerialTransport {
    /// The underlying serial port stream.
    port: Option<SerialStream>,
    /// Port name for logging/debugging.
    port_name: String,
    /// Locally configured baud rate.
    baud_rate: u32,
}

impl SerialTransport {
    /// Open a serial port at the given baud rate.
    ///
    /// # Arguments
    ///
    /// * `port` - Serial port path (e.g. "/dev/ttyUSB0" on Linux, "COM3"
    ///   on Windows)
    /// * `baud_rate` - Initial baud rate (e.g. 115200)
    pub async fn open(port: &str, baud_rate: u32) -> Result<Self> {
        tracing::debug!(port = %port, baud_rate, "Opening serial port");

        let serial_stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                tracing::error!(port = %port, error = %e, "Failed to open serial port");
                Error::Transport(format!("failed to open serial port {}: {}", port, e))
            })?;

        tracing::info!(port = %port, baud_rate, "Serial port opened");

        Ok(Self {
            port: Some(serial_stream),
            port_name: port.to_string(),
            baud_rate,
        })
    }

    /// Get the name of the serial port.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn map_io_error(&self, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::BrokenPipe
            || e.kind() == std::io::ErrorKind::NotConnected
        {
            Error::ConnectionLost
        } else {
            Error::Io(e)
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::trace!(
            port = %self.port_name,
            bytes = data.len(),
            data = ?data,
            "Sending data"
        );

        port.write_all(data).await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to send data");
            if e.kind() == std::io::ErrorKind::BrokenPipe
                || e.kind() == std::io::ErrorKind::NotConnected
            {
                Error::ConnectionLost
            } else {
                Error::Io(e)
            }
        })?;

        port.flush().await.map_err(|e| {
            tracing::error!(port = %self.port_name, error = %e, "Failed to flush serial port");
            Error::Io(e)
        })?;

        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        let result = tokio::time::timeout(timeout, port.read(buf)).await;

        match result {
            Ok(Ok(n)) => {
                tracing::trace!(
                    port = %self.port_name,
                    bytes = n,
                    data = ?&buf[..n],
                    "Received data"
                );
                Ok(n)
            }
            Ok(Err(e)) => {
                tracing::error!(port = %self.port_name, error = %e, "Failed to receive data");
                if e.kind() == std::io::ErrorKind::BrokenPipe
                    || e.kind() == std::io::ErrorKind::NotConnected
                {
                    Err(Error::ConnectionLost)
                } else {
                    Err(Error::Io(e))
                }
            }
            Err(_) => {
                tracing::trace!(
                    port = %self.port_name,
                    timeout_ms = timeout.as_millis(),
                    "Timeout waiting for data"
                );
                Err(Error::Timeout)
            }
        }
    }

    async fn set_signals(&mut self, signals: SerialSignals) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        if let Some(dtr) = signals.dtr {
            tracing::trace!(port = %self.port_name, dtr, "Setting DTR");
            port.write_data_terminal_ready(dtr)
                .map_err(|e| Error::Transport(format!("failed to set DTR: {e}")))?;
        }
        if let Some(rts) = signals.rts {
            tracing::trace!(port = %self.port_name, rts, "Setting RTS");
            port.write_request_to_send(rts)
                .map_err(|e| Error::Transport(format!("failed to set RTS: {e}")))?;
        }
        Ok(())
    }

    async fn set_baud_rate(&mut self, baud: u32) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;

        tracing::debug!(port = %self.port_name, from = self.baud_rate, to = baud, "Changing baud rate");
        port.set_baud_rate(baud)
            .map_err(|e| Error::Transport(format!("failed to set baud rate {baud}: {e}")))?;
        self.baud_rate = baud;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            tracing::debug!(port = %self.port_name, "Closing serial port");

            if let Err(e) = port.flush().await {
                tracing::warn!(
                    port = %self.port_name,
                    error = %e,
                    "Failed to flush before closing (continuing anyway)"
                );
            }

            tracing::info!(port = %self.port_name, "Serial port closed");
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.port.is_some() {
            tracing::debug!(port = %self.port_name, "SerialTransport dropped, closing port");
        }
    }
}
