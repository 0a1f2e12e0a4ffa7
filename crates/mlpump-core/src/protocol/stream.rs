use serialport::SerialPort;
use std::io::{self, Read, Write};
use std::time::Duration;

use super::{serial, PumpError};

/// Abstraction for the byte stream a pump chain is attached to
pub trait Channel: Read + Write + Send {
    /// Port name, used in log messages
    fn name(&self) -> &str;

    /// Upper bound for a single blocking read
    fn timeout(&self) -> Duration;

    /// Get number of bytes available to read
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Clear input buffers
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Clear output buffers
    fn clear_output_buffer(&mut self) -> io::Result<()>;

    /// Release the underlying device. Further I/O fails with `NotConnected`.
    fn close(&mut self);

    /// Whether [`Channel::close`] has not been called yet
    fn is_open(&self) -> bool;
}

/// Serial port wrapper implementing [`Channel`]
///
/// Opened with two stop bits, no parity and a fixed per-read timeout. Both
/// buffers are discarded right after opening.
pub struct SerialChannel {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialChannel {
    /// Open `name` with the default baud rate and read timeout
    pub fn open(name: &str) -> Result<Self, PumpError> {
        Self::open_with(
            name,
            super::DEFAULT_BAUD_RATE,
            Duration::from_millis(super::DEFAULT_TIMEOUT_MS),
        )
    }

    /// Open `name` with an explicit baud rate and read timeout
    pub fn open_with(name: &str, baud_rate: u32, timeout: Duration) -> Result<Self, PumpError> {
        let mut port = serial::open_port(name, baud_rate, timeout)?;
        serial::clear_buffers(port.as_mut())?;
        tracing::info!("Chain created on {}", name);
        Ok(Self::new(port, name, timeout))
    }

    /// Wrap an already configured port
    pub fn new(port: Box<dyn SerialPort>, name: &str, timeout: Duration) -> Self {
        Self {
            port: Some(port),
            name: name.to_string(),
            timeout,
        }
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port is closed"))
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port()?.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port()?.flush()
    }
}

impl Channel for SerialChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        self.port()?.bytes_to_read().map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port()?
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn clear_output_buffer(&mut self) -> io::Result<()> {
        self.port()?
            .clear(serialport::ClearBuffer::Output)
            .map_err(io::Error::other)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::debug!("Closed serial port {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_is_connection_error() {
        let err = SerialChannel::open("/dev/definitely-not-a-pump-port").unwrap_err();
        assert_eq!(err.kind(), crate::protocol::ErrorKind::Connection);
    }
}
