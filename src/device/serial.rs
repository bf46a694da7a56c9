//! Serial port implementation of [`DeviceLink`].

use super::{DeviceLink, LinkError};
use crate::config::SerialConfig;
use serialport::{ClearBuffer, FlowControl, SerialPort};
use std::io::{self, Read, Write};

/// Bytes held while waiting for a newline. Frames are far shorter, so
/// anything longer is noise such as a baud rate mismatch.
const MAX_PENDING: usize = 1024;

/// Receive-side line assembly.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete line with its terminator.
    ///
    /// Once `MAX_PENDING` bytes pile up without a newline they are handed out
    /// unterminated, which the frame codec rejects.
    fn take_line(&mut self) -> Option<String> {
        let end = match self.pending.iter().position(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None if self.pending.len() >= MAX_PENDING => {
                tracing::warn!("No line terminator in {} bytes; discarding", MAX_PENDING);
                MAX_PENDING
            }
            None => return None,
        };
        let line: Vec<u8> = self.pending.drain(..end).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}

/// A serial port with line buffering on the receive side.
///
/// The port is closed when the link is dropped.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    lines: LineBuffer,
}

impl SerialLink {
    /// Open the port described by the configuration.
    pub fn open(config: &SerialConfig) -> Result<Self, LinkError> {
        let port = serialport::new(config.port.as_str(), config.baud_rate)
            .timeout(config.read_timeout)
            .flow_control(FlowControl::None)
            .open()
            .map_err(|source| LinkError::Open {
                port: config.port.clone(),
                source,
            })?;

        tracing::info!(
            "Opened serial port {} at {} baud",
            config.port,
            config.baud_rate
        );

        Ok(Self {
            port,
            lines: LineBuffer::default(),
        })
    }

    /// Names of the serial ports present on this machine.
    pub fn list_ports() -> Result<Vec<String>, LinkError> {
        Ok(serialport::available_ports()?
            .into_iter()
            .map(|info| info.port_name)
            .collect())
    }
}

impl DeviceLink for SerialLink {
    fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, LinkError> {
        let mut buf = [0u8; 128];
        loop {
            if let Some(line) = self.lines.take_line() {
                return Ok(Some(line));
            }

            match self.port.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(n) => self.lines.extend(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        self.lines.clear();
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
