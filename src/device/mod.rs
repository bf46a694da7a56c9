//! Line-oriented link to the sensor board.
//!
//! The relay talks to the board through the [`DeviceLink`] trait:
//! - [`SerialLink`] drives a real serial port
//! - [`ReplayLink`] plays back a scripted or recorded stream of lines

pub mod replay;
pub mod serial;

use thiserror::Error;

pub use replay::ReplayLink;
pub use serial::SerialLink;

/// Errors from the device link.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to open serial port {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Port(#[from] serialport::Error),

    #[error("device stream closed")]
    Closed,
}

/// Line-based access to the board.
///
/// Lines are newline terminated in both directions. Reads return the line with
/// its terminator so the frame codec sees exactly what was transmitted.
pub trait DeviceLink {
    /// Send one line; the newline is appended.
    fn send_line(&mut self, line: &str) -> Result<(), LinkError>;

    /// Read one complete line, or `None` if the read timed out first.
    fn read_line(&mut self) -> Result<Option<String>, LinkError>;

    /// Drop everything received but not yet read.
    fn clear_input(&mut self) -> Result<(), LinkError>;

    /// Clear input and skip to the next line boundary.
    ///
    /// Clearing usually cuts a line in half, so the remainder of that line is
    /// read and thrown away.
    fn resync_to_line(&mut self) -> Result<(), LinkError> {
        self.clear_input()?;
        self.read_line().map(|_| ())
    }
}

impl<L: DeviceLink + ?Sized> DeviceLink for &mut L {
    fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        (**self).send_line(line)
    }

    fn read_line(&mut self) -> Result<Option<String>, LinkError> {
        (**self).read_line()
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        (**self).clear_input()
    }

    fn resync_to_line(&mut self) -> Result<(), LinkError> {
        (**self).resync_to_line()
    }
}

impl<L: DeviceLink + ?Sized> DeviceLink for Box<L> {
    fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        (**self).send_line(line)
    }

    fn read_line(&mut self) -> Result<Option<String>, LinkError> {
        (**self).read_line()
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        (**self).clear_input()
    }

    fn resync_to_line(&mut self) -> Result<(), LinkError> {
        (**self).resync_to_line()
    }
}
