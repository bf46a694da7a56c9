//! Scripted device link.
//!
//! Plays back a fixed sequence of lines, for replaying a captured stream
//! through the pipeline without hardware and for driving tests.

use super::{DeviceLink, LinkError};
use std::collections::VecDeque;
use std::io::{self, BufRead};

/// One scripted read result.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Incoming {
    Line(String),
    Timeout,
    Fault(io::ErrorKind),
}

/// A [`DeviceLink`] backed by an in-memory script.
///
/// Lines are handed out whole, so there is never a partial line to skip and
/// clearing input is a no-op. Once the script runs out every read fails with
/// [`LinkError::Closed`]. Transient I/O faults can be scripted with
/// [`push_fault`](ReplayLink::push_fault).
#[derive(Debug, Default)]
pub struct ReplayLink {
    incoming: VecDeque<Incoming>,
    sent: Vec<String>,
    ack_handshake: bool,
    reads: usize,
}

impl ReplayLink {
    /// Create a link that will deliver the given lines in order.
    ///
    /// A missing trailing newline is added to each line.
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut link = Self::default();
        for line in lines {
            link.push_line(line);
        }
        link
    }

    /// Load a capture file, one raw line per frame.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, LinkError> {
        let mut link = Self::default();
        for line in reader.lines() {
            link.push_line(line?);
        }
        Ok(link)
    }

    /// Answer every `H` with an `A`, the way the board does.
    pub fn acknowledging_handshake(mut self) -> Self {
        self.ack_handshake = true;
        self
    }

    /// Queue a line at the end of the script.
    pub fn push_line(&mut self, line: impl Into<String>) {
        let mut line = line.into();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.incoming.push_back(Incoming::Line(line));
    }

    /// Queue a read that times out.
    pub fn push_timeout(&mut self) {
        self.incoming.push_back(Incoming::Timeout);
    }

    /// Queue a read that fails with an I/O error of the given kind.
    pub fn push_fault(&mut self, kind: io::ErrorKind) {
        self.incoming.push_back(Incoming::Fault(kind));
    }

    /// Lines sent to the device so far, without terminators.
    pub fn sent(&self) -> &[String] {
        &self.sent
    }

    /// Number of read calls served.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Scripted reads not yet consumed.
    pub fn remaining(&self) -> usize {
        self.incoming.len()
    }
}

impl DeviceLink for ReplayLink {
    fn send_line(&mut self, line: &str) -> Result<(), LinkError> {
        if self.ack_handshake && line == "H" {
            self.incoming.push_front(Incoming::Line("A\n".into()));
        }
        self.sent.push(line.to_string());
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, LinkError> {
        self.reads += 1;
        match self.incoming.pop_front() {
            Some(Incoming::Line(line)) => Ok(Some(line)),
            Some(Incoming::Timeout) => Ok(None),
            Some(Incoming::Fault(kind)) => Err(io::Error::new(kind, "scripted fault").into()),
            None => Err(LinkError::Closed),
        }
    }

    fn clear_input(&mut self) -> Result<(), LinkError> {
        Ok(())
    }

    fn resync_to_line(&mut self) -> Result<(), LinkError> {
        self.clear_input()
    }
}
