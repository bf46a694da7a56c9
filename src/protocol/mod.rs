//! Sensor-board wire protocol.
//!
//! - Frame parsing, checksum validation and encoding
//! - The `H`/`A` handshake state machine

pub mod frame;
pub mod handshake;

pub use frame::{parse, FrameError, FrameKind, MovementReading, SensorFrame};
pub use handshake::{Handshake, HandshakeError, LinkState, RetrySchedule, START_STREAM};

/// Consecutive frame failures since the last good frame.
#[derive(Debug, Clone, Copy)]
pub struct ErrorCounter {
    count: u32,
    threshold: u32,
}

impl ErrorCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
        }
    }

    /// Count a failure; true when the threshold is reached, which also resets
    /// the count.
    pub fn record_failure(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.threshold {
            self.count = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
