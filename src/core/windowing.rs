//! Sliding windows of movement readings.
//!
//! Movement readings are collected into fixed-length windows for
//! classification. After each window the oldest `overlap_count` readings are
//! dropped and the rest carry over, so consecutive windows overlap.
//! Power readings never enter a window; the latest one waits in
//! [`PendingPower`] until a result needs it.

use crate::config::PipelineConfig;
use crate::protocol::frame::MovementReading;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One window handed to the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub samples: Vec<MovementReading>,
}

impl Window {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Accumulates movement readings into overlapping windows.
#[derive(Debug, Clone)]
pub struct WindowBuffer {
    frame_length: usize,
    overlap_count: usize,
    entries: VecDeque<MovementReading>,
}

impl WindowBuffer {
    /// Create a buffer from the pipeline configuration.
    ///
    /// At least one reading is always dropped per window so the buffer keeps
    /// moving even with a degenerate overlap ratio.
    pub fn new(config: &PipelineConfig) -> Self {
        let frame_length = config.frame_length.max(1);
        Self {
            frame_length,
            overlap_count: config.overlap_count().clamp(1, frame_length),
            entries: VecDeque::with_capacity(frame_length),
        }
    }

    /// Append one movement reading set.
    pub fn push(&mut self, readings: MovementReading) {
        self.entries.push_back(readings);
    }

    /// True once a full window is available.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.frame_length
    }

    /// Remove and return the next window, or `None` if not full yet.
    ///
    /// The window is the first `frame_length` entries. Afterwards the oldest
    /// `overlap_count` entries are dropped, leaving
    /// `frame_length - overlap_count` of them as the start of the next window.
    pub fn take_window(&mut self) -> Option<Window> {
        if !self.is_full() {
            return None;
        }

        let samples = self.entries.iter().take(self.frame_length).copied().collect();
        self.entries.drain(..self.overlap_count);
        Some(Window { samples })
    }

    /// Discard everything, e.g. after the stream was interrupted.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn overlap_count(&self) -> usize {
        self.overlap_count
    }

    /// Entries left behind by `take_window` on a buffer holding one window.
    pub fn carried_count(&self) -> usize {
        self.frame_length - self.overlap_count
    }
}

/// Voltage and current from a power frame, as reported by the board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub voltage: f64,
    pub current: f64,
}

/// Single-slot holder for the most recent power reading.
#[derive(Debug, Clone, Default)]
pub struct PendingPower {
    latest: Option<PowerReading>,
}

impl PendingPower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a reading, replacing any earlier one.
    pub fn store(&mut self, reading: PowerReading) {
        self.latest = Some(reading);
    }

    /// Take the reading for a result, leaving the slot empty.
    pub fn take(&mut self) -> Option<PowerReading> {
        self.latest.take()
    }

    pub fn peek(&self) -> Option<&PowerReading> {
        self.latest.as_ref()
    }
}
