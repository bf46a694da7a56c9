//! Window-consensus pipeline.
//!
//! This module contains:
//! - Sliding windows over movement readings and the pending power slot
//! - Majority-of-K smoothing of classifier labels
//! - Power and cumulative energy for accepted results

pub mod consensus;
pub mod energy;
pub mod windowing;

// Re-export commonly used types
pub use consensus::{ConsensusSmoother, Decision};
pub use energy::{EnergyAccumulator, EnergySample};
pub use windowing::{PendingPower, PowerReading, Window, WindowBuffer};
