//! Power and energy bookkeeping for accepted results.
//!
//! Cumulative energy is a running integral of power over time: each accepted
//! result adds its instantaneous power multiplied by the time since the
//! previous acceptance (or since the evaluation started, for the first one).

use crate::clock::seconds_between;
use crate::config::EnergyConfig;
use crate::core::windowing::PowerReading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Power figures attached to one accepted result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnergySample {
    /// Volts, as reported
    pub voltage: f64,
    /// Current after applying `current_scale`
    pub current: f64,
    /// `voltage × current`
    pub instantaneous_power: f64,
    /// Energy since the evaluation started
    pub cumulative_energy: f64,
}

/// Running energy integral.
#[derive(Debug, Clone)]
pub struct EnergyAccumulator {
    config: EnergyConfig,
    evaluation_start: DateTime<Utc>,
    last_accept: Option<DateTime<Utc>>,
    cumulative: f64,
}

impl EnergyAccumulator {
    pub fn new(config: EnergyConfig, evaluation_start: DateTime<Utc>) -> Self {
        Self {
            config,
            evaluation_start,
            last_accept: None,
            cumulative: 0.0,
        }
    }

    /// Fold in the power reading of a result accepted at `accepted_at`.
    pub fn record(&mut self, reading: PowerReading, accepted_at: DateTime<Utc>) -> EnergySample {
        let current = reading.current * self.config.current_scale;
        let instantaneous_power = reading.voltage * current;

        let since = self.last_accept.unwrap_or(self.evaluation_start);
        let elapsed = seconds_between(since, accepted_at).max(0.0);
        self.cumulative += instantaneous_power * self.config.power_to_watts * elapsed;
        // A clock step backwards must not reopen an interval already counted.
        self.last_accept = Some(accepted_at.max(since));

        tracing::debug!(
            "Power {:.3} over {:.3}s, cumulative {:.3}",
            instantaneous_power,
            elapsed,
            self.cumulative
        );

        EnergySample {
            voltage: reading.voltage,
            current,
            instantaneous_power,
            cumulative_energy: self.cumulative,
        }
    }

    pub fn cumulative(&self) -> f64 {
        self.cumulative
    }

    pub fn evaluation_start(&self) -> DateTime<Utc> {
        self.evaluation_start
    }

    /// Start a new evaluation at `start`, discarding the running total.
    pub fn restart(&mut self, start: DateTime<Utc>) {
        self.evaluation_start = start;
        self.last_accept = None;
        self.cumulative = 0.0;
    }
}
