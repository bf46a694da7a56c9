//! Three-way handshake with the sensor board.
//!
//! ```text
//!            begin()                 "A" received
//! Disconnected ─────▶ Handshaking ──────────────────▶ Synchronized
//!                         ▲                                │
//!                         └──────── force_resync() ────────┘
//! ```
//!
//! Each [`Handshake::poll`] is one attempt: send `H`, wait, read a line. An `A`
//! reply is answered with `A`, the link settles, stale input is dropped and the
//! session is synchronized. Anything else leaves the state machine in
//! `Handshaking` and the next poll resends `H`. There is no retry limit; the
//! pace is set by the [`RetrySchedule`]. [`Handshake::reset`] returns to
//! `Disconnected` from any state.

use crate::clock::Clock;
use crate::config::HandshakeConfig;
use crate::device::{DeviceLink, LinkError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Sent by the relay to open a handshake.
pub const HELLO: &str = "H";

/// Acknowledgement, sent in both directions.
pub const ACK: &str = "A";

/// Tells the board to start streaming frames.
pub const START_STREAM: &str = "S";

/// Lifecycle of the device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    Disconnected,
    Handshaking,
    Synchronized,
}

/// Handshake failures.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid handshake transition from {from:?} to {to:?}")]
    InvalidTransition { from: LinkState, to: LinkState },

    #[error("device link is not synchronized (state {0:?})")]
    NotSynchronized(LinkState),

    #[error(transparent)]
    Link(#[from] LinkError),
}

/// When the next attempt happens.
///
/// A fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub delay: Duration,
}

impl RetrySchedule {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// Pause before attempt number `attempt` (1-based).
    pub fn delay_before(&self, _attempt: u64) -> Duration {
        self.delay
    }
}

/// The handshake state machine.
#[derive(Debug)]
pub struct Handshake {
    state: LinkState,
    config: HandshakeConfig,
    schedule: RetrySchedule,
    attempts: u64,
    completed: u64,
}

impl Handshake {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            state: LinkState::Disconnected,
            schedule: RetrySchedule::fixed(config.response_wait),
            config,
            attempts: 0,
            completed: 0,
        }
    }

    /// Use a different retry schedule.
    pub fn with_schedule(mut self, schedule: RetrySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_synchronized(&self) -> bool {
        self.state == LinkState::Synchronized
    }

    /// Attempts made in the current handshake.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Number of handshakes that reached `Synchronized`.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Fail unless frames can be trusted.
    pub fn require_synchronized(&self) -> Result<(), HandshakeError> {
        if self.is_synchronized() {
            Ok(())
        } else {
            Err(HandshakeError::NotSynchronized(self.state))
        }
    }

    /// `Disconnected → Handshaking`.
    pub fn begin(&mut self) -> Result<(), HandshakeError> {
        self.transition(LinkState::Disconnected, LinkState::Handshaking)
    }

    /// `Synchronized → Handshaking`, after too many bad frames.
    pub fn force_resync(&mut self) -> Result<(), HandshakeError> {
        self.transition(LinkState::Synchronized, LinkState::Handshaking)
    }

    /// Back to `Disconnected` from any state, on operator request.
    pub fn reset(&mut self) {
        tracing::info!("Link reset from {:?}", self.state);
        self.state = LinkState::Disconnected;
        self.attempts = 0;
    }

    fn transition(&mut self, from: LinkState, to: LinkState) -> Result<(), HandshakeError> {
        if self.state != from {
            return Err(HandshakeError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        tracing::debug!("Link state {:?} -> {:?}", from, to);
        self.state = to;
        self.attempts = 0;
        Ok(())
    }

    /// Make one handshake attempt and report the resulting state.
    pub fn poll<L, C>(&mut self, link: &mut L, clock: &C) -> Result<LinkState, HandshakeError>
    where
        L: DeviceLink + ?Sized,
        C: Clock + ?Sized,
    {
        if self.state != LinkState::Handshaking {
            return Err(HandshakeError::InvalidTransition {
                from: self.state,
                to: LinkState::Synchronized,
            });
        }

        self.attempts += 1;
        link.send_line(HELLO)?;
        tracing::debug!("H sent (attempt {})", self.attempts);
        clock.sleep(self.schedule.delay_before(self.attempts));

        match link.read_line()? {
            Some(reply) if reply == "A\n" => {
                tracing::debug!("A received");
                link.send_line(ACK)?;
                clock.sleep(self.config.settle);
                link.clear_input()?;

                self.state = LinkState::Synchronized;
                self.completed += 1;
                tracing::info!("Handshake complete after {} attempt(s)", self.attempts);
            }
            Some(other) => tracing::debug!("Unexpected handshake reply {:?}", other),
            None => tracing::debug!("No handshake reply"),
        }

        Ok(self.state)
    }

    /// Poll until synchronized.
    pub fn run<L, C>(&mut self, link: &mut L, clock: &C) -> Result<(), HandshakeError>
    where
        L: DeviceLink + ?Sized,
        C: Clock + ?Sized,
    {
        tracing::info!("Entering handshake");
        while self.poll(link, clock)? != LinkState::Synchronized {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::device::ReplayLink;

    fn config() -> HandshakeConfig {
        HandshakeConfig::default()
    }

    #[test]
    fn test_initial_state() {
        let handshake = Handshake::new(config());
        assert_eq!(handshake.state(), LinkState::Disconnected);
        assert!(matches!(
            handshake.require_synchronized(),
            Err(HandshakeError::NotSynchronized(LinkState::Disconnected))
        ));
    }

    #[test]
    fn test_handshake_succeeds_first_try() {
        let clock = ManualClock::default();
        let mut link = ReplayLink::new(["A"]);
        let mut handshake = Handshake::new(config());

        handshake.begin().unwrap();
        handshake.run(&mut link, &clock).unwrap();

        assert!(handshake.is_synchronized());
        assert_eq!(link.sent(), ["H".to_string(), "A".to_string()]);
        assert_eq!(clock.total_slept(), Duration::from_secs(4));
    }

    #[test]
    fn test_handshake_retries_until_ack() {
        let clock = ManualClock::default();
        let mut link = ReplayLink::new(["garbage", "A extra"]);
        link.push_timeout();
        link.push_line("A");
        let mut handshake = Handshake::new(config());

        handshake.begin().unwrap();
        assert_eq!(handshake.poll(&mut link, &clock).unwrap(), LinkState::Handshaking);
        handshake.run(&mut link, &clock).unwrap();

        assert_eq!(handshake.attempts(), 4);
        assert_eq!(link.sent().iter().filter(|s| *s == "H").count(), 4);
        assert_eq!(link.sent().last().map(String::as_str), Some("A"));
        assert_eq!(clock.total_slept(), Duration::from_secs(4 + 3));
    }

    #[test]
    fn test_invalid_transitions() {
        let clock = ManualClock::default();
        let mut link = ReplayLink::new(["A"]);
        let mut handshake = Handshake::new(config());

        assert!(handshake.force_resync().is_err());
        assert!(handshake.poll(&mut link, &clock).is_err());

        handshake.begin().unwrap();
        assert!(handshake.begin().is_err());
        handshake.run(&mut link, &clock).unwrap();
        assert!(handshake.begin().is_err());

        handshake.force_resync().unwrap();
        assert_eq!(handshake.state(), LinkState::Handshaking);
        assert!(handshake.force_resync().is_err());
    }

    #[test]
    fn test_reset_from_any_state() {
        let clock = ManualClock::default();
        let mut link = ReplayLink::new(["A"]);
        let mut handshake = Handshake::new(config());

        handshake.reset();
        assert_eq!(handshake.state(), LinkState::Disconnected);

        handshake.begin().unwrap();
        handshake.run(&mut link, &clock).unwrap();
        handshake.reset();
        assert_eq!(handshake.state(), LinkState::Disconnected);
        assert!(handshake.begin().is_ok());
        assert_eq!(handshake.completed(), 1);
    }

    #[test]
    fn test_link_error_propagates() {
        let clock = ManualClock::default();
        let mut link = ReplayLink::new(Vec::<String>::new());
        let mut handshake = Handshake::new(config());

        handshake.begin().unwrap();
        assert!(matches!(
            handshake.run(&mut link, &clock),
            Err(HandshakeError::Link(LinkError::Closed))
        ));
    }

    #[test]
    fn test_custom_schedule() {
        let clock = ManualClock::default();
        let mut link = ReplayLink::new(["A"]);
        let mut handshake = Handshake::new(config())
            .with_schedule(RetrySchedule::fixed(Duration::from_millis(10)));

        handshake.begin().unwrap();
        handshake.run(&mut link, &clock).unwrap();
        assert_eq!(
            clock.total_slept(),
            Duration::from_millis(10) + config().settle
        );
    }
}
