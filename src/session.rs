//! Evaluation session: the loop that turns a frame stream into results.
//!
//! One call to [`SessionLoop::next_result`] covers one dance move:
//!
//! 1. wait the reaction delay, then skip stale input
//! 2. read frames; movement readings fill the window buffer and the latest
//!    power reading waits in the pending slot
//! 3. classify every full window and vote on the labels
//! 4. on acceptance compute power and energy, encrypt and send the result
//!
//! Consecutive bad frames force a new handshake. The loop owns the device link
//! and the server socket; both are closed when it is dropped.

use crate::classifier::{Classifier, ClassifierError, Move};
use crate::clock::{seconds_between, Clock, SystemClock};
use crate::config::Config;
use crate::core::{
    ConsensusSmoother, Decision, EnergyAccumulator, PendingPower, PowerReading, WindowBuffer,
};
use crate::device::{DeviceLink, LinkError};
use crate::protocol::{self, ErrorCounter, Handshake, HandshakeError, LinkState, START_STREAM};
use crate::relay::{AcceptedResult, ServerError, ServerLink};
use crate::stats::{create_shared_stats, SharedStats};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Failures that end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// What happened to one line read from the device.
enum ReadOutcome {
    Frame,
    Dropped,
    Resynced,
    Interrupted,
}

/// Drives the device, classifier and server for an evaluation.
pub struct SessionLoop<L, C, W = TcpStream, K = SystemClock>
where
    L: DeviceLink,
    C: Classifier,
    W: Write,
    K: Clock,
{
    config: Config,
    link: L,
    classifier: C,
    server: ServerLink<W>,
    clock: K,
    handshake: Handshake,
    windows: WindowBuffer,
    power: PendingPower,
    consensus: ConsensusSmoother<Move>,
    energy: EnergyAccumulator,
    errors: ErrorCounter,
    stats: SharedStats,
    shutdown: Arc<AtomicBool>,
}

impl<L, C, W, K> SessionLoop<L, C, W, K>
where
    L: DeviceLink,
    C: Classifier,
    W: Write,
    K: Clock,
{
    pub fn new(config: Config, link: L, classifier: C, server: ServerLink<W>, clock: K) -> Self {
        let energy = EnergyAccumulator::new(config.energy.clone(), clock.now());
        Self {
            handshake: Handshake::new(config.handshake.clone()),
            windows: WindowBuffer::new(&config.pipeline),
            power: PendingPower::new(),
            consensus: ConsensusSmoother::new(config.pipeline.votes_required),
            errors: ErrorCounter::new(config.pipeline.error_threshold),
            energy,
            stats: create_shared_stats(),
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
            link,
            classifier,
            server,
            clock,
        }
    }

    /// Count into shared statistics instead of private ones.
    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = stats;
        self
    }

    /// Stop at the next read once `flag` is set.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Start the evaluation clock and synchronize with the board.
    ///
    /// Streaming does not begin until [`start_stream`](Self::start_stream).
    pub fn connect_device(&mut self) -> Result<(), SessionError> {
        self.energy.restart(self.clock.now());
        if self.handshake.state() == LinkState::Disconnected {
            self.handshake.begin()?;
        }
        self.run_handshake()
    }

    /// Tell the board to start streaming frames.
    pub fn start_stream(&mut self) -> Result<(), SessionError> {
        self.handshake.require_synchronized()?;
        self.with_retry(|link| link.send_line(START_STREAM))?;
        tracing::info!("S sent");
        Ok(())
    }

    /// [`connect_device`](Self::connect_device) then
    /// [`start_stream`](Self::start_stream).
    pub fn start(&mut self) -> Result<(), SessionError> {
        self.connect_device()?;
        if self.is_shutdown() {
            return Ok(());
        }
        self.start_stream()
    }

    /// Drop buffered readings, handshake from scratch and restart the stream.
    ///
    /// Pending votes and the energy total are kept.
    pub fn resynchronize(&mut self) -> Result<(), SessionError> {
        self.windows.clear();
        self.handshake.reset();
        self.handshake.begin()?;
        self.run_handshake()?;
        if self.is_shutdown() {
            return Ok(());
        }
        self.start_stream()?;
        self.stats.record_resync();
        Ok(())
    }

    /// Produce the next accepted result, or `None` once shutdown is requested.
    pub fn next_result(&mut self) -> Result<Option<AcceptedResult>, SessionError> {
        if self.is_shutdown() {
            return Ok(None);
        }
        self.handshake.require_synchronized()?;

        self.clock.sleep(self.config.pipeline.reaction_delay);
        self.with_retry(|link| link.resync_to_line())?;
        self.windows.clear();
        self.consensus.reset();
        self.errors.record_success();

        loop {
            while !self.windows.is_full() {
                match self.read_frame()? {
                    ReadOutcome::Interrupted => return Ok(None),
                    ReadOutcome::Frame | ReadOutcome::Dropped | ReadOutcome::Resynced => {}
                }
            }

            let Some(window) = self.windows.take_window() else {
                continue;
            };

            let label = match self.classifier.classify(&window) {
                Ok(label) => label,
                Err(e) if e.is_recoverable() => {
                    tracing::warn!("{}; discarding window", e);
                    self.windows.clear();
                    self.stats.record_window_discarded();
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.stats.record_window_classified();
            tracing::info!("Window classified as {}", label);

            match self.consensus.submit(label) {
                Decision::Accepted(action) => return self.accept(action).map(Some),
                Decision::Rejected => {
                    tracing::info!("Candidates disagree; vote rejected");
                    self.stats.record_candidates_rejected();
                }
                Decision::Pending => {}
            }
        }
    }

    /// Relay results until shutdown, calling `on_result` after each send.
    ///
    /// Returns the number of results sent.
    pub fn run_until_shutdown<F>(&mut self, mut on_result: F) -> Result<u64, SessionError>
    where
        F: FnMut(&AcceptedResult),
    {
        let mut sent = 0;
        while let Some(result) = self.next_result()? {
            sent += 1;
            on_result(&result);
        }
        tracing::info!("Session stopped after {} result(s)", sent);
        Ok(sent)
    }

    fn read_frame(&mut self) -> Result<ReadOutcome, SessionError> {
        if self.is_shutdown() {
            return Ok(ReadOutcome::Interrupted);
        }

        let interval = self.config.pipeline.sampling_interval;
        if !interval.is_zero() {
            self.clock.sleep(interval);
            self.with_retry(|link| link.resync_to_line())?;
        }

        let Some(line) = self.with_retry(|link| link.read_line())? else {
            tracing::debug!("Frame read timed out");
            return self.frame_failed();
        };

        match protocol::parse(&line) {
            Ok(frame) => {
                self.errors.record_success();
                self.stats.record_frame_parsed();
                tracing::debug!("m:{}", frame);

                if let Some(readings) = frame.movement() {
                    self.windows.push(readings);
                } else if let Some((voltage, current)) = frame.power() {
                    self.power.store(PowerReading { voltage, current });
                }
                Ok(ReadOutcome::Frame)
            }
            Err(e) => {
                tracing::warn!("Dropped frame {:?}: {}", line.trim_end(), e);
                self.frame_failed()
            }
        }
    }

    fn frame_failed(&mut self) -> Result<ReadOutcome, SessionError> {
        self.stats.record_frame_dropped();
        if !self.errors.record_failure() {
            return Ok(ReadOutcome::Dropped);
        }

        tracing::warn!(
            "{} consecutive bad frames; flushing buffer and resynchronizing",
            self.config.pipeline.error_threshold
        );
        self.windows.clear();
        self.handshake.force_resync()?;
        self.run_handshake()?;
        if self.is_shutdown() {
            return Ok(ReadOutcome::Interrupted);
        }

        self.clock.sleep(self.config.handshake.resync_pause);
        self.start_stream()?;
        self.stats.record_resync();
        Ok(ReadOutcome::Resynced)
    }

    fn accept(&mut self, action: Move) -> Result<AcceptedResult, SessionError> {
        let accepted_at = self.clock.now();
        let reading = self.power.take().unwrap_or_else(|| {
            tracing::warn!("No power reading received for this move; reporting zero power");
            PowerReading::default()
        });

        let result = AcceptedResult::new(action, self.energy.record(reading, accepted_at));
        let message = self.server.send_result(&result)?;
        self.stats.record_result_sent();
        tracing::info!("Result sent to server: {}", message);
        Ok(result)
    }

    /// Poll the handshake until synchronized or shut down.
    fn run_handshake(&mut self) -> Result<(), SessionError> {
        tracing::info!("Entering handshake");
        while !self.is_shutdown() {
            match self.handshake.poll(&mut self.link, &self.clock) {
                Ok(LinkState::Synchronized) => return Ok(()),
                Ok(_) => {}
                Err(HandshakeError::Link(e)) if self.retryable(&e) => self.pause_after(&e),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Run a link operation, retrying after `retry_delay` when not failing fast.
    fn with_retry<T, F>(&mut self, mut op: F) -> Result<T, SessionError>
    where
        F: FnMut(&mut L) -> Result<T, LinkError>,
    {
        loop {
            match op(&mut self.link) {
                Ok(value) => return Ok(value),
                Err(e) if self.retryable(&e) => self.pause_after(&e),
                Err(e) => return Err(e.into()),
            }
        }
    }

    // A closed stream never comes back.
    fn retryable(&self, error: &LinkError) -> bool {
        !self.config.fail_fast && !self.is_shutdown() && !matches!(error, LinkError::Closed)
    }

    fn pause_after(&self, error: &LinkError) {
        tracing::warn!("{}; retrying in {:?}", error, self.config.retry_delay);
        self.clock.sleep(self.config.retry_delay);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn link_state(&self) -> LinkState {
        self.handshake.state()
    }

    pub fn stats(&self) -> &SharedStats {
        &self.stats
    }

    pub fn cumulative_energy(&self) -> f64 {
        self.energy.cumulative()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn server(&self) -> &ServerLink<W> {
        &self.server
    }

    pub fn clock(&self) -> &K {
        &self.clock
    }
}

/// Result of a frame throughput measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedReport {
    pub frames: usize,
    pub dropped: usize,
    pub elapsed_secs: f64,
}

impl SpeedReport {
    /// Average seconds per processed frame.
    pub fn secs_per_frame(&self) -> Option<f64> {
        (self.frames > 0).then(|| self.elapsed_secs / self.frames as f64)
    }

    /// Frames per second, if any time passed.
    pub fn frames_per_sec(&self) -> Option<f64> {
        (self.elapsed_secs > 0.0).then(|| self.frames as f64 / self.elapsed_secs)
    }
}

/// Time how long it takes to receive and parse `batches × batch_size` frames.
///
/// Input is flushed before each batch; only reading and parsing are timed.
/// The board must already be streaming.
pub fn measure_throughput<L, K>(
    link: &mut L,
    clock: &K,
    batches: usize,
    batch_size: usize,
) -> Result<SpeedReport, LinkError>
where
    L: DeviceLink + ?Sized,
    K: Clock + ?Sized,
{
    let mut report = SpeedReport {
        frames: 0,
        dropped: 0,
        elapsed_secs: 0.0,
    };

    for batch in 1..=batches {
        link.resync_to_line()?;
        let started = clock.now();
        let mut parsed = 0;
        while parsed < batch_size {
            match link.read_line()?.as_deref().map(protocol::parse) {
                Some(Ok(_)) => parsed += 1,
                Some(Err(_)) | None => report.dropped += 1,
            }
        }
        let elapsed = seconds_between(started, clock.now());
        tracing::info!("Batch {} of {} frames took {:.3}s", batch, batch_size, elapsed);
        report.frames += parsed;
        report.elapsed_secs += elapsed;
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::core::Window;
    use crate::device::ReplayLink;
    use crate::protocol::{FrameKind, SensorFrame};
    use crate::relay::SharedKey;
    use std::time::Duration;

    fn movement(serial: u32) -> String {
        SensorFrame {
            serial_number: serial.to_string(),
            kind: FrameKind::Movement,
            readings: vec![0.5; 12],
        }
        .encode()
    }

    fn power(serial: u32, voltage: f64, current: f64) -> String {
        SensorFrame {
            serial_number: serial.to_string(),
            kind: FrameKind::Power,
            readings: vec![voltage, current],
        }
        .encode()
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.pipeline.frame_length = 4;
        config
    }

    fn key() -> SharedKey {
        SharedKey::try_from("0123456789abcdef").unwrap()
    }

    fn scripted(labels: Vec<Move>) -> impl FnMut(&Window) -> Result<Move, ClassifierError> {
        let mut labels = labels.into_iter();
        move |_: &Window| {
            labels
                .next()
                .ok_or_else(|| ClassifierError::Protocol("script exhausted".into()))
        }
    }

    #[test]
    fn test_next_result_requires_handshake() {
        let link = ReplayLink::new(Vec::<String>::new());
        let server = ServerLink::from_writer(Vec::new(), key());
        let mut session = SessionLoop::new(
            config(),
            link,
            scripted(vec![]),
            server,
            ManualClock::default(),
        );

        assert!(matches!(
            session.next_result(),
            Err(SessionError::Handshake(HandshakeError::NotSynchronized(
                LinkState::Disconnected
            )))
        ));
    }

    #[test]
    fn test_start_synchronizes_and_starts_stream() {
        let link = ReplayLink::new(Vec::<String>::new()).acknowledging_handshake();
        let server = ServerLink::from_writer(Vec::new(), key());
        let mut session = SessionLoop::new(
            config(),
            link,
            scripted(vec![]),
            server,
            ManualClock::default(),
        );

        session.start().unwrap();
        assert_eq!(session.link_state(), LinkState::Synchronized);
        assert_eq!(session.link().sent(), ["H", "A", "S"]);
    }

    #[test]
    fn test_explicit_resynchronize() {
        let link = ReplayLink::new(Vec::<String>::new()).acknowledging_handshake();
        let server = ServerLink::from_writer(Vec::new(), key());
        let mut session = SessionLoop::new(
            config(),
            link,
            scripted(vec![]),
            server,
            ManualClock::default(),
        );

        session.start().unwrap();
        session.resynchronize().unwrap();
        assert_eq!(session.link_state(), LinkState::Synchronized);
        assert_eq!(session.link().sent(), ["H", "A", "S", "H", "A", "S"]);
        assert_eq!(session.stats().snapshot().resyncs, 1);
    }

    fn faulty_link() -> ReplayLink {
        let mut link = ReplayLink::new((1..=2).map(movement)).acknowledging_handshake();
        link.push_fault(std::io::ErrorKind::Other);
        for serial in 3..=8 {
            link.push_line(movement(serial));
        }
        link
    }

    #[test]
    fn test_best_effort_retries_link_errors() {
        let mut config = config();
        config.fail_fast = false;
        config.retry_delay = Duration::from_millis(250);
        let server = ServerLink::from_writer(Vec::new(), key());
        let clock = ManualClock::default();
        let mut session = SessionLoop::new(
            config,
            faulty_link(),
            scripted(vec![Move::Logout; 3]),
            server,
            &clock,
        );

        session.start().unwrap();
        let result = session.next_result().unwrap().unwrap();

        assert_eq!(result.action, Move::Logout);
        assert_eq!(session.stats().snapshot().frames_parsed, 8);
        assert_eq!(session.stats().snapshot().frames_dropped, 0);
        // Handshake (4 s), reaction delay (1 s) and one retry pause.
        assert_eq!(clock.total_slept(), Duration::from_millis(5250));
    }

    #[test]
    fn test_fail_fast_stops_on_link_error() {
        let server = ServerLink::from_writer(Vec::new(), key());
        let clock = ManualClock::default();
        let mut session = SessionLoop::new(
            config(),
            faulty_link(),
            scripted(vec![Move::Logout; 3]),
            server,
            &clock,
        );

        session.start().unwrap();
        assert!(matches!(
            session.next_result(),
            Err(SessionError::Link(LinkError::Io(_)))
        ));
        assert_eq!(session.stats().snapshot().frames_parsed, 2);
        assert_eq!(clock.total_slept(), Duration::from_secs(5));
        assert!(session.server().writer().is_empty());
    }

    #[test]
    fn test_power_and_energy_reported_on_accept() {
        // Window length 4, stride 2: windows complete after 4, 6 and 8 frames.
        let mut lines = vec![power(1, 5.0, 0.5)];
        lines.extend((2..=9).map(movement));
        let link = ReplayLink::new(lines).acknowledging_handshake();
        let server = ServerLink::from_writer(Vec::new(), key());
        let clock = ManualClock::default();
        let mut session = SessionLoop::new(
            config(),
            link,
            scripted(vec![Move::Crab, Move::Snake, Move::Crab]),
            server,
            &clock,
        );

        session.start().unwrap();
        let result = session.next_result().unwrap().unwrap();

        assert_eq!(result.action, Move::Crab);
        assert_eq!(result.voltage, 5.0);
        assert_eq!(result.current, 500.0);
        assert_eq!(result.instantaneous_power, 2500.0);
        // Handshake (1 s + 3 s) and reaction delay (1 s) since the evaluation started.
        assert!((result.cumulative_power - 2.5 * 5.0).abs() < 1e-9);
        assert_eq!(session.server().sent(), 1);
        assert_eq!(session.stats().snapshot().windows_classified, 3);
        assert_eq!(session.stats().snapshot().candidates_rejected, 0);
    }

    #[test]
    fn test_missing_power_reports_zero() {
        let lines: Vec<String> = (1..=8).map(movement).collect();
        let link = ReplayLink::new(lines).acknowledging_handshake();
        let server = ServerLink::from_writer(Vec::new(), key());
        let mut session = SessionLoop::new(
            config(),
            link,
            scripted(vec![Move::Cowboy, Move::Cowboy, Move::Snake]),
            server,
            ManualClock::default(),
        );

        session.start().unwrap();
        let result = session.next_result().unwrap().unwrap();
        assert_eq!(result.action, Move::Cowboy);
        assert_eq!(result.instantaneous_power, 0.0);
        assert_eq!(session.cumulative_energy(), 0.0);
    }

    #[test]
    fn test_unknown_class_discards_window() {
        let lines: Vec<String> = (1..=12).map(movement).collect();
        let link = ReplayLink::new(lines).acknowledging_handshake();
        let server = ServerLink::from_writer(Vec::new(), key());
        let mut replies = vec![
            Err(ClassifierError::UnknownClass("42".into())),
            Ok(Move::Mermaid),
            Ok(Move::Mermaid),
            Ok(Move::Crab),
        ]
        .into_iter();
        let classifier = move |_: &Window| {
            replies
                .next()
                .unwrap_or_else(|| Err(ClassifierError::Protocol("script exhausted".into())))
        };
        let mut session =
            SessionLoop::new(config(), link, classifier, server, ManualClock::default());

        session.start().unwrap();
        let result = session.next_result().unwrap().unwrap();
        assert_eq!(result.action, Move::Mermaid);

        let snapshot = session.stats().snapshot();
        assert_eq!(snapshot.windows_discarded, 1);
        assert_eq!(snapshot.windows_classified, 3);
        // 4 frames lost to the discarded window, then 4 + 2 + 2 for the vote.
        assert_eq!(snapshot.frames_parsed, 12);
    }

    #[test]
    fn test_classifier_failure_is_fatal() {
        let lines: Vec<String> = (1..=4).map(movement).collect();
        let link = ReplayLink::new(lines).acknowledging_handshake();
        let server = ServerLink::from_writer(Vec::new(), key());
        let mut session = SessionLoop::new(
            config(),
            link,
            scripted(vec![]),
            server,
            ManualClock::default(),
        );

        session.start().unwrap();
        assert!(matches!(
            session.next_result(),
            Err(SessionError::Classifier(ClassifierError::Protocol(_)))
        ));
        assert_eq!(session.server().sent(), 0);
    }

    #[test]
    fn test_shutdown_stops_between_reads() {
        let lines: Vec<String> = (1..=3).map(movement).collect();
        let link = ReplayLink::new(lines).acknowledging_handshake();
        let server = ServerLink::from_writer(Vec::new(), key());
        let flag = Arc::new(AtomicBool::new(false));
        let mut session = SessionLoop::new(
            config(),
            link,
            scripted(vec![]),
            server,
            ManualClock::default(),
        )
        .with_shutdown(flag.clone());

        session.start().unwrap();
        flag.store(true, Ordering::SeqCst);
        assert_eq!(session.run_until_shutdown(|_| {}).unwrap(), 0);
        assert_eq!(session.link().reads(), 1);
    }

    #[test]
    fn test_sampling_interval_sleeps_before_each_read() {
        let mut config = config();
        config.pipeline.sampling_interval = Duration::from_millis(50);
        let lines: Vec<String> = (1..=8).map(movement).collect();
        let link = ReplayLink::new(lines).acknowledging_handshake();
        let server = ServerLink::from_writer(Vec::new(), key());
        let clock = ManualClock::default();
        let mut session = SessionLoop::new(
            config,
            link,
            scripted(vec![Move::Hunchback, Move::Raffles, Move::Hunchback]),
            server,
            &clock,
        );

        session.start().unwrap();
        let before = clock.total_slept();
        session.next_result().unwrap().unwrap();
        // Reaction delay plus eight sampling pauses.
        assert_eq!(
            clock.total_slept() - before,
            Duration::from_secs(1) + Duration::from_millis(400)
        );
    }

    #[test]
    fn test_measure_throughput() {
        let mut lines: Vec<String> = (1..=10).map(movement).collect();
        lines.insert(3, "[garbage]\n".into());
        let mut link = ReplayLink::new(lines);
        let clock = ManualClock::default();

        let report = measure_throughput(&mut link, &clock, 2, 5).unwrap();
        assert_eq!(report.frames, 10);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.frames_per_sec(), None);
        assert_eq!(report.secs_per_frame(), Some(0.0));
    }
}
