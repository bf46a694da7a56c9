//! End-to-end tests: scripted device stream in, encrypted results out.

use sensor_relay::clock::ManualClock;
use sensor_relay::core::Window;
use sensor_relay::relay::{decrypt_payload, ServerLink, SharedKey};
use sensor_relay::session::{SessionError, SessionLoop};
use sensor_relay::{
    ClassifierError, Config, FrameKind, LinkError, LinkState, Move, ReplayLink, SensorFrame,
};
use std::cell::{Cell, RefCell};
use std::io::Cursor;
use std::rc::Rc;
use std::time::Duration;

const KEY: &str = "pipelinetestkey!";

fn key() -> SharedKey {
    SharedKey::try_from(KEY).unwrap()
}

fn config() -> Config {
    let mut config = Config::default();
    config.pipeline.frame_length = 4;
    config
}

/// Movement frame whose twelve readings all equal `value`.
fn movement(serial: u32, value: f64) -> String {
    SensorFrame {
        serial_number: serial.to_string(),
        kind: FrameKind::Movement,
        readings: vec![value; 12],
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

fn movements(serials: std::ops::RangeInclusive<u32>) -> Vec<String> {
    serials.map(|s| movement(s, f64::from(s))).collect()
}

/// Classifier answering from a script and recording every window it sees.
struct Scripted {
    calls: Rc<Cell<usize>>,
    windows: Rc<RefCell<Vec<Window>>>,
}

impl Scripted {
    fn new(labels: Vec<Move>) -> (Self, impl FnMut(&Window) -> Result<Move, ClassifierError>) {
        let calls = Rc::new(Cell::new(0));
        let windows = Rc::new(RefCell::new(Vec::new()));
        let handle = Self {
            calls: calls.clone(),
            windows: windows.clone(),
        };
        let mut labels = labels.into_iter();
        let classifier = move |window: &Window| {
            calls.set(calls.get() + 1);
            windows.borrow_mut().push(window.clone());
            labels
                .next()
                .ok_or_else(|| ClassifierError::Protocol("no more labels".into()))
        };
        (handle, classifier)
    }
}

fn payload(sink: &[u8]) -> String {
    String::from_utf8(sink.to_vec()).unwrap()
}

#[test]
fn test_one_window_one_classifier_call() {
    let link = ReplayLink::new(movements(1..=4)).acknowledging_handshake();
    let (script, classifier) = Scripted::new(vec![Move::Chicken]);
    let server = ServerLink::from_writer(Vec::new(), key());
    let mut session = SessionLoop::new(config(), link, classifier, server, ManualClock::default());

    session.start().unwrap();
    // The stream ends while waiting for the next window.
    let err = session.next_result().unwrap_err();
    assert!(matches!(err, SessionError::Link(LinkError::Closed)));

    assert_eq!(script.calls.get(), 1);
    assert_eq!(script.windows.borrow()[0].len(), 4);
    assert!(session.server().writer().is_empty());
}

#[test]
fn test_no_result_until_two_of_three_agree() {
    let mut lines = vec![power(1, 5.0, 0.5)];
    lines.extend(movements(2..=9));
    let link = ReplayLink::new(lines).acknowledging_handshake();
    let (script, classifier) = Scripted::new(vec![Move::Crab, Move::Snake, Move::Crab]);
    let server = ServerLink::from_writer(Vec::new(), key());
    let mut session = SessionLoop::new(config(), link, classifier, server, ManualClock::default());

    session.start().unwrap();
    let result = session.next_result().unwrap().unwrap();

    assert_eq!(script.calls.get(), 3);
    assert_eq!(result.action, Move::Crab);
    assert_eq!(session.server().sent(), 1);

    let message = decrypt_payload(&payload(session.server().writer()), &key()).unwrap();
    assert_eq!(message, result.format());
    assert!(message.starts_with("#crab|5.0|500.0|2500.0|"));
}

#[test]
fn test_windows_overlap_by_configured_amount() {
    let link = ReplayLink::new(movements(1..=8)).acknowledging_handshake();
    let (script, classifier) = Scripted::new(vec![Move::Raffles; 3]);
    let server = ServerLink::from_writer(Vec::new(), key());
    let mut session = SessionLoop::new(config(), link, classifier, server, ManualClock::default());

    session.start().unwrap();
    session.next_result().unwrap().unwrap();

    let windows = script.windows.borrow();
    let firsts: Vec<f64> = windows.iter().map(|w| w.samples[0][0]).collect();
    // Length 4, ratio 0.5: each window starts two readings after the last.
    assert_eq!(firsts, vec![1.0, 3.0, 5.0]);
}

#[test]
fn test_rejected_vote_keeps_latest_candidate() {
    let link = ReplayLink::new(movements(1..=12)).acknowledging_handshake();
    let (script, classifier) = Scripted::new(vec![
        Move::Cowboy,
        Move::Hunchback,
        Move::Jamesbond,
        Move::Jamesbond,
        Move::Logout,
    ]);
    let server = ServerLink::from_writer(Vec::new(), key());
    let mut session = SessionLoop::new(config(), link, classifier, server, ManualClock::default());

    session.start().unwrap();
    let result = session.next_result().unwrap().unwrap();

    assert_eq!(result.action, Move::Jamesbond);
    assert_eq!(script.calls.get(), 5);
    assert_eq!(session.stats().snapshot().candidates_rejected, 1);
    assert_eq!(session.server().sent(), 1);
}

#[test]
fn test_three_bad_frames_force_resync() {
    let mut lines = movements(1..=2);
    lines.push("[3,M,garbage]\n".into());
    lines.push("[4,P,5.0,1.5,99]\n".into());
    lines.push("\n".into());
    lines.extend(movements(6..=13));
    let link = ReplayLink::new(lines).acknowledging_handshake();
    let (script, classifier) = Scripted::new(vec![Move::Snake, Move::Snake, Move::Crab]);
    let server = ServerLink::from_writer(Vec::new(), key());
    let clock = ManualClock::default();
    let mut session = SessionLoop::new(config(), link, classifier, server, &clock);

    session.start().unwrap();
    let result = session.next_result().unwrap().unwrap();
    assert_eq!(result.action, Move::Snake);

    assert_eq!(session.link_state(), LinkState::Synchronized);
    assert_eq!(session.link().sent(), ["H", "A", "S", "H", "A", "S"]);
    // Readings from before the resync never reach the classifier.
    assert_eq!(script.windows.borrow()[0].samples[0][0], 6.0);

    let snapshot = session.stats().snapshot();
    assert_eq!(snapshot.resyncs, 1);
    assert_eq!(snapshot.frames_dropped, 3);
    // Two handshakes (4 s each), reaction delay (1 s) and resync pause (5 s).
    assert_eq!(clock.total_slept(), Duration::from_secs(14));
}

#[test]
fn test_cumulative_energy_across_results() {
    let mut lines = vec![power(1, 5.0, 0.5)];
    lines.extend(movements(2..=9));
    lines.push(power(10, 4.0, 0.25));
    lines.extend(movements(11..=18));
    let link = ReplayLink::new(lines).acknowledging_handshake();
    let (_, classifier) = Scripted::new(vec![Move::Mermaid; 6]);
    let server = ServerLink::from_writer(Vec::new(), key());
    let clock = ManualClock::default();
    let mut session = SessionLoop::new(config(), link, classifier, server, &clock);

    session.start().unwrap();
    let first = session.next_result().unwrap().unwrap();
    clock.advance(Duration::from_secs(2));
    let second = session.next_result().unwrap().unwrap();

    // 2.5 W from the evaluation start (4 s handshake + 1 s reaction delay).
    assert!((first.cumulative_power - 12.5).abs() < 1e-9);
    // Then 1 W for the 2 s gap plus the next reaction delay.
    assert_eq!(second.instantaneous_power, 1000.0);
    assert!((second.cumulative_power - 15.5).abs() < 1e-9);
    assert!(second.cumulative_power >= first.cumulative_power);
    assert_eq!(session.server().sent(), 2);
}

#[test]
fn test_replay_from_capture() {
    let mut capture = String::new();
    capture.push('\0');
    for line in movements(1..=8) {
        capture.push_str(&line);
    }
    let link = ReplayLink::from_reader(Cursor::new(capture))
        .unwrap()
        .acknowledging_handshake();
    let (_, classifier) = Scripted::new(vec![Move::Doublepump; 3]);
    let server = ServerLink::from_writer(Vec::new(), key());
    let mut session = SessionLoop::new(config(), link, classifier, server, ManualClock::default());

    session.start().unwrap();
    let result = session.next_result().unwrap().unwrap();
    assert_eq!(result.action, Move::Doublepump);
    assert_eq!(session.stats().snapshot().frames_parsed, 8);
}
