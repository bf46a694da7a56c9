//! Demonstration of the relay pipeline without hardware.
//!
//! This example shows how to:
//! 1. Build a synthetic frame stream and replay it as the sensor board
//! 2. Plug in a classifier (here a toy rule on mean acceleration)
//! 3. Run the session on simulated time
//! 4. Decrypt what would have been sent to the evaluation server
//!
//! Run with: cargo run --example replay_demo

use sensor_relay::{
    clock::ManualClock,
    core::Window,
    relay::{decrypt_payload, ServerLink, SharedKey},
    ClassifierError, Config, FrameKind, Move, ReplayLink, SensorFrame, SessionLoop,
};

const DEMO_KEY: &str = "demo-key-16bytes";

fn frame(serial: u32, kind: FrameKind, readings: Vec<f64>) -> String {
    SensorFrame {
        serial_number: serial.to_string(),
        kind,
        readings,
    }
    .encode()
}

/// Two moves worth of frames: gentle motion, then vigorous motion.
fn synthetic_stream(frame_length: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut serial = 0;
    for (voltage, current, level) in [(5.0, 0.42, 0.2), (4.9, 0.61, 1.4)] {
        serial += 1;
        lines.push(frame(serial, FrameKind::Power, vec![voltage, current]));
        for i in 0..frame_length * 2 {
            serial += 1;
            let wobble = (i as f64 * 0.7).sin() * 0.1;
            lines.push(frame(serial, FrameKind::Movement, vec![level + wobble; 12]));
        }
    }
    // A corrupted line, as seen after a loose connector.
    lines.insert(5, "[9,M,0.1,0.2]\n".into());
    lines
}

fn toy_classifier(window: &Window) -> Result<Move, ClassifierError> {
    let total: f64 = window.samples.iter().map(|s| s[0]).sum();
    let mean = total / window.len() as f64;
    Ok(if mean > 1.0 { Move::Doublepump } else { Move::Hunchback })
}

fn main() -> anyhow::Result<()> {
    println!("Sensor Relay - Replay Demo");
    println!("==========================");
    println!();

    let mut config = Config::default();
    config.pipeline.frame_length = 10;

    let link = ReplayLink::new(synthetic_stream(config.pipeline.frame_length))
        .acknowledging_handshake();
    println!("Replaying {} lines", link.remaining());

    let key = SharedKey::try_from(DEMO_KEY)?;
    let server = ServerLink::from_writer(Vec::new(), key.clone());
    let clock = ManualClock::default();

    let mut session = SessionLoop::new(config, link, toy_classifier, server, &clock);
    session.start()?;

    // Payloads go out back to back, so note where each one ends.
    let mut boundaries = vec![0];
    for _ in 0..2 {
        let Some(result) = session.next_result()? else {
            break;
        };
        boundaries.push(session.server().writer().len());
        println!(
            "Accepted {:<12} power {:>8.1} mW, cumulative {:.3} J",
            result.action.to_string(),
            result.instantaneous_power,
            result.cumulative_power
        );
    }

    println!();
    println!("Simulated time elapsed: {:?}", clock.total_slept());
    println!();
    println!("{}", session.stats().summary());
    println!();

    let sent = String::from_utf8(session.server().writer().clone())?;
    for pair in boundaries.windows(2) {
        let payload = &sent[pair[0]..pair[1]];
        println!("{payload}");
        println!("  -> {}", decrypt_payload(payload, &key)?);
    }

    Ok(())
}
