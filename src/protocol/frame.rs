//! Line-framed sensor telemetry codec.
//!
//! The board sends one frame per line:
//!
//! ```text
//! [<serial>,<type>,<field_1>,...,<field_n>,<checksum>]\n
//! ```
//!
//! `type` is `M` (12 movement readings) or `P` (voltage, current). The checksum
//! is the XOR of every byte from the opening `[` up to, but not including, the
//! comma in front of the checksum field, sent as a decimal number.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Shortest line that can possibly hold a frame.
pub const MIN_FRAME_LEN: usize = 6;

/// Fields in the shortest valid frame (`[23,P,0.2,0.3,CS]`).
const MIN_FIELD_COUNT: usize = 5;

/// Serial number, type tag and checksum surround the payload.
const ENVELOPE_FIELDS: usize = 3;

/// Number of readings in a movement frame.
pub const MOVEMENT_ARITY: usize = 12;

/// Number of readings in a power frame.
pub const POWER_ARITY: usize = 2;

/// One set of movement readings: left accel xyz, left gyro xyz, right accel
/// xyz, right gyro xyz.
pub type MovementReading = [f64; MOVEMENT_ARITY];

/// Frame type carried in the second field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    Movement,
    Power,
}

impl FrameKind {
    /// Parse the type tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "M" => Some(FrameKind::Movement),
            "P" => Some(FrameKind::Power),
            _ => None,
        }
    }

    /// Wire tag for this kind.
    pub fn tag(self) -> char {
        match self {
            FrameKind::Movement => 'M',
            FrameKind::Power => 'P',
        }
    }

    /// Number of readings carried by this kind.
    pub fn arity(self) -> usize {
        match self {
            FrameKind::Movement => MOVEMENT_ARITY,
            FrameKind::Power => POWER_ARITY,
        }
    }

    /// Total comma-separated fields between the brackets.
    pub fn field_count(self) -> usize {
        self.arity() + ENVELOPE_FIELDS
    }
}

/// Reasons a line is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrameError {
    #[error("frame too short ({len} chars)")]
    TooShort { len: usize },

    #[error("bad sentinel framing")]
    BadFraming,

    #[error("frame has {0} fields, need at least 5")]
    TooFewFields(usize),

    #[error("unknown frame type {0:?}")]
    UnknownType(String),

    #[error("{kind:?} frame has {actual} fields, expected {expected}")]
    WrongArity {
        kind: FrameKind,
        expected: usize,
        actual: usize,
    },

    #[error("checksum mismatch: computed {computed}, received {received:?}")]
    ChecksumMismatch { computed: u8, received: String },

    #[error("reading {0:?} is not a number")]
    BadReading(String),
}

/// A validated frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    /// Device-assigned sequence identifier, kept as transmitted.
    pub serial_number: String,
    pub kind: FrameKind,
    /// Exactly `kind.arity()` values.
    pub readings: Vec<f64>,
}

impl SensorFrame {
    /// Movement readings as a fixed-size set, if this is a movement frame.
    pub fn movement(&self) -> Option<MovementReading> {
        match self.kind {
            FrameKind::Movement => self.readings.as_slice().try_into().ok(),
            FrameKind::Power => None,
        }
    }

    /// Voltage and current, if this is a power frame.
    pub fn power(&self) -> Option<(f64, f64)> {
        match (self.kind, self.readings.as_slice()) {
            (FrameKind::Power, [voltage, current]) => Some((*voltage, *current)),
            _ => None,
        }
    }

    /// Render the frame in wire form, checksum and newline included.
    pub fn encode(&self) -> String {
        let mut body = format!("[{},{}", self.serial_number, self.kind.tag());
        for value in &self.readings {
            body.push(',');
            body.push_str(&value.to_string());
        }
        let sum = checksum(body.as_bytes());
        format!("{body},{sum}]\n")
    }
}

impl fmt::Display for SensorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})={:?}", self.serial_number, self.kind.tag(), self.readings)
    }
}

/// XOR-fold of the given bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Parse and validate one raw line.
///
/// Checks run cheapest first and stop at the first failure. Leading NUL bytes
/// (the board emits one after a reset) are skipped.
pub fn parse(raw: &str) -> Result<SensorFrame, FrameError> {
    let line = raw.trim_start_matches('\0');
    let chars = line.chars().count();
    if chars < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: chars });
    }
    let len = line.len();

    if !line.starts_with('[') || !line.ends_with("]\n") {
        return Err(FrameError::BadFraming);
    }

    let inner = &line[1..len - 2];
    let fields: Vec<&str> = inner.split(',').collect();
    if fields.len() < MIN_FIELD_COUNT {
        return Err(FrameError::TooFewFields(fields.len()));
    }

    let kind =
        FrameKind::from_tag(fields[1]).ok_or_else(|| FrameError::UnknownType(fields[1].into()))?;

    if fields.len() != kind.field_count() {
        return Err(FrameError::WrongArity {
            kind,
            expected: kind.field_count(),
            actual: fields.len(),
        });
    }

    // Everything up to the comma that separates the checksum field.
    let received = fields[fields.len() - 1];
    let covered_len = len - 2 - received.len() - 1;
    let computed = checksum(&line.as_bytes()[..covered_len]);
    match received.trim().parse::<u8>() {
        Ok(sum) if sum == computed => {}
        _ => {
            return Err(FrameError::ChecksumMismatch {
                computed,
                received: received.into(),
            })
        }
    }

    let payload = &fields[2..fields.len() - 1];
    let mut readings = Vec::with_capacity(kind.arity());
    for field in payload {
        let value: f64 = field
            .trim()
            .parse()
            .map_err(|_| FrameError::BadReading((*field).into()))?;
        readings.push(match kind {
            FrameKind::Movement => round2(value),
            FrameKind::Power => value,
        });
    }

    Ok(SensorFrame {
        serial_number: fields[0].into(),
        kind,
        readings,
    })
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const POWER_FRAME: &str = "[1,P,5.0,1.5,23]\n";
    const MOVEMENT_FRAME: &str = "[1,M,0.1,0.2,0.3,0.4,0.5,0.6,0.7,0.8,0.9,1.0,1.1,1.2,8]\n";

    #[test]
    fn test_parse_power_frame() {
        let frame = parse(POWER_FRAME).unwrap();
        assert_eq!(frame.serial_number, "1");
        assert_eq!(frame.kind, FrameKind::Power);
        assert_eq!(frame.power(), Some((5.0, 1.5)));
        assert!(frame.movement().is_none());
    }

    #[test]
    fn test_parse_movement_frame() {
        let frame = parse(MOVEMENT_FRAME).unwrap();
        assert_eq!(frame.kind, FrameKind::Movement);
        let readings = frame.movement().unwrap();
        assert_eq!(readings[0], 0.1);
        assert_eq!(readings[11], 1.2);
    }

    #[test]
    fn test_checksum_vectors() {
        assert_eq!(checksum(b"[1,P,5.0,1.5"), 23);
        assert_eq!(checksum(b"[7,P,4.92,0.73"), 27);
        assert!(parse("[7,P,4.92,0.73,27]\n").is_ok());
        assert!(parse("[12,M,1.234,-0.5,9.81,0.0,0.0,0.0,-1.0,2.0,3.0,4.0,5.0,6.0,15]\n").is_ok());
    }

    #[test]
    fn test_movement_rounded_power_not() {
        let frame =
            parse("[12,M,1.234,-0.5,9.81,0.0,0.0,0.0,-1.0,2.0,3.0,4.0,5.0,6.0,15]\n").unwrap();
        assert_eq!(frame.readings[0], 1.23);

        let frame = parse("[7,P,4.92,0.73,27]\n").unwrap();
        assert_eq!(frame.readings, vec![4.92, 0.73]);
    }

    #[test]
    fn test_short_inputs() {
        for s in ["", "[", "[]\n", "[1,P]", "[1,]\n", "[éé]\n"] {
            assert!(matches!(parse(s), Err(FrameError::TooShort { .. })), "{s:?}");
        }
    }

    #[test]
    fn test_bad_framing() {
        assert_eq!(parse("1,P,5.0,1.5,23]\n"), Err(FrameError::BadFraming));
        assert_eq!(parse("[1,P,5.0,1.5,23\n"), Err(FrameError::BadFraming));
        assert_eq!(parse("[1,P,5.0,1.5,23]"), Err(FrameError::BadFraming));
    }

    #[test]
    fn test_field_checks() {
        assert_eq!(parse("[1,P,5.0]\n"), Err(FrameError::TooFewFields(3)));
        assert_eq!(
            parse("[1,X,5.0,1.5,23]\n"),
            Err(FrameError::UnknownType("X".into()))
        );
        assert!(matches!(
            parse("[1,P,5.0,1.5,2.0,23]\n"),
            Err(FrameError::WrongArity { expected: 5, actual: 6, .. })
        ));
        assert!(matches!(
            parse("[1,M,5.0,1.5,23]\n"),
            Err(FrameError::WrongArity { expected: 15, actual: 5, .. })
        ));
    }

    #[test]
    fn test_checksum_mismatch() {
        assert!(matches!(
            parse("[1,P,5.0,1.5,24]\n"),
            Err(FrameError::ChecksumMismatch { computed: 23, .. })
        ));
        assert!(matches!(
            parse("[1,P,5.0,1.5,xx]\n"),
            Err(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_any_flipped_digit_breaks_checksum() {
        let body_len = MOVEMENT_FRAME.rfind(',').unwrap();
        for (i, c) in MOVEMENT_FRAME.char_indices().take(body_len) {
            if !c.is_ascii_digit() {
                continue;
            }
            let replacement = if c == '9' { '0' } else { (c as u8 + 1) as char };
            let mut flipped = MOVEMENT_FRAME.to_string();
            flipped.replace_range(i..i + 1, &replacement.to_string());
            assert!(
                matches!(parse(&flipped), Err(FrameError::ChecksumMismatch { .. })),
                "flipping index {i} in {flipped:?}"
            );
        }
    }

    #[test]
    fn test_leading_nul_skipped() {
        let frame = parse("\0[1,P,5.0,1.5,23]\n").unwrap();
        assert_eq!(frame.power(), Some((5.0, 1.5)));
    }

    #[test]
    fn test_non_numeric_reading() {
        // Checksum of "[1,P,a.0,1.5" so only the payload is wrong.
        let body = "[1,P,a.0,1.5";
        let line = format!("{body},{}]\n", checksum(body.as_bytes()));
        assert_eq!(parse(&line), Err(FrameError::BadReading("a.0".into())));
    }

    #[test]
    fn test_encode_round_trip() {
        for line in [POWER_FRAME, MOVEMENT_FRAME, "[7,P,4.92,0.73,27]\n"] {
            let frame = parse(line).unwrap();
            let encoded = frame.encode();
            assert_eq!(parse(&encoded).unwrap(), frame);
            assert_eq!(parse(&parse(&encoded).unwrap().encode()).unwrap(), frame);
        }
        assert_eq!(parse(POWER_FRAME).unwrap().encode(), "[1,P,5,1.5,9]\n");
    }
}
