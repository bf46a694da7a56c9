//! Move vocabulary and the classifier seam.
//!
//! The model itself lives outside the relay. Anything that can turn a
//! [`Window`] into a [`Move`] implements [`Classifier`]; the binary uses
//! [`ProcessClassifier`], which talks to a model process over stdin/stdout.

use crate::core::Window;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::str::FromStr;
use thiserror::Error;

/// The fixed set of moves the model can report.
///
/// Discriminants are the model's class indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Move {
    Logout = 0,
    Hunchback = 1,
    Raffles = 2,
    Chicken = 3,
    Crab = 4,
    Cowboy = 5,
    Runningman = 6,
    Jamesbond = 7,
    Snake = 8,
    Doublepump = 9,
    Mermaid = 10,
}

impl Move {
    pub const ALL: [Move; 11] = [
        Move::Logout,
        Move::Hunchback,
        Move::Raffles,
        Move::Chicken,
        Move::Crab,
        Move::Cowboy,
        Move::Runningman,
        Move::Jamesbond,
        Move::Snake,
        Move::Doublepump,
        Move::Mermaid,
    ];

    /// Map a model class index to a move.
    pub fn from_class_index(index: u32) -> Result<Self, ClassifierError> {
        Self::ALL
            .get(index as usize)
            .copied()
            .ok_or_else(|| ClassifierError::UnknownClass(index.to_string()))
    }

    /// Name sent to the evaluation server.
    pub fn as_str(self) -> &'static str {
        match self {
            Move::Logout => "logout",
            Move::Hunchback => "hunchback",
            Move::Raffles => "raffles",
            Move::Chicken => "chicken",
            Move::Crab => "crab",
            Move::Cowboy => "cowboy",
            Move::Runningman => "runningman",
            Move::Jamesbond => "jamesbond",
            Move::Snake => "snake",
            Move::Doublepump => "doublepump",
            Move::Mermaid => "mermaid",
        }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Move {
    type Err = ClassifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(index) = s.parse::<u32>() {
            return Self::from_class_index(index);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ClassifierError::UnknownClass(s.to_string()))
    }
}

/// Classifier failures.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier produced unknown class {0:?}")]
    UnknownClass(String),

    #[error("classifier I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("classifier protocol error: {0}")]
    Protocol(String),
}

impl ClassifierError {
    /// Whether the pipeline can drop the window and carry on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ClassifierError::UnknownClass(_))
    }
}

/// Turns a window into a move label.
pub trait Classifier {
    fn classify(&mut self, window: &Window) -> Result<Move, ClassifierError>;
}

impl<F> Classifier for F
where
    F: FnMut(&Window) -> Result<Move, ClassifierError>,
{
    fn classify(&mut self, window: &Window) -> Result<Move, ClassifierError> {
        self(window)
    }
}

/// Request line written to the model process.
#[derive(Serialize)]
struct ClassifyRequest<'a> {
    window: &'a [[f64; 12]],
}

/// A model running as a child process.
///
/// For each window one JSON line `{"window": [[...12 readings...], ...]}` is
/// written to the child's stdin; the child answers with one line holding a
/// class index or a move name. The child is killed when this value is dropped.
pub struct ProcessClassifier {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl ProcessClassifier {
    /// Start the model process.
    pub fn spawn<I, S>(program: &str, args: I) -> Result<Self, ClassifierError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClassifierError::Protocol("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClassifierError::Protocol("child stdout unavailable".into()))?;

        tracing::info!("Started classifier process {} (pid {})", program, child.id());

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }
}

impl Classifier for ProcessClassifier {
    fn classify(&mut self, window: &Window) -> Result<Move, ClassifierError> {
        let request = ClassifyRequest {
            window: &window.samples,
        };
        let line = serde_json::to_string(&request)
            .map_err(|e| ClassifierError::Protocol(e.to_string()))?;
        writeln!(self.stdin, "{line}")?;
        self.stdin.flush()?;

        let mut reply = String::new();
        if self.stdout.read_line(&mut reply)? == 0 {
            return Err(ClassifierError::Protocol(
                "classifier process closed its output".into(),
            ));
        }
        reply.parse()
    }
}

impl Drop for ProcessClassifier {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
