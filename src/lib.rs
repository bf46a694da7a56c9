//! Sensor Relay - classifies dance moves from a wearable sensor board and
//! reports them to an evaluation server.
//!
//! The relay sits between a microcontroller streaming sensor frames over a
//! serial line and a remote server expecting one encrypted result per move.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Sensor Relay                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌───────────┐  │
//! │  │  Device   │──▶│  Frame    │──▶│  Window   │──▶│Classifier │  │
//! │  │  (serial) │   │  codec    │   │  buffer   │   │           │  │
//! │  └───────────┘   └───────────┘   └───────────┘   └───────────┘  │
//! │       ▲                │ power                         │        │
//! │       │                ▼                               ▼        │
//! │  ┌───────────┐   ┌───────────┐   ┌───────────┐   ┌───────────┐  │
//! │  │ Handshake │   │  Pending  │──▶│  Energy   │◀──│ Consensus │  │
//! │  │           │   │  power    │   │           │   │  (2 of K) │  │
//! │  └───────────┘   └───────────┘   └───────────┘   └───────────┘  │
//! │                                        │                        │
//! │                                        ▼                        │
//! │                                  ┌───────────┐                  │
//! │                                  │  Relay    │──▶ TCP server    │
//! │                                  │ (AES-CBC) │                  │
//! │                                  └───────────┘                  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sensor_relay::{
//!     clock::SystemClock, device::SerialLink, relay::SharedKey, Config,
//!     ProcessClassifier, ServerLink, SessionLoop,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = Config::default();
//! let link = SerialLink::open(&config.serial)?;
//! let classifier = ProcessClassifier::spawn("python3", ["model.py"])?;
//! let key = SharedKey::try_from("0123456789abcdef")?;
//! let server = ServerLink::connect(&config.server.host, config.server.port, key)?;
//!
//! let mut session = SessionLoop::new(config, link, classifier, server, SystemClock);
//! session.start()?;
//! while let Some(result) = session.next_result()? {
//!     println!("sent {}", result.action);
//! }
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod clock;
pub mod config;
pub mod core;
pub mod device;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod stats;

// Re-export key types at crate root for convenience
pub use classifier::{Classifier, ClassifierError, Move, ProcessClassifier};
pub use config::{Config, ConfigError};
pub use core::{ConsensusSmoother, Decision, EnergyAccumulator, Window, WindowBuffer};
pub use device::{DeviceLink, LinkError, ReplayLink, SerialLink};
pub use protocol::{FrameError, FrameKind, Handshake, LinkState, SensorFrame};
pub use relay::{AcceptedResult, EncodeError, ServerError, ServerLink, SharedKey};
pub use session::{SessionError, SessionLoop};
pub use stats::{SessionStats, SharedStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
