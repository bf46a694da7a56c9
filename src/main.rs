//! Sensor Relay CLI
//!
//! Drives the sensor board, the move classifier and the evaluation server.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use sensor_relay::{
    clock::SystemClock,
    device::{DeviceLink, ReplayLink, SerialLink},
    protocol::{self, Handshake, START_STREAM},
    relay::{decrypt_payload, AcceptedResult, ServerLink, SharedKey},
    session::{measure_throughput, SessionLoop},
    stats::{create_shared_stats_with_persistence, read_persisted},
    Config, Move, ProcessClassifier, VERSION,
};

#[derive(Parser)]
#[command(name = "sensor-relay")]
#[command(version = VERSION)]
#[command(about = "Relay classified dance moves from a sensor board to an evaluation server", long_about = None)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

/// Settings that override the configuration file for this run.
#[derive(Args, Debug)]
struct Overrides {
    /// Serial device path
    #[arg(long, global = true)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true)]
    baud: Option<u32>,

    /// Evaluation server host
    #[arg(long, global = true)]
    host: Option<String>,

    /// Evaluation server TCP port
    #[arg(long, global = true)]
    server_port: Option<u16>,

    /// 16, 24 or 32 character key shared with the server
    #[arg(long, global = true)]
    key: Option<String>,

    /// Movement readings per window
    #[arg(long, global = true)]
    frame_length: Option<usize>,

    /// Fraction of each window carried into the next
    #[arg(long, global = true)]
    overlap: Option<f64>,

    /// Pause before each frame read, in milliseconds
    #[arg(long, global = true)]
    sampling_interval_ms: Option<u64>,

    /// Candidates per vote
    #[arg(long, global = true)]
    votes: Option<usize>,

    /// Consecutive bad frames before a new handshake
    #[arg(long, global = true)]
    error_threshold: Option<u32>,

    /// Retry link and connect failures instead of exiting
    #[arg(long, global = true)]
    best_effort: bool,

    /// Read frames from a capture file instead of the serial port
    #[arg(long, global = true)]
    replay: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an evaluation: classify moves and send results to the server
    Run {
        /// Classifier program; receives windows on stdin, answers on stdout
        #[arg(long)]
        classifier: String,

        /// Argument passed to the classifier program (repeatable)
        #[arg(long = "classifier-arg")]
        classifier_args: Vec<String>,

        /// Start streaming right after the handshake
        #[arg(long)]
        no_prompt: bool,
    },

    /// Perform one handshake with the board and exit
    Handshake,

    /// Print frames received from the board
    Monitor {
        /// How long to listen
        #[arg(long, default_value = "5")]
        seconds: u64,
    },

    /// Measure frame receive and parse throughput
    SpeedTest {
        #[arg(long, default_value = "3")]
        batches: usize,

        #[arg(long, default_value = "50")]
        frames: usize,
    },

    /// Send one result to the server by hand
    Send {
        action: String,
        voltage: f64,
        current: f64,
        power: f64,
        cumulative_power: f64,
    },

    /// Decrypt a captured payload
    Decode { payload: String },

    /// Show statistics from previous sessions
    Status,

    /// Show the effective configuration
    Config {
        /// Write the effective configuration to the config file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.overrides.log_level);

    let config = build_config(&cli.overrides)?;
    let replay = cli.overrides.replay.clone();

    match cli.command {
        Commands::Run {
            classifier,
            classifier_args,
            no_prompt,
        } => cmd_run(config, replay, &classifier, &classifier_args, no_prompt),
        Commands::Handshake => cmd_handshake(&config, replay),
        Commands::Monitor { seconds } => cmd_monitor(&config, replay, seconds),
        Commands::SpeedTest { batches, frames } => cmd_speed_test(&config, replay, batches, frames),
        Commands::Send {
            action,
            voltage,
            current,
            power,
            cumulative_power,
        } => cmd_send(&config, &action, voltage, current, power, cumulative_power),
        Commands::Decode { payload } => cmd_decode(&config, &payload),
        Commands::Status => cmd_status(&config),
        Commands::Config { save } => cmd_config(&config, save),
    }
}

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();
}

/// Load the configuration file and apply command-line overrides.
fn build_config(overrides: &Overrides) -> Result<Config> {
    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Could not load {:?}, using defaults: {}", Config::config_path(), e);
            Config::default()
        }
    };

    if let Some(port) = &overrides.port {
        config.serial.port = port.clone();
    }
    if let Some(baud) = overrides.baud {
        config.serial.baud_rate = baud;
    }
    if let Some(host) = &overrides.host {
        config.server.host = host.clone();
    }
    if let Some(port) = overrides.server_port {
        config.server.port = port;
    }
    if let Some(key) = &overrides.key {
        config.server.key = Some(key.clone());
    }
    if let Some(frame_length) = overrides.frame_length {
        config.pipeline.frame_length = frame_length;
    }
    if let Some(overlap) = overrides.overlap {
        config.pipeline.overlap_ratio = overlap;
    }
    if let Some(ms) = overrides.sampling_interval_ms {
        config.pipeline.sampling_interval = Duration::from_millis(ms);
    }
    if let Some(votes) = overrides.votes {
        config.pipeline.votes_required = votes;
    }
    if let Some(threshold) = overrides.error_threshold {
        config.pipeline.error_threshold = threshold;
    }
    if overrides.best_effort {
        config.fail_fast = false;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Open the serial port, or a capture file when replaying.
fn open_device(config: &Config, replay: Option<PathBuf>) -> Result<Box<dyn DeviceLink>> {
    match replay {
        Some(path) => {
            let file = File::open(&path).with_context(|| format!("Failed to open {path:?}"))?;
            let link = ReplayLink::from_reader(BufReader::new(file))
                .with_context(|| format!("Failed to read {path:?}"))?
                .acknowledging_handshake();
            println!("Replaying {} lines from {:?}", link.remaining(), path);
            Ok(Box::new(link))
        }
        None => {
            let link = SerialLink::open(&config.serial).context("Failed to open sensor board")?;
            Ok(Box::new(link))
        }
    }
}

fn shared_key(config: &Config) -> Result<SharedKey> {
    let Some(key) = config.server.key.as_deref() else {
        bail!("No key configured; pass --key or set server.key in {:?}", Config::config_path());
    };
    SharedKey::try_from(key).context("Invalid key")
}

/// Connect to the server, retrying when not failing fast.
fn connect_server(config: &Config, shutdown: &AtomicBool) -> Result<ServerLink> {
    let key = shared_key(config)?;
    loop {
        match ServerLink::connect(&config.server.host, config.server.port, key.clone()) {
            Ok(link) => return Ok(link),
            Err(e) if !config.fail_fast && !shutdown.load(Ordering::SeqCst) => {
                tracing::warn!("{}; retrying in {:?}", e, config.retry_delay);
                std::thread::sleep(config.retry_delay);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn handshake(link: &mut dyn DeviceLink, config: &Config) -> Result<Handshake> {
    let mut handshake = Handshake::new(config.handshake.clone());
    handshake.begin()?;
    handshake
        .run(link, &SystemClock)
        .context("Handshake with sensor board failed")?;
    Ok(handshake)
}

fn cmd_run(
    config: Config,
    replay: Option<PathBuf>,
    classifier: &str,
    classifier_args: &[String],
    no_prompt: bool,
) -> Result<()> {
    println!("Sensor Relay v{VERSION}");
    println!();
    println!("  Serial port: {} @ {} baud", config.serial.port, config.serial.baud_rate);
    println!("  Server: {}", config.server.address());
    println!(
        "  Window: {} readings, overlap {}, {} votes",
        config.pipeline.frame_length, config.pipeline.overlap_ratio, config.pipeline.votes_required
    );
    println!();

    let shutdown = Arc::new(AtomicBool::new(false));
    ctrlc_handler(shutdown.clone())?;

    let stats = create_shared_stats_with_persistence(config.stats_path());
    let prompt = !no_prompt && replay.is_none();

    let server = connect_server(&config, &shutdown)?;
    let link = open_device(&config, replay)?;
    let classifier = ProcessClassifier::spawn(classifier, classifier_args)
        .context("Failed to start classifier")?;

    let mut session = SessionLoop::new(config, link, classifier, server, SystemClock)
        .with_stats(stats.clone())
        .with_shutdown(shutdown.clone());

    println!("Session ID: {}", stats.session_id());
    println!("Press Ctrl+C to stop");
    println!();

    let outcome = run_session(&mut session, prompt, &stats);

    if let Err(e) = stats.save() {
        eprintln!("Warning: Could not save session stats: {e}");
    }
    println!();
    println!("{}", stats.summary());

    outcome
}

fn run_session(
    session: &mut SessionLoop<Box<dyn DeviceLink>, ProcessClassifier>,
    prompt: bool,
    stats: &sensor_relay::SharedStats,
) -> Result<()> {
    session.connect_device()?;

    if prompt {
        println!("Wait for the server to prompt the first move, then press Enter to begin.");
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
    }
    session.start_stream()?;

    session.run_until_shutdown(|result: &AcceptedResult| {
        let snapshot = stats.snapshot();
        println!(
            "[{}] {} - {} results sent, avg {:.2} seconds per result",
            chrono::Local::now().format("%H:%M:%S"),
            result.format(),
            snapshot.run_results_sent,
            snapshot.avg_secs_per_result.unwrap_or_default()
        );
    })?;

    println!();
    println!("Stopping session...");
    Ok(())
}

fn cmd_handshake(config: &Config, replay: Option<PathBuf>) -> Result<()> {
    let mut link = open_device(config, replay)?;
    let handshake = handshake(link.as_mut(), config)?;
    println!(
        "Handshake complete after {} attempt(s); link is {:?}",
        handshake.attempts(),
        handshake.state()
    );
    Ok(())
}

fn cmd_monitor(config: &Config, replay: Option<PathBuf>, seconds: u64) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    ctrlc_handler(shutdown.clone())?;

    let mut link = open_device(config, replay)?;
    handshake(link.as_mut(), config)?;
    link.send_line(START_STREAM)?;

    let deadline = Instant::now() + Duration::from_secs(seconds);
    let (mut good, mut bad) = (0u64, 0u64);
    while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
        let Some(line) = link.read_line()? else {
            continue;
        };
        match protocol::parse(&line) {
            Ok(frame) => {
                good += 1;
                println!("{frame}");
            }
            Err(e) => {
                bad += 1;
                println!("invalid frame {:?}: {e}", line.trim_end());
            }
        }
    }

    println!();
    println!("{good} valid frame(s), {bad} invalid");
    Ok(())
}

fn cmd_speed_test(
    config: &Config,
    replay: Option<PathBuf>,
    batches: usize,
    frames: usize,
) -> Result<()> {
    let mut link = open_device(config, replay)?;
    handshake(link.as_mut(), config)?;
    link.send_line(START_STREAM)?;

    let report = measure_throughput(link.as_mut(), &SystemClock, batches, frames)?;

    println!("Frames processed: {} ({} invalid)", report.frames, report.dropped);
    match (report.secs_per_frame(), report.frames_per_sec()) {
        (Some(per_frame), Some(rate)) => {
            println!("Average time taken to process a frame: {per_frame:.6} seconds");
            println!("Frames per second: {rate:.2}");
        }
        _ => println!("Too little time elapsed to measure throughput"),
    }
    Ok(())
}

fn cmd_send(
    config: &Config,
    action: &str,
    voltage: f64,
    current: f64,
    power: f64,
    cumulative_power: f64,
) -> Result<()> {
    let action: Move = action.parse()?;
    let result = AcceptedResult {
        action,
        voltage,
        current,
        instantaneous_power: power,
        cumulative_power,
    };

    let mut server = connect_server(config, &AtomicBool::new(false))?;
    let message = server.send_result(&result)?;
    println!("Sent {message}");
    Ok(())
}

fn cmd_decode(config: &Config, payload: &str) -> Result<()> {
    let key = shared_key(config)?;
    let message = decrypt_payload(payload, &key).context("Failed to decode payload")?;
    println!("{message}");
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    println!("Sensor Relay Status");
    println!("===================");
    println!();

    match SerialLink::list_ports() {
        Ok(ports) if ports.is_empty() => println!("Serial ports: none found"),
        Ok(ports) => println!("Serial ports: {}", ports.join(", ")),
        Err(e) => println!("Serial ports: unavailable ({e})"),
    }
    println!("Configured port: {}", config.serial.port);
    println!("Server: {}", config.server.address());
    println!();

    let stats_path = config.stats_path();
    if !stats_path.exists() {
        println!("No previous session data found.");
        return Ok(());
    }

    let stats = read_persisted(&stats_path).with_context(|| format!("Failed to read {stats_path:?}"))?;
    println!("Cumulative Statistics:");
    println!("  Frames parsed: {}", stats.frames_parsed);
    println!("  Frames dropped: {}", stats.frames_dropped);
    println!("  Windows classified: {}", stats.windows_classified);
    println!("  Windows discarded: {}", stats.windows_discarded);
    println!("  Votes rejected: {}", stats.candidates_rejected);
    println!("  Forced resyncs: {}", stats.resyncs);
    println!("  Results sent: {}", stats.results_sent);
    println!("  Last session: {} ({})", stats.last_session_id, stats.last_updated);
    Ok(())
}

fn cmd_config(config: &Config, save: bool) -> Result<()> {
    println!("Configuration");
    println!("=============");
    println!();
    println!("Config file: {:?}", Config::config_path());
    println!();
    println!("{}", serde_json::to_string_pretty(&config.redacted())?);

    if save {
        config.save().context("Failed to save configuration")?;
        println!();
        println!("Saved to {:?}", Config::config_path());
    }
    Ok(())
}

/// Set up Ctrl+C handler.
fn ctrlc_handler(shutdown: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("Error setting Ctrl+C handler")
}
