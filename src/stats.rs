//! Session statistics.
//!
//! Counters are atomics behind an `Arc` so the Ctrl+C handler and the session
//! loop can share them. Totals are persisted as JSON and accumulate across
//! runs; the session id and start time belong to the current run only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Counters for one relay session.
#[derive(Debug)]
pub struct SessionStats {
    /// Frames that passed validation
    frames_parsed: AtomicU64,
    /// Frames rejected by the codec
    frames_dropped: AtomicU64,
    /// Windows handed to the classifier
    windows_classified: AtomicU64,
    /// Windows thrown away on an unknown class
    windows_discarded: AtomicU64,
    /// Votes ending with all candidates different
    candidates_rejected: AtomicU64,
    /// Handshakes forced by consecutive bad frames
    resyncs: AtomicU64,
    /// Results delivered to the server
    results_sent: AtomicU64,
    /// Results delivered since this run started; loaded totals excluded
    run_results_sent: AtomicU64,
    session_id: Uuid,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl SessionStats {
    pub fn new() -> Self {
        Self {
            frames_parsed: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            windows_classified: AtomicU64::new(0),
            windows_discarded: AtomicU64::new(0),
            candidates_rejected: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            results_sent: AtomicU64::new(0),
            run_results_sent: AtomicU64::new(0),
            session_id: Uuid::new_v4(),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Stats backed by a JSON file; previous totals are loaded if present.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!("Could not load previous session stats: {}", e);
        }

        stats
    }

    pub fn record_frame_parsed(&self) {
        self.frames_parsed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_classified(&self) {
        self.windows_classified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_window_discarded(&self) {
        self.windows_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_candidates_rejected(&self) {
        self.candidates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_sent(&self) {
        self.results_sent.fetch_add(1, Ordering::Relaxed);
        self.run_results_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Snapshot with durations measured up to `now`.
    ///
    /// The average covers this run only, so totals loaded from disk do not
    /// dilute it.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let run_results_sent = self.run_results_sent.load(Ordering::Relaxed);
        let session_duration_secs = (now - self.session_start).num_milliseconds().max(0) as f64 / 1000.0;
        let avg_secs_per_result = if run_results_sent > 0 {
            Some(session_duration_secs / run_results_sent as f64)
        } else {
            None
        };

        StatsSnapshot {
            session_id: self.session_id,
            session_start: self.session_start,
            frames_parsed: self.frames_parsed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            windows_classified: self.windows_classified.load(Ordering::Relaxed),
            windows_discarded: self.windows_discarded.load(Ordering::Relaxed),
            candidates_rejected: self.candidates_rejected.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            results_sent: self.results_sent.load(Ordering::Relaxed),
            run_results_sent,
            session_duration_secs,
            avg_secs_per_result,
        }
    }

    /// Human-readable summary.
    pub fn summary(&self) -> String {
        self.snapshot().summary()
    }

    /// Write totals to the persistence file, if one is configured.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let snapshot = self.snapshot();
            let persisted = PersistedStats {
                last_session_id: snapshot.session_id,
                frames_parsed: snapshot.frames_parsed,
                frames_dropped: snapshot.frames_dropped,
                windows_classified: snapshot.windows_classified,
                windows_discarded: snapshot.windows_discarded,
                candidates_rejected: snapshot.candidates_rejected,
                resyncs: snapshot.resyncs,
                results_sent: snapshot.results_sent,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;
            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let persisted = read_persisted(path)?;
                self.frames_parsed.store(persisted.frames_parsed, Ordering::Relaxed);
                self.frames_dropped.store(persisted.frames_dropped, Ordering::Relaxed);
                self.windows_classified
                    .store(persisted.windows_classified, Ordering::Relaxed);
                self.windows_discarded
                    .store(persisted.windows_discarded, Ordering::Relaxed);
                self.candidates_rejected
                    .store(persisted.candidates_rejected, Ordering::Relaxed);
                self.resyncs.store(persisted.resyncs, Ordering::Relaxed);
                self.results_sent.store(persisted.results_sent, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for counter in [
            &self.frames_parsed,
            &self.frames_dropped,
            &self.windows_classified,
            &self.windows_discarded,
            &self.candidates_rejected,
            &self.resyncs,
            &self.results_sent,
            &self.run_results_sent,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for SessionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy of the counters at one instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub session_id: Uuid,
    pub session_start: DateTime<Utc>,
    pub frames_parsed: u64,
    pub frames_dropped: u64,
    pub windows_classified: u64,
    pub windows_discarded: u64,
    pub candidates_rejected: u64,
    pub resyncs: u64,
    pub results_sent: u64,
    pub run_results_sent: u64,
    pub session_duration_secs: f64,
    pub avg_secs_per_result: Option<f64>,
}

impl StatsSnapshot {
    pub fn summary(&self) -> String {
        let average = match self.avg_secs_per_result {
            Some(avg) => format!("{avg:.2} seconds"),
            None => "n/a".to_string(),
        };
        format!(
            "Session {}:\n\
             - Frames parsed: {}\n\
             - Frames dropped: {}\n\
             - Windows classified: {}\n\
             - Windows discarded: {}\n\
             - Votes rejected: {}\n\
             - Forced resyncs: {}\n\
             - Results sent: {} ({} this run)\n\
             - Average time per result: {}\n\
             - Session duration: {:.0} seconds",
            self.session_id,
            self.frames_parsed,
            self.frames_dropped,
            self.windows_classified,
            self.windows_discarded,
            self.candidates_rejected,
            self.resyncs,
            self.results_sent,
            self.run_results_sent,
            average,
            self.session_duration_secs
        )
    }
}

/// On-disk form of the totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedStats {
    pub last_session_id: Uuid,
    pub frames_parsed: u64,
    pub frames_dropped: u64,
    pub windows_classified: u64,
    pub windows_discarded: u64,
    pub candidates_rejected: u64,
    pub resyncs: u64,
    pub results_sent: u64,
    pub last_updated: DateTime<Utc>,
}

/// Read persisted totals, e.g. for the `status` command.
pub fn read_persisted(path: &std::path::Path) -> Result<PersistedStats, std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(std::io::Error::other)
}

/// Thread-safe shared statistics.
pub type SharedStats = Arc<SessionStats>;

pub fn create_shared_stats() -> SharedStats {
    Arc::new(SessionStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedStats {
    Arc::new(SessionStats::with_persistence(path))
}
