//! Collection transparency log.
//!
//! Counts what the recorder collected and what it lost, so that dropped
//! batches show up somewhere other than a log line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the current recording session.
#[derive(Debug)]
pub struct TransparencyLog {
    /// Extension messages handled
    messages_received: AtomicU64,
    /// Samples assembled
    samples_collected: AtomicU64,
    /// Samples carrying a webcam frame
    frames_captured: AtomicU64,
    /// Batches accepted by the server
    batches_sent: AtomicU64,
    /// Batches the transport failed to deliver
    batches_dropped: AtomicU64,
    /// Samples inside dropped batches
    samples_dropped: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    /// Create a new transparency log.
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            samples_collected: AtomicU64::new(0),
            frames_captured: AtomicU64::new(0),
            batches_sent: AtomicU64::new(0),
            batches_dropped: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a transparency log with persistence.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!("could not load previous collection stats: {e}");
        }

        log
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an assembled sample.
    pub fn record_sample(&self, with_frame: bool) {
        self.samples_collected.fetch_add(1, Ordering::Relaxed);
        if with_frame {
            self.frames_captured.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_batch_sent(&self) {
        self.batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch lost to a transport failure.
    pub fn record_batch_dropped(&self, samples: u64) {
        self.batches_dropped.fetch_add(1, Ordering::Relaxed);
        self.samples_dropped.fetch_add(samples, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> TransparencyStats {
        TransparencyStats {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            samples_collected: self.samples_collected.load(Ordering::Relaxed),
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
            batches_dropped: self.batches_dropped.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Session Statistics:\n\
             - Messages received: {}\n\
             - Samples collected: {}\n\
             - Webcam frames captured: {}\n\
             - Batches sent: {}\n\
             - Batches dropped: {} ({} samples lost)\n\
             - Session duration: {} seconds",
            stats.messages_received,
            stats.samples_collected,
            stats.frames_captured,
            stats.batches_sent,
            stats.batches_dropped,
            stats.samples_dropped,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                messages_received: stats.messages_received,
                samples_collected: stats.samples_collected,
                frames_captured: stats.frames_captured,
                batches_sent: stats.batches_sent,
                batches_dropped: stats.batches_dropped,
                samples_dropped: stats.samples_dropped,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load stats from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.messages_received
                    .store(persisted.messages_received, Ordering::Relaxed);
                self.samples_collected
                    .store(persisted.samples_collected, Ordering::Relaxed);
                self.frames_captured
                    .store(persisted.frames_captured, Ordering::Relaxed);
                self.batches_sent
                    .store(persisted.batches_sent, Ordering::Relaxed);
                self.batches_dropped
                    .store(persisted.batches_dropped, Ordering::Relaxed);
                self.samples_dropped
                    .store(persisted.samples_dropped, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transparency statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub messages_received: u64,
    pub samples_collected: u64,
    pub frames_captured: u64,
    pub batches_sent: u64,
    pub batches_dropped: u64,
    pub samples_dropped: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    messages_received: u64,
    samples_collected: u64,
    frames_captured: u64,
    batches_sent: u64,
    batches_dropped: u64,
    samples_dropped: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;

/// Create a new shared transparency log.
pub fn create_shared_log() -> SharedTransparencyLog {
    Arc::new(TransparencyLog::new())
}

/// Create a new shared transparency log with persistence.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedTransparencyLog {
    Arc::new(TransparencyLog::with_persistence(path))
}
