//! Collection counters.
//!
//! Tracks what the recorder collected, sent and dropped, and persists the
//! totals so `status` can show them between runs.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, SharedTransparencyLog, TransparencyLog,
    TransparencyStats,
};
