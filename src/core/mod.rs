//! Core aggregation for the interaction recorder.
//!
//! This module owns the two timers: the sampling timer that assembles
//! samples into the pending buffer, and the flush timer that ships the
//! buffer to the server as one batch.

pub mod aggregation;

// Re-export commonly used types
pub use aggregation::{
    AggregationError, AggregationLoop, CollectionCycle, CollectorContext, FlushOutcome, LoopState,
};
