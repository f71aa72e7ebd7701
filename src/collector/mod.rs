//! Client-side signal collection.
//!
//! This module turns extension messages and active-tab queries into
//! [`Sample`]s: the input tracker, the page probe, the snapshot gate with its
//! browser-specific capture paths, and the sample assembler.

pub mod assembler;
pub mod background;
pub mod probe;
pub mod snapshot;
pub mod tracker;
pub mod types;
pub mod url;

// Re-export commonly used types
pub use assembler::SampleAssembler;
pub use background::{Background, Dispatch};
pub use probe::{serve_page_queries, MessagingProbe, PageProbe, ReportedPage, SharedPage};
pub use snapshot::{capture_for, BrowserVendor, FrameCapture, SnapshotGate, WebcamPermission};
pub use tracker::{normalize_key, InputTracker, SharedInputTracker};
pub use types::{
    ContentRequest, Coordinates, ExtensionMessage, KeyCategory, MouseState, PageGeometry, Sample,
    ScrollLocation, WindowSize,
};
pub use url::{normalize_url, UrlComponents};
