//! Interaction Recorder - browser interaction sampling for research.
//!
//! This library samples what a participant does in the browser (pointer
//! position and buttons, held keys, scroll position, viewport size, the
//! active page and, with permission, a webcam frame), batches the samples
//! and ships them to an ingest server that enriches frames with emotion
//! scores before storing them.
//!
//! # Privacy Guarantees
//!
//! - **Reduced URLs**: Only the configured URL components are kept (protocol
//!   and domain by default)
//! - **Opt-in webcam**: No frame is captured before permission is granted
//! - **No stored images**: The server deletes every frame before persistence
//! - **Transparency**: All collection is counted and auditable
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Interaction Recorder                      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐       │
//! │  │  Collector  │──▶│ Aggregation │──▶│  Transport  │──┐    │
//! │  │  (tracker)  │   │ (two timers)│   │   (batch)   │  │    │
//! │  └─────────────┘   └─────────────┘   └─────────────┘  │    │
//! │         │                                             ▼    │
//! │  ┌─────────────┐                     ┌─────────────────┐   │
//! │  │Transparency │                     │ Server (ingest, │   │
//! │  │    Log      │                     │ emotions, API)  │   │
//! │  └─────────────┘                     └─────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use interaction_recorder::collector::{normalize_url, UrlComponents};
//!
//! let url = normalize_url("https://example.com/a?b=c", &UrlComponents::default());
//! assert_eq!(url.as_deref(), Some("https://example.com/"));
//! ```

pub mod collector;
pub mod config;
pub mod core;
pub mod transparency;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use collector::{
    normalize_url, Background, BrowserVendor, ExtensionMessage, Sample, SharedInputTracker,
    UrlComponents,
};
pub use config::{CollectionOptions, Config, ConfigError, ServerSettings};
pub use crate::core::{AggregationError, AggregationLoop, CollectorContext, FlushOutcome, LoopState};
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};
pub use transport::{EndpointConfig, Transport, TransportError};

#[cfg(feature = "transport")]
pub use transport::HttpTransport;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Privacy declaration that can be displayed to users.
pub const PRIVACY_DECLARATION: &str = r#"
╔══════════════════════════════════════════════════════════════════╗
║            INTERACTION RECORDER - PRIVACY DECLARATION            ║
╠══════════════════════════════════════════════════════════════════╣
║                                                                  ║
║  This recorder samples browser interaction for research.         ║
║                                                                  ║
║  ✓ WHAT WE CAPTURE (several times per second):                   ║
║    • Pointer position and pressed mouse buttons                  ║
║    • Which keys are currently held down                          ║
║    • Scroll position and window size                             ║
║    • The active page address, reduced to the configured parts    ║
║    • A webcam frame, only after you grant permission             ║
║                                                                  ║
║  ✗ WHAT WE NEVER KEEP:                                           ║
║    • Webcam images (deleted on the server after analysis;        ║
║      only emotion scores are stored)                             ║
║    • Page contents or form values                                ║
║    • Full URLs, unless configured                                ║
║                                                                  ║
║  Samples are sent in batches. A batch that fails to send is      ║
║  dropped, not retried.                                           ║
║                                                                  ║
║  You can view collection statistics anytime with:                ║
║    interaction-recorder status                                   ║
║                                                                  ║
╚══════════════════════════════════════════════════════════════════╝
"#;
