//! Webcam snapshot cadence and capture.
//!
//! Frames are expensive, so only one main tick in every
//! `floor(emotions_interval / main_interval)` requests one. How the frame is
//! obtained depends on the browser, behind the [`FrameCapture`] trait.

use crate::collector::probe::{MessagingProbe, PageReply, QueryKind, SharedPage};
use crate::collector::types::ContentRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Decides which main ticks carry a webcam capture.
#[derive(Debug, Clone)]
pub struct SnapshotGate {
    cycles_per_capture: u64,
    counter: u64,
}

impl SnapshotGate {
    /// Build a gate from the two periods. An emotions period shorter than
    /// the main tick floors to zero cycles, and such a gate never fires.
    pub fn new(main_interval: Duration, emotions_interval: Duration) -> Self {
        let main = main_interval.as_millis().max(1);
        Self {
            cycles_per_capture: (emotions_interval.as_millis() / main) as u64,
            counter: 0,
        }
    }

    /// False when no tick will ever capture.
    pub fn captures(&self) -> bool {
        self.cycles_per_capture > 0
    }

    pub fn cycles_per_capture(&self) -> u64 {
        self.cycles_per_capture
    }

    /// Advance by one main tick. Returns true when this tick should capture.
    pub fn tick(&mut self) -> bool {
        if !self.captures() {
            return false;
        }
        self.counter += 1;
        if self.counter >= self.cycles_per_capture {
            self.counter = 0;
            true
        } else {
            false
        }
    }
}

/// Whether the user granted webcam access. Set once the device attached.
#[derive(Debug, Clone, Default)]
pub struct WebcamPermission(Arc<AtomicBool>);

impl WebcamPermission {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_granted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Produces one webcam frame as a data URI, or nothing.
#[async_trait]
pub trait FrameCapture: Send + Sync {
    async fn capture_frame(&self) -> Option<String>;
}

/// Browser family the background runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserVendor {
    #[default]
    Chromium,
    Firefox,
}

impl BrowserVendor {
    pub fn from_user_agent(user_agent: &str) -> Self {
        if user_agent.contains("Firefox") {
            BrowserVendor::Firefox
        } else {
            BrowserVendor::Chromium
        }
    }
}

impl std::str::FromStr for BrowserVendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chromium" | "chrome" => Ok(BrowserVendor::Chromium),
            "firefox" => Ok(BrowserVendor::Firefox),
            other => Err(format!("unknown browser '{other}'")),
        }
    }
}

/// Chromium path: ask the page script of the active tab for a frame.
pub struct RelayedCapture {
    permission: WebcamPermission,
    probe: MessagingProbe,
}

impl RelayedCapture {
    pub fn new(permission: WebcamPermission, probe: MessagingProbe) -> Self {
        Self { permission, probe }
    }
}

#[async_trait]
impl FrameCapture for RelayedCapture {
    async fn capture_frame(&self) -> Option<String> {
        if !self.permission.is_granted() {
            return None;
        }
        match self
            .probe
            .request(QueryKind::Content(ContentRequest::SnapWebcam))
            .await?
        {
            PageReply::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Firefox path: the injected capture frame pushes frames to the background,
/// and a capture takes the latest one.
pub struct InjectedFrameCapture {
    permission: WebcamPermission,
    page: SharedPage,
}

impl InjectedFrameCapture {
    pub fn new(permission: WebcamPermission, page: SharedPage) -> Self {
        Self { permission, page }
    }
}

#[async_trait]
impl FrameCapture for InjectedFrameCapture {
    async fn capture_frame(&self) -> Option<String> {
        if !self.permission.is_granted() {
            return None;
        }
        let frame = {
            let mut page = self.page.write().unwrap_or_else(|e| e.into_inner());
            page.frame.take()
        };
        frame
    }
}

/// Pick the capture path for `vendor`.
pub fn capture_for(
    vendor: BrowserVendor,
    permission: WebcamPermission,
    probe: MessagingProbe,
    page: SharedPage,
) -> Arc<dyn FrameCapture> {
    match vendor {
        BrowserVendor::Chromium => Arc::new(RelayedCapture::new(permission, probe)),
        BrowserVendor::Firefox => Arc::new(InjectedFrameCapture::new(permission, page)),
    }
}
