//! Data types shared by the extension background, the collector and the server.
//!
//! A [`Sample`] is the unit that travels from the browser to the ingest
//! endpoint. The message enums mirror the JSON objects exchanged between the
//! content script, the page and the background context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A point on the page or screen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: f64,
    pub y: f64,
}

impl Coordinates {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Pointer state at capture time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MouseState {
    /// Last known pointer position
    pub position: Coordinates,
    /// Held buttons (0 = left, 1 = middle, 2 = right, higher = auxiliary)
    pub buttons: BTreeSet<u16>,
}

/// Scroll position of the active page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScrollLocation {
    /// Absolute offset in page pixels
    pub absolute: Coordinates,
    /// How far the bottom/right viewport edge has progressed, in percent
    pub relative: Coordinates,
}

impl ScrollLocation {
    /// Compute the scroll location from raw page geometry.
    ///
    /// Returns `None` when the document reports an empty extent, since the
    /// relative offset is undefined in that case.
    pub fn from_geometry(geometry: &PageGeometry) -> Option<Self> {
        if geometry.document_width <= 0.0 || geometry.document_height <= 0.0 {
            return None;
        }

        let relative_x =
            100.0 * (geometry.scroll_x + geometry.viewport_width) / geometry.document_width;
        let relative_y =
            100.0 * (geometry.scroll_y + geometry.viewport_height) / geometry.document_height;

        Some(Self {
            absolute: Coordinates::new(geometry.scroll_x, geometry.scroll_y),
            relative: Coordinates::new(relative_x, relative_y),
        })
    }
}

/// Outer browser window size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowSize {
    pub width: f64,
    pub height: f64,
}

/// Raw page geometry as reported by the content script.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageGeometry {
    pub scroll_x: f64,
    pub scroll_y: f64,
    pub viewport_width: f64,
    pub viewport_height: f64,
    pub document_width: f64,
    pub document_height: f64,
}

/// Category of a held key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyCategory {
    Alpha,
    Numeric,
    Symbol,
    Function,
}

impl KeyCategory {
    /// Classify a normalized key identifier.
    ///
    /// Single printable characters are alpha, numeric or symbol. Named keys
    /// ("Enter", "Shift", "F5", ...) are function keys.
    pub fn classify(key: &str) -> Self {
        let mut chars = key.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_alphabetic() => KeyCategory::Alpha,
            (Some(c), None) if c.is_numeric() => KeyCategory::Numeric,
            (Some(c), None) if !c.is_control() => KeyCategory::Symbol,
            _ => KeyCategory::Function,
        }
    }
}

/// One timestamped interaction snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    /// Normalized URL of the active tab, `None` if it could not be queried
    pub url: Option<String>,
    pub mouse: MouseState,
    pub scroll: Option<ScrollLocation>,
    pub window: Option<WindowSize>,
    pub keyboard: BTreeSet<String>,
    /// Webcam frame as a data URI, removed by the server after analysis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Abbreviated emotion name to rounded score, attached by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotions: Option<BTreeMap<String, f64>>,
}

impl Sample {
    /// Categories of the keys held in this sample.
    pub fn key_categories(&self) -> BTreeSet<KeyCategory> {
        self.keyboard
            .iter()
            .map(|k| KeyCategory::classify(k))
            .collect()
    }
}

/// Messages sent from content scripts and extension pages to the background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ExtensionMessage {
    MouseMove { x: f64, y: f64 },
    MouseDown { button: u16 },
    MouseUp { button: u16 },
    KeyDown { key: String },
    KeyUp { key: String },
    Scroll(PageGeometry),
    Resize { width: f64, height: f64 },
    /// A frame delivered by the injected capture frame
    SnapWebcam {
        #[serde(default)]
        data: Option<String>,
    },
    WebcamPermission,
    SurveyCompleted {
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// The active tab changed or navigated
    TabActivated { url: String },
}

/// Requests sent from the background to the content script of the active tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ContentRequest {
    GetScrollLocation,
    GetWindowSize,
    SnapWebcam,
}
