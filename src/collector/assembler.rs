//! Builds one [`Sample`] per main tick from the tracker and fresh page queries.

use crate::collector::probe::PageProbe;
use crate::collector::tracker::SharedInputTracker;
use crate::collector::types::Sample;
use crate::collector::url::{normalize_url, UrlComponents};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Composes samples. Nothing is cached between calls: every sample pays for
/// its own URL, scroll and window queries.
pub struct SampleAssembler {
    user_id: String,
    url_components: UrlComponents,
    tracker: SharedInputTracker,
    probe: Arc<dyn PageProbe>,
    last_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl SampleAssembler {
    pub fn new(
        user_id: impl Into<String>,
        url_components: UrlComponents,
        tracker: SharedInputTracker,
        probe: Arc<dyn PageProbe>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            url_components,
            tracker,
            probe,
            last_timestamp: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Assemble a sample carrying `image`.
    pub async fn assemble(&self, image: Option<String>) -> Sample {
        let (raw_url, scroll, window) = tokio::join!(
            self.probe.active_url(),
            self.probe.scroll_location(),
            self.probe.window_size()
        );
        let url = raw_url.and_then(|raw| normalize_url(&raw, &self.url_components));

        let (mouse, keyboard) = {
            let tracker = self.tracker.lock();
            (tracker.mouse(), tracker.keys())
        };

        Sample {
            user_id: self.user_id.clone(),
            timestamp: self.next_timestamp(),
            url,
            mouse,
            scroll,
            window,
            keyboard,
            image,
            emotions: None,
        }
    }

    /// Wall clock, clamped so timestamps never go backwards.
    fn next_timestamp(&self) -> DateTime<Utc> {
        let mut last = self.last_timestamp.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let ts = match *last {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        *last = Some(ts);
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::types::{Coordinates, ScrollLocation, WindowSize};
    use async_trait::async_trait;

    struct FixedProbe;

    #[async_trait]
    impl PageProbe for FixedProbe {
        async fn active_url(&self) -> Option<String> {
            Some("https://news.example.org/world/today?page=2".to_string())
        }

        async fn scroll_location(&self) -> Option<ScrollLocation> {
            Some(ScrollLocation {
                absolute: Coordinates::new(0.0, 120.0),
                relative: Coordinates::new(100.0, 40.0),
            })
        }

        async fn window_size(&self) -> Option<WindowSize> {
            None
        }
    }

    #[tokio::test]
    async fn test_assemble_merges_all_signals() {
        let tracker = SharedInputTracker::new();
        {
            let mut t = tracker.lock();
            t.mouse_move(15.0, 25.0);
            t.mouse_down(0);
            t.key_down("q");
        }
        let assembler = SampleAssembler::new(
            "user-1",
            UrlComponents::default(),
            tracker.clone(),
            Arc::new(FixedProbe),
        );

        let sample = assembler.assemble(Some("data:image/png;base64,AA".into())).await;
        assert_eq!(sample.user_id, "user-1");
        assert_eq!(sample.url.as_deref(), Some("https://news.example.org/"));
        assert_eq!(sample.mouse.position, Coordinates::new(15.0, 25.0));
        assert!(sample.mouse.buttons.contains(&0));
        assert!(sample.keyboard.contains("q"));
        assert_eq!(sample.scroll.unwrap().absolute.y, 120.0);
        assert!(sample.window.is_none());
        assert!(sample.image.is_some());
        assert!(sample.emotions.is_none());

        // Later tracker changes do not touch the assembled sample.
        tracker.lock().key_up("q");
        assert!(sample.keyboard.contains("q"));
    }

    #[tokio::test]
    async fn test_timestamps_never_decrease() {
        let assembler = SampleAssembler::new(
            "user-1",
            UrlComponents::default(),
            SharedInputTracker::new(),
            Arc::new(FixedProbe),
        );
        let mut previous = assembler.assemble(None).await.timestamp;
        for _ in 0..20 {
            let ts = assembler.assemble(None).await.timestamp;
            assert!(ts >= previous);
            previous = ts;
        }
    }
}
