//! Routes extension messages to the state they update.

use crate::collector::probe::{ReportedPage, SharedPage};
use crate::collector::snapshot::WebcamPermission;
use crate::collector::tracker::SharedInputTracker;
use crate::collector::types::{ExtensionMessage, WindowSize};
use crate::transparency::SharedTransparencyLog;

/// What a handled message asks of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// State updated, nothing else to do
    Handled,
    /// The enrollment survey finished and assigned this user ID
    Enrolled(String),
}

/// Background-side message dispatcher.
#[derive(Clone)]
pub struct Background {
    tracker: SharedInputTracker,
    page: SharedPage,
    permission: WebcamPermission,
    log: SharedTransparencyLog,
}

impl Background {
    pub fn new(
        tracker: SharedInputTracker,
        page: SharedPage,
        permission: WebcamPermission,
        log: SharedTransparencyLog,
    ) -> Self {
        Self {
            tracker,
            page,
            permission,
            log,
        }
    }

    pub fn handle(&self, message: ExtensionMessage) -> Dispatch {
        self.log.record_message();

        match message {
            ExtensionMessage::MouseMove { x, y } => self.tracker.lock().mouse_move(x, y),
            ExtensionMessage::MouseDown { button } => self.tracker.lock().mouse_down(button),
            ExtensionMessage::MouseUp { button } => self.tracker.lock().mouse_up(button),
            ExtensionMessage::KeyDown { key } => self.tracker.lock().key_down(&key),
            ExtensionMessage::KeyUp { key } => self.tracker.lock().key_up(&key),
            ExtensionMessage::Scroll(geometry) => {
                self.page_mut(|page| page.geometry = Some(geometry));
            }
            ExtensionMessage::Resize { width, height } => {
                self.page_mut(|page| page.window = Some(WindowSize { width, height }));
            }
            ExtensionMessage::TabActivated { url } => {
                self.page_mut(|page| page.url = Some(url));
            }
            ExtensionMessage::SnapWebcam { data } => {
                if data.is_some() {
                    self.page_mut(|page| page.frame = data);
                }
            }
            ExtensionMessage::WebcamPermission => {
                tracing::info!("webcam attached, snapshots enabled");
                self.permission.grant();
            }
            ExtensionMessage::SurveyCompleted { user_id } => {
                return Dispatch::Enrolled(user_id);
            }
        }

        Dispatch::Handled
    }

    fn page_mut(&self, update: impl FnOnce(&mut ReportedPage)) {
        let mut page = self.page.write().unwrap_or_else(|e| e.into_inner());
        update(&mut page);
    }
}
