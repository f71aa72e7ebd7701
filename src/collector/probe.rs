//! Queries against the active tab: URL, scroll position and window size.
//!
//! Every query can fail (no active tab, content script not injected, tab
//! navigated away). Failures resolve to `None`, never to an error.

use crate::collector::types::{ContentRequest, PageGeometry, ScrollLocation, WindowSize};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Source of page-level signals for the sample assembler.
#[async_trait]
pub trait PageProbe: Send + Sync {
    /// Raw URL of the active tab.
    async fn active_url(&self) -> Option<String>;

    /// Scroll position of the active tab.
    async fn scroll_location(&self) -> Option<ScrollLocation>;

    /// Outer window size of the active tab.
    async fn window_size(&self) -> Option<WindowSize>;
}

/// What the background asks of the active tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Tab metadata (answered by the browser, not the content script)
    ActiveTab,
    /// A request to the content script
    Content(ContentRequest),
}

/// Answer to a [`QueryKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum PageReply {
    Url(String),
    Scroll(ScrollLocation),
    Window(WindowSize),
    Frame(String),
}

/// One in-flight query with its reply slot.
#[derive(Debug)]
pub struct PageQuery {
    pub kind: QueryKind,
    pub reply: oneshot::Sender<Option<PageReply>>,
}

/// Probe that sends each query across the content-script boundary.
#[derive(Debug, Clone)]
pub struct MessagingProbe {
    sender: mpsc::Sender<PageQuery>,
    timeout: Duration,
}

impl MessagingProbe {
    /// Default time to wait for the tab to answer.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

    /// Create a probe and the receiving end its queries arrive on.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<PageQuery>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender,
                timeout: Self::DEFAULT_TIMEOUT,
            },
            receiver,
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one query and wait for its answer.
    pub async fn request(&self, kind: QueryKind) -> Option<PageReply> {
        let (reply, answer) = oneshot::channel();
        if self.sender.send(PageQuery { kind, reply }).await.is_err() {
            tracing::debug!("page query {:?} dropped: no tab listener", kind);
            return None;
        }

        match tokio::time::timeout(self.timeout, answer).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::debug!("page query {:?} timed out", kind);
                None
            }
        }
    }
}

#[async_trait]
impl PageProbe for MessagingProbe {
    async fn active_url(&self) -> Option<String> {
        match self.request(QueryKind::ActiveTab).await? {
            PageReply::Url(url) => Some(url),
            _ => None,
        }
    }

    async fn scroll_location(&self) -> Option<ScrollLocation> {
        match self
            .request(QueryKind::Content(ContentRequest::GetScrollLocation))
            .await?
        {
            PageReply::Scroll(scroll) => Some(scroll),
            _ => None,
        }
    }

    async fn window_size(&self) -> Option<WindowSize> {
        match self
            .request(QueryKind::Content(ContentRequest::GetWindowSize))
            .await?
        {
            PageReply::Window(size) => Some(size),
            _ => None,
        }
    }
}

/// Last page state reported by the active tab.
#[derive(Debug, Clone, Default)]
pub struct ReportedPage {
    pub url: Option<String>,
    pub geometry: Option<PageGeometry>,
    pub window: Option<WindowSize>,
    /// Most recent frame from the page capture script
    pub frame: Option<String>,
}

impl ReportedPage {
    /// Answer a query from the mirrored state. Frames are handed out once.
    pub fn answer(&mut self, kind: QueryKind) -> Option<PageReply> {
        match kind {
            QueryKind::ActiveTab => self.url.clone().map(PageReply::Url),
            QueryKind::Content(ContentRequest::GetScrollLocation) => self
                .geometry
                .as_ref()
                .and_then(ScrollLocation::from_geometry)
                .map(PageReply::Scroll),
            QueryKind::Content(ContentRequest::GetWindowSize) => {
                self.window.map(PageReply::Window)
            }
            QueryKind::Content(ContentRequest::SnapWebcam) => {
                self.frame.take().map(PageReply::Frame)
            }
        }
    }
}

/// Page mirror shared between the message dispatcher and the query responder.
pub type SharedPage = Arc<RwLock<ReportedPage>>;

/// Answer queries from `page` until every probe is dropped.
pub async fn serve_page_queries(mut queries: mpsc::Receiver<PageQuery>, page: SharedPage) {
    while let Some(query) = queries.recv().await {
        let reply = {
            let mut page = page.write().unwrap_or_else(|e| e.into_inner());
            page.answer(query.kind)
        };
        // The requester may have timed out already.
        let _ = query.reply.send(reply);
    }
    tracing::debug!("page query responder finished");
}
