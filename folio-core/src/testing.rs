//! In-memory engine and host used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::cancel::CancellationToken;
use crate::destination::{ExplicitDestination, PageRef};
use crate::engine::{
    DocumentHandle, EngineBootstrap, OpenOptions, PageHandle, RenderingEngine,
};
use crate::error::EngineError;
use crate::outline::OutlineEntry;
use crate::session::{ReaderHost, ScrollBehavior};
use crate::{PageNumber, Surface, TextContent, TextItem, Viewport};

pub const PAGE_WIDTH: f32 = 600.0;
pub const PAGE_HEIGHT: f32 = 800.0;

#[derive(Default)]
pub struct RenderStats {
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub completed: AtomicUsize,
}

struct ActiveGuard<'a>(&'a RenderStats);

impl<'a> ActiveGuard<'a> {
    fn enter(stats: &'a RenderStats) -> Self {
        stats.calls.fetch_add(1, Ordering::SeqCst);
        let now = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_active.fetch_max(now, Ordering::SeqCst);
        Self(stats)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeDocument {
    pages: usize,
    named: HashMap<String, PageRef>,
    outline: Vec<OutlineEntry>,
    outline_fails: bool,
    render_delay: Option<Duration>,
    failing_pages: HashSet<PageNumber>,
    pub stats: Arc<RenderStats>,
    pub destroyed: AtomicBool,
}

impl FakeDocument {
    pub fn new(pages: usize) -> Self {
        Self {
            pages,
            named: HashMap::new(),
            outline: Vec::new(),
            outline_fails: false,
            render_delay: None,
            failing_pages: HashSet::new(),
            stats: Arc::new(RenderStats::default()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn with_named(mut self, name: &str, page: PageRef) -> Self {
        self.named.insert(name.to_string(), page);
        self
    }

    pub fn with_outline(mut self, outline: Vec<OutlineEntry>) -> Self {
        self.outline = outline;
        self
    }

    pub fn with_outline_failure(mut self) -> Self {
        self.outline_fails = true;
        self
    }

    pub fn with_render_delay(mut self, delay: Duration) -> Self {
        self.render_delay = Some(delay);
        self
    }

    pub fn with_failing_page(mut self, page: PageNumber) -> Self {
        self.failing_pages.insert(page);
        self
    }
}

#[async_trait]
impl DocumentHandle for FakeDocument {
    fn page_count(&self) -> usize {
        self.pages
    }

    async fn page(&self, number: PageNumber) -> Result<Arc<dyn PageHandle>, EngineError> {
        if number == 0 || number > self.pages {
            return Err(EngineError::PageOutOfRange(number));
        }
        Ok(Arc::new(FakePage {
            number,
            delay: self.render_delay,
            fails: self.failing_pages.contains(&number),
            stats: Arc::clone(&self.stats),
        }))
    }

    async fn outline(&self) -> Result<Vec<OutlineEntry>, EngineError> {
        if self.outline_fails {
            return Err(EngineError::Unsupported("outline".into()));
        }
        Ok(self.outline.clone())
    }

    async fn destination(&self, name: &str) -> Result<Option<ExplicitDestination>, EngineError> {
        Ok(self
            .named
            .get(name)
            .map(|page| ExplicitDestination { page: Some(*page) }))
    }

    async fn page_index(&self, page: &PageRef) -> Result<usize, EngineError> {
        match page {
            PageRef::Index(index) => Ok(*index),
            PageRef::Object { number, .. } => Ok(*number as usize),
        }
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

pub struct FakePage {
    number: PageNumber,
    delay: Option<Duration>,
    fails: bool,
    stats: Arc<RenderStats>,
}

#[async_trait]
impl PageHandle for FakePage {
    fn viewport(&self, scale: f32) -> Viewport {
        Viewport::from_page_size(PAGE_WIDTH, PAGE_HEIGHT, scale)
    }

    async fn render(
        &self,
        surface: &mut Surface,
        _viewport: &Viewport,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let _guard = ActiveGuard::enter(&self.stats);
        if let Some(delay) = self.delay {
            let step = Duration::from_millis(10);
            let mut waited = Duration::ZERO;
            while waited < delay {
                cancel.check()?;
                tokio::time::sleep(step).await;
                waited += step;
            }
        }
        cancel.check()?;
        if self.fails {
            return Err(EngineError::Render {
                page: self.number,
                message: "broken content stream".into(),
            });
        }
        surface.pixels.fill(self.number as u8);
        self.stats.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn text_content(&self) -> Result<TextContent, EngineError> {
        Ok(TextContent {
            items: vec![TextItem {
                text: format!("page {}", self.number),
                left: 10.0,
                top: 10.0,
                width: 80.0,
                height: 12.0,
            }],
        })
    }
}

pub struct FakeEngine {
    document: Arc<FakeDocument>,
    pub gate: Option<Arc<Notify>>,
    pub fail: AtomicBool,
    pub opened: Mutex<Vec<(String, OpenOptions)>>,
}

impl FakeEngine {
    pub fn new(pages: usize) -> Self {
        Self::with_document(FakeDocument::new(pages))
    }

    pub fn with_document(document: FakeDocument) -> Self {
        Self {
            document: Arc::new(document),
            gate: None,
            fail: AtomicBool::new(false),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Holds every load until the returned notify fires.
    pub fn gated(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn document(&self) -> Arc<FakeDocument> {
        Arc::clone(&self.document)
    }
}

#[async_trait]
impl RenderingEngine for FakeEngine {
    async fn open_document(
        &self,
        source: &str,
        options: &OpenOptions,
        _cancel: &CancellationToken,
    ) -> Result<Arc<dyn DocumentHandle>, EngineError> {
        self.opened
            .lock()
            .push((source.to_string(), options.clone()));
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Load("404 Not Found".into()));
        }
        Ok(Arc::clone(&self.document) as Arc<dyn DocumentHandle>)
    }
}

pub struct FakeBootstrap(pub Arc<FakeEngine>);

#[async_trait]
impl EngineBootstrap for FakeBootstrap {
    async fn load(&self) -> Result<Arc<dyn RenderingEngine>, EngineError> {
        Ok(Arc::clone(&self.0) as Arc<dyn RenderingEngine>)
    }
}

pub struct FakeHost {
    pub width: Mutex<f32>,
    pub pixel_ratio: f32,
    /// Scroll attempts that report "not laid out yet" before succeeding.
    pub missing_attempts: AtomicUsize,
    pub scrolls: Mutex<Vec<(PageNumber, ScrollBehavior)>>,
}

impl FakeHost {
    pub fn new(width: f32) -> Self {
        Self {
            width: Mutex::new(width),
            pixel_ratio: 2.0,
            missing_attempts: AtomicUsize::new(0),
            scrolls: Mutex::new(Vec::new()),
        }
    }

    pub fn resize(&self, width: f32) {
        *self.width.lock() = width;
    }
}

impl ReaderHost for FakeHost {
    fn viewport_width(&self) -> f32 {
        *self.width.lock()
    }

    fn device_pixel_ratio(&self) -> f32 {
        self.pixel_ratio
    }

    fn scroll_to_page(&self, page: PageNumber, behavior: ScrollBehavior) -> bool {
        let missing = self.missing_attempts.load(Ordering::SeqCst);
        if missing > 0 {
            self.missing_attempts.store(missing - 1, Ordering::SeqCst);
            return false;
        }
        self.scrolls.lock().push((page, behavior));
        true
    }
}
