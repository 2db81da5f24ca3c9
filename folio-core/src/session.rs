use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::config::ReaderConfig;
use crate::destination::{Destination, DestinationResolver, JumpRequest};
use crate::engine::{DocumentHandle, EngineLoader, OpenOptions};
use crate::error::EngineError;
use crate::outline::{flatten_outline, OutlineNode};
use crate::page::{PageRenderUnit, PageSnapshot};
use crate::progress::{DocumentIdentity, ProgressStore};
use crate::visibility::{FocusBand, PageVisibilityTracker};
use crate::window::{fit_scale, step_zoom, LayoutMode, RenderWindow};
use crate::{clamp_pixel_ratio, PageNumber};

const PAGE_GAP: f32 = 12.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollBehavior {
    Instant,
    Smooth,
}

pub trait ReaderHost: Send + Sync {
    fn viewport_width(&self) -> f32;

    fn device_pixel_ratio(&self) -> f32 {
        1.0
    }

    /// Brings a page container into view. Returns `false` while the
    /// container is not laid out yet so the caller can retry.
    fn scroll_to_page(&self, page: PageNumber, behavior: ScrollBehavior) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadingState {
    Idle,
    Loading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSession {
    pub source_url: String,
    pub title: String,
    pub document_id: Option<String>,
    pub total_pages: usize,
    pub current_page: PageNumber,
    pub zoom: f32,
    pub layout: LayoutMode,
    pub loading: LoadingState,
    pub error_message: Option<String>,
    pub outline: Vec<OutlineNode>,
    pub jump_target: Option<PageNumber>,
}

impl DocumentSession {
    pub fn identity(&self) -> DocumentIdentity {
        DocumentIdentity {
            document_id: self.document_id.clone(),
            source_url: self.source_url.clone(),
            title: self.title.clone(),
        }
    }

    pub fn render_window(&self, config: &ReaderConfig) -> RenderWindow {
        RenderWindow {
            current: self.current_page,
            radius: self.layout.window_radius(&config.layout),
            jump_target: self.jump_target,
            total_pages: self.total_pages,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderEvent {
    Opened { source_url: String, initial_page: PageNumber },
    Loaded { total_pages: usize, current_page: PageNumber },
    LoadFailed { message: String },
    OutlineReady { entries: usize },
    PageChanged { page: PageNumber },
    ZoomChanged { zoom: f32 },
    JumpStarted { page: PageNumber },
    JumpExpired { page: PageNumber },
    ProgressSaved { page: PageNumber, total_pages: usize },
    Closed { source_url: String },
}

/// Freshest page/total, kept in step with every change so teardown can flush
/// without consulting anything asynchronous.
#[derive(Debug, Clone, Copy, Default)]
struct LatestProgress {
    page: PageNumber,
    total_pages: usize,
}

#[derive(Default)]
struct Timers {
    save: Option<JoinHandle<()>>,
    restore: Option<JoinHandle<()>>,
    jump: Option<JoinHandle<()>>,
    scroll: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [
            self.save.take(),
            self.restore.take(),
            self.jump.take(),
            self.scroll.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

fn replace_timer(slot: &mut Option<JoinHandle<()>>, handle: JoinHandle<()>) {
    if let Some(previous) = slot.replace(handle) {
        previous.abort();
    }
}

struct ControllerState {
    session: Option<DocumentSession>,
    document: Option<Arc<dyn DocumentHandle>>,
    epoch: u64,
    cancel: CancellationToken,
    latest: LatestProgress,
    user_zoomed: bool,
    timers: Timers,
    units: BTreeMap<PageNumber, PageRenderUnit>,
    tracker: PageVisibilityTracker,
}

impl ControllerState {
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && !self.cancel.is_cancelled()
    }
}

struct Inner {
    loader: Arc<EngineLoader>,
    store: ProgressStore,
    host: Arc<dyn ReaderHost>,
    config: ReaderConfig,
    runtime: Handle,
    resolver: DestinationResolver,
    state: Mutex<ControllerState>,
    events: Arc<Mutex<Vec<ReaderEvent>>>,
}

/// Owns one reading session at a time: loading, paging, zoom, jumps,
/// progress persistence and teardown. Cheap to clone; clones share the
/// session.
#[derive(Clone)]
pub struct ReaderController {
    inner: Arc<Inner>,
}

impl ReaderController {
    /// Must be called from within a Tokio runtime; background work is spawned
    /// onto it.
    pub fn new(
        loader: Arc<EngineLoader>,
        store: ProgressStore,
        host: Arc<dyn ReaderHost>,
        config: ReaderConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().context("reader controller needs a tokio runtime")?;
        Ok(Self::with_runtime(loader, store, host, config, runtime))
    }

    pub fn with_runtime(
        loader: Arc<EngineLoader>,
        store: ProgressStore,
        host: Arc<dyn ReaderHost>,
        config: ReaderConfig,
        runtime: Handle,
    ) -> Self {
        let state = ControllerState {
            session: None,
            document: None,
            epoch: 0,
            cancel: CancellationToken::new(),
            latest: LatestProgress::default(),
            user_zoomed: false,
            timers: Timers::default(),
            units: BTreeMap::new(),
            tracker: PageVisibilityTracker::new(FocusBand::default()),
        };
        Self {
            inner: Arc::new(Inner {
                loader,
                store,
                host,
                config,
                runtime,
                resolver: DestinationResolver::default(),
                state: Mutex::new(state),
                events: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<ReaderEvent>>> {
        Arc::clone(&self.inner.events)
    }

    pub fn session(&self) -> Option<DocumentSession> {
        self.inner.state.lock().session.clone()
    }

    pub fn render_window(&self) -> Option<RenderWindow> {
        let state = self.inner.state.lock();
        state
            .session
            .as_ref()
            .map(|session| session.render_window(&self.inner.config))
    }

    pub fn page(&self, page: PageNumber) -> Option<PageSnapshot> {
        self.inner
            .state
            .lock()
            .units
            .get(&page)
            .map(PageRenderUnit::snapshot)
    }

    pub fn is_user_zoomed(&self) -> bool {
        self.inner.state.lock().user_zoomed
    }

    /// Opens `source_url`, replacing any current session. Completes once the
    /// document has loaded or failed; errors end up in the session state.
    #[instrument(skip(self, title))]
    pub async fn open(&self, source_url: &str, title: &str, document_id: Option<String>) {
        let source_url = source_url.to_string();
        let inner = &self.inner;

        let (epoch, cancel, initial_page, options) = {
            let mut state = inner.state.lock();
            inner.close_locked(&mut state);

            state.epoch += 1;
            state.cancel = CancellationToken::new();
            state.user_zoomed = false;

            let width = inner.host.viewport_width();
            let layout = LayoutMode::classify(width, inner.config.layout.narrow_breakpoint);
            let zoom = if layout.is_narrow() {
                fit_scale(width)
            } else {
                1.0
            };

            let mut session = DocumentSession {
                source_url: source_url.clone(),
                title: title.to_string(),
                document_id,
                total_pages: 0,
                current_page: 1,
                zoom,
                layout,
                loading: LoadingState::Loading,
                error_message: None,
                outline: Vec::new(),
                jump_target: None,
            };

            if source_url.trim().is_empty() {
                let message = inner.config.messages.missing_source.clone();
                warn!("no document source provided");
                session.loading = LoadingState::Failed;
                session.error_message = Some(message.clone());
                state.session = Some(session);
                inner.emit(ReaderEvent::LoadFailed { message });
                return;
            }

            let initial_page = inner.store.resolve_initial_page(&session.identity());
            session.current_page = initial_page;
            state.latest = LatestProgress {
                page: initial_page,
                total_pages: 0,
            };
            state.session = Some(session);
            inner.emit(ReaderEvent::Opened {
                source_url: source_url.clone(),
                initial_page,
            });

            (
                state.epoch,
                state.cancel.clone(),
                initial_page,
                OpenOptions::for_layout(layout, &inner.config),
            )
        };

        let outcome = inner.load_document(&source_url, &options, &cancel).await;

        let mut state = inner.state.lock();
        if !state.is_current(epoch) {
            if let Ok(document) = outcome {
                debug!("discarding document loaded for a closed session");
                document.destroy();
            }
            return;
        }

        match outcome {
            Ok(document) => inner.finish_load(&mut state, epoch, cancel, initial_page, document),
            Err(err) => {
                error!(%err, source = %source_url, "failed to load document");
                let message = inner.config.messages.load_failed.clone();
                if let Some(session) = state.session.as_mut() {
                    session.loading = LoadingState::Failed;
                    session.error_message = Some(message.clone());
                }
                inner.emit(ReaderEvent::LoadFailed { message });
            }
        }
    }

    #[instrument(skip(self))]
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        self.inner.close_locked(&mut state);
    }

    /// Current page as reported by the visibility tracker. Repeated reports
    /// of the same page are ignored.
    pub fn set_page(&self, page: PageNumber) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        let Some(session) = state.session.as_mut() else {
            return;
        };
        if page == 0 || page > session.total_pages {
            debug!(page, total = session.total_pages, "ignoring out-of-range page");
            return;
        }
        if session.current_page == page {
            return;
        }

        session.current_page = page;
        if session.jump_target == Some(page) {
            session.jump_target = None;
        }
        state.latest.page = page;
        inner.emit(ReaderEvent::PageChanged { page });
        inner.schedule_save(&mut state);
        inner.sync_units(&mut state);
    }

    /// Jumps to an outline destination, falling back to a `#page=N` link.
    /// Returns the page jumped to, or `None` when nothing resolved.
    #[instrument(skip(self, destination))]
    pub async fn jump_to(
        &self,
        destination: Option<&Destination>,
        fallback_url: Option<&str>,
    ) -> Option<PageNumber> {
        let inner = &self.inner;
        let (document, epoch) = {
            let state = inner.state.lock();
            (state.document.clone()?, state.epoch)
        };

        let request = JumpRequest {
            destination,
            fallback_url,
        };
        let resolved = inner.resolver.resolve_page(document.as_ref(), &request).await?;

        let mut state = inner.state.lock();
        if !state.is_current(epoch) {
            return None;
        }
        let session = state.session.as_mut()?;
        let page = resolved.clamp(1, session.total_pages.max(1));

        session.jump_target = Some(page);
        if let Some(restore) = state.timers.restore.take() {
            restore.abort();
        }
        let session = state.session.as_mut()?;
        let changed = session.current_page != page;
        session.current_page = page;
        state.latest.page = page;

        info!(page, "jumping to page");
        inner.emit(ReaderEvent::JumpStarted { page });
        if changed {
            inner.emit(ReaderEvent::PageChanged { page });
            inner.schedule_save(&mut state);
        }
        inner.sync_units(&mut state);

        let scroll = Arc::clone(inner).spawn_scroll(
            epoch,
            page,
            ScrollBehavior::Smooth,
            inner.config.timing.jump_retries,
            None,
        );
        replace_timer(&mut state.timers.scroll, scroll);

        let expiry = Arc::clone(inner).spawn_jump_expiry(epoch, page);
        replace_timer(&mut state.timers.jump, expiry);

        Some(page)
    }

    /// Adjusts zoom by `delta` and turns off automatic refitting for the rest
    /// of the session.
    pub fn set_zoom(&self, delta: f32) -> Option<f32> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        state.user_zoomed = true;
        let session = state.session.as_mut()?;

        let limits = session.layout.zoom_limits(&inner.config.layout);
        let zoom = step_zoom(session.zoom, delta, limits);
        if (zoom - session.zoom).abs() > f32::EPSILON {
            session.zoom = zoom;
            inner.emit(ReaderEvent::ZoomChanged { zoom });
            inner.sync_units(&mut state);
        }
        Some(zoom)
    }

    pub fn zoom_in(&self) -> Option<f32> {
        self.set_zoom(self.inner.config.layout.zoom_step)
    }

    pub fn zoom_out(&self) -> Option<f32> {
        self.set_zoom(-self.inner.config.layout.zoom_step)
    }

    pub fn on_viewport_resize(&self) {
        let inner = &self.inner;
        let width = inner.host.viewport_width();
        let mut state = inner.state.lock();
        let user_zoomed = state.user_zoomed;
        let Some(session) = state.session.as_mut() else {
            return;
        };

        session.layout = LayoutMode::classify(width, inner.config.layout.narrow_breakpoint);
        if session.layout.is_narrow() && !user_zoomed {
            let zoom = fit_scale(width);
            if (zoom - session.zoom).abs() > f32::EPSILON {
                session.zoom = zoom;
                inner.emit(ReaderEvent::ZoomChanged { zoom });
            }
        }
        inner.sync_units(&mut state);
    }

    pub fn report_scroll(&self, scroll_top: f32, viewport_height: f32) {
        let reports = {
            let mut state = self.inner.state.lock();
            let state = &mut *state;
            let heights: Vec<f32> = state
                .units
                .values()
                .map(|unit| unit.footprint().height())
                .collect();
            state.tracker.set_layout(heights, PAGE_GAP);
            state.tracker.observe(scroll_top, viewport_height)
        };
        for page in reports {
            self.set_page(page);
        }
    }

    /// Scroll offset of a page container under the current layout.
    pub fn page_offset(&self, page: PageNumber) -> Option<f32> {
        let mut state = self.inner.state.lock();
        let state = &mut *state;
        let heights: Vec<f32> = state
            .units
            .values()
            .map(|unit| unit.footprint().height())
            .collect();
        state.tracker.set_layout(heights, PAGE_GAP);
        state.tracker.offset_of(page)
    }
}

impl Inner {
    fn emit(&self, event: ReaderEvent) {
        self.events.lock().push(event);
    }

    async fn load_document(
        &self,
        source_url: &str,
        options: &OpenOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn DocumentHandle>, EngineError> {
        let engine = self.loader.engine().await?;
        cancel.check()?;
        let document = engine.open_document(source_url, options, cancel).await?;
        if cancel.is_cancelled() {
            document.destroy();
            return Err(EngineError::Cancelled);
        }
        Ok(document)
    }

    fn finish_load(
        self: &Arc<Self>,
        state: &mut ControllerState,
        epoch: u64,
        cancel: CancellationToken,
        initial_page: PageNumber,
        document: Arc<dyn DocumentHandle>,
    ) {
        let total_pages = document.page_count();
        let current_page = initial_page.clamp(1, total_pages.max(1));
        info!(total_pages, current_page, "document loaded");

        if let Some(session) = state.session.as_mut() {
            session.total_pages = total_pages;
            session.current_page = current_page;
            session.loading = LoadingState::Ready;
        }
        state.latest = LatestProgress {
            page: current_page,
            total_pages,
        };
        state.document = Some(Arc::clone(&document));
        state.units = (1..=total_pages)
            .map(|page| (page, PageRenderUnit::new(page)))
            .collect();
        self.emit(ReaderEvent::Loaded {
            total_pages,
            current_page,
        });

        self.schedule_save(state);
        self.sync_units(state);

        let outline_task = Arc::clone(self).fetch_outline(epoch, cancel, document);
        self.runtime.spawn(outline_task);

        let restore = Arc::clone(self).spawn_scroll(
            epoch,
            current_page,
            ScrollBehavior::Instant,
            self.config.timing.restore_retries,
            Some(self.config.timing.settle_delay()),
        );
        replace_timer(&mut state.timers.restore, restore);
    }

    async fn fetch_outline(
        self: Arc<Self>,
        epoch: u64,
        cancel: CancellationToken,
        document: Arc<dyn DocumentHandle>,
    ) {
        let outline = match document.outline().await {
            Ok(tree) => flatten_outline(&tree),
            Err(err) => {
                debug!(%err, "outline unavailable");
                Vec::new()
            }
        };
        if cancel.is_cancelled() {
            return;
        }

        let mut state = self.state.lock();
        if !state.is_current(epoch) {
            return;
        }
        let entries = outline.len();
        if let Some(session) = state.session.as_mut() {
            session.outline = outline;
        }
        self.emit(ReaderEvent::OutlineReady { entries });
    }

    fn close_locked(&self, state: &mut ControllerState) {
        state.cancel.cancel();
        state.timers.abort_all();

        if let Some(session) = state.session.take() {
            if !session.source_url.trim().is_empty() {
                let latest = state.latest;
                self.store
                    .write(&session.identity(), latest.page, latest.total_pages);
                self.emit(ReaderEvent::ProgressSaved {
                    page: latest.page,
                    total_pages: latest.total_pages,
                });
            }
            info!(source = %session.source_url, "reader session closed");
            self.emit(ReaderEvent::Closed {
                source_url: session.source_url,
            });
        }

        state.units.clear();
        state.tracker.reset();
        if let Some(document) = state.document.take() {
            document.destroy();
        }
        state.latest = LatestProgress::default();
        state.user_zoomed = false;
    }

    /// Coalesces saves: each call pushes the write out by the debounce
    /// interval, and the write uses whatever is latest when it fires.
    fn schedule_save(self: &Arc<Self>, state: &mut ControllerState) {
        let Some(session) = state.session.as_ref() else {
            return;
        };
        if session.source_url.trim().is_empty() {
            return;
        }

        let epoch = state.epoch;
        let delay = self.config.timing.save_debounce();
        let inner = Arc::clone(self);
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let state = inner.state.lock();
            if !state.is_current(epoch) {
                return;
            }
            let Some(session) = state.session.as_ref() else {
                return;
            };
            let latest = state.latest;
            inner
                .store
                .write(&session.identity(), latest.page, latest.total_pages);
            inner.emit(ReaderEvent::ProgressSaved {
                page: latest.page,
                total_pages: latest.total_pages,
            });
        });
        replace_timer(&mut state.timers.save, handle);
    }

    fn sync_units(&self, state: &mut ControllerState) {
        let Some(session) = state.session.as_ref() else {
            return;
        };
        let window = session.render_window(&self.config);
        let zoom = session.zoom;
        let pixel_ratio = clamp_pixel_ratio(self.host.device_pixel_ratio());
        let document = state.document.as_ref();
        for (page, unit) in state.units.iter_mut() {
            unit.update(
                &self.runtime,
                document,
                state.epoch,
                zoom,
                pixel_ratio,
                window.contains(*page),
            );
        }
    }

    fn spawn_scroll(
        self: Arc<Self>,
        epoch: u64,
        page: PageNumber,
        behavior: ScrollBehavior,
        retries: u32,
        settle: Option<std::time::Duration>,
    ) -> JoinHandle<()> {
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            if let Some(settle) = settle {
                tokio::time::sleep(settle).await;
            }
            let interval = self.config.timing.retry_interval();
            for attempt in 0..=retries {
                let current = self.state.lock().is_current(epoch);
                if !current {
                    return;
                }
                if self.host.scroll_to_page(page, behavior) {
                    debug!(page, attempt, "scrolled to page");
                    return;
                }
                tokio::time::sleep(interval).await;
            }
            debug!(page, retries, "page container never appeared, giving up");
        })
    }

    fn spawn_jump_expiry(self: Arc<Self>, epoch: u64, page: PageNumber) -> JoinHandle<()> {
        let delay = self.config.timing.jump_highlight();
        let runtime = self.runtime.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = self.state.lock();
            if !state.is_current(epoch) {
                return;
            }
            let Some(session) = state.session.as_mut() else {
                return;
            };
            if session.jump_target != Some(page) {
                return;
            }
            session.jump_target = None;
            self.emit(ReaderEvent::JumpExpired { page });
            self.sync_units(&mut state);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use crate::destination::{ExplicitDestination, PageRef};
    use crate::outline::OutlineEntry;
    use crate::page::PageStatus;
    use crate::progress::{legacy_progress_key, KeyValueStore, MemoryKeyValueStore};
    use crate::testing::{FakeBootstrap, FakeDocument, FakeEngine, FakeHost};

    const URL: &str = "https://audio.886.best/chinese-vocab-audio/hsk1.pdf";

    struct Harness {
        controller: ReaderController,
        engine: Arc<FakeEngine>,
        host: Arc<FakeHost>,
        kv: Arc<MemoryKeyValueStore>,
        store: ProgressStore,
    }

    fn harness_with(engine: FakeEngine, width: f32) -> Harness {
        let engine = Arc::new(engine);
        let loader = Arc::new(EngineLoader::new(Arc::new(FakeBootstrap(engine.clone()))));
        let kv = Arc::new(MemoryKeyValueStore::new());
        let store = ProgressStore::new(kv.clone(), "hsk-reader-meta");
        let host = Arc::new(FakeHost::new(width));
        let controller = ReaderController::new(
            loader,
            store.clone(),
            host.clone(),
            ReaderConfig::default(),
        )
        .unwrap();
        Harness {
            controller,
            engine,
            host,
            kv,
            store,
        }
    }

    fn harness(pages: usize) -> Harness {
        harness_with(FakeEngine::new(pages), 1280.0)
    }

    fn events(h: &Harness) -> Vec<ReaderEvent> {
        h.controller.events().lock().clone()
    }

    async fn open_b3(h: &Harness) {
        h.controller
            .open(URL, "HSK 1", Some("b3".to_string()))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn opens_on_first_page_without_history() {
        let h = harness(50);
        open_b3(&h).await;

        let session = h.controller.session().unwrap();
        assert_eq!(session.loading, LoadingState::Ready);
        assert_eq!(session.total_pages, 50);
        assert_eq!(session.current_page, 1);
        assert_eq!(session.zoom, 1.0);
        assert_eq!(session.layout, LayoutMode::Wide);
    }

    #[tokio::test(start_paused = true)]
    async fn restores_saved_page_and_scrolls_after_settling() {
        let h = harness(50);
        h.store.write(
            &DocumentIdentity {
                document_id: Some("b3".into()),
                source_url: URL.into(),
                title: "HSK 1".into(),
            },
            12,
            50,
        );
        h.host.missing_attempts.store(3, Ordering::SeqCst);

        open_b3(&h).await;
        assert_eq!(h.controller.session().unwrap().current_page, 12);
        assert!(h.host.scrolls.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(
            h.host.scrolls.lock().as_slice(),
            &[(12, ScrollBehavior::Instant)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn record_with_null_title_resumes_on_saved_page() {
        let h = harness(50);
        h.kv.set(
            "hsk-reader-meta_b3",
            r#"{"page":12,"numPages":50,"title":null}"#,
        )
        .unwrap();

        open_b3(&h).await;
        assert_eq!(h.controller.session().unwrap().current_page, 12);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let record = h.store.read("b3").unwrap();
        assert_eq!(record.page, 12);
        assert_eq!(record.title, "HSK 1");
    }

    #[tokio::test(start_paused = true)]
    async fn legacy_page_is_clamped_to_document() {
        let h = harness(30);
        h.kv.set(&legacy_progress_key(URL), "75").unwrap();

        open_b3(&h).await;
        assert_eq!(h.controller.session().unwrap().current_page, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn scroll_restoration_gives_up_after_bounded_retries() {
        let h = harness(5);
        h.host.missing_attempts.store(1000, Ordering::SeqCst);
        open_b3(&h).await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.host.scrolls.lock().is_empty());
        assert_eq!(h.host.missing_attempts.load(Ordering::SeqCst), 1000 - 21);
    }

    #[tokio::test(start_paused = true)]
    async fn narrow_viewport_fits_zoom_and_uses_small_window() {
        let h = harness_with(FakeEngine::new(20), 390.0);
        open_b3(&h).await;

        let session = h.controller.session().unwrap();
        assert_eq!(session.layout, LayoutMode::Narrow);
        assert!((session.zoom - 0.61).abs() < 1e-6);
        assert_eq!(h.controller.render_window().unwrap().pages(), vec![1, 2]);

        let (_, options) = h.engine.opened.lock()[0].clone();
        assert!(options.disable_auto_fetch);
    }

    #[tokio::test(start_paused = true)]
    async fn set_page_is_idempotent_and_debounced() {
        let h = harness(50);
        open_b3(&h).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        h.controller.events().lock().clear();

        for page in [2, 3, 3, 4, 5] {
            h.controller.set_page(page);
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(h.store.read("b3").map(|r| r.page) != Some(5));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.store.read("b3").unwrap().page, 5);

        let recorded = events(&h);
        let changes: Vec<_> = recorded
            .iter()
            .filter(|e| matches!(e, ReaderEvent::PageChanged { .. }))
            .collect();
        assert_eq!(changes.len(), 4);
        let saves: Vec<_> = recorded
            .iter()
            .filter(|e| matches!(e, ReaderEvent::ProgressSaved { .. }))
            .collect();
        assert_eq!(saves.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_flushes_latest_page_before_debounce() {
        let h = harness(50);
        open_b3(&h).await;
        h.controller.set_page(9);
        h.controller.close();

        let record = h.store.read("b3").unwrap();
        assert_eq!(record.page, 9);
        assert_eq!(record.total_pages, 50);
        assert!(h.controller.session().is_none());
        assert!(h.engine.document().destroyed.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let saves = events(&h)
            .into_iter()
            .filter(|e| matches!(e, ReaderEvent::ProgressSaved { .. }))
            .count();
        assert_eq!(saves, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_load_discards_the_result() {
        let (engine, gate) = FakeEngine::new(40).gated();
        let h = harness_with(engine, 1280.0);

        let controller = h.controller.clone();
        let pending = tokio::spawn(async move {
            controller.open(URL, "HSK 1", Some("b3".to_string())).await;
        });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        h.controller.close();
        let record_after_close = h.kv.get("hsk-reader-meta_b3").unwrap();
        let events_after_close = events(&h).len();

        gate.notify_one();
        pending.await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(h.controller.session().is_none());
        assert_eq!(h.kv.get("hsk-reader-meta_b3").unwrap(), record_after_close);
        assert_eq!(events(&h).len(), events_after_close);
        assert!(h.engine.document().destroyed.load(Ordering::SeqCst));
        assert!(h.controller.page(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reopening_invalidates_previous_session_callbacks() {
        let h = harness(50);
        open_b3(&h).await;
        h.controller.set_page(7);

        h.controller
            .open("https://example.com/other.pdf", "Other", Some("b1".to_string()))
            .await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(h.store.read("b3").unwrap().page, 7);
        assert_eq!(h.store.read("b1").unwrap().page, 1);
        assert_eq!(h.controller.session().unwrap().document_id.as_deref(), Some("b1"));
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_sets_error_state() {
        let engine = FakeEngine::new(10);
        engine.fail.store(true, Ordering::SeqCst);
        let h = harness_with(engine, 1280.0);
        open_b3(&h).await;

        let session = h.controller.session().unwrap();
        assert_eq!(session.loading, LoadingState::Failed);
        assert_eq!(
            session.error_message.as_deref(),
            Some(ReaderConfig::default().messages.load_failed.as_str())
        );
        assert!(h.controller.page(1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_source_fails_without_loading() {
        let h = harness(10);
        h.controller.open("", "Empty", Some("b4".to_string())).await;

        let session = h.controller.session().unwrap();
        assert_eq!(session.loading, LoadingState::Failed);
        assert_eq!(
            session.error_message.as_deref(),
            Some(ReaderConfig::default().messages.missing_source.as_str())
        );
        assert!(h.engine.opened.lock().is_empty());

        h.controller.close();
        assert!(h.kv.keys().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn jump_uses_url_fragment_and_expires_marker() {
        let h = harness(100);
        open_b3(&h).await;

        let unresolvable = Destination::Named("nowhere".into());
        let page = h
            .controller
            .jump_to(Some(&unresolvable), Some("doc.pdf#page=42"))
            .await;
        assert_eq!(page, Some(42));

        let session = h.controller.session().unwrap();
        assert_eq!(session.current_page, 42);
        assert_eq!(session.jump_target, Some(42));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h
            .host
            .scrolls
            .lock()
            .contains(&(42, ScrollBehavior::Smooth)));

        h.controller.set_page(30);
        let window = h.controller.render_window().unwrap();
        assert!(window.contains(42));
        assert!(!window.contains(20));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.controller.session().unwrap().jump_target, None);
        assert!(!h.controller.render_window().unwrap().contains(42));
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_jump_target_clears_marker() {
        let h = harness(100);
        open_b3(&h).await;
        h.controller.jump_to(None, Some("doc.pdf#page=60")).await;
        h.controller.set_page(58);
        h.controller.set_page(60);
        assert_eq!(h.controller.session().unwrap().jump_target, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_jump_is_a_no_op() {
        let h = harness(10);
        open_b3(&h).await;
        let empty = Destination::Explicit(ExplicitDestination { page: None });
        assert_eq!(h.controller.jump_to(Some(&empty), None).await, None);
        assert_eq!(h.controller.session().unwrap().current_page, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn jump_target_is_clamped() {
        let h = harness(10);
        open_b3(&h).await;
        let dest = Destination::Explicit(ExplicitDestination {
            page: Some(PageRef::Index(99)),
        });
        assert_eq!(h.controller.jump_to(Some(&dest), None).await, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn outline_is_flattened_and_failure_is_empty() {
        let outline = vec![OutlineEntry {
            title: Some("Lesson 1".into()),
            destination: None,
            url: None,
            children: vec![OutlineEntry {
                title: None,
                destination: None,
                url: None,
                children: vec![],
            }],
        }];
        let h = harness_with(
            FakeEngine::with_document(FakeDocument::new(5).with_outline(outline)),
            1280.0,
        );
        open_b3(&h).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let session = h.controller.session().unwrap();
        assert_eq!(session.outline.len(), 2);
        assert_eq!(session.outline[1].depth, 1);
        assert_eq!(session.outline[1].title, "Untitled");

        let failing = harness_with(
            FakeEngine::with_document(FakeDocument::new(5).with_outline_failure()),
            1280.0,
        );
        open_b3(&failing).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let session = failing.controller.session().unwrap();
        assert!(session.outline.is_empty());
        assert_eq!(session.loading, LoadingState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn zoom_is_clamped_and_disables_refit() {
        let h = harness_with(FakeEngine::new(10), 390.0);
        open_b3(&h).await;

        for _ in 0..40 {
            h.controller.zoom_in();
        }
        assert_eq!(h.controller.session().unwrap().zoom, 2.5);
        for _ in 0..40 {
            h.controller.zoom_out();
        }
        assert_eq!(h.controller.session().unwrap().zoom, 0.5);
        assert!(h.controller.is_user_zoomed());

        h.host.resize(500.0);
        h.controller.on_viewport_resize();
        assert_eq!(h.controller.session().unwrap().zoom, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn wide_zoom_tops_out_at_three() {
        let h = harness(10);
        open_b3(&h).await;
        for _ in 0..40 {
            h.controller.set_zoom(0.15);
        }
        assert_eq!(h.controller.session().unwrap().zoom, 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn resize_refits_until_user_zooms() {
        let h = harness_with(FakeEngine::new(10), 390.0);
        open_b3(&h).await;

        h.host.resize(624.0);
        h.controller.on_viewport_resize();
        let session = h.controller.session().unwrap();
        assert_eq!(session.zoom, 1.0);
        assert_eq!(session.layout, LayoutMode::Narrow);

        h.host.resize(1440.0);
        h.controller.on_viewport_resize();
        let session = h.controller.session().unwrap();
        assert_eq!(session.layout, LayoutMode::Wide);
        assert_eq!(session.zoom, 1.0);
        assert_eq!(h.controller.render_window().unwrap().radius, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn only_window_pages_hold_pixels() {
        let h = harness(40);
        open_b3(&h).await;
        h.controller.set_page(10);
        tokio::time::sleep(Duration::from_millis(100)).await;

        for page in 7..=13 {
            assert_eq!(h.controller.page(page).unwrap().status, PageStatus::Rendered);
        }
        assert_eq!(h.controller.page(6).unwrap().status, PageStatus::Idle);
        assert_eq!(h.controller.page(20).unwrap().status, PageStatus::Idle);
        assert!(h.controller.page(1).unwrap().surface.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn scroll_reports_drive_current_page() {
        let h = harness(10);
        open_b3(&h).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let offset = h.controller.page_offset(3).unwrap();
        h.controller.report_scroll(offset, 1000.0);
        assert_eq!(h.controller.session().unwrap().current_page, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn current_page_stays_in_range() {
        let h = harness(8);
        open_b3(&h).await;
        h.controller.set_page(0);
        h.controller.set_page(9);
        assert_eq!(h.controller.session().unwrap().current_page, 1);
        h.controller.set_page(8);
        assert_eq!(h.controller.session().unwrap().current_page, 8);
    }
}
