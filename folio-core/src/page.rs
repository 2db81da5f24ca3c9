use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::engine::DocumentHandle;
use crate::error::EngineError;
use crate::{clamp_pixel_ratio, PageNumber, Surface, TextLayer, Viewport};

/// Height a page container keeps while it holds no pixels.
pub const PLACEHOLDER_HEIGHT: f32 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Idle,
    Loading,
    Rendered,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Footprint {
    Placeholder,
    Sized { width: f32, height: f32 },
}

impl Footprint {
    pub fn height(&self) -> f32 {
        match self {
            Footprint::Placeholder => PLACEHOLDER_HEIGHT,
            Footprint::Sized { height, .. } => height.max(PLACEHOLDER_HEIGHT),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageSnapshot {
    pub page: PageNumber,
    pub status: PageStatus,
    pub surface: Option<Arc<Surface>>,
    pub text_layer: Arc<TextLayer>,
    pub footprint: Footprint,
}

#[derive(Debug)]
struct UnitState {
    status: PageStatus,
    surface: Option<Arc<Surface>>,
    text_layer: Arc<TextLayer>,
    footprint: Footprint,
}

impl Default for UnitState {
    fn default() -> Self {
        Self {
            status: PageStatus::Idle,
            surface: None,
            text_layer: Arc::new(TextLayer::default()),
            footprint: Footprint::Placeholder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RenderParams {
    scale: f32,
    pixel_ratio: f32,
    epoch: u64,
}

struct ActiveRender {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveRender {
    fn stop(self) -> JoinHandle<()> {
        self.cancel.cancel();
        self.handle.abort();
        self.handle
    }
}

/// Draws one page while it is inside the render window and lets go of its
/// pixels as soon as it leaves. A parameter change cancels the running render
/// and waits for it to unwind before the replacement starts drawing.
pub struct PageRenderUnit {
    page: PageNumber,
    shared: Arc<Mutex<UnitState>>,
    active: Option<ActiveRender>,
    params: Option<RenderParams>,
}

impl PageRenderUnit {
    pub fn new(page: PageNumber) -> Self {
        Self {
            page,
            shared: Arc::new(Mutex::new(UnitState::default())),
            active: None,
            params: None,
        }
    }

    pub fn snapshot(&self) -> PageSnapshot {
        let state = self.shared.lock();
        PageSnapshot {
            page: self.page,
            status: state.status,
            surface: state.surface.clone(),
            text_layer: Arc::clone(&state.text_layer),
            footprint: state.footprint,
        }
    }

    pub fn status(&self) -> PageStatus {
        self.shared.lock().status
    }

    pub fn footprint(&self) -> Footprint {
        self.shared.lock().footprint
    }

    /// Applies the windowing decision. `epoch` identifies the document the
    /// handle belongs to so a reopened document always re-renders.
    pub fn update(
        &mut self,
        runtime: &Handle,
        document: Option<&Arc<dyn DocumentHandle>>,
        epoch: u64,
        scale: f32,
        pixel_ratio: f32,
        should_render: bool,
    ) {
        let document = match document {
            Some(document) if should_render => document,
            _ => {
                self.release();
                return;
            }
        };

        let params = RenderParams {
            scale,
            pixel_ratio: clamp_pixel_ratio(pixel_ratio),
            epoch,
        };
        if self.params == Some(params) {
            return;
        }
        self.params = Some(params);

        let previous = self.active.take().map(ActiveRender::stop);
        let cancel = CancellationToken::new();
        let task = render_task(
            self.page,
            Arc::clone(document),
            params,
            cancel.clone(),
            Arc::clone(&self.shared),
            previous,
        );
        {
            let mut state = self.shared.lock();
            state.status = PageStatus::Loading;
        }
        let handle = runtime.spawn(task);
        self.active = Some(ActiveRender { cancel, handle });
    }

    pub fn release(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.stop();
        }
        self.params = None;
        let mut state = self.shared.lock();
        if state.status != PageStatus::Idle || state.surface.is_some() {
            debug!(page = self.page, "releasing page surface");
        }
        *state = UnitState::default();
    }
}

impl Drop for PageRenderUnit {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.stop();
        }
    }
}

struct RenderedPage {
    surface: Surface,
    text_layer: TextLayer,
    viewport: Viewport,
}

async fn render_task(
    page: PageNumber,
    document: Arc<dyn DocumentHandle>,
    params: RenderParams,
    cancel: CancellationToken,
    shared: Arc<Mutex<UnitState>>,
    previous: Option<JoinHandle<()>>,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    if cancel.is_cancelled() {
        return;
    }

    let outcome = draw_page(page, document.as_ref(), params, &cancel).await;

    let mut state = shared.lock();
    if cancel.is_cancelled() {
        return;
    }
    match outcome {
        Ok(rendered) => {
            state.footprint = Footprint::Sized {
                width: rendered.viewport.width,
                height: rendered.viewport.height,
            };
            state.surface = Some(Arc::new(rendered.surface));
            state.text_layer = Arc::new(rendered.text_layer);
            state.status = PageStatus::Rendered;
        }
        Err(err) if err.is_cancelled() => {}
        Err(err) => {
            warn!(page, %err, "page render failed");
            state.surface = None;
            state.text_layer = Arc::new(TextLayer::default());
            state.status = PageStatus::Error;
        }
    }
}

async fn draw_page(
    page: PageNumber,
    document: &dyn DocumentHandle,
    params: RenderParams,
    cancel: &CancellationToken,
) -> Result<RenderedPage, EngineError> {
    let handle = document.page(page).await?;
    cancel.check()?;

    let viewport = handle.viewport(params.scale);
    let mut surface = Surface::allocate(&viewport, params.pixel_ratio);
    handle.render(&mut surface, &viewport, cancel).await?;
    cancel.check()?;

    let content = handle.text_content().await?;
    cancel.check()?;
    let text_layer = TextLayer::build(&content, &viewport);

    Ok(RenderedPage {
        surface,
        text_layer,
        viewport,
    })
}
