use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::config::ReaderConfig;
use crate::destination::{ExplicitDestination, PageRef};
use crate::error::EngineError;
use crate::outline::OutlineEntry;
use crate::window::LayoutMode;
use crate::{PageNumber, Surface, TextContent, Viewport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    pub range_chunk_size: usize,
    /// Fetch only what is needed for visible pages instead of the whole file.
    pub disable_auto_fetch: bool,
    pub use_system_fonts: bool,
    pub stop_at_errors: bool,
}

impl OpenOptions {
    /// Narrow viewports are usually on metered connections: smaller ranges,
    /// no background fetching.
    pub fn for_layout(layout: LayoutMode, config: &ReaderConfig) -> Self {
        let loading = &config.loading;
        let narrow = layout.is_narrow();
        Self {
            range_chunk_size: if narrow {
                loading.narrow_range_chunk_size
            } else {
                loading.wide_range_chunk_size
            },
            disable_auto_fetch: narrow,
            use_system_fonts: loading.use_system_fonts,
            stop_at_errors: loading.stop_at_errors,
        }
    }
}

#[async_trait]
pub trait RenderingEngine: Send + Sync {
    async fn open_document(
        &self,
        source: &str,
        options: &OpenOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn DocumentHandle>, EngineError>;
}

#[async_trait]
pub trait DocumentHandle: Send + Sync {
    fn page_count(&self) -> usize;

    async fn page(&self, number: PageNumber) -> Result<Arc<dyn PageHandle>, EngineError>;

    async fn outline(&self) -> Result<Vec<OutlineEntry>, EngineError>;

    async fn destination(&self, name: &str) -> Result<Option<ExplicitDestination>, EngineError>;

    /// Zero-based index of the referenced page.
    async fn page_index(&self, page: &PageRef) -> Result<usize, EngineError>;

    fn destroy(&self);
}

#[async_trait]
pub trait PageHandle: Send + Sync {
    fn viewport(&self, scale: f32) -> Viewport;

    /// Draws the page into `surface`, which was allocated for `viewport`.
    /// Returns `EngineError::Cancelled` when `cancel` fires mid-render.
    async fn render(
        &self,
        surface: &mut Surface,
        viewport: &Viewport,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError>;

    async fn text_content(&self) -> Result<TextContent, EngineError>;
}

#[async_trait]
pub trait EngineBootstrap: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn RenderingEngine>, EngineError>;
}

pub struct EngineLoader {
    bootstrap: Arc<dyn EngineBootstrap>,
    engine: OnceCell<Arc<dyn RenderingEngine>>,
}

impl EngineLoader {
    pub fn new(bootstrap: Arc<dyn EngineBootstrap>) -> Self {
        Self {
            bootstrap,
            engine: OnceCell::new(),
        }
    }

    pub async fn engine(&self) -> Result<Arc<dyn RenderingEngine>, EngineError> {
        let engine = self
            .engine
            .get_or_try_init(|| async {
                info!("bootstrapping rendering engine");
                self.bootstrap.load().await.inspect_err(|err| {
                    warn!(%err, "rendering engine bootstrap failed");
                })
            })
            .await?;
        Ok(Arc::clone(engine))
    }

    pub fn is_ready(&self) -> bool {
        self.engine.initialized()
    }
}
