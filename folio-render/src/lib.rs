use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use folio_core::{
    CancellationToken, Destination, DocumentHandle, EngineBootstrap, EngineError, EngineLoader,
    ExplicitDestination, OpenOptions, OutlineEntry, PageHandle, PageNumber, PageRef,
    RenderingEngine, Surface, TextContent, TextItem, Viewport,
};
use image::imageops::{self, FilterType};
use image::RgbaImage;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tracing::{debug, info, instrument, warn};

/// Where a document's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Remote(String),
    Local(PathBuf),
}

impl SourceKind {
    pub fn classify(source: &str) -> Self {
        let trimmed = source.trim();
        let lower = trimmed.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return SourceKind::Remote(trimmed.to_string());
        }
        let path = trimmed.strip_prefix("file://").unwrap_or(trimmed);
        // `#page=N` belongs to the link, not the file name.
        let path = path.split_once('#').map(|(path, _)| path).unwrap_or(path);
        SourceKind::Local(PathBuf::from(path))
    }
}

/// Binds the pdfium native library on first use.
pub struct PdfiumBootstrap {
    library_path: Option<PathBuf>,
}

impl PdfiumBootstrap {
    pub fn new(library_path: Option<PathBuf>) -> Self {
        Self { library_path }
    }
}

#[async_trait]
impl EngineBootstrap for PdfiumBootstrap {
    async fn load(&self) -> Result<Arc<dyn RenderingEngine>, EngineError> {
        let library_path = self.library_path.clone();
        let pdfium = tokio::task::spawn_blocking(move || bind_pdfium(library_path.as_deref()))
            .await
            .map_err(|err| EngineError::Unavailable(err.to_string()))?
            .map_err(|err| EngineError::Unavailable(format!("{err:#}")))?;
        let engine = PdfiumEngine::new(pdfium).map_err(EngineError::Backend)?;
        info!("pdfium engine ready");
        Ok(Arc::new(engine))
    }
}

static SHARED_LOADER: OnceCell<Arc<EngineLoader>> = OnceCell::new();

/// Process-wide loader. The library path of the first caller wins; every
/// reader in the process shares one bound engine.
pub fn shared_loader(library_path: Option<PathBuf>) -> Arc<EngineLoader> {
    let loader = SHARED_LOADER.get_or_init(|| {
        Arc::new(EngineLoader::new(Arc::new(PdfiumBootstrap::new(
            library_path,
        ))))
    });
    Arc::clone(loader)
}

pub struct PdfiumEngine {
    pdfium: Arc<Pdfium>,
    client: reqwest::Client,
}

impl PdfiumEngine {
    pub fn new(pdfium: Pdfium) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            pdfium: Arc::new(pdfium),
            client,
        })
    }
}

async fn fetch_remote(
    client: &reqwest::Client,
    url: &str,
    options: &OpenOptions,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, EngineError> {
    let mut response = client
        .get(url)
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|err| EngineError::Load(err.to_string()))?;

    let expected = response.content_length().unwrap_or(0) as usize;
    let mut bytes = Vec::with_capacity(expected.max(options.range_chunk_size));
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| EngineError::Load(err.to_string()))?
    {
        cancel.check()?;
        bytes.extend_from_slice(&chunk);
    }
    debug!(url, bytes = bytes.len(), "fetched document");
    Ok(bytes)
}

/// Reads the whole document into memory; pdfium parses from a buffer.
async fn fetch_source(
    client: &reqwest::Client,
    source: &str,
    options: &OpenOptions,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, EngineError> {
    match SourceKind::classify(source) {
        SourceKind::Remote(url) => fetch_remote(client, &url, options, cancel).await,
        SourceKind::Local(path) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
            .map_err(|err| EngineError::Load(format!("{err:#}"))),
    }
}

#[async_trait]
impl RenderingEngine for PdfiumEngine {
    #[instrument(skip(self, options, cancel))]
    async fn open_document(
        &self,
        source: &str,
        options: &OpenOptions,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn DocumentHandle>, EngineError> {
        debug!(
            chunk = options.range_chunk_size,
            disable_auto_fetch = options.disable_auto_fetch,
            "opening document"
        );
        let bytes = fetch_source(&self.client, source, options, cancel).await?;
        cancel.check()?;

        let pdfium = Arc::clone(&self.pdfium);
        let loaded = tokio::task::spawn_blocking(move || LoadedDocument::load(pdfium, bytes))
            .await
            .map_err(|err| EngineError::Load(err.to_string()))??;
        let page_count = accept_page_count(loaded.page_count()?, options.stop_at_errors)?;

        Ok(Arc::new(PdfiumDocument {
            inner: Arc::new(loaded),
            page_count,
        }))
    }
}

/// A parsed document pinned to the bindings it was loaded with.
struct LoadedDocument {
    document: Mutex<Option<PdfDocument<'static>>>,
    pdfium: Arc<Pdfium>,
}

impl LoadedDocument {
    fn load(pdfium: Arc<Pdfium>, bytes: Vec<u8>) -> Result<Self, EngineError> {
        let document = pdfium
            .load_pdf_from_byte_vec(bytes, None)
            .map_err(|err| EngineError::Load(err.to_string()))?;
        // SAFETY: the document borrows the bindings behind `pdfium`. Both live in
        // this struct and `document` is declared first, so it drops before the
        // Arc it borrows from. `close` only ever drops the document early.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        Ok(Self {
            document: Mutex::new(Some(document)),
            pdfium,
        })
    }

    fn with_document<R, F>(&self, f: F) -> Result<R, EngineError>
    where
        F: FnOnce(&PdfDocument<'static>) -> Result<R, EngineError>,
    {
        let guard = self.document.lock();
        match guard.as_ref() {
            Some(document) => f(document),
            None => Err(EngineError::Unavailable("document already closed".into())),
        }
    }

    fn page_count(&self) -> Result<usize, EngineError> {
        self.with_document(|document| Ok(usize::try_from(document.pages().len()).unwrap_or(0)))
    }

    fn close(&self) {
        if self.document.lock().take().is_some() {
            debug!(bindings = Arc::strong_count(&self.pdfium), "closed document");
        }
    }
}

fn accept_page_count(page_count: usize, stop_at_errors: bool) -> Result<usize, EngineError> {
    if stop_at_errors && page_count == 0 {
        return Err(EngineError::Load("document has no pages".into()));
    }
    Ok(page_count)
}

fn resolve_page_ref(page: &PageRef, page_count: usize) -> Result<usize, EngineError> {
    match page {
        PageRef::Index(index) if *index < page_count => Ok(*index),
        PageRef::Index(index) => Err(EngineError::PageOutOfRange(index + 1)),
        PageRef::Object { number, generation } => Err(EngineError::Unsupported(format!(
            "page reference {number} {generation} R"
        ))),
    }
}

fn page_index(number: PageNumber) -> Result<PdfPageIndex, EngineError> {
    number
        .checked_sub(1)
        .and_then(|index| PdfPageIndex::try_from(index).ok())
        .ok_or(EngineError::PageOutOfRange(number))
}

struct PdfiumDocument {
    inner: Arc<LoadedDocument>,
    page_count: usize,
}

#[async_trait]
impl DocumentHandle for PdfiumDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    async fn page(&self, number: PageNumber) -> Result<Arc<dyn PageHandle>, EngineError> {
        if number == 0 || number > self.page_count {
            return Err(EngineError::PageOutOfRange(number));
        }
        let index = page_index(number)?;
        let (width, height) = self.inner.with_document(|document| {
            let page = document
                .pages()
                .get(index)
                .map_err(|_| EngineError::PageOutOfRange(number))?;
            Ok((page.width().value, page.height().value))
        })?;
        Ok(Arc::new(PdfiumPage {
            document: Arc::clone(&self.inner),
            number,
            width,
            height,
        }))
    }

    async fn outline(&self) -> Result<Vec<OutlineEntry>, EngineError> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            inner.with_document(|document| {
                Ok(document
                    .bookmarks()
                    .root()
                    .map(collect_outline)
                    .unwrap_or_default())
            })
        })
        .await
        .map_err(|err| EngineError::Backend(anyhow!(err)))?
    }

    async fn destination(&self, name: &str) -> Result<Option<ExplicitDestination>, EngineError> {
        debug!(name, "named destinations are not exposed by pdfium bindings");
        Ok(None)
    }

    async fn page_index(&self, page: &PageRef) -> Result<usize, EngineError> {
        resolve_page_ref(page, self.page_count)
    }

    fn destroy(&self) {
        self.inner.close();
    }
}

/// Walks siblings iteratively and children recursively, mirroring the
/// bookmark tree.
fn collect_outline(first: PdfBookmark<'_>) -> Vec<OutlineEntry> {
    let mut entries = Vec::new();
    let mut current = Some(first);
    while let Some(bookmark) = current {
        let page_index = bookmark
            .destination()
            .and_then(|destination| destination.page_index().ok())
            .map(|index| index as usize);
        let uri = bookmark
            .action()
            .filter(|action| matches!(action.action_type(), PdfActionType::Uri))
            .and_then(|action| action.as_uri_action().and_then(|uri| uri.uri().ok()));
        let children = bookmark.first_child().map(collect_outline).unwrap_or_default();
        entries.push(outline_entry(bookmark.title(), page_index, uri, children));
        current = bookmark.next_sibling();
    }
    entries
}

fn outline_entry(
    title: Option<String>,
    page_index: Option<usize>,
    uri: Option<String>,
    children: Vec<OutlineEntry>,
) -> OutlineEntry {
    OutlineEntry {
        title,
        destination: page_index
            .map(|index| Destination::Explicit(ExplicitDestination::for_index(index))),
        url: uri.filter(|uri| !uri.trim().is_empty()),
        children,
    }
}

struct PdfiumPage {
    document: Arc<LoadedDocument>,
    number: PageNumber,
    width: f32,
    height: f32,
}

#[async_trait]
impl PageHandle for PdfiumPage {
    fn viewport(&self, scale: f32) -> Viewport {
        Viewport::from_page_size(self.width, self.height, scale)
    }

    /// pdfium cannot be interrupted mid-page; cancellation is honoured before
    /// and after the native call.
    async fn render(
        &self,
        surface: &mut Surface,
        _viewport: &Viewport,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        cancel.check()?;
        let document = Arc::clone(&self.document);
        let number = self.number;
        let (width, height) = (surface.width, surface.height);
        let image = tokio::task::spawn_blocking(move || {
            render_page(&document, number, width, height)
        })
        .await
        .map_err(|err| EngineError::Backend(anyhow!(err)))??;
        cancel.check()?;

        surface.pixels = fit_to_surface(image, width, height).into_raw();
        Ok(())
    }

    async fn text_content(&self) -> Result<TextContent, EngineError> {
        let document = Arc::clone(&self.document);
        let number = self.number;
        let page_height = self.height;
        tokio::task::spawn_blocking(move || extract_text(&document, number, page_height))
            .await
            .map_err(|err| EngineError::Backend(anyhow!(err)))?
    }
}

/// pdfium rounds the target size itself; the surface size is authoritative.
fn fit_to_surface(image: RgbaImage, width: u32, height: u32) -> RgbaImage {
    if image.dimensions() == (width, height) {
        image
    } else {
        imageops::resize(&image, width, height, FilterType::Triangle)
    }
}

fn render_page(
    document: &LoadedDocument,
    number: PageNumber,
    width: u32,
    height: u32,
) -> Result<RgbaImage, EngineError> {
    let index = page_index(number)?;
    let render_error = |message: String| EngineError::Render {
        page: number,
        message,
    };
    document.with_document(|document| {
        let page = document
            .pages()
            .get(index)
            .map_err(|_| EngineError::PageOutOfRange(number))?;
        let config = PdfRenderConfig::new()
            .set_target_width(i32::try_from(width).unwrap_or(i32::MAX))
            .set_maximum_height(i32::try_from(height).unwrap_or(i32::MAX));
        let bitmap = page
            .render_with_config(&config)
            .map_err(|err| render_error(err.to_string()))?;
        Ok(bitmap.as_image().to_rgba8())
    })
}

fn extract_text(
    document: &LoadedDocument,
    number: PageNumber,
    page_height: f32,
) -> Result<TextContent, EngineError> {
    let index = page_index(number)?;
    document.with_document(|document| {
        let page = document
            .pages()
            .get(index)
            .map_err(|_| EngineError::PageOutOfRange(number))?;
        let text = match page.text() {
            Ok(text) => text,
            Err(err) => {
                warn!(page = number, %err, "failed to extract page text");
                return Ok(TextContent::default());
            }
        };
        let items = text
            .segments()
            .iter()
            .map(|segment| {
                let bounds = segment.bounds();
                SegmentBounds {
                    left: bounds.left().value,
                    top: bounds.top().value,
                    right: bounds.right().value,
                    bottom: bounds.bottom().value,
                }
                .into_text_item(segment.text(), page_height)
            })
            .collect();
        Ok(TextContent { items })
    })
}

/// Segment bounds in PDF user space, origin at the bottom-left.
struct SegmentBounds {
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
}

impl SegmentBounds {
    fn into_text_item(self, text: String, page_height: f32) -> TextItem {
        TextItem {
            text,
            left: self.left,
            top: page_height - self.top,
            width: self.right - self.left,
            height: self.top - self.bottom,
        }
    }
}

fn bind_pdfium(configured: Option<&Path>) -> Result<Pdfium> {
    let mut errors = Vec::new();

    if let Some(path) = configured {
        let library = if path.is_dir() {
            Pdfium::pdfium_platform_library_name_at_path(path)
        } else {
            path.to_path_buf()
        };
        match Pdfium::bind_to_library(&library) {
            Ok(bindings) => return Ok(Pdfium::new(bindings)),
            Err(err) => {
                warn!(path = %library.display(), %err, "failed to load configured pdfium");
                errors.push(format!("{}: {}", library.display(), err));
            }
        }
    }

    let cwd_path = Pdfium::pdfium_platform_library_name_at_path("./");
    match Pdfium::bind_to_library(&cwd_path) {
        Ok(bindings) => return Ok(Pdfium::new(bindings)),
        Err(err) => errors.push(format!("{}: {}", cwd_path.display(), err)),
    }

    match Pdfium::bind_to_system_library() {
        Ok(bindings) => Ok(Pdfium::new(bindings)),
        Err(err) => {
            errors.push(format!("system: {err}"));
            Err(anyhow!(
                "failed to bind to a pdfium library; ensure it is installed ({})",
                errors.join(", ")
            ))
        }
    }
}
