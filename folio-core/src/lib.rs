mod cancel;
pub mod config;
mod destination;
mod engine;
mod error;
mod outline;
mod page;
mod progress;
mod session;
mod visibility;
mod window;

#[cfg(test)]
mod testing;

pub use cancel::CancellationToken;
pub use config::ReaderConfig;
pub use destination::{
    parse_page_fragment, Destination, DestinationResolver, ExplicitDestination,
    ExplicitDestinationStrategy, JumpRequest, NamedDestinationStrategy, PageRef, ResolveStrategy,
    UrlFragmentStrategy,
};
pub use engine::{
    DocumentHandle, EngineBootstrap, EngineLoader, OpenOptions, PageHandle, RenderingEngine,
};
pub use error::{EngineError, StoreError};
pub use outline::{flatten_outline, OutlineEntry, OutlineNode, UNTITLED_OUTLINE_TITLE};
pub use page::{Footprint, PageRenderUnit, PageSnapshot, PageStatus};
pub use progress::{
    legacy_progress_key, DocumentIdentity, FileKeyValueStore, KeyValueStore, MemoryKeyValueStore,
    ProgressRecord, ProgressStore,
};
pub use session::{
    DocumentSession, LoadingState, ReaderController, ReaderEvent, ReaderHost, ScrollBehavior,
};
pub use visibility::{FocusBand, PageVisibilityTracker};
pub use window::{fit_scale, step_zoom, LayoutMode, RenderWindow, ZoomLimits};

/// One-based page number, matching how readers and `#page=N` fragments count.
pub type PageNumber = usize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
    pub scale: f32,
}

impl Viewport {
    pub fn from_page_size(page_width: f32, page_height: f32, scale: f32) -> Self {
        Self {
            width: page_width * scale,
            height: page_height * scale,
            scale,
        }
    }
}

/// Device pixel ratio used for surfaces, bounded to keep memory in check on
/// dense displays.
pub fn clamp_pixel_ratio(ratio: f32) -> f32 {
    if !ratio.is_finite() {
        return 1.0;
    }
    ratio.clamp(1.0, 2.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub pixel_ratio: f32,
    pub pixels: Vec<u8>,
}

impl Surface {
    pub fn allocate(viewport: &Viewport, pixel_ratio: f32) -> Self {
        let pixel_ratio = clamp_pixel_ratio(pixel_ratio);
        let width = device_pixels(viewport.width, pixel_ratio);
        let height = device_pixels(viewport.height, pixel_ratio);
        Self {
            width,
            height,
            pixel_ratio,
            pixels: vec![255; width as usize * height as usize * 4],
        }
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

fn device_pixels(css: f32, pixel_ratio: f32) -> u32 {
    let scaled = (css * pixel_ratio).floor();
    if !scaled.is_finite() || scaled < 1.0 {
        1
    } else if scaled > u32::MAX as f32 {
        u32::MAX
    } else {
        scaled as u32
    }
}

/// A run of text reported by the engine, in unscaled page units with a
/// top-left origin.
#[derive(Debug, Clone, PartialEq)]
pub struct TextItem {
    pub text: String,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextContent {
    pub items: Vec<TextItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextSpan {
    pub text: String,
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

/// Invisible, selectable text positioned over a rendered surface. Sized in
/// CSS pixels so it lines up with the surface's display size.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextLayer {
    pub width: f32,
    pub height: f32,
    pub spans: Vec<TextSpan>,
}

impl TextLayer {
    pub fn build(content: &TextContent, viewport: &Viewport) -> Self {
        let scale = viewport.scale;
        let spans = content
            .items
            .iter()
            .filter(|item| !item.text.is_empty())
            .map(|item| TextSpan {
                text: item.text.clone(),
                left: item.left * scale,
                top: item.top * scale,
                width: item.width * scale,
                height: item.height * scale,
            })
            .collect();
        Self {
            width: viewport.width,
            height: viewport.height,
            spans,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}
