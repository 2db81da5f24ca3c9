use std::collections::BTreeSet;

use crate::PageNumber;

/// Horizontal band of the viewport treated as the reading focal point,
/// expressed as insets from the top and bottom edges.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusBand {
    pub top_inset: f32,
    pub bottom_inset: f32,
}

impl Default for FocusBand {
    fn default() -> Self {
        Self {
            top_inset: 0.45,
            bottom_inset: 0.45,
        }
    }
}

impl FocusBand {
    pub fn bounds(&self, scroll_top: f32, viewport_height: f32) -> (f32, f32) {
        let top = scroll_top + viewport_height * self.top_inset;
        let bottom = scroll_top + viewport_height * (1.0 - self.bottom_inset);
        (top, bottom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PageGeometry {
    page: PageNumber,
    top: f32,
    height: f32,
}

impl PageGeometry {
    fn intersects(&self, band_top: f32, band_bottom: f32) -> bool {
        self.top < band_bottom && self.top + self.height > band_top
    }
}

/// Reports pages as they start crossing the focus band. Does not debounce;
/// a fast fling produces one report per page passed.
#[derive(Debug, Default)]
pub struct PageVisibilityTracker {
    band: FocusBand,
    layout: Vec<PageGeometry>,
    intersecting: BTreeSet<PageNumber>,
}

impl PageVisibilityTracker {
    pub fn new(band: FocusBand) -> Self {
        Self {
            band,
            layout: Vec::new(),
            intersecting: BTreeSet::new(),
        }
    }

    /// Stacks containers top to bottom, page 1 first, `gap` apart.
    pub fn set_layout<I>(&mut self, heights: I, gap: f32)
    where
        I: IntoIterator<Item = f32>,
    {
        let mut top = 0.0;
        self.layout = heights
            .into_iter()
            .enumerate()
            .map(|(idx, height)| {
                let geometry = PageGeometry {
                    page: idx + 1,
                    top,
                    height,
                };
                top += height + gap;
                geometry
            })
            .collect();
        let known = self.layout.len();
        self.intersecting.retain(|page| *page <= known);
    }

    pub fn offset_of(&self, page: PageNumber) -> Option<f32> {
        self.layout.get(page.checked_sub(1)?).map(|g| g.top)
    }

    pub fn observe(&mut self, scroll_top: f32, viewport_height: f32) -> Vec<PageNumber> {
        let (band_top, band_bottom) = self.band.bounds(scroll_top, viewport_height);
        let now: BTreeSet<PageNumber> = self
            .layout
            .iter()
            .filter(|g| g.intersects(band_top, band_bottom))
            .map(|g| g.page)
            .collect();
        let entered = now.difference(&self.intersecting).copied().collect();
        self.intersecting = now;
        entered
    }

    pub fn reset(&mut self) {
        self.layout.clear();
        self.intersecting.clear();
    }
}
