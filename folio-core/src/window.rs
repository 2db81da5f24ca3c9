use crate::config::LayoutConfig;
use crate::PageNumber;

/// Horizontal padding subtracted from the viewport before fitting a page.
const FIT_PADDING: f32 = 24.0;
const FIT_PAGE_WIDTH: f32 = 600.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMode {
    Narrow,
    Wide,
}

impl LayoutMode {
    pub fn classify(viewport_width: f32, breakpoint: f32) -> Self {
        if viewport_width < breakpoint {
            LayoutMode::Narrow
        } else {
            LayoutMode::Wide
        }
    }

    pub fn is_narrow(self) -> bool {
        matches!(self, LayoutMode::Narrow)
    }

    pub fn window_radius(self, layout: &LayoutConfig) -> usize {
        match self {
            LayoutMode::Narrow => layout.narrow_window_radius,
            LayoutMode::Wide => layout.wide_window_radius,
        }
    }

    pub fn zoom_limits(self, layout: &LayoutConfig) -> ZoomLimits {
        let max = match self {
            LayoutMode::Narrow => layout.narrow_max_zoom,
            LayoutMode::Wide => layout.wide_max_zoom,
        };
        ZoomLimits {
            min: layout.min_zoom,
            max,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZoomLimits {
    pub min: f32,
    pub max: f32,
}

pub fn fit_scale(viewport_width: f32) -> f32 {
    if !viewport_width.is_finite() {
        return 1.0;
    }
    ((viewport_width - FIT_PADDING) / FIT_PAGE_WIDTH).clamp(0.6, 1.2)
}

/// Applies a signed zoom increment, rounded to two decimals so repeated steps
/// do not accumulate float noise.
pub fn step_zoom(current: f32, delta: f32, limits: ZoomLimits) -> f32 {
    let next = ((current + delta) * 100.0).round() / 100.0;
    next.clamp(limits.min, limits.max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderWindow {
    pub current: PageNumber,
    pub radius: usize,
    pub jump_target: Option<PageNumber>,
    pub total_pages: usize,
}

impl RenderWindow {
    pub fn contains(&self, page: PageNumber) -> bool {
        if page == 0 || page > self.total_pages {
            return false;
        }
        page.abs_diff(self.current) <= self.radius || self.jump_target == Some(page)
    }

    pub fn pages(&self) -> Vec<PageNumber> {
        if self.total_pages == 0 {
            return Vec::new();
        }
        let start = self.current.saturating_sub(self.radius).max(1);
        let end = self.current.saturating_add(self.radius).min(self.total_pages);
        let mut pages: Vec<PageNumber> = (start..=end).collect();
        if let Some(target) = self.jump_target {
            if (1..=self.total_pages).contains(&target) && !pages.contains(&target) {
                pages.push(target);
                pages.sort_unstable();
            }
        }
        pages
    }
}
