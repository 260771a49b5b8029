/// Distance from the content bottom within which new arrivals keep the view pinned.
pub const DEFAULT_AUTOSCROLL_THRESHOLD: f64 = 100.0;

/// Scroll geometry in layout units. `scroll_offset` is the distance of the viewport top
/// from the content top.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub scroll_offset: f64,
    pub viewport_height: f64,
    pub content_height: f64,
}

impl Viewport {
    /// Gap between the last visible pixel and the content bottom, never negative.
    pub fn distance_from_bottom(&self) -> f64 {
        (self.content_height - self.scroll_offset - self.viewport_height).max(0.0)
    }
}

/// Why the content height changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentChange {
    /// Newer messages materialized at the bottom.
    NewArrivals,
    /// Older history was prepended at the top.
    OlderHistory,
}

/// Decides whether to jump to the bottom, given the geometry sampled before the change.
pub fn should_autoscroll(before: Viewport, has_painted: bool, threshold: f64) -> bool {
    if !has_painted {
        return true;
    }
    before.distance_from_bottom() <= threshold
}

/// Tracks first paint per open scope and applies [`should_autoscroll`] to later changes.
#[derive(Debug, Clone)]
pub struct AutoscrollController {
    has_painted: bool,
    threshold: f64,
}

impl Default for AutoscrollController {
    fn default() -> Self {
        Self::new(DEFAULT_AUTOSCROLL_THRESHOLD)
    }
}

impl AutoscrollController {
    pub fn new(threshold: f64) -> Self {
        Self {
            has_painted: false,
            threshold,
        }
    }

    pub fn has_painted(&self) -> bool {
        self.has_painted
    }

    /// Reports the first completed paint. Returns true only the first time.
    pub fn on_first_paint(&mut self) -> bool {
        let first = !self.has_painted;
        self.has_painted = true;
        first
    }

    pub fn on_content_change(&self, before: Viewport, change: ContentChange) -> bool {
        match change {
            ContentChange::OlderHistory => false,
            ContentChange::NewArrivals => should_autoscroll(before, self.has_painted, self.threshold),
        }
    }

    /// Back to the state of a freshly opened scope.
    pub fn reset(&mut self) {
        self.has_painted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_distance(distance: f64) -> Viewport {
        Viewport {
            scroll_offset: 1_000.0 - 400.0 - distance,
            viewport_height: 400.0,
            content_height: 1_000.0,
        }
    }

    #[test]
    fn threshold_is_inclusive() {
        assert!(should_autoscroll(at_distance(0.0), true, DEFAULT_AUTOSCROLL_THRESHOLD));
        assert!(should_autoscroll(at_distance(100.0), true, DEFAULT_AUTOSCROLL_THRESHOLD));
        assert!(!should_autoscroll(at_distance(101.0), true, DEFAULT_AUTOSCROLL_THRESHOLD));
    }

    #[test]
    fn first_paint_always_scrolls() {
        assert!(should_autoscroll(at_distance(500.0), false, DEFAULT_AUTOSCROLL_THRESHOLD));

        let mut controller = AutoscrollController::default();
        assert!(controller.on_content_change(at_distance(500.0), ContentChange::NewArrivals));
        assert!(controller.on_first_paint());
        assert!(!controller.on_first_paint());
        assert!(!controller.on_content_change(at_distance(500.0), ContentChange::NewArrivals));
    }

    #[test]
    fn older_history_never_scrolls() {
        let mut controller = AutoscrollController::default();
        controller.on_first_paint();
        assert!(!controller.on_content_change(at_distance(0.0), ContentChange::OlderHistory));
        assert!(controller.on_content_change(at_distance(40.0), ContentChange::NewArrivals));

        controller.reset();
        assert!(!controller.has_painted());
    }

    #[test]
    fn short_content_counts_as_bottom() {
        let viewport = Viewport {
            scroll_offset: 0.0,
            viewport_height: 800.0,
            content_height: 200.0,
        };
        assert_eq!(viewport.distance_from_bottom(), 0.0);
    }
}
