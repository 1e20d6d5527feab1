// src/timing.rs
//! Dwell-time computation. Everything here is pure: same inputs, same timings.
use crate::types::{ContentType, ManifestItem};
use std::collections::HashMap;

/// Used when an item carries no authored duration.
pub const DEFAULT_ITEM_SECONDS: f64 = 10.0;

/// Item id -> rendered pixel height, for content only measurable after paint.
pub type MeasuredHeights = HashMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub width: f64,
    pub height: f64,
}

impl Viewport {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: f64::from(width),
            height: f64::from(height),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingConfig {
    pub scroll_pixels_per_second: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Leave the item when its dwell timer fires.
    Timer,
    /// Leave the item when the player reports end of media.
    MediaEnd,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeTiming {
    pub item_id: String,
    pub dwell_seconds: f64,
    pub overflow_extra_seconds: f64,
    pub overflow_px: f64,
    pub advance: Advance,
}

/// Linear upward pan that ends exactly when the dwell does.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPlan {
    pub distance_px: f64,
    pub duration_seconds: f64,
}

impl RuntimeTiming {
    pub fn scroll_plan(&self) -> Option<ScrollPlan> {
        (self.overflow_px > 0.0 && self.overflow_extra_seconds > 0.0).then_some(ScrollPlan {
            distance_px: self.overflow_px,
            duration_seconds: self.overflow_extra_seconds,
        })
    }
}

pub fn build_runtime_timings(
    items: &[ManifestItem],
    viewport: Viewport,
    config: TimingConfig,
    measured: &MeasuredHeights,
) -> Vec<RuntimeTiming> {
    items
        .iter()
        .map(|item| item_timing(item, viewport, config, measured))
        .collect()
}

fn item_timing(
    item: &ManifestItem,
    viewport: Viewport,
    config: TimingConfig,
    measured: &MeasuredHeights,
) -> RuntimeTiming {
    if item.content.kind == ContentType::Video {
        return RuntimeTiming {
            item_id: item.id.clone(),
            dwell_seconds: item
                .content
                .duration
                .or(item.duration)
                .unwrap_or(0.0)
                .max(0.0),
            overflow_extra_seconds: 0.0,
            overflow_px: 0.0,
            advance: Advance::MediaEnd,
        };
    }

    let base = item.duration.unwrap_or(DEFAULT_ITEM_SECONDS).max(0.0);
    let scaled_height = measured
        .get(&item.id)
        .copied()
        .unwrap_or_else(|| estimated_height(item, viewport));
    let overflow = (scaled_height - viewport.height).max(0.0);
    let extra = if overflow > 0.0 && config.scroll_pixels_per_second > 0.0 {
        overflow / config.scroll_pixels_per_second
    } else {
        0.0
    };

    RuntimeTiming {
        item_id: item.id.clone(),
        dwell_seconds: base + extra,
        overflow_extra_seconds: extra,
        overflow_px: if extra > 0.0 { overflow } else { 0.0 },
        advance: Advance::Timer,
    }
}

/// Height after scaling to viewport width. PDFs report 0 until measured.
fn estimated_height(item: &ManifestItem, viewport: Viewport) -> f64 {
    if item.content.kind == ContentType::Pdf {
        return 0.0;
    }
    match (item.content.width, item.content.height) {
        (Some(w), Some(h)) if w > 0 => viewport.width / f64::from(w) * f64::from(h),
        _ => 0.0,
    }
}
