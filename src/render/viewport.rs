//! Fitting the camera image into the render surface.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How the image is mapped onto the surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ScaleType {
    /// Stretch to fill the surface, ignoring aspect ratio
    FitXy,
    /// Fit inside the surface, aligned to the top-left
    FitStart,
    /// Fit inside the surface, centered
    FitCenter,
    /// Fit inside the surface, aligned to the bottom-right
    FitEnd,
    /// Fill the surface and crop the overflowing dimension
    #[default]
    CenterCrop,
}

/// Image placement in surface pixels, origin at the top-left.
///
/// May extend past the surface (center-crop), so offsets are signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewportRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl ViewportRect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Intersects with the surface and derives the texture window that keeps
    /// the visible part of the image where the full rect would put it.
    pub fn clip_to(&self, surface_width: u32, surface_height: u32) -> Option<ClippedViewport> {
        if self.width <= 0 || self.height <= 0 {
            return None;
        }
        let left = self.x.max(0);
        let top = self.y.max(0);
        let right = self.right().min(surface_width as i32);
        let bottom = self.bottom().min(surface_height as i32);
        if right <= left || bottom <= top {
            return None;
        }

        let (w, h) = (self.width as f32, self.height as f32);
        Some(ClippedViewport {
            x: left as u32,
            y: top as u32,
            width: (right - left) as u32,
            height: (bottom - top) as u32,
            uv_offset: [(left - self.x) as f32 / w, (top - self.y) as f32 / h],
            uv_scale: [(right - left) as f32 / w, (bottom - top) as f32 / h],
        })
    }
}

/// The part of a [`ViewportRect`] inside the surface.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClippedViewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Texture coordinate of the clipped rect's top-left corner
    pub uv_offset: [f32; 2],
    /// Texture extent covered by the clipped rect
    pub uv_scale: [f32; 2],
}

impl ClippedViewport {
    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

/// Places an `image_width` x `image_height` image on the surface under `policy`.
///
/// Aspect ratios are compared by cross-multiplication so equal ratios fit
/// exactly; derived dimensions are truncated.
pub fn fit(image_width: u32, image_height: u32, surface_width: u32, surface_height: u32, policy: ScaleType) -> ViewportRect {
    let (sw, sh) = (surface_width as i32, surface_height as i32);
    if image_width == 0 || image_height == 0 || policy == ScaleType::FitXy {
        return ViewportRect::new(0, 0, sw, sh);
    }

    let (iw, ih) = (u64::from(image_width), u64::from(image_height));
    let (sw64, sh64) = (u64::from(surface_width), u64::from(surface_height));
    // iw/ih < sw/sh
    let image_narrower = iw * sh64 < sw64 * ih;
    match policy {
        ScaleType::CenterCrop => {
            let (width, height) = if image_narrower {
                (sw, (sw64 * ih / iw) as i32)
            } else {
                ((sh64 * iw / ih) as i32, sh)
            };
            ViewportRect::new((sw - width) / 2, (sh - height) / 2, width, height)
        }
        ScaleType::FitStart | ScaleType::FitCenter | ScaleType::FitEnd => {
            let (width, height) = if image_narrower {
                ((sh64 * iw / ih) as i32, sh)
            } else {
                (sw, (sw64 * ih / iw) as i32)
            };
            let (x, y) = match policy {
                ScaleType::FitStart => (0, 0),
                ScaleType::FitEnd => (sw - width, sh - height),
                _ => ((sw - width) / 2, (sh - height) / 2),
            };
            ViewportRect::new(x, y, width, height)
        }
        ScaleType::FitXy => ViewportRect::new(0, 0, sw, sh),
    }
}

/// Memoizes the fitted rectangle so GPU viewport state is only reissued on change.
#[derive(Debug, Default)]
pub struct ViewportFitter {
    last: Option<ViewportRect>,
    updates: u64,
}

impl ViewportFitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new rectangle when it differs from the previous one.
    pub fn update(
        &mut self,
        image_width: u32,
        image_height: u32,
        surface_width: u32,
        surface_height: u32,
        policy: ScaleType,
    ) -> Option<ViewportRect> {
        let rect = fit(image_width, image_height, surface_width, surface_height, policy);
        if self.last == Some(rect) {
            return None;
        }
        debug!(?rect, ?policy, image_width, image_height, surface_width, surface_height, "Viewport changed");
        self.last = Some(rect);
        self.updates += 1;
        Some(rect)
    }

    pub fn current(&self) -> Option<ViewportRect> {
        self.last
    }

    /// Number of times a changed rectangle was reported.
    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Forgets the last rectangle, e.g. after the GPU context was recreated.
    pub fn invalidate(&mut self) {
        self.last = None;
    }
}
