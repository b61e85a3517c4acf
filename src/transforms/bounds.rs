//! Content bounds detection and smart margins

use image::{GrayImage, RgbaImage};

/// Alpha value a column or row must exceed to count as content
pub const CONTENT_ALPHA_THRESHOLD: u8 = 5;

/// Rectangle with inclusive `left`/`top` and exclusive `right`/`bottom`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentBounds {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl ContentBounds {
    #[must_use]
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Per-side margins in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Margins {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

/// Scan each side independently for the first column/row whose maximum exceeds
/// `threshold`. Returns inclusive bounds, or `None` when nothing exceeds it.
fn scan_content<F>(width: u32, height: u32, threshold: u8, value_at: F) -> Option<(u32, u32, u32, u32)>
where
    F: Fn(u32, u32) -> u8,
{
    let column_has_content = |x: u32| (0..height).any(|y| value_at(x, y) > threshold);
    let row_has_content = |y: u32| (0..width).any(|x| value_at(x, y) > threshold);

    let left = (0..width).find(|&x| column_has_content(x))?;
    let right = (0..width).rev().find(|&x| column_has_content(x))?;
    let top = (0..height).find(|&y| row_has_content(y))?;
    let bottom = (0..height).rev().find(|&y| row_has_content(y))?;
    Some((left, top, right, bottom))
}

/// Bounds of the visible content of an RGBA image
///
/// A fully transparent image yields full-frame bounds; it is valid input, not an
/// error. A single opaque pixel yields a 1x1 rectangle.
#[must_use]
pub fn detect_content_bounds(image: &RgbaImage) -> ContentBounds {
    let (width, height) = image.dimensions();
    match scan_content(width, height, CONTENT_ALPHA_THRESHOLD, |x, y| {
        image.get_pixel(x, y).0[3]
    }) {
        Some((left, top, right, bottom)) => ContentBounds {
            left,
            top,
            right: right + 1,
            bottom: bottom + 1,
        },
        None => {
            tracing::debug!(width, height, "no content detected, using full frame");
            ContentBounds::full_frame(width, height)
        },
    }
}

/// Crop rectangle around mask content, widened by `margin` and clamped to the frame
///
/// Returns `None` when no pixel exceeds `detection_threshold`.
///
/// # Examples
///
/// ```rust
/// use cutout_pipeline::transforms::crop_bounds;
/// use image::{GrayImage, Luma};
///
/// let mut mask = GrayImage::new(100, 100);
/// for y in 45..55 {
///     for x in 45..55 {
///         mask.put_pixel(x, y, Luma([255]));
///     }
/// }
/// let bounds = crop_bounds(&mask, 5, 0).unwrap();
/// assert_eq!((bounds.left, bounds.top, bounds.right, bounds.bottom), (45, 45, 55, 55));
/// ```
#[must_use]
pub fn crop_bounds(mask: &GrayImage, detection_threshold: u8, margin: u32) -> Option<ContentBounds> {
    let (width, height) = mask.dimensions();
    let (left, top, right, bottom) =
        scan_content(width, height, detection_threshold, |x, y| mask.get_pixel(x, y).0[0])?;
    Some(ContentBounds {
        left: left.saturating_sub(margin),
        top: top.saturating_sub(margin),
        right: (right + 1).saturating_add(margin).min(width),
        bottom: (bottom + 1).saturating_add(margin).min(height),
    })
}

/// Clamp the requested margin per side to the space outside the content
///
/// Each side gets `min(requested, available)`, where available space is measured
/// between the content bounds and the image edge on that side.
#[must_use]
pub fn compute_smart_margins(bounds: ContentBounds, image_size: (u32, u32), requested: u32) -> Margins {
    let (width, height) = image_size;
    let margins = Margins {
        left: requested.min(bounds.left),
        top: requested.min(bounds.top),
        right: requested.min(width.saturating_sub(bounds.right)),
        bottom: requested.min(height.saturating_sub(bounds.bottom)),
    };
    tracing::debug!(?margins, requested, "smart margins");
    margins
}
