//! Edge-refined alpha compositing

use super::bounds::{compute_smart_margins, detect_content_bounds};
use super::levels::{apply_levels_lut, levels_lut, LevelsParams};
use image::imageops::{self, FilterType};
use image::{GrayImage, Rgb, RgbImage, Rgba, RgbaImage};

/// Extract the alpha channel and remap it with the edge-refinement levels
///
/// Alpha below 20 becomes fully transparent and alpha above 235 fully opaque, which
/// drops the residual fringe colour left on feathered edges.
#[must_use]
pub fn refine_edge_alpha(foreground: &RgbaImage) -> GrayImage {
    let alpha = GrayImage::from_fn(foreground.width(), foreground.height(), |x, y| {
        image::Luma([foreground.get_pixel(x, y).0[3]])
    });
    apply_levels_lut(&alpha, &levels_lut(LevelsParams::EDGE_REFINEMENT))
}

fn blend_channel(fg: u8, bg: u8, alpha: f32) -> u8 {
    (f32::from(fg) * alpha + f32::from(bg) * (1.0 - alpha))
        .round()
        .clamp(0.0, 255.0) as u8
}

/// Composite `foreground` over `background` using the refined foreground alpha
///
/// The background is resized (Lanczos3) when its size differs. Output RGB is
/// `fg * a + bg * (1 - a)` and output alpha is `a + a_bg * (1 - a)`, with `a` the
/// edge-refined alpha.
#[must_use]
pub fn composite_over(foreground: &RgbaImage, background: &RgbaImage) -> RgbaImage {
    let (width, height) = foreground.dimensions();
    let resized;
    let background = if background.dimensions() == (width, height) {
        background
    } else {
        tracing::debug!(
            from = ?background.dimensions(),
            to = ?(width, height),
            "resizing background to foreground size"
        );
        resized = imageops::resize(background, width, height, FilterType::Lanczos3);
        &resized
    };

    let refined = refine_edge_alpha(foreground);
    RgbaImage::from_fn(width, height, |x, y| {
        let fg = foreground.get_pixel(x, y).0;
        let bg = background.get_pixel(x, y).0;
        let alpha = f32::from(refined.get_pixel(x, y).0[0]) / 255.0;
        let bg_alpha = f32::from(bg[3]) / 255.0;
        let out_alpha = alpha + bg_alpha * (1.0 - alpha);
        Rgba([
            blend_channel(fg[0], bg[0], alpha),
            blend_channel(fg[1], bg[1], alpha),
            blend_channel(fg[2], bg[2], alpha),
            (out_alpha * 255.0).round().clamp(0.0, 255.0) as u8,
        ])
    })
}

/// Place `image` on a solid colour canvas with smart margins
///
/// The canvas grows by the per-side margins from
/// [`compute_smart_margins`]; the image is composited at `(left, top)`.
#[must_use]
pub fn add_solid_background(image: &RgbaImage, color: [u8; 3], margin: u32) -> RgbaImage {
    let (width, height) = image.dimensions();
    let bounds = detect_content_bounds(image);
    let margins = compute_smart_margins(bounds, (width, height), margin);

    let canvas_width = width + margins.left + margins.right;
    let canvas_height = height + margins.top + margins.bottom;
    let background = RgbaImage::from_pixel(
        canvas_width,
        canvas_height,
        Rgba([color[0], color[1], color[2], 255]),
    );

    let mut layer = RgbaImage::new(canvas_width, canvas_height);
    imageops::replace(
        &mut layer,
        image,
        i64::from(margins.left),
        i64::from(margins.top),
    );

    composite_over(&layer, &background)
}

/// Flatten transparency onto a solid colour with a plain alpha blend
#[must_use]
pub fn flatten_onto_color(image: &RgbaImage, color: [u8; 3]) -> RgbImage {
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let px = image.get_pixel(x, y).0;
        let alpha = f32::from(px[3]) / 255.0;
        Rgb([
            blend_channel(px[0], color[0], alpha),
            blend_channel(px[1], color[1], alpha),
            blend_channel(px[2], color[2], alpha),
        ])
    })
}
