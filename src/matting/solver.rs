//! Guided-filter alpha matting
//!
//! A trimap is derived from the model mask, then every unknown pixel solves a
//! regularised 3x3 local linear model `alpha = a . I + b` over its neighbourhood.
//! The covariance system is solved by Cholesky decomposition; a non-positive pivot
//! is reported as a decomposition failure so the retry engine can relax parameters.

use super::params::AlphaMattingParams;
use super::MattingBackend;
use crate::error::{PipelineError, Result};
use image::{GrayImage, Luma, RgbImage};
use ndarray::{Array2, Array3};

const TRIMAP_FOREGROUND: u8 = 255;
const TRIMAP_BACKGROUND: u8 = 0;
const TRIMAP_UNKNOWN: u8 = 128;
const WINDOW_RADIUS: usize = 1;

/// Default [`MattingBackend`] based on a local guided filter
#[derive(Debug, Clone, Copy, Default)]
pub struct GuidedFilterMatting;

/// One-dimensional erosion along rows (`horizontal`) or columns.
/// Outside the image counts as false.
#[allow(clippy::indexing_slicing)]
fn erode_axis(input: &Array2<bool>, size: usize, horizontal: bool) -> Array2<bool> {
    let (rows, cols) = input.dim();
    let before = size / 2;
    let after = size - before - 1;
    let mut out = Array2::from_elem((rows, cols), false);
    let (outer, inner) = if horizontal { (rows, cols) } else { (cols, rows) };
    let at = |o: usize, i: usize| if horizontal { (o, i) } else { (i, o) };

    for o in 0..outer {
        // prefix[i] = number of true cells in [0, i)
        let mut prefix = Vec::with_capacity(inner + 1);
        prefix.push(0usize);
        for i in 0..inner {
            let last = prefix.last().copied().unwrap_or(0);
            prefix.push(last + usize::from(input[at(o, i)]));
        }
        for i in 0..inner {
            if i < before || i + after >= inner {
                continue;
            }
            let start = i - before;
            let end = i + after + 1;
            if prefix[end] - prefix[start] == size {
                out[at(o, i)] = true;
            }
        }
    }
    out
}

/// Binary erosion with a square `size` x `size` structuring element
fn erode(input: &Array2<bool>, size: usize) -> Array2<bool> {
    if size <= 1 {
        return input.clone();
    }
    let horizontal = erode_axis(input, size, true);
    erode_axis(&horizontal, size, false)
}

/// Build the trimap for a mask: 255 foreground, 0 background, 128 unknown
#[must_use]
#[allow(clippy::indexing_slicing)]
pub fn build_trimap(mask: &GrayImage, params: &AlphaMattingParams) -> GrayImage {
    let (width, height) = mask.dimensions();
    let (rows, cols) = (height as usize, width as usize);
    let foreground = Array2::from_shape_fn((rows, cols), |(y, x)| {
        mask.get_pixel(x as u32, y as u32).0[0] > params.foreground_threshold
    });
    let background = Array2::from_shape_fn((rows, cols), |(y, x)| {
        mask.get_pixel(x as u32, y as u32).0[0] < params.background_threshold
    });
    let size = params.erode_size as usize;
    let foreground = erode(&foreground, size);
    let background = erode(&background, size);

    GrayImage::from_fn(width, height, |x, y| {
        let idx = (y as usize, x as usize);
        if foreground[idx] {
            Luma([TRIMAP_FOREGROUND])
        } else if background[idx] {
            Luma([TRIMAP_BACKGROUND])
        } else {
            Luma([TRIMAP_UNKNOWN])
        }
    })
}

/// Cholesky solve of a symmetric 3x3 system
#[allow(clippy::indexing_slicing, clippy::needless_range_loop)]
fn cholesky_solve(matrix: [[f64; 3]; 3], rhs: [f64; 3]) -> Result<[f64; 3]> {
    let mut l = [[0.0f64; 3]; 3];
    for i in 0..3 {
        for j in 0..=i {
            let mut sum = matrix[i][j];
            for k in 0..j {
                sum -= l[i][k] * l[j][k];
            }
            if i == j {
                if !sum.is_finite() || sum <= f64::EPSILON {
                    return Err(PipelineError::matting(format!(
                        "Cholesky decomposition failed: non-positive pivot {sum:e} at row {i}"
                    )));
                }
                l[i][i] = sum.sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }

    let mut y = [0.0f64; 3];
    for i in 0..3 {
        let mut sum = rhs[i];
        for k in 0..i {
            sum -= l[i][k] * y[k];
        }
        y[i] = sum / l[i][i];
    }
    let mut x = [0.0f64; 3];
    for i in (0..3).rev() {
        let mut sum = y[i];
        for k in (i + 1)..3 {
            sum -= l[k][i] * x[k];
        }
        x[i] = sum / l[i][i];
    }
    Ok(x)
}

impl GuidedFilterMatting {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[allow(clippy::indexing_slicing, clippy::needless_range_loop)]
    fn solve_pixel(
        guide: &Array3<f64>,
        target: &Array2<f64>,
        (row, col): (usize, usize),
        shift: f64,
    ) -> Result<f64> {
        let (rows, cols) = target.dim();
        let r0 = row.saturating_sub(WINDOW_RADIUS);
        let r1 = (row + WINDOW_RADIUS + 1).min(rows);
        let c0 = col.saturating_sub(WINDOW_RADIUS);
        let c1 = (col + WINDOW_RADIUS + 1).min(cols);
        let n = ((r1 - r0) * (c1 - c0)) as f64;

        let mut mean_i = [0.0f64; 3];
        let mut mean_p = 0.0;
        for r in r0..r1 {
            for c in c0..c1 {
                for ch in 0..3 {
                    mean_i[ch] += guide[(r, c, ch)];
                }
                mean_p += target[(r, c)];
            }
        }
        for value in &mut mean_i {
            *value /= n;
        }
        mean_p /= n;

        let mut sigma = [[0.0f64; 3]; 3];
        let mut cov_ip = [0.0f64; 3];
        for r in r0..r1 {
            for c in c0..c1 {
                let d = [
                    guide[(r, c, 0)] - mean_i[0],
                    guide[(r, c, 1)] - mean_i[1],
                    guide[(r, c, 2)] - mean_i[2],
                ];
                let dp = target[(r, c)] - mean_p;
                for i in 0..3 {
                    cov_ip[i] += d[i] * dp;
                    for j in 0..3 {
                        sigma[i][j] += d[i] * d[j];
                    }
                }
            }
        }
        for i in 0..3 {
            cov_ip[i] /= n;
            for j in 0..3 {
                sigma[i][j] /= n;
            }
            sigma[i][i] += shift;
        }

        let a = cholesky_solve(sigma, cov_ip)?;
        let b = mean_p - (a[0] * mean_i[0] + a[1] * mean_i[1] + a[2] * mean_i[2]);
        let alpha = a[0] * guide[(row, col, 0)]
            + a[1] * guide[(row, col, 1)]
            + a[2] * guide[(row, col, 2)]
            + b;
        Ok(alpha.clamp(0.0, 1.0))
    }
}

impl MattingBackend for GuidedFilterMatting {
    fn name(&self) -> &str {
        "guided-filter"
    }

    #[allow(clippy::indexing_slicing)]
    fn estimate_alpha(
        &self,
        image: &RgbImage,
        mask: &GrayImage,
        params: &AlphaMattingParams,
    ) -> Result<GrayImage> {
        if image.dimensions() != mask.dimensions() {
            return Err(PipelineError::matting(format!(
                "image {:?} and mask {:?} differ in size",
                image.dimensions(),
                mask.dimensions()
            )));
        }
        if !(params.shift.is_finite() && params.discard_threshold.is_finite()) {
            return Err(PipelineError::matting(
                "discard_threshold and shift must be finite",
            ));
        }

        let trimap = build_trimap(mask, params);
        let mut has_fg = false;
        let mut has_bg = false;
        let mut has_unknown = false;
        for pixel in trimap.pixels() {
            match pixel.0[0] {
                TRIMAP_FOREGROUND => has_fg = true,
                TRIMAP_BACKGROUND => has_bg = true,
                _ => has_unknown = true,
            }
        }
        if !has_unknown {
            return Ok(trimap);
        }
        if !has_fg || !has_bg {
            return Err(PipelineError::matting(format!(
                "trimap has no definite {} pixels; lower the discard_threshold or erode size",
                if has_fg { "background" } else { "foreground" }
            )));
        }

        let (width, height) = image.dimensions();
        let (rows, cols) = (height as usize, width as usize);
        let guide = Array3::from_shape_fn((rows, cols, 3), |(y, x, ch)| {
            f64::from(image.get_pixel(x as u32, y as u32).0[ch]) / 255.0
        });
        // Known regions are pinned; unknown pixels start from the model's soft mask
        let target = Array2::from_shape_fn((rows, cols), |(y, x)| {
            match trimap.get_pixel(x as u32, y as u32).0[0] {
                TRIMAP_FOREGROUND => 1.0,
                TRIMAP_BACKGROUND => 0.0,
                _ => f64::from(mask.get_pixel(x as u32, y as u32).0[0]) / 255.0,
            }
        });

        let mut alpha = trimap.clone();
        for (x, y, pixel) in trimap.enumerate_pixels() {
            if pixel.0[0] != TRIMAP_UNKNOWN {
                continue;
            }
            let mut value =
                Self::solve_pixel(&guide, &target, (y as usize, x as usize), params.shift)?;
            if value < params.discard_threshold {
                value = 0.0;
            } else if value > 1.0 - params.discard_threshold {
                value = 1.0;
            }
            alpha.put_pixel(x, y, Luma([(value * 255.0).round() as u8]));
        }
        Ok(alpha)
    }
}
