// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Filter kernels derived from a PSF template, and the convolution used to
//! turn an image into a filter response map.
//!
//! The on-site kernel keeps the core of the template (the part brighter than
//! `inner_thr` times its peak). Convolving with it measures how much signal an
//! emitter centered at a pixel deposits on itself.
//!
//! The neighbor kernel is an annulus covering the template's tail, between
//! `outer_thr` and `inner_thr` of its peak, weighted towards the inner edge.
//! Its response is high wherever an emitter sits a PSF radius away from a
//! pixel, i.e. where a neighbor's tail would contaminate an emitter at that
//! pixel.

use image::Luma;

use crate::FloatImage;
use crate::error::PsfError;

fn template_max(template: &FloatImage) -> Result<f64, PsfError> {
    let (width, height) = template.dimensions();
    if width == 0 || height == 0 {
        return Err(PsfError::Configuration("PSF template is empty".to_string()));
    }
    let mut max = f64::MIN;
    for pixel in template.pixels() {
        let v = pixel.0[0] as f64;
        if !v.is_finite() {
            return Err(PsfError::Configuration(
                "PSF template contains non-finite values".to_string()));
        }
        max = max.max(v);
    }
    if max <= 0.0 {
        return Err(PsfError::Configuration(format!(
            "PSF template maximum {} is not positive", max)));
    }
    Ok(max)
}

// Turns `weights` (row-major, template shape) into a kernel image summing to 1.
fn normalized_kernel(weights: Vec<f64>, width: u32, height: u32, name: &str)
                     -> Result<FloatImage, PsfError> {
    let total: f64 = weights.iter().sum();
    if !total.is_finite() || total <= 0.0 {
        return Err(PsfError::Configuration(format!(
            "{} kernel has degenerate sum {}; check template and thresholds",
            name, total)));
    }
    Ok(FloatImage::from_fn(width, height, |x, y| {
        Luma([(weights[(y * width + x) as usize] / total) as f32])
    }))
}

/// Computes the on-site kernel: `max(template - inner_thr * max(template), 0)`
/// normalized to sum 1.
///
/// # Arguments
///   `template` - The pixel-integrated PSF template.
///   `inner_thr` - Fraction of the template peak below which pixels are
///       excluded from the kernel.
pub fn onsite_kernel(template: &FloatImage, inner_thr: f64)
                     -> Result<FloatImage, PsfError> {
    let max = template_max(template)?;
    let cutoff = inner_thr * max;
    let weights: Vec<f64> = template.pixels()
        .map(|p| (p.0[0] as f64 - cutoff).max(0.0))
        .collect();
    normalized_kernel(weights, template.width(), template.height(), "on-site")
}

/// Computes the neighbor kernel. With `n = template / max(template)`, pixels
/// with `n > inner_thr` or `n < outer_thr` are zero and the rest are
/// `inner_thr - n`; the result is normalized to sum 1.
pub fn neighbor_kernel(template: &FloatImage, inner_thr: f64, outer_thr: f64)
                       -> Result<FloatImage, PsfError> {
    let max = template_max(template)?;
    let weights: Vec<f64> = template.pixels()
        .map(|p| {
            let n = p.0[0] as f64 / max;
            if n > inner_thr || n < outer_thr {
                0.0
            } else {
                inner_thr - n
            }
        })
        .collect();
    normalized_kernel(weights, template.width(), template.height(), "neighbor")
}

// Maps an out-of-range index into [0, n) by half-sample symmetric reflection
// (d c b a | a b c d | d c b a), repeating as needed.
fn reflect_index(i: i64, n: i64) -> usize {
    let period = 2 * n;
    let m = i.rem_euclid(period);
    (if m >= n { period - 1 - m } else { m }) as usize
}

/// Convolves `image` with `kernel`, producing a response map of the image's
/// shape.
///
/// `out(x, y) = sum over (kx, ky) of kernel(kx, ky) *
///              image(x + cx - kx, y + cy - ky)`
/// with the kernel origin `(cx, cy) = (kw/2, kh/2)`. Pixels beyond the image
/// border are taken by reflection about the border, so a flat image yields a
/// flat response.
pub fn apply_filter(image: &FloatImage, kernel: &FloatImage) -> FloatImage {
    let (width, height) = image.dimensions();
    let (kw, kh) = kernel.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }
    let (cx, cy) = ((kw / 2) as i64, (kh / 2) as i64);
    let pixels = image.as_raw();
    // Nonzero kernel taps only; kernels derived from templates are sparse.
    let mut taps = Vec::<(i64, i64, f64)>::new();
    for (kx, ky, k) in kernel.enumerate_pixels() {
        if k.0[0] != 0.0 {
            taps.push((cx - kx as i64, cy - ky as i64, k.0[0] as f64));
        }
    }
    // Per-axis reflected index tables, covering every offset the taps reach.
    let reach_x = cx.max(kw as i64 - 1 - cx);
    let reach_y = cy.max(kh as i64 - 1 - cy);
    let x_index: Vec<usize> = (-reach_x..width as i64 + reach_x)
        .map(|i| reflect_index(i, width as i64)).collect();
    let y_index: Vec<usize> = (-reach_y..height as i64 + reach_y)
        .map(|i| reflect_index(i, height as i64)).collect();

    FloatImage::from_fn(width, height, |x, y| {
        let mut acc = 0.0_f64;
        for &(dx, dy, k) in &taps {
            let sx = x_index[(x as i64 + dx + reach_x) as usize];
            let sy = y_index[(y as i64 + dy + reach_y) as usize];
            acc += k * pixels[sy * width as usize + sx] as f64;
        }
        Luma([acc as f32])
    })
}

// mod tests.
