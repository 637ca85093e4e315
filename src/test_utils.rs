// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Synthetic emitter images for tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::FloatImage;
use crate::image_funcs::render_gaussian_spot;

pub const SPOT_SIGMA: f64 = 2.0;
pub const SPOT_AMPLITUDE: f64 = 100.0;

/// 13x13 pixel-integrated Gaussian template, sigma 2, peak near 1.
pub fn gaussian_template() -> FloatImage {
    render_gaussian_spot(13, 13, 6.0, 6.0, SPOT_SIGMA, 1.0, 5)
}

/// Pixel-integrated Gaussian emitters at `spots` (x, y), plus uniform noise
/// in [-0.5, 0.5) drawn from a generator seeded with `seed`.
pub fn emitter_image(width: u32, height: u32, spots: &[(f64, f64)], seed: u64)
                     -> FloatImage {
    let mut image = FloatImage::new(width, height);
    for (x, y) in spots {
        let spot = render_gaussian_spot(width, height, *x, *y,
                                        SPOT_SIGMA, SPOT_AMPLITUDE, 5);
        for (p, s) in image.pixels_mut().zip(spot.pixels()) {
            p.0[0] += s.0[0];
        }
    }
    let mut rng = StdRng::seed_from_u64(seed);
    for p in image.pixels_mut() {
        p.0[0] += rng.gen_range(-0.5..0.5);
    }
    image
}

/// Coordinates of the brightest pixel (first in raster order on ties).
pub fn argmax(image: &FloatImage) -> (u32, u32) {
    let (mut best, mut best_val) = ((0, 0), f32::MIN);
    for (x, y, p) in image.enumerate_pixels() {
        if p.0[0] > best_val {
            best = (x, y);
            best_val = p.0[0];
        }
    }
    best
}
