// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Least-squares fit of a tilted (rotated, elliptical) 2D Gaussian with a
//! constant offset:
//!
//! `f(x, y) = a * exp(-u^2 / (2 wu^2) - v^2 / (2 wv^2)) + c`
//!
//! where `(u, v)` are the coordinates `(x - x0, y - y0)` rotated by `tilt`:
//! `u = dx cos(tilt) + dy sin(tilt)`, `v = -dx sin(tilt) + dy cos(tilt)`.
//!
//! The fit uses Levenberg-Marquardt iterations on the normal equations,
//! starting from a moment-based guess.

use std::f64::consts::PI;

use imageproc::point::Point;
use nalgebra::{DMatrix, DVector};

use crate::FloatImage;

const NUM_PARAMS: usize = 7;
const TILT: usize = 5;
const MAX_ITERATIONS: usize = 200;
const REL_TOLERANCE: f64 = 1e-10;
const INITIAL_LAMBDA: f64 = 1e-3;
const MAX_LAMBDA: f64 = 1e10;

/// Parameters held constant during a fit.
#[derive(Clone, Copy, Debug, Default)]
pub struct FixedParams {
    /// If given, the tilt is fixed at this angle (radians).
    pub tilt: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GaussianFit {
    pub amplitude: f64,
    /// Center, in the coordinates of the image the fitted data was cropped
    /// from.
    pub x0: f64,
    pub y0: f64,
    /// Standard deviation along the tilted u axis.
    pub width_u: f64,
    /// Standard deviation along the tilted v axis.
    pub width_v: f64,
    /// Radians, wrapped to [-pi/2, pi/2).
    pub tilt: f64,
    pub offset: f64,
    /// True if the iterations converged to finite parameters.
    pub success: bool,
    pub iterations: usize,
}

impl GaussianFit {
    pub fn center(&self) -> Point<f64> {
        Point::new(self.x0, self.y0)
    }
}

/// Reasons a fit cannot be attempted.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FitError {
    #[error("{num_pixels} pixels cannot constrain {num_params} parameters")]
    TooFewPixels { num_pixels: usize, num_params: usize },
    #[error("fit data contains non-finite values")]
    NonFiniteData,
    #[error("fit data is flat")]
    FlatData,
}

// Model value at (x, y) and its gradient with respect to the seven parameters.
fn evaluate(p: &[f64; NUM_PARAMS], x: f64, y: f64) -> (f64, [f64; NUM_PARAMS]) {
    let [a, x0, y0, wu, wv, tilt, c] = *p;
    let (st, ct) = tilt.sin_cos();
    let (dx, dy) = (x - x0, y - y0);
    let u = dx * ct + dy * st;
    let v = -dx * st + dy * ct;
    let (wu2, wv2) = (wu * wu, wv * wv);
    let e = (-(u * u / (2.0 * wu2) + v * v / (2.0 * wv2))).exp();
    let ae = a * e;
    let grad = [
        e,
        ae * (u * ct / wu2 - v * st / wv2),
        ae * (u * st / wu2 + v * ct / wv2),
        ae * u * u / (wu2 * wu),
        ae * v * v / (wv2 * wv),
        -ae * u * v * (1.0 / wu2 - 1.0 / wv2),
        1.0,
    ];
    (ae + c, grad)
}

// Offset from the data minimum, amplitude from its range, and the centroid
// and second moments of the offset-subtracted data.
fn initial_guess(data: &FloatImage, origin: Point<i32>, tilt: f64) -> [f64; NUM_PARAMS] {
    let mut min = f64::MAX;
    let mut max = f64::MIN;
    for p in data.pixels() {
        min = min.min(p.0[0] as f64);
        max = max.max(p.0[0] as f64);
    }
    let (mut m, mut sx, mut sy) = (0.0, 0.0, 0.0);
    for (x, y, p) in data.enumerate_pixels() {
        let w = p.0[0] as f64 - min;
        m += w;
        sx += w * x as f64;
        sy += w * y as f64;
    }
    let (cx, cy) = (sx / m, sy / m);
    let (mut vx, mut vy) = (0.0, 0.0);
    for (x, y, p) in data.enumerate_pixels() {
        let w = p.0[0] as f64 - min;
        vx += w * (x as f64 - cx).powi(2);
        vy += w * (y as f64 - cy).powi(2);
    }
    [max - min,
     cx + origin.x as f64,
     cy + origin.y as f64,
     (vx / m).max(0.25).sqrt(),
     (vy / m).max(0.25).sqrt(),
     tilt,
     min]
}

fn wrap_tilt(tilt: f64) -> f64 {
    (tilt + PI / 2.0).rem_euclid(PI) - PI / 2.0
}

/// Fits a tilted 2D Gaussian to `data`.
///
/// # Arguments
///   `data` - The pixels to fit, typically a crop of a larger image.
///   `origin` - Position of `data`'s (0, 0) pixel in the larger image; the
///       fitted center is reported in the larger image's coordinates.
///   `fixed` - Parameters to hold constant.
///
/// # Returns
/// The fitted parameters. `success` is false if the iterations did not
/// converge or produced non-finite parameters; a FitError is returned if the
/// data cannot support a fit at all.
pub fn fit_gaussian_2d_tilt(data: &FloatImage, origin: Point<i32>, fixed: &FixedParams)
                            -> Result<GaussianFit, FitError> {
    let free: Vec<usize> = (0..NUM_PARAMS)
        .filter(|i| !(*i == TILT && fixed.tilt.is_some()))
        .collect();
    let num_free = free.len();
    let num_pixels = (data.width() * data.height()) as usize;
    if num_pixels < num_free {
        return Err(FitError::TooFewPixels{num_pixels, num_params: num_free});
    }
    if data.pixels().any(|p| !p.0[0].is_finite()) {
        return Err(FitError::NonFiniteData);
    }
    let first = data.get_pixel(0, 0).0[0];
    if data.pixels().all(|p| p.0[0] == first) {
        return Err(FitError::FlatData);
    }

    let points: Vec<(f64, f64, f64)> = data.enumerate_pixels()
        .map(|(x, y, p)| ((x as i32 + origin.x) as f64,
                          (y as i32 + origin.y) as f64,
                          p.0[0] as f64))
        .collect();
    let sse = |params: &[f64; NUM_PARAMS]| -> f64 {
        points.iter()
            .map(|(x, y, v)| (v - evaluate(params, *x, *y).0).powi(2))
            .sum()
    };

    let mut params = initial_guess(data, origin, fixed.tilt.unwrap_or(0.0));
    let mut error = sse(&params);
    let mut lambda = INITIAL_LAMBDA;
    let mut converged = false;
    let mut iterations = 0;
    while iterations < MAX_ITERATIONS {
        iterations += 1;
        let mut jtj = DMatrix::<f64>::zeros(num_free, num_free);
        let mut jtr = DVector::<f64>::zeros(num_free);
        for (x, y, v) in &points {
            let (value, grad) = evaluate(&params, *x, *y);
            let residual = v - value;
            for (i, gi) in free.iter().enumerate() {
                jtr[i] += grad[*gi] * residual;
                for (j, gj) in free.iter().enumerate() {
                    jtj[(i, j)] += grad[*gi] * grad[*gj];
                }
            }
        }

        let mut improved = false;
        while lambda < MAX_LAMBDA {
            let mut h = jtj.clone();
            for i in 0..num_free {
                h[(i, i)] += lambda * (jtj[(i, i)] + 1e-9);
            }
            if let Some(delta) = h.lu().solve(&jtr) {
                let mut trial = params;
                for (k, i) in free.iter().enumerate() {
                    trial[*i] += delta[k];
                }
                let trial_error = sse(&trial);
                if trial_error.is_finite() && trial_error < error {
                    let rel_decrease = (error - trial_error) / error.max(f64::MIN_POSITIVE);
                    params = trial;
                    error = trial_error;
                    lambda = (lambda / 10.0).max(1e-12);
                    improved = true;
                    if rel_decrease < REL_TOLERANCE || error < 1e-24 {
                        converged = true;
                    }
                    break;
                }
            }
            lambda *= 10.0;
        }
        // No step reduces the error: we are at a stationary point.
        if !improved || converged {
            converged = true;
            break;
        }
    }

    let [amplitude, x0, y0, width_u, width_v, tilt, offset] = params;
    let success = converged && params.iter().all(|p| p.is_finite());
    Ok(GaussianFit{
        amplitude, x0, y0,
        width_u: width_u.abs(),
        width_v: width_v.abs(),
        tilt: if tilt.is_finite() { wrap_tilt(tilt) } else { tilt },
        offset, success, iterations,
    })
}

// mod tests.
