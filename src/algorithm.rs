// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Per-label stages of the pipeline: sub-pixel center refinement of each
//! labeled region, and extraction of supersampled, sub-pixel aligned image
//! patches around the accepted centers.
//!
//! Both stages treat candidates independently. A candidate whose window
//! leaves the image, whose fit fails or whose fit strays outside the
//! tolerances is dropped; the remaining candidates are unaffected.

use std::time::Instant;

use imageproc::point::Point;
use imageproc::rect::Rect;
use log::{debug, info};
use rayon::prelude::*;

use crate::FloatImage;
use crate::gaussian_fit::{fit_gaussian_2d_tilt, FitError, FixedParams};
use crate::image_funcs::{crop_roi, normalize_sum, roi_centered_at, supersample};

/// Acceptance bounds for a refined label center, relative to the fit window
/// size (per axis).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CenterTolerance {
    /// The fitted center may be at most `rel_center_tol * window` from the
    /// label's center of mass.
    pub rel_center_tol: f64,

    /// The fitted widths may be at most `rel_width_tol * window`.
    pub rel_width_tol: f64,
}

impl Default for CenterTolerance {
    fn default() -> Self {
        CenterTolerance{rel_center_tol: 1.0, rel_width_tol: 2.0}
    }
}

/// Why a label did not yield a usable center.
#[derive(Clone, Debug, PartialEq)]
pub enum Rejection {
    /// The fit window around the center of mass extends past the image.
    WindowOutOfBounds,
    FitFailed(FitError),
    NotConverged,
    CenterOutOfTolerance { fitted: Point<f64> },
    WidthOutOfTolerance { width_u: f64, width_v: f64 },
}

/// Outcome of center refinement for one label.
#[derive(Clone, Debug, PartialEq)]
pub enum Candidate {
    Valid {
        /// Sub-pixel center in image coordinates.
        center: Point<f64>,
        /// Fitted (width_u, width_v).
        width: (f64, f64),
    },
    Rejected(Rejection),
}

impl Candidate {
    pub fn center(&self) -> Option<Point<f64>> {
        match self {
            Candidate::Valid{center, ..} => Some(*center),
            Candidate::Rejected(_) => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Candidate::Valid{..})
    }
}

fn refine_label_center(image: &FloatImage, com: Point<i32>, window: (u32, u32),
                       tolerance: &CenterTolerance) -> Candidate {
    let roi = roi_centered_at(com, window.0, window.1);
    let Some(data) = crop_roi(image, &roi) else {
        return Candidate::Rejected(Rejection::WindowOutOfBounds);
    };
    let fit = match fit_gaussian_2d_tilt(&data, Point::new(roi.left(), roi.top()),
                                         &FixedParams::default()) {
        Ok(fit) => fit,
        Err(e) => return Candidate::Rejected(Rejection::FitFailed(e)),
    };
    if !fit.success {
        return Candidate::Rejected(Rejection::NotConverged);
    }
    let (win_x, win_y) = (window.0 as f64, window.1 as f64);
    if (fit.x0 - com.x as f64).abs() > tolerance.rel_center_tol * win_x ||
        (fit.y0 - com.y as f64).abs() > tolerance.rel_center_tol * win_y
    {
        return Candidate::Rejected(Rejection::CenterOutOfTolerance{
            fitted: fit.center()});
    }
    if fit.width_u > tolerance.rel_width_tol * win_x ||
        fit.width_v > tolerance.rel_width_tol * win_y
    {
        return Candidate::Rejected(Rejection::WidthOutOfTolerance{
            width_u: fit.width_u, width_v: fit.width_v});
    }
    Candidate::Valid{center: fit.center(), width: (fit.width_u, fit.width_v)}
}

/// Refines each label's center of mass to a sub-pixel center by fitting a
/// tilted 2D Gaussian to the `window` (width, height) of `image` around it.
///
/// Returns one candidate per entry of `label_coms`, in the same order.
pub fn find_label_centers_gaussian(image: &FloatImage, label_coms: &[Point<i32>],
                                   window: (u32, u32), tolerance: &CenterTolerance)
                                   -> Vec<Candidate> {
    let start = Instant::now();
    let candidates: Vec<Candidate> = label_coms.par_iter()
        .map(|com| refine_label_center(image, *com, window, tolerance))
        .collect();
    for (com, candidate) in label_coms.iter().zip(&candidates) {
        match candidate {
            Candidate::Valid{center, width} => {
                debug!("Label at {:?}: center {:?} width {:?}", com, center, width);
            },
            Candidate::Rejected(reason) => {
                debug!("Label at {:?} rejected: {:?}", com, reason);
            },
        }
    }
    let num_valid = candidates.iter().filter(|c| c.is_valid()).count();
    info!("Refined {} of {} label centers in {:?}",
          num_valid, candidates.len(), start.elapsed());
    candidates
}

// Crops `region_size` + 1 pixel margin around the nearest pixel to `center`,
// supersamples and cuts out the region shifted by the sub-pixel offset.
fn extract_region(image: &FloatImage, center: Point<f64>, region_size: (u32, u32),
                  supersample_factor: u32, normalize: bool) -> Option<FloatImage> {
    let center_int = Point::new(center.x.round_ties_even() as i32,
                                center.y.round_ties_even() as i32);
    let roi = roi_centered_at(center_int, region_size.0 + 2, region_size.1 + 2);
    let Some(crop) = crop_roi(image, &roi) else {
        debug!("Region around {:?} leaves the image", center);
        return None;
    };
    let s = supersample_factor as i32;
    let fine = supersample(&crop, supersample_factor);
    let dx = (s as f64 * (center.x - center_int.x as f64)).round_ties_even() as i32;
    let dy = (s as f64 * (center.y - center_int.y as f64)).round_ties_even() as i32;
    let window = Rect::at(s + dx, s + dy)
        .of_size(region_size.0 * supersample_factor, region_size.1 * supersample_factor);
    let mut region = crop_roi(&fine, &window)?;
    if normalize && !normalize_sum(&mut region) {
        debug!("Region around {:?} has no positive flux", center);
        return None;
    }
    Some(region)
}

/// Extracts a region of `region_size` (width, height) around each valid
/// candidate, supersampled by `supersample_factor` and aligned to the
/// candidate's sub-pixel center. Every region has shape
/// `region_size * supersample_factor`.
///
/// # Arguments
///   `image` - The image the candidates were found in.
///   `candidates` - Refined label centers; rejected ones are skipped.
///   `region_size` - Region shape in image pixels, usually the PSF template
///       shape.
///   `supersample_factor` - Grid refinement; 1 disables supersampling.
///   `normalize` - If true, each region is scaled to sum to 1 and regions
///       without positive flux are dropped.
pub fn find_label_regions_subpixel(image: &FloatImage, candidates: &[Candidate],
                                   region_size: (u32, u32), supersample_factor: u32,
                                   normalize: bool) -> Vec<FloatImage> {
    let start = Instant::now();
    let regions: Vec<FloatImage> = candidates.iter()
        .filter_map(|c| c.center())
        .filter_map(|center| extract_region(image, center, region_size,
                                            supersample_factor, normalize))
        .collect();
    debug!("Extracted {} regions in {:?}", regions.len(), start.elapsed());
    regions
}

// mod tests.
