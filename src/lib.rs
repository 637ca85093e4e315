// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! IsoPsf estimates the point-spread function (PSF) of an imaging system from
//! images of sparsely distributed point emitters, such as single atoms on an
//! optical lattice or fluorescent beads on a slide. Given a rough guess of the
//! PSF and a set of images, IsoPsf finds the emitters that are isolated from
//! their neighbors and averages their supersampled, sub-pixel aligned image
//! patches into a refined PSF.
//!
//! Features:
//!
//! * Decides isolation from the data. No emitter positions or lattice
//!   geometry need to be supplied.
//! * Adapts its detection thresholds to each image from the histograms of two
//!   filter responses, so varying exposure and background levels are
//!   tolerated.
//! * Refines emitter centers to sub-pixel precision with a tilted 2D Gaussian
//!   fit and discards emitters whose fit is implausible.
//! * Supersamples the PSF, so its estimate can be finer than the pixel grid
//!   when emitters fall at varied sub-pixel positions.
//! * Deterministic: the same images and configuration give bit-identical
//!   results, even though images and candidates are processed in parallel.
//!
//! # Algorithm
//!
//! Two filter kernels are derived from the PSF guess (see [filter_funcs]):
//!
//! * The on-site kernel is the core of the PSF. Its response is high where an
//!   emitter sits.
//! * The neighbor kernel is the ring-shaped tail of the PSF. Its response is
//!   high where a nearby emitter's tail reaches.
//!
//! Each response map is thresholded at a split value placed between the two
//! dominant modes of its histogram (see [histogram_funcs]): the background
//! mode and the emitter mode. Pixels flagged by the on-site mask but not by the
//! neighbor mask are isolated. Connected regions of isolated pixels become
//! labels, each with an intensity-weighted center of mass.
//!
//! Every label's center is then refined by fitting a tilted Gaussian in a
//! small window sized from a fit of the PSF guess itself. Fits that fail,
//! drift too far from the center of mass, or come out too wide reject the
//! label. Around each accepted center, a patch one template in size is
//! supersampled and shifted by the sub-pixel offset, so all patches share a
//! common center. The PSF estimate is the mean of the normalized patches over
//! all images.
//!
//! # Caveats
//!
//! ## Crowding
//!
//! The neighbor filter flags a pixel when emitter signal is found a PSF radius
//! away. An isolated emitter's own tail also contributes to this response, so
//! a very permissive neighbor split (a small `Width` multiplier) can reject
//! every emitter. A `Center` split, or a larger `Width` multiplier, keeps
//! isolated emitters while still rejecting close pairs.
//!
//! ## PSF model
//!
//! Center refinement assumes a roughly Gaussian PSF core. The averaged PSF
//! itself is model free, but emitters whose core is far from Gaussian will be
//! rejected or mis-centered. A spatially varying PSF is averaged over the
//! field.
//!
//! ## Iteration
//!
//! The region size, the filter kernels and the fit window all derive from the
//! PSF guess. A poor guess can be improved by feeding the estimate (binned back
//! to the pixel grid) into a second run.

pub mod algorithm;
pub mod error;
pub mod estimator;
pub mod filter_funcs;
pub mod gaussian_fit;
pub mod histogram_funcs;
pub mod image_funcs;
pub mod labels;

#[cfg(test)]
mod test_utils;

use image::{ImageBuffer, Luma};

/// Single channel floating point image. Used for input images, PSF templates,
/// filter kernels, response maps, regions and PSF estimates.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

pub use algorithm::{Candidate, CenterTolerance, Rejection};
pub use error::PsfError;
pub use estimator::{ImageAnalysis, PsfAccumulator, PsfEstimator, PsfEstimatorConfig};
pub use histogram_funcs::SplitCondition;
