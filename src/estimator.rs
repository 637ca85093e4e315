// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use image::{GrayImage, Luma};
use imageproc::point::Point;
use indicatif::{ParallelProgressIterator, ProgressBar};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::FloatImage;
use crate::algorithm::{find_label_centers_gaussian, find_label_regions_subpixel,
                       Candidate, CenterTolerance};
use crate::error::PsfError;
use crate::filter_funcs::{apply_filter, neighbor_kernel, onsite_kernel};
use crate::gaussian_fit::{fit_gaussian_2d_tilt, FixedParams, GaussianFit};
use crate::histogram_funcs::{interpret_filter_hist, SplitCondition};
use crate::image_funcs::isolated_mask;
use crate::labels::{find_labels, LabelSet};

/// Parameters of a [PsfEstimator]. Use [PsfEstimatorConfig::new()] to get
/// the defaults for a given PSF template, then adjust fields as needed.
#[derive(Clone, Debug)]
pub struct PsfEstimatorConfig {
    /// Best current estimate of the pixel-integrated PSF. Determines the
    /// filter kernels, the label fit window and the region size.
    pub guess_psf_integrated: FloatImage,

    /// Supersampling factor of the extracted regions and the PSF estimate.
    /// Default 5.
    pub psf_supersample: u32,

    /// Fraction of the template peak separating its core from its tail.
    /// Default 1/e.
    pub filter_inner_thr: f64,

    /// Fraction of the template peak below which its tail is ignored.
    /// Default 1/e^4.
    pub filter_outer_thr: f64,

    /// Split of the on-site response histogram. Default `Width(5.0)`.
    pub onsite_split: SplitCondition,

    /// Split of the neighbor response histogram. Default `Width(3.0)`.
    pub neighbor_split: SplitCondition,

    /// Scales the label fit window, whose default extent is twice the
    /// template's fitted width per axis. Default 1.0.
    pub label_center_rel_im_size: f64,

    /// Acceptance bounds for refined label centers.
    pub label_center_tol: CenterTolerance,

    /// Histogram bin count for both response maps. None chooses a count
    /// from the image size.
    pub histogram_bins: Option<usize>,
}

impl PsfEstimatorConfig {
    pub fn new(guess_psf_integrated: FloatImage) -> Self {
        PsfEstimatorConfig{
            guess_psf_integrated,
            psf_supersample: 5,
            filter_inner_thr: (-1.0_f64).exp(),
            filter_outer_thr: (-4.0_f64).exp(),
            onsite_split: SplitCondition::Width(5.0),
            neighbor_split: SplitCondition::Width(3.0),
            label_center_rel_im_size: 1.0,
            label_center_tol: CenterTolerance::default(),
            histogram_bins: None,
        }
    }

    fn validate(&self) -> Result<(), PsfError> {
        if self.psf_supersample == 0 {
            return Err(PsfError::Configuration(
                "psf_supersample must be at least 1".to_string()));
        }
        let (inner, outer) = (self.filter_inner_thr, self.filter_outer_thr);
        if !(inner > 0.0 && inner <= 1.0) {
            return Err(PsfError::Configuration(format!(
                "filter_inner_thr {} must be within (0, 1]", inner)));
        }
        if !(outer >= 0.0 && outer < inner) {
            return Err(PsfError::Configuration(format!(
                "filter_outer_thr {} must be within [0, filter_inner_thr)", outer)));
        }
        let rel_size = self.label_center_rel_im_size;
        if !(rel_size.is_finite() && rel_size > 0.0) {
            return Err(PsfError::Configuration(format!(
                "label_center_rel_im_size {} must be positive", rel_size)));
        }
        let tol = &self.label_center_tol;
        for (name, value) in [("rel_center_tol", tol.rel_center_tol),
                              ("rel_width_tol", tol.rel_width_tol)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(PsfError::Configuration(format!(
                    "{} {} must be finite and non-negative", name, value)));
            }
        }
        if self.histogram_bins == Some(0) {
            return Err(PsfError::Configuration(
                "histogram_bins must be positive".to_string()));
        }
        self.onsite_split.validate()?;
        self.neighbor_split.validate()?;
        Ok(())
    }
}

/// Intermediate and final products of running the pipeline on one image.
#[derive(Clone, Debug)]
pub struct ImageAnalysis {
    pub onsite_response: FloatImage,
    pub neighbor_response: FloatImage,
    pub onsite_mask: GrayImage,
    pub neighbor_mask: GrayImage,
    pub isolated_mask: GrayImage,
    pub labels: LabelSet,
    /// One per label, in label order.
    pub candidates: Vec<Candidate>,
    pub regions: Vec<FloatImage>,
}

/// Estimates a supersampled PSF from isolated emitters found in images.
/// Created with [PsfEstimator::build()], which resolves everything derived
/// from the configuration once.
#[derive(Clone, Debug)]
pub struct PsfEstimator {
    config: PsfEstimatorConfig,
    onsite_kernel: FloatImage,
    neighbor_kernel: FloatImage,
    template_fit: GaussianFit,
    label_fit_size: (u32, u32),
}

impl PsfEstimator {
    /// Validates `config`, derives the filter kernels from the PSF template
    /// and sizes the label fit window from a Gaussian fit of the template.
    pub fn build(config: PsfEstimatorConfig) -> Result<PsfEstimator, PsfError> {
        config.validate()?;
        let template = &config.guess_psf_integrated;
        let onsite_kernel = onsite_kernel(template, config.filter_inner_thr)?;
        let neighbor_kernel = neighbor_kernel(
            template, config.filter_inner_thr, config.filter_outer_thr)?;

        let template_fit = fit_gaussian_2d_tilt(template, Point::new(0, 0),
                                                &FixedParams{tilt: Some(0.0)})
            .map_err(|e| PsfError::Configuration(format!(
                "cannot fit PSF template: {}", e)))?;
        if !template_fit.success {
            return Err(PsfError::Configuration(
                "PSF template fit did not converge".to_string()));
        }
        let window_extent = |width: f64| {
            (2.0 * config.label_center_rel_im_size * width).round_ties_even().max(1.0) as u32
        };
        let label_fit_size = (window_extent(template_fit.width_u),
                              window_extent(template_fit.width_v));
        if (label_fit_size.0 * label_fit_size.1) < 7 {
            warn!("Label fit window {:?} has too few pixels for a tilted Gaussian fit; \
                   increase label_center_rel_im_size", label_fit_size);
        }
        debug!("Template fit {:?}; label fit window {:?}", template_fit, label_fit_size);
        Ok(PsfEstimator{config, onsite_kernel, neighbor_kernel, template_fit, label_fit_size})
    }

    pub fn config(&self) -> &PsfEstimatorConfig {
        &self.config
    }

    pub fn onsite_kernel(&self) -> &FloatImage {
        &self.onsite_kernel
    }

    pub fn neighbor_kernel(&self) -> &FloatImage {
        &self.neighbor_kernel
    }

    /// Gaussian fit of the PSF template, with tilt fixed at zero.
    pub fn template_fit(&self) -> &GaussianFit {
        &self.template_fit
    }

    /// (width, height) of the window used to refine label centers.
    pub fn label_fit_size(&self) -> (u32, u32) {
        self.label_fit_size
    }

    /// (width, height) of a region in image pixels: the template's shape.
    pub fn region_size(&self) -> (u32, u32) {
        self.config.guess_psf_integrated.dimensions()
    }

    /// (width, height) of a region and of the PSF estimate, in supersampled
    /// pixels.
    pub fn region_shape(&self) -> (u32, u32) {
        let (w, h) = self.region_size();
        (w * self.config.psf_supersample, h * self.config.psf_supersample)
    }

    /// Runs the full pipeline on `image`, keeping every intermediate result.
    ///
    /// # Errors
    /// [PsfError::Detection] if either response histogram lacks two modes.
    pub fn analyze_image(&self, image: &FloatImage, normalize: bool)
                         -> Result<ImageAnalysis, PsfError> {
        let start = Instant::now();
        let bins = self.config.histogram_bins;
        let onsite_response = apply_filter(image, &self.onsite_kernel);
        let onsite_mask = interpret_filter_hist(
            &onsite_response, bins, &self.config.onsite_split)?;
        let neighbor_response = apply_filter(image, &self.neighbor_kernel);
        let neighbor_mask = interpret_filter_hist(
            &neighbor_response, bins, &self.config.neighbor_split)?;
        let isolated_mask = isolated_mask(&onsite_mask, &neighbor_mask);

        let labels = find_labels(&isolated_mask, image);
        let candidates = find_label_centers_gaussian(
            image, &labels.label_com, self.label_fit_size, &self.config.label_center_tol);
        let regions = find_label_regions_subpixel(
            image, &candidates, self.region_size(), self.config.psf_supersample,
            normalize);
        info!("Image {}x{}: {} labels, {} regions in {:?}",
              image.width(), image.height(), labels.num_labels(), regions.len(),
              start.elapsed());
        Ok(ImageAnalysis{onsite_response, neighbor_response, onsite_mask,
                         neighbor_mask, isolated_mask, labels, candidates, regions})
    }

    /// Returns the supersampled, sub-pixel aligned regions around the isolated
    /// emitters of `image`. Zero regions is a valid outcome.
    pub fn get_label_regions(&self, image: &FloatImage, normalize: bool)
                             -> Result<Vec<FloatImage>, PsfError> {
        Ok(self.analyze_image(image, normalize)?.regions)
    }

    /// Estimates the PSF as the mean of the normalized regions of all
    /// `images`. Images are processed in parallel.
    ///
    /// # Errors
    /// Any image's detection error, or [PsfError::EmptyResult] if no region
    /// was found in any image.
    pub fn get_psf(&self, images: &[FloatImage], print_progress: bool)
                   -> Result<FloatImage, PsfError> {
        let start = Instant::now();
        let run = |image: &FloatImage| self.get_label_regions(image, true);
        let per_image: Vec<Vec<FloatImage>> = if print_progress {
            let pb = ProgressBar::new(images.len() as u64);
            images.par_iter().progress_with(pb).map(run).collect::<Result<_, _>>()?
        } else {
            images.par_iter().map(run).collect::<Result<_, _>>()?
        };
        let mut accumulator = PsfAccumulator::new();
        for regions in &per_image {
            accumulator.add(regions);
        }
        info!("Averaging {} regions from {} images; {:?} elapsed",
              accumulator.num_regions(), images.len(), start.elapsed());
        accumulator.mean()
    }
}

/// Running element-wise sum of equally shaped regions.
#[derive(Clone, Debug, Default)]
pub struct PsfAccumulator {
    shape: Option<(u32, u32)>,
    sum: Vec<f64>,
    num_regions: usize,
}

impl PsfAccumulator {
    pub fn new() -> Self {
        PsfAccumulator::default()
    }

    /// # Panics
    /// If a region's shape differs from that of the regions added before.
    pub fn add(&mut self, regions: &[FloatImage]) {
        for region in regions {
            let shape = region.dimensions();
            match self.shape {
                None => {
                    self.shape = Some(shape);
                    self.sum = vec![0.0; region.as_raw().len()];
                },
                Some(s) => assert_eq!(s, shape, "region shape mismatch"),
            }
            for (acc, v) in self.sum.iter_mut().zip(region.as_raw()) {
                *acc += *v as f64;
            }
            self.num_regions += 1;
        }
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions
    }

    /// Element-wise mean of the regions added so far.
    pub fn mean(&self) -> Result<FloatImage, PsfError> {
        let Some((width, height)) = self.shape else {
            return Err(PsfError::EmptyResult);
        };
        let n = self.num_regions as f64;
        Ok(FloatImage::from_fn(width, height, |x, y| {
            Luma([(self.sum[(y * width + x) as usize] / n) as f32])
        }))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;
    use crate::image_funcs::{image_sum, mask_count};
    use crate::test_utils::{argmax, emitter_image, gaussian_template};

    // Neighbor filter that never fires.
    fn single_emitter_config() -> PsfEstimatorConfig {
        let mut config = PsfEstimatorConfig::new(gaussian_template());
        config.neighbor_split = SplitCondition::Width(1e6);
        config
    }

    #[test]
    fn test_build_defaults() {
        let estimator = PsfEstimator::build(
            PsfEstimatorConfig::new(gaussian_template())).unwrap();
        assert_abs_diff_eq!(image_sum(estimator.onsite_kernel()), 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(image_sum(estimator.neighbor_kernel()), 1.0, epsilon = 1e-5);
        assert_abs_diff_eq!(estimator.template_fit().width_u, 2.02, epsilon = 0.02);
        assert_eq!(estimator.template_fit().tilt, 0.0);
        assert_eq!(estimator.label_fit_size(), (4, 4));
        assert_eq!(estimator.region_size(), (13, 13));
        assert_eq!(estimator.region_shape(), (65, 65));

        let mut config = PsfEstimatorConfig::new(gaussian_template());
        config.label_center_rel_im_size = 2.0;
        config.psf_supersample = 3;
        let estimator = PsfEstimator::build(config).unwrap();
        assert_eq!(estimator.label_fit_size(), (8, 8));
        assert_eq!(estimator.region_shape(), (39, 39));
    }

    #[test]
    fn test_build_config_errors() {
        let cases: [fn(&mut PsfEstimatorConfig); 9] = [
            |c| c.psf_supersample = 0,
            |c| c.filter_outer_thr = c.filter_inner_thr,
            |c| c.filter_inner_thr = 1.5,
            |c| c.label_center_rel_im_size = 0.0,
            |c| c.label_center_tol.rel_center_tol = f64::NAN,
            |c| c.histogram_bins = Some(0),
            |c| c.onsite_split = SplitCondition::Center(2.0),
            |c| c.neighbor_split = SplitCondition::Width(-3.0),
            |c| c.guess_psf_integrated = FloatImage::new(13, 13),
        ];
        for (i, modify) in cases.iter().enumerate() {
            let mut config = PsfEstimatorConfig::new(gaussian_template());
            modify(&mut config);
            assert!(matches!(PsfEstimator::build(config),
                             Err(PsfError::Configuration(_))), "case {}", i);
        }
    }

    #[test]
    fn test_single_emitter() {
        let estimator = PsfEstimator::build(single_emitter_config()).unwrap();
        let image = emitter_image(64, 64, &[(32.3, 31.7)], 17);
        let analysis = estimator.analyze_image(&image, true).unwrap();

        assert_eq!(mask_count(&analysis.neighbor_mask), 0);
        assert_eq!(analysis.labels.num_labels(), 1);
        let com = analysis.labels.label_com[0];
        assert!((com.x - 32).abs() <= 1 && (com.y - 32).abs() <= 1, "{:?}", com);

        assert_eq!(analysis.candidates.len(), 1);
        let center = analysis.candidates[0].center().unwrap();
        assert_abs_diff_eq!(center.x, 32.3, epsilon = 0.2);
        assert_abs_diff_eq!(center.y, 31.7, epsilon = 0.2);

        assert_eq!(analysis.regions.len(), 1);
        let region = &analysis.regions[0];
        assert_eq!(region.dimensions(), (65, 65));
        assert_abs_diff_eq!(image_sum(region), 1.0, epsilon = 1e-4);
        let (px, py) = argmax(region);
        assert!((px as i32 - 32).abs() <= 1 && (py as i32 - 32).abs() <= 1,
                "peak at {} {}", px, py);
    }

    #[test]
    fn test_isolation_masks() {
        let estimator = PsfEstimator::build(single_emitter_config()).unwrap();
        let image = emitter_image(64, 64, &[(32.3, 31.7)], 3);
        let analysis = estimator.analyze_image(&image, false).unwrap();
        for (x, y, p) in analysis.isolated_mask.enumerate_pixels() {
            let isolated = p.0[0] != 0;
            let onsite = analysis.onsite_mask.get_pixel(x, y).0[0] != 0;
            let neighbor = analysis.neighbor_mask.get_pixel(x, y).0[0] != 0;
            assert_eq!(isolated, onsite && !neighbor);
        }
        assert_eq!(analysis.onsite_response.dimensions(), (64, 64));
        assert_eq!(analysis.neighbor_response.dimensions(), (64, 64));
    }

    #[test]
    fn test_multiple_emitters() {
        let spots = [(20.2, 22.6), (70.4, 20.1), (24.7, 71.3), (72.1, 69.8)];
        let estimator = PsfEstimator::build(single_emitter_config()).unwrap();
        let image = emitter_image(96, 96, &spots, 5);
        let analysis = estimator.analyze_image(&image, true).unwrap();
        assert_eq!(analysis.labels.num_labels(), 4);
        assert_eq!(analysis.regions.len(), 4);
        for candidate in &analysis.candidates {
            let center = candidate.center().unwrap();
            assert!(spots.iter().any(|(x, y)| {
                (center.x - x).abs() < 0.2 && (center.y - y).abs() < 0.2
            }), "{:?}", center);
        }
    }

    #[test]
    fn test_close_pair_excluded() {
        // The last two emitters are 5 pixels apart; each sits in the other's
        // neighbor ring.
        let isolated = [(20.2, 22.6), (70.4, 20.1), (24.7, 71.3)];
        let pair = [(66.0, 70.0), (71.0, 70.5)];
        let mut config = PsfEstimatorConfig::new(gaussian_template());
        config.neighbor_split = SplitCondition::Center(0.3);
        let estimator = PsfEstimator::build(config).unwrap();
        let spots: Vec<(f64, f64)> = isolated.iter().chain(&pair).copied().collect();
        let image = emitter_image(96, 96, &spots, 11);
        let analysis = estimator.analyze_image(&image, true).unwrap();

        assert_eq!(analysis.labels.num_labels(), 3);
        assert_eq!(analysis.regions.len(), 3);
        for candidate in &analysis.candidates {
            let center = candidate.center().unwrap();
            assert!(isolated.iter().any(|(x, y)| {
                (center.x - x).abs() < 0.2 && (center.y - y).abs() < 0.2
            }), "{:?}", center);
        }
    }

    #[test]
    fn test_empty_image() {
        let estimator = PsfEstimator::build(
            PsfEstimatorConfig::new(gaussian_template())).unwrap();
        let image = FloatImage::new(32, 32);
        let analysis = estimator.analyze_image(&image, true).unwrap();
        assert_eq!(analysis.labels.num_labels(), 0);
        assert!(analysis.candidates.is_empty());
        assert!(estimator.get_label_regions(&image, true).unwrap().is_empty());

        let images = vec![image.clone(), image];
        assert!(matches!(estimator.get_psf(&images, false), Err(PsfError::EmptyResult)));
        assert!(matches!(estimator.get_psf(&[], false), Err(PsfError::EmptyResult)));
    }

    #[test]
    fn test_get_psf() {
        let estimator = PsfEstimator::build(single_emitter_config()).unwrap();
        let images: Vec<FloatImage> = [(32.3, 31.7), (30.8, 33.1), (33.5, 32.4)]
            .iter().enumerate()
            .map(|(i, spot)| emitter_image(64, 64, &[*spot], 40 + i as u64))
            .collect();
        let psf = estimator.get_psf(&images, false).unwrap();
        assert_eq!(psf.dimensions(), (65, 65));
        assert_abs_diff_eq!(image_sum(&psf), 1.0, epsilon = 1e-4);
        let (px, py) = argmax(&psf);
        assert!((px as i32 - 32).abs() <= 1 && (py as i32 - 32).abs() <= 1);

        // Repeat runs, with or without progress reporting, are identical.
        assert_eq!(estimator.get_psf(&images, false).unwrap(), psf);
        assert_eq!(estimator.get_psf(&images, true).unwrap(), psf);
    }

    #[test]
    fn test_accumulator() {
        let mut accumulator = PsfAccumulator::new();
        assert!(matches!(accumulator.mean(), Err(PsfError::EmptyResult)));
        accumulator.add(&[]);
        assert!(matches!(accumulator.mean(), Err(PsfError::EmptyResult)));

        let a = FloatImage::from_raw(2, 1, vec![1.0, 3.0]).unwrap();
        let b = FloatImage::from_raw(2, 1, vec![2.0, 5.0]).unwrap();
        accumulator.add(&[a]);
        accumulator.add(&[b.clone(), b]);
        assert_eq!(accumulator.num_regions(), 3);
        let mean = accumulator.mean().unwrap();
        assert_abs_diff_eq!(mean.get_pixel(0, 0).0[0], 5.0 / 3.0, epsilon = 1e-6);
        assert_abs_diff_eq!(mean.get_pixel(1, 0).0[0], 13.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    #[should_panic(expected = "region shape mismatch")]
    fn test_accumulator_shape_mismatch() {
        let mut accumulator = PsfAccumulator::new();
        accumulator.add(&[FloatImage::new(2, 2), FloatImage::new(3, 2)]);
    }
}  // mod tests.
