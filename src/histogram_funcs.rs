// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Bimodal thresholding of filter response maps. The histogram of a response
//! map over a sparse emitter image has a dominant background mode and a mode
//! formed by emitter-affected pixels; the split between them turns the map
//! into a boolean mask.

use std::time::Instant;

use image::{GrayImage, Luma};
use log::debug;

use crate::FloatImage;
use crate::error::PsfError;
use crate::image_funcs::MASK_ON;

/// Equal-width histogram over the `[min, max]` range of some data.
#[derive(Clone, Debug)]
pub struct Histogram {
    /// Bin midpoints.
    pub centers: Vec<f64>,
    pub counts: Vec<u32>,
    pub bin_width: f64,
}

impl Histogram {
    /// Bins `values` into `bins` equal bins spanning their range. A value equal
    /// to the maximum lands in the last bin. Returns None if `values` is empty,
    /// constant, or contains non-finite numbers.
    pub fn build(values: &[f32], bins: usize) -> Option<Histogram> {
        if values.is_empty() || bins == 0 {
            return None;
        }
        let mut min = f64::MAX;
        let mut max = f64::MIN;
        for v in values {
            let v = *v as f64;
            if !v.is_finite() {
                return None;
            }
            min = min.min(v);
            max = max.max(v);
        }
        if max <= min {
            return None;
        }
        let bin_width = (max - min) / bins as f64;
        let mut counts = vec![0_u32; bins];
        for v in values {
            let index = ((*v as f64 - min) * bins as f64 / (max - min)) as usize;
            counts[index.min(bins - 1)] += 1;
        }
        let centers = (0..bins).map(|b| min + (b as f64 + 0.5) * bin_width).collect();
        Some(Histogram{centers, counts, bin_width})
    }
}

/// Number of histogram bins used for a response map of `num_pixels` pixels
/// when not overridden.
pub fn default_bin_count(num_pixels: usize) -> usize {
    (num_pixels / 2048).clamp(32, 128)
}

#[derive(Debug)]
pub struct HistogramStats {
    pub mean: f64,
    pub stddev: f64,
}

/// Count-weighted mean and standard deviation of bin positions `centers`.
pub fn stats_for_histogram(centers: &[f64], counts: &[u32]) -> HistogramStats {
    let mut count = 0.0;
    let mut first_moment = 0.0;
    for (c, n) in centers.iter().zip(counts) {
        count += *n as f64;
        first_moment += *n as f64 * c;
    }
    if count == 0.0 {
        return HistogramStats{mean: 0.0, stddev: 0.0};
    }
    let mean = first_moment / count;
    let mut second_moment = 0.0;
    for (c, n) in centers.iter().zip(counts) {
        second_moment += *n as f64 * (c - mean) * (c - mean);
    }
    HistogramStats{mean, stddev: (second_moment / count).sqrt()}
}

/// One mode of a histogram.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistogramPeak {
    /// Count-weighted mean position of the peak's support.
    pub center: f64,
    /// Count-weighted standard deviation over the support, including the bin
    /// quantization variance.
    pub width: f64,
    /// Topographic prominence, in counts.
    pub prominence: f64,
    /// Index of the peak's highest bin.
    pub bin: usize,
}

// Local maxima of `c`, excluding its first and last entries. A flat top
// resolves to its middle (rounded down).
fn local_maxima(c: &[f64]) -> Vec<usize> {
    let mut peaks = Vec::<usize>::new();
    let n = c.len();
    let mut i = 1;
    while i + 1 < n {
        if c[i - 1] < c[i] {
            let mut ahead = i + 1;
            while ahead + 1 < n && c[ahead] == c[i] {
                ahead += 1;
            }
            if c[ahead] < c[i] {
                peaks.push((i + ahead - 1) / 2);
                i = ahead;
                continue;
            }
        }
        i += 1;
    }
    peaks
}

// Returns (prominence, base) of the peak at `p`. The search on each side runs
// until a strictly higher sample or the end; the base is the higher of the
// two side minima.
fn prominence(c: &[f64], p: usize) -> (f64, f64) {
    let height = c[p];
    let mut left_min = height;
    let mut k = p;
    while k > 0 && c[k - 1] <= height {
        k -= 1;
        left_min = left_min.min(c[k]);
    }
    let mut right_min = height;
    k = p;
    while k + 1 < c.len() && c[k + 1] <= height {
        k += 1;
        right_min = right_min.min(c[k]);
    }
    let base = left_min.max(right_min);
    (height - base, base)
}

/// Finds the two most prominent modes of a histogram.
///
/// The counts are padded with a zero on each side so modes at the ends of the
/// range are found. Each local maximum gets its topographic prominence; those
/// with positive prominence are ranked (most prominent first, ties to the
/// lower bin). For each of the top two, the support is the contiguous run of
/// bins around the maximum whose count exceeds `base + 0.1 * prominence`; the
/// peak's center and width are the count-weighted mean and standard deviation
/// of `centers` over the support, with `bin_width^2 / 12` added to the
/// variance.
///
/// Returns the two peaks ordered by center, or a detection error if fewer
/// than two peaks exist.
pub fn find_two_peaks(centers: &[f64], counts: &[u32])
                      -> Result<[HistogramPeak; 2], PsfError> {
    assert_eq!(centers.len(), counts.len());
    let bin_width = if centers.len() > 1 { centers[1] - centers[0] } else { 0.0 };
    let mut padded = Vec::<f64>::with_capacity(counts.len() + 2);
    padded.push(0.0);
    padded.extend(counts.iter().map(|c| *c as f64));
    padded.push(0.0);

    let mut ranked = Vec::<(usize, f64, f64)>::new();
    for p in local_maxima(&padded) {
        let (prom, base) = prominence(&padded, p);
        if prom > 0.0 {
            ranked.push((p, prom, base));
        }
    }
    if ranked.len() < 2 {
        return Err(PsfError::Detection(format!(
            "expected two histogram peaks, found {}", ranked.len())));
    }
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(2);
    ranked.sort_by_key(|r| r.0);

    let mut peaks = Vec::<HistogramPeak>::with_capacity(2);
    for (p, prom, base) in ranked {
        let threshold = base + 0.1 * prom;
        let (mut start, mut end) = (p, p);
        while start > 1 && padded[start - 1] > threshold {
            start -= 1;
        }
        while end + 2 < padded.len() && padded[end + 1] > threshold {
            end += 1;
        }
        // Padded index i is real bin i - 1.
        let stats = stats_for_histogram(&centers[start - 1..end],
                                        &counts[start - 1..end]);
        peaks.push(HistogramPeak{
            center: stats.mean,
            width: (stats.stddev * stats.stddev + bin_width * bin_width / 12.0).sqrt(),
            prominence: prom,
            bin: p - 1,
        });
    }
    Ok([peaks[0], peaks[1]])
}

/// How the split value is placed between the two modes of a response
/// histogram.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SplitCondition {
    /// `split = peak0.center + k * peak0.width`: k background widths above
    /// the background mode.
    Width(f64),
    /// `split = f * peak0.center + (1 - f) * peak1.center`: a point between
    /// the two mode centers, with f in [0, 1].
    Center(f64),
}

impl SplitCondition {
    /// Builds a split condition from the loosely typed pair of options used by
    /// command line and RPC callers. Exactly one must be given.
    pub fn from_options(width: Option<f64>, center: Option<f64>)
                        -> Result<SplitCondition, PsfError> {
        let condition = match (width, center) {
            (Some(k), None) => SplitCondition::Width(k),
            (None, Some(f)) => SplitCondition::Center(f),
            (Some(_), Some(_)) => {
                return Err(PsfError::Configuration(
                    "split is overspecified: give either width or center".to_string()));
            },
            (None, None) => {
                return Err(PsfError::Configuration(
                    "split is unspecified: give either width or center".to_string()));
            },
        };
        condition.validate()?;
        Ok(condition)
    }

    pub fn validate(&self) -> Result<(), PsfError> {
        match *self {
            SplitCondition::Width(k) if !(k.is_finite() && k >= 0.0) => {
                Err(PsfError::Configuration(format!(
                    "split width multiplier {} must be finite and non-negative", k)))
            },
            SplitCondition::Center(f) if !(0.0..=1.0).contains(&f) => {
                Err(PsfError::Configuration(format!(
                    "split center fraction {} must be within [0, 1]", f)))
            },
            _ => Ok(()),
        }
    }

    /// Split value for `peaks`, ordered by center.
    pub fn split_value(&self, peaks: &[HistogramPeak; 2]) -> f64 {
        match *self {
            SplitCondition::Width(k) => peaks[0].center + k * peaks[0].width,
            SplitCondition::Center(f) => f * peaks[0].center + (1.0 - f) * peaks[1].center,
        }
    }
}

/// Diagnostics of one histogram split.
#[derive(Clone, Debug)]
pub struct HistogramSplit {
    pub histogram: Histogram,
    pub peaks: [HistogramPeak; 2],
    pub split_value: f64,
}

/// Computes the histogram of `response`, its two modes and the split value.
/// Returns None if the response is constant (it carries no emitter signal).
///
/// # Arguments
///   `response` - A filter response map.
///   `bins` - Histogram bin count; None selects `default_bin_count()`.
///   `split` - Placement of the split value between the modes.
pub fn split_filter_hist(response: &FloatImage, bins: Option<usize>,
                         split: &SplitCondition)
                         -> Result<Option<HistogramSplit>, PsfError> {
    let values = response.as_raw();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(PsfError::Detection(
            "response map contains non-finite values".to_string()));
    }
    let bins = match bins {
        Some(0) => {
            return Err(PsfError::Configuration(
                "histogram bin count must be positive".to_string()));
        },
        Some(b) => b,
        None => default_bin_count(values.len()),
    };
    let Some(histogram) = Histogram::build(values, bins) else {
        debug!("Constant response map; no split");
        return Ok(None);
    };
    debug!("Response histogram: centers {:?} counts {:?}",
           histogram.centers, histogram.counts);
    let peaks = find_two_peaks(&histogram.centers, &histogram.counts)?;
    let split_value = split.split_value(&peaks);
    debug!("Histogram peaks {:?}; {:?} gives split {}", peaks, split, split_value);
    Ok(Some(HistogramSplit{histogram, peaks, split_value}))
}

/// Thresholds `response` at the split value between its two histogram modes.
/// Pixels with `response >= split` are set in the returned mask. A constant
/// response yields an empty mask.
pub fn interpret_filter_hist(response: &FloatImage, bins: Option<usize>,
                             split: &SplitCondition)
                             -> Result<GrayImage, PsfError> {
    let start = Instant::now();
    let (width, height) = response.dimensions();
    let Some(hist_split) = split_filter_hist(response, bins, split)? else {
        return Ok(GrayImage::new(width, height));
    };
    let threshold = hist_split.split_value;
    let mask = GrayImage::from_fn(width, height, |x, y| {
        let v = response.get_pixel(x, y).0[0] as f64;
        Luma([if v >= threshold { MASK_ON } else { 0 }])
    });
    debug!("Thresholded response at {} in {:?}", threshold, start.elapsed());
    Ok(mask)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;
    use crate::image_funcs::mask_count;

    fn bin_positions(n: usize) -> Vec<f64> {
        (0..n).map(|i| i as f64).collect()
    }

    #[test]
    fn test_default_bin_count() {
        assert_eq!(default_bin_count(100), 32);
        assert_eq!(default_bin_count(64 * 2048), 64);
        assert_eq!(default_bin_count(4096 * 4096), 128);
    }

    #[test]
    fn test_histogram_build() {
        let histogram = Histogram::build(&[0.0, 1.0, 2.0, 3.0, 4.0], 2).unwrap();
        assert_eq!(histogram.counts, vec![2, 3]);
        assert_eq!(histogram.centers, vec![1.0, 3.0]);
        assert_eq!(histogram.bin_width, 2.0);

        assert!(Histogram::build(&[1.5, 1.5, 1.5], 4).is_none());
        assert!(Histogram::build(&[], 4).is_none());
        assert!(Histogram::build(&[0.0, f32::NAN], 4).is_none());
    }

    #[test]
    fn test_stats_for_histogram() {
        let stats = stats_for_histogram(&[10.0, 15.0, 20.0], &[2, 0, 2]);
        assert_eq!(stats.mean, 15.0);
        assert_eq!(stats.stddev, 5.0);
    }

    #[test]
    fn test_find_two_peaks() {
        let counts = [0, 10, 50, 10, 0, 0, 3, 8, 3, 0];
        let peaks = find_two_peaks(&bin_positions(counts.len()), &counts).unwrap();
        assert_eq!(peaks[0].bin, 2);
        assert_eq!(peaks[0].prominence, 50.0);
        assert_abs_diff_eq!(peaks[0].center, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(peaks[0].width, (20.0 / 70.0 + 1.0 / 12.0_f64).sqrt(),
                            epsilon = 1e-12);
        assert_eq!(peaks[1].bin, 7);
        assert_eq!(peaks[1].prominence, 8.0);
        assert_abs_diff_eq!(peaks[1].center, 7.0, epsilon = 1e-12);
        assert_abs_diff_eq!(peaks[1].width, (6.0 / 14.0 + 1.0 / 12.0_f64).sqrt(),
                            epsilon = 1e-12);
    }

    #[test]
    fn test_find_two_peaks_most_prominent() {
        // Three modes; the weakest is dropped and the rest come back ordered
        // by position, not prominence.
        let counts = [0, 5, 0, 0, 20, 0, 0, 40, 0];
        let peaks = find_two_peaks(&bin_positions(counts.len()), &counts).unwrap();
        assert_eq!(peaks[0].bin, 4);
        assert_eq!(peaks[1].bin, 7);
        assert!(peaks[0].prominence < peaks[1].prominence);
    }

    #[test]
    fn test_find_two_peaks_edges_and_plateau() {
        // Mode at the first bin, and a flat-topped mode resolving to its middle.
        let counts = [30, 4, 0, 6, 6, 6, 0];
        let peaks = find_two_peaks(&bin_positions(counts.len()), &counts).unwrap();
        assert_eq!(peaks[0].bin, 0);
        assert_eq!(peaks[1].bin, 4);
        assert_abs_diff_eq!(peaks[1].center, 4.0, epsilon = 1e-12);
    }

    #[test]
    fn test_find_two_peaks_too_few() {
        let counts = [1, 2, 3, 2];
        assert!(matches!(find_two_peaks(&bin_positions(4), &counts),
                         Err(PsfError::Detection(_))));
        let counts = [0, 0, 0];
        assert!(matches!(find_two_peaks(&bin_positions(3), &counts),
                         Err(PsfError::Detection(_))));
    }

    #[test]
    fn test_split_condition_from_options() {
        assert_eq!(SplitCondition::from_options(Some(5.0), None).unwrap(),
                   SplitCondition::Width(5.0));
        assert_eq!(SplitCondition::from_options(None, Some(0.3)).unwrap(),
                   SplitCondition::Center(0.3));
        assert!(matches!(SplitCondition::from_options(Some(5.0), Some(0.5)),
                         Err(PsfError::Configuration(_))));
        assert!(matches!(SplitCondition::from_options(None, None),
                         Err(PsfError::Configuration(_))));
        assert!(matches!(SplitCondition::from_options(None, Some(1.5)),
                         Err(PsfError::Configuration(_))));
        assert!(matches!(SplitCondition::from_options(Some(-1.0), None),
                         Err(PsfError::Configuration(_))));
    }

    #[test]
    fn test_split_value() {
        let peak = |center, width| HistogramPeak{center, width, prominence: 1.0, bin: 0};
        let peaks = [peak(2.0, 1.0), peak(7.0, 0.5)];
        assert_eq!(SplitCondition::Width(3.0).split_value(&peaks), 5.0);
        assert_eq!(SplitCondition::Center(0.5).split_value(&peaks), 4.5);
        assert_eq!(SplitCondition::Center(1.0).split_value(&peaks), 2.0);
    }

    // 1600 pixels: a low background mode and every 16th pixel in a high mode.
    fn bimodal_response() -> FloatImage {
        FloatImage::from_fn(40, 40, |x, y| {
            let i = y * 40 + x;
            if i % 16 == 0 {
                Luma([10.0 + (i % 7) as f32 * 0.1])
            } else {
                Luma([(i % 13) as f32 * 0.05])
            }
        })
    }

    #[test]
    fn test_interpret_filter_hist() {
        let response = bimodal_response();
        for split in [SplitCondition::Width(5.0), SplitCondition::Center(0.5)] {
            let mask = interpret_filter_hist(&response, None, &split).unwrap();
            assert_eq!(mask.dimensions(), (40, 40));
            assert_eq!(mask_count(&mask), 100);
            for (x, y, pixel) in mask.enumerate_pixels() {
                assert_eq!(pixel.0[0] != 0, (y * 40 + x) % 16 == 0);
            }
        }
    }

    #[test]
    fn test_interpret_filter_hist_deterministic() {
        let response = bimodal_response();
        let split = SplitCondition::Width(5.0);
        let mask1 = interpret_filter_hist(&response, Some(50), &split).unwrap();
        let mask2 = interpret_filter_hist(&response, Some(50), &split).unwrap();
        assert_eq!(mask1, mask2);
    }

    #[test]
    fn test_interpret_filter_hist_constant() {
        let response = FloatImage::from_pixel(8, 8, Luma([0.0]));
        let mask = interpret_filter_hist(&response, None,
                                         &SplitCondition::Width(5.0)).unwrap();
        assert_eq!(mask_count(&mask), 0);
    }

    #[test]
    fn test_interpret_filter_hist_errors() {
        let unimodal = FloatImage::from_raw(
            8, 1, vec![0.0, 1.0, 1.0, 2.0, 2.0, 2.0, 3.0, 3.0]).unwrap();
        let split = SplitCondition::Width(5.0);
        assert!(matches!(interpret_filter_hist(&unimodal, Some(4), &split),
                         Err(PsfError::Detection(_))));
        assert!(matches!(interpret_filter_hist(&unimodal, Some(0), &split),
                         Err(PsfError::Configuration(_))));
        let mut bad = bimodal_response();
        bad.put_pixel(3, 3, Luma([f32::INFINITY]));
        assert!(matches!(interpret_filter_hist(&bad, None, &split),
                         Err(PsfError::Detection(_))));
    }
}  // mod tests.
