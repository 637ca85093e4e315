// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Instant;

use image::{GrayImage, ImageBuffer, Luma};
use imageproc::point::Point;
use imageproc::region_labelling::{connected_components, Connectivity};
use log::debug;

use crate::FloatImage;

pub type LabelImage = ImageBuffer<Luma<u32>, Vec<u32>>;

/// Connected regions of a mask.
#[derive(Clone, Debug)]
pub struct LabelSet {
    /// 0 is background; regions are numbered 1..=K in raster order of their
    /// first pixel.
    pub labels: LabelImage,

    /// Pixel count of label k at index k-1.
    pub label_size: Vec<usize>,

    /// Intensity-weighted center of mass of label k at index k-1, rounded
    /// (half to even) to integer pixel coordinates.
    pub label_com: Vec<Point<i32>>,
}

impl LabelSet {
    pub fn num_labels(&self) -> usize {
        self.label_size.len()
    }
}

/// Labels the 4-connected regions of `mask` and computes each region's size
/// and center of mass. The center of mass is weighted by the pixel values of
/// `image`; if a region's total weight is zero or non-finite its geometric
/// centroid is used instead.
///
/// # Panics
/// If `mask` and `image` differ in shape.
pub fn find_labels(mask: &GrayImage, image: &FloatImage) -> LabelSet {
    assert_eq!(mask.dimensions(), image.dimensions());
    let start = Instant::now();
    let components = connected_components(mask, Connectivity::Four, Luma([0u8]));

    // Renumber so labels are contiguous in raster order.
    let max_component = components.pixels().map(|p| p.0[0]).max().unwrap_or(0);
    let mut remap = vec![0_u32; max_component as usize + 1];
    let mut num_labels = 0_u32;
    for pixel in components.pixels() {
        let c = pixel.0[0] as usize;
        if c != 0 && remap[c] == 0 {
            num_labels += 1;
            remap[c] = num_labels;
        }
    }
    let labels = LabelImage::from_fn(components.width(), components.height(), |x, y| {
        Luma([remap[components.get_pixel(x, y).0[0] as usize]])
    });

    let n = num_labels as usize;
    let mut label_size = vec![0_usize; n];
    let mut mass = vec![0.0_f64; n];
    let mut x_moment = vec![0.0_f64; n];
    let mut y_moment = vec![0.0_f64; n];
    let mut x_sum = vec![0.0_f64; n];
    let mut y_sum = vec![0.0_f64; n];
    for (x, y, label) in labels.enumerate_pixels() {
        let l = label.0[0] as usize;
        if l == 0 {
            continue;
        }
        let i = l - 1;
        let v = image.get_pixel(x, y).0[0] as f64;
        label_size[i] += 1;
        mass[i] += v;
        x_moment[i] += v * x as f64;
        y_moment[i] += v * y as f64;
        x_sum[i] += x as f64;
        y_sum[i] += y as f64;
    }
    let label_com = (0..n).map(|i| {
        let (cx, cy) = if mass[i].is_finite() && mass[i] != 0.0 {
            (x_moment[i] / mass[i], y_moment[i] / mass[i])
        } else {
            let size = label_size[i] as f64;
            (x_sum[i] / size, y_sum[i] / size)
        };
        Point::new(cx.round_ties_even() as i32, cy.round_ties_even() as i32)
    }).collect();

    debug!("Found {} labels in {:?}", n, start.elapsed());
    LabelSet{labels, label_size, label_com}
}

// mod tests.
