// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use image::{GrayImage, Luma};
use imageproc::point::Point;
use imageproc::rect::Rect;

use crate::FloatImage;

/// Mask value for pixels that pass a test.
pub const MASK_ON: u8 = 255;

/// Sum of all pixel values, accumulated in f64.
pub fn image_sum(image: &FloatImage) -> f64 {
    image.as_raw().iter().map(|v| *v as f64).sum()
}

/// Number of set pixels in `mask`.
pub fn mask_count(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|v| **v != 0).count()
}

/// Returns the `width` x `height` rectangle whose center pixel is `center`.
/// For even sizes the center lies just right of (below) the geometric middle,
/// i.e. the rectangle starts at `center - size/2`.
///
/// # Panics
/// If `width` or `height` is zero.
pub fn roi_centered_at(center: Point<i32>, width: u32, height: u32) -> Rect {
    Rect::at(center.x - (width / 2) as i32, center.y - (height / 2) as i32)
        .of_size(width, height)
}

/// Copies the `roi` portion of `image`. Returns None if `roi` is not entirely
/// within the image.
pub fn crop_roi(image: &FloatImage, roi: &Rect) -> Option<FloatImage> {
    let (width, height) = image.dimensions();
    if roi.left() < 0 || roi.top() < 0 ||
        roi.right() >= width as i32 || roi.bottom() >= height as i32
    {
        return None;
    }
    let (left, top) = (roi.left() as u32, roi.top() as u32);
    Some(FloatImage::from_fn(roi.width(), roi.height(), |x, y| {
        *image.get_pixel(left + x, top + y)
    }))
}

/// Pixel-wise `onsite AND NOT neighbor`.
///
/// # Panics
/// If the masks differ in shape.
pub fn isolated_mask(onsite_mask: &GrayImage, neighbor_mask: &GrayImage) -> GrayImage {
    assert_eq!(onsite_mask.dimensions(), neighbor_mask.dimensions());
    let (width, height) = onsite_mask.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        let onsite = onsite_mask.get_pixel(x, y).0[0] != 0;
        let neighbor = neighbor_mask.get_pixel(x, y).0[0] != 0;
        Luma([if onsite && !neighbor { MASK_ON } else { 0 }])
    })
}

// Keys cubic convolution kernel with a = -0.5.
fn cubic_weight(t: f64) -> f64 {
    const A: f64 = -0.5;
    let t = t.abs();
    if t <= 1.0 {
        (A + 2.0) * t * t * t - (A + 3.0) * t * t + 1.0
    } else if t < 2.0 {
        A * t * t * t - 5.0 * A * t * t + 8.0 * A * t - 4.0 * A
    } else {
        0.0
    }
}

/// Resamples `image` onto a grid `factor` times denser along each axis.
///
/// Fine pixel j samples the coarse coordinate `(j + 0.5) / factor - 0.5`
/// using bicubic (Keys) interpolation with replicated edge pixels. The result
/// is then rescaled so that its total equals the total of `image`, i.e. flux
/// is preserved. A factor of 1 returns a copy.
///
/// # Panics
/// If `factor` is zero.
pub fn supersample(image: &FloatImage, factor: u32) -> FloatImage {
    assert!(factor > 0);
    if factor == 1 {
        return image.clone();
    }
    let (width, height) = image.dimensions();
    let s = factor as f64;
    let coarse = |x: i64, y: i64| -> f64 {
        let cx = x.clamp(0, width as i64 - 1) as u32;
        let cy = y.clamp(0, height as i64 - 1) as u32;
        image.get_pixel(cx, cy).0[0] as f64
    };
    let fine_width = width * factor;
    let fine_height = height * factor;
    let mut fine = Vec::<f64>::with_capacity((fine_width * fine_height) as usize);
    for j in 0..fine_height {
        let py = (j as f64 + 0.5) / s - 0.5;
        let fy = py.floor() as i64;
        for i in 0..fine_width {
            let px = (i as f64 + 0.5) / s - 0.5;
            let fx = px.floor() as i64;
            let mut value = 0.0;
            for yy in fy - 1..=fy + 2 {
                let wy = cubic_weight(py - yy as f64);
                if wy == 0.0 {
                    continue;
                }
                for xx in fx - 1..=fx + 2 {
                    let wx = cubic_weight(px - xx as f64);
                    if wx == 0.0 {
                        continue;
                    }
                    value += wy * wx * coarse(xx, yy);
                }
            }
            fine.push(value);
        }
    }
    let coarse_total = image_sum(image);
    let fine_total: f64 = fine.iter().sum();
    let scale = if fine_total != 0.0 { coarse_total / fine_total } else { 1.0 };
    FloatImage::from_fn(fine_width, fine_height, |x, y| {
        Luma([(fine[(y * fine_width + x) as usize] * scale) as f32])
    })
}

/// Sums `factor` x `factor` blocks of `image` into single pixels, inverting
/// supersample() up to interpolation error. Trailing rows and columns that do
/// not fill a block are dropped.
///
/// # Panics
/// If `factor` is zero.
pub fn bin_image(image: &FloatImage, factor: u32) -> FloatImage {
    assert!(factor > 0);
    let (width, height) = image.dimensions();
    let (new_width, new_height) = (width / factor, height / factor);
    let source_pixels = image.as_raw();
    FloatImage::from_fn(new_width, new_height, |bx, by| {
        let mut acc = 0.0_f64;
        for y in by * factor..(by + 1) * factor {
            for x in bx * factor..(bx + 1) * factor {
                acc += source_pixels[(y * width + x) as usize] as f64;
            }
        }
        Luma([acc as f32])
    })
}

/// Scales `image` so that its pixels sum to 1. Returns false (leaving the
/// image untouched) if the current sum is not a positive finite number.
pub fn normalize_sum(image: &mut FloatImage) -> bool {
    let total = image_sum(image);
    if !(total.is_finite() && total > 0.0) {
        return false;
    }
    for pixel in image.pixels_mut() {
        pixel.0[0] = (pixel.0[0] as f64 / total) as f32;
    }
    true
}

/// Renders a pixel-integrated circular Gaussian spot. Each pixel is the mean
/// of `oversample` x `oversample` point samples of
/// `amplitude * exp(-r^2 / (2 sigma^2))` spread evenly over the pixel area.
/// Pixel (x, y) is centered at integer coordinates (x, y).
pub fn render_gaussian_spot(width: u32, height: u32, center_x: f64, center_y: f64,
                            sigma: f64, amplitude: f64, oversample: u32)
                            -> FloatImage {
    let oversample = oversample.max(1);
    let step = 1.0 / oversample as f64;
    let two_sigma_sq = 2.0 * sigma * sigma;
    FloatImage::from_fn(width, height, |x, y| {
        let mut acc = 0.0;
        for sy in 0..oversample {
            let py = y as f64 + (sy as f64 + 0.5) * step - 0.5;
            for sx in 0..oversample {
                let px = x as f64 + (sx as f64 + 0.5) * step - 0.5;
                let r2 = (px - center_x).powi(2) + (py - center_y).powi(2);
                acc += (-r2 / two_sigma_sq).exp();
            }
        }
        Luma([(amplitude * acc / (oversample * oversample) as f64) as f32])
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use super::*;

    #[test]
    fn test_roi_centered_at() {
        let roi = roi_centered_at(Point::new(10, 20), 5, 4);
        assert_eq!((roi.left(), roi.top()), (8, 18));
        assert_eq!((roi.right(), roi.bottom()), (12, 21));
    }

    #[test]
    fn test_crop_roi() {
        let image = FloatImage::from_fn(6, 5, |x, y| Luma([(10 * y + x) as f32]));
        let crop = crop_roi(&image, &Rect::at(2, 1).of_size(3, 2)).unwrap();
        assert_eq!(crop.dimensions(), (3, 2));
        assert_eq!(crop.get_pixel(0, 0).0[0], 12.0);
        assert_eq!(crop.get_pixel(2, 1).0[0], 24.0);

        // Touching the far edges is fine; extending past them is not.
        assert!(crop_roi(&image, &Rect::at(3, 3).of_size(3, 2)).is_some());
        assert!(crop_roi(&image, &Rect::at(4, 3).of_size(3, 2)).is_none());
        assert!(crop_roi(&image, &Rect::at(-1, 0).of_size(3, 2)).is_none());
        assert!(crop_roi(&image, &Rect::at(0, 4).of_size(3, 2)).is_none());
    }

    #[test]
    fn test_isolated_mask() {
        let onsite = GrayImage::from_raw(4, 1, vec![255, 255, 0, 0]).unwrap();
        let neighbor = GrayImage::from_raw(4, 1, vec![0, 255, 255, 0]).unwrap();
        let isolated = isolated_mask(&onsite, &neighbor);
        assert_eq!(isolated.as_raw(), &vec![255, 0, 0, 0]);
    }

    #[test]
    fn test_isolated_mask_exclusive() {
        let onsite = GrayImage::from_fn(17, 13, |x, y| {
            Luma([if (x * 7 + y * 3) % 5 < 3 { 255 } else { 0 }])
        });
        let neighbor = GrayImage::from_fn(17, 13, |x, y| {
            Luma([if (x + 2 * y) % 4 == 0 { 255 } else { 0 }])
        });
        let isolated = isolated_mask(&onsite, &neighbor);
        for (x, y, pixel) in isolated.enumerate_pixels() {
            if pixel.0[0] != 0 {
                assert_ne!(onsite.get_pixel(x, y).0[0], 0);
                assert_eq!(neighbor.get_pixel(x, y).0[0], 0);
            }
        }
        assert!(mask_count(&isolated) > 0);
    }

    #[test]
    fn test_supersample_preserves_flux() {
        let image = render_gaussian_spot(9, 7, 4.3, 3.2, 1.5, 50.0, 5);
        let fine = supersample(&image, 5);
        assert_eq!(fine.dimensions(), (45, 35));
        assert_abs_diff_eq!(image_sum(&fine), image_sum(&image), epsilon = 1e-2);
    }

    #[test]
    fn test_supersample_flat() {
        let image = FloatImage::from_pixel(3, 3, Luma([2.0]));
        let fine = supersample(&image, 3);
        // Each coarse pixel's value is spread over 9 fine pixels.
        for pixel in fine.pixels() {
            assert_abs_diff_eq!(pixel.0[0], 2.0 / 9.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_supersample_factor_one() {
        let image = render_gaussian_spot(5, 5, 2.0, 2.0, 1.0, 1.0, 1);
        assert_eq!(supersample(&image, 1), image);
    }

    #[test]
    fn test_bin_image() {
        let image = FloatImage::from_fn(5, 4, |x, y| Luma([(y * 5 + x) as f32]));
        let binned = bin_image(&image, 2);
        assert_eq!(binned.dimensions(), (2, 2));
        assert_eq!(binned.get_pixel(0, 0).0[0], 0.0 + 1.0 + 5.0 + 6.0);
        assert_eq!(binned.get_pixel(1, 1).0[0], 12.0 + 13.0 + 17.0 + 18.0);

        // Binning undoes supersampling.
        let spot = render_gaussian_spot(9, 9, 4.2, 3.9, 1.5, 10.0, 5);
        let round_trip = bin_image(&supersample(&spot, 3), 3);
        assert_abs_diff_eq!(round_trip.get_pixel(4, 4).0[0], spot.get_pixel(4, 4).0[0],
                            epsilon = 0.5);
    }

    #[test]
    fn test_normalize_sum() {
        let mut image = FloatImage::from_raw(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(normalize_sum(&mut image));
        assert_abs_diff_eq!(image_sum(&image), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(image.get_pixel(1, 1).0[0], 0.4, epsilon = 1e-6);

        let mut zeros = FloatImage::new(2, 2);
        assert!(!normalize_sum(&mut zeros));
    }

    #[test]
    fn test_render_gaussian_spot() {
        let spot = render_gaussian_spot(21, 21, 10.0, 10.0, 2.0, 1.0, 5);
        let (mut peak_x, mut peak_y, mut peak) = (0, 0, f32::MIN);
        for (x, y, pixel) in spot.enumerate_pixels() {
            if pixel.0[0] > peak {
                (peak_x, peak_y, peak) = (x, y, pixel.0[0]);
            }
        }
        assert_eq!((peak_x, peak_y), (10, 10));
        // Pixel integration slightly lowers the peak.
        assert!(peak < 1.0 && peak > 0.95);
        // Total flux of a unit Gaussian is 2 pi sigma^2.
        assert_abs_diff_eq!(image_sum(&spot), 2.0 * std::f64::consts::PI * 4.0,
                            epsilon = 1e-2);
    }
}  // mod tests.
