// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use env_logger;
use image::{GrayImage, ImageReader, Luma, Rgb};
use imageproc::drawing;
use log::{info, warn};

use iso_psf::FloatImage;
use iso_psf::algorithm::Candidate;
use iso_psf::estimator::{PsfAccumulator, PsfEstimator, PsfEstimatorConfig};
use iso_psf::error::PsfError;
use iso_psf::histogram_funcs::SplitCondition;
use iso_psf::image_funcs::{bin_image, render_gaussian_spot};

/// Estimates the PSF from isolated emitters in test image(s).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Path of the image file or directory of images to process.
    #[arg(short, long)]
    input: String,

    /// Directory where output file(s) are written.
    #[arg(short, long)]
    output: String,

    /// PSF template: an image file, or a text matrix as written to
    /// psf_binned.txt by a previous run. If omitted, a Gaussian template is
    /// synthesized from --template-sigma and --template-size.
    #[arg(short, long)]
    template: Option<String>,

    /// Sigma (pixels) of the synthesized Gaussian template.
    #[arg(long, default_value_t = 2.0)]
    template_sigma: f64,

    /// Width and height (pixels) of the synthesized Gaussian template.
    #[arg(long, default_value_t = 13)]
    template_size: u32,

    /// Supersampling factor of the PSF estimate.
    #[arg(short, long, default_value_t = 5)]
    supersample: u32,

    /// Fraction of the template peak separating its core from its tail.
    #[arg(long, default_value_t = (-1.0_f64).exp())]
    inner_thr: f64,

    /// Fraction of the template peak below which its tail is ignored.
    #[arg(long, default_value_t = (-4.0_f64).exp())]
    outer_thr: f64,

    /// On-site split at this many background widths above the background
    /// mode. Default 5 if neither on-site option is given.
    #[arg(long)]
    onsite_width: Option<f64>,

    /// On-site split at this fraction between the two mode centers.
    #[arg(long)]
    onsite_center: Option<f64>,

    /// Neighbor split at this many background widths above the background
    /// mode. Default 3 if neither neighbor option is given.
    #[arg(long)]
    neighbor_width: Option<f64>,

    /// Neighbor split at this fraction between the two mode centers.
    #[arg(long)]
    neighbor_center: Option<f64>,

    /// Scale of the label fit window relative to the template width.
    #[arg(long, default_value_t = 1.0)]
    rel_im_size: f64,

    /// Allowed fitted center offset, relative to the fit window.
    #[arg(long, default_value_t = 1.0)]
    rel_center_tol: f64,

    /// Allowed fitted width, relative to the fit window.
    #[arg(long, default_value_t = 2.0)]
    rel_width_tol: f64,

    /// Histogram bin count. Chosen from the image size if omitted.
    #[arg(long)]
    histogram_bins: Option<usize>,

    /// Skip images whose filter histograms lack two modes instead of failing.
    #[arg(long, default_value_t = false)]
    skip_failed: bool,

    /// Write a copy of each image with accepted emitters marked in green and
    /// rejected labels in red.
    #[arg(short, long, default_value_t = false)]
    mark: bool,

    /// Show a progress bar.
    #[arg(short, long, default_value_t = false)]
    progress: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let input_metadata = fs::metadata(&args.input)
        .map_err(|e| format!("Input file/dir '{}' does not exist? {:?}", args.input, e))?;
    let output_metadata = fs::metadata(&args.output)
        .map_err(|e| format!("Output dir '{}' does not exist? {:?}", args.output, e))?;
    if !output_metadata.is_dir() {
        return Err(format!("Output '{}' must be a directory", args.output).into());
    }

    let estimator = PsfEstimator::build(make_config(&args)?)?;
    info!("Label fit window {:?}; PSF shape {:?}",
          estimator.label_fit_size(), estimator.region_shape());

    let mut images = Vec::<(PathBuf, FloatImage)>::new();
    if input_metadata.is_dir() {
        let mut paths: Vec<PathBuf> = fs::read_dir(&args.input)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        for path in paths {
            if let Some(image) = read_image(&path) {
                images.push((path, image));
            }
        }
    } else if let Some(image) = read_image(Path::new(&args.input)) {
        images.push((PathBuf::from(&args.input), image));
    }
    info!("Loaded {} images", images.len());

    let start = Instant::now();
    let psf = if args.skip_failed || args.mark {
        process_each(&estimator, &images, &args)?
    } else {
        let images: Vec<FloatImage> = images.into_iter().map(|(_, im)| im).collect();
        estimator.get_psf(&images, args.progress)?
    };
    info!("PSF estimated in {:?}", start.elapsed());

    let output_dir = PathBuf::from(&args.output);
    write_matrix(&psf, &output_dir.join("psf.txt"))?;
    preview(&psf).save(output_dir.join("psf.png"))?;
    let binned = bin_image(&psf, args.supersample);
    write_matrix(&binned, &output_dir.join("psf_binned.txt"))?;
    info!("Wrote PSF files to {:?}", output_dir);
    Ok(())
}

// Neither option given selects `default`; otherwise exactly one must be.
fn split_condition(width: Option<f64>, center: Option<f64>, default: SplitCondition)
                   -> Result<SplitCondition, PsfError> {
    if width.is_none() && center.is_none() {
        return Ok(default);
    }
    SplitCondition::from_options(width, center)
}

fn make_config(args: &Args) -> Result<PsfEstimatorConfig, Box<dyn Error>> {
    let template = match &args.template {
        Some(path) => read_template(Path::new(path))?,
        None => {
            let size = args.template_size;
            let center = (size / 2) as f64;
            render_gaussian_spot(size, size, center, center, args.template_sigma, 1.0, 5)
        },
    };
    let mut config = PsfEstimatorConfig::new(template);
    config.psf_supersample = args.supersample;
    config.filter_inner_thr = args.inner_thr;
    config.filter_outer_thr = args.outer_thr;
    config.onsite_split = split_condition(
        args.onsite_width, args.onsite_center, config.onsite_split)?;
    config.neighbor_split = split_condition(
        args.neighbor_width, args.neighbor_center, config.neighbor_split)?;
    config.label_center_rel_im_size = args.rel_im_size;
    config.label_center_tol.rel_center_tol = args.rel_center_tol;
    config.label_center_tol.rel_width_tol = args.rel_width_tol;
    config.histogram_bins = args.histogram_bins;
    Ok(config)
}

fn read_image(path: &Path) -> Option<FloatImage> {
    let decoded = ImageReader::open(path).map_err(|e| e.to_string())
        .and_then(|reader| reader.decode().map_err(|e| e.to_string()));
    match decoded {
        Ok(img) => Some(img.to_luma32f()),
        Err(e) => {
            warn!("Skipping {:?} due to: {}", path, e);
            None
        },
    }
}

fn read_template(path: &Path) -> Result<FloatImage, Box<dyn Error>> {
    if path.extension().is_some_and(|ext| ext == "txt") {
        return read_matrix(path);
    }
    Ok(ImageReader::open(path)?.decode()?.to_luma32f())
}

// Per-image processing, for skipping failed images and for marking.
fn process_each(estimator: &PsfEstimator, images: &[(PathBuf, FloatImage)], args: &Args)
                -> Result<FloatImage, Box<dyn Error>> {
    let mut accumulator = PsfAccumulator::new();
    for (path, image) in images {
        let analysis = match estimator.analyze_image(image, true) {
            Ok(analysis) => analysis,
            Err(PsfError::Detection(e)) if args.skip_failed => {
                warn!("Skipping {:?} due to: {}", path, e);
                continue;
            },
            Err(e) => return Err(e.into()),
        };
        info!("{:?}: {} labels, {} regions",
              path, analysis.labels.num_labels(), analysis.regions.len());
        accumulator.add(&analysis.regions);
        if args.mark {
            let mut img_color = image::DynamicImage::ImageLuma8(preview(image)).into_rgb8();
            for (com, candidate) in analysis.labels.label_com.iter().zip(&analysis.candidates) {
                let (center, color) = match candidate {
                    Candidate::Valid{center, ..} => {
                        ((center.x.round() as i32, center.y.round() as i32),
                         Rgb::<u8>([0, 255, 0]))
                    },
                    Candidate::Rejected(_) => ((com.x, com.y), Rgb::<u8>([255, 0, 0])),
                };
                drawing::draw_hollow_circle_mut(&mut img_color, center, 4, color);
            }
            let mut output_path = PathBuf::from(&args.output);
            output_path.push(path.file_name().unwrap_or_default());
            output_path.set_extension("bmp");
            img_color.save(output_path)?;
        }
    }
    Ok(accumulator.mean()?)
}

// 8-bit rendering scaled to the image's range.
fn preview(image: &FloatImage) -> GrayImage {
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for p in image.pixels() {
        min = min.min(p.0[0]);
        max = max.max(p.0[0]);
    }
    let scale = if max > min { 255.0 / (max - min) } else { 0.0 };
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([((image.get_pixel(x, y).0[0] - min) * scale).round() as u8])
    })
}

fn write_matrix(image: &FloatImage, path: &Path) -> Result<(), Box<dyn Error>> {
    let (width, height) = image.dimensions();
    let mut text = String::new();
    text.push_str(format!("# WxH {}x{}\n", width, height).as_str());
    for y in 0..height {
        let row: Vec<String> = (0..width)
            .map(|x| format!("{:e}", image.get_pixel(x, y).0[0]))
            .collect();
        text.push_str(&row.join(" "));
        text.push('\n');
    }
    fs::write(path, text)?;
    Ok(())
}

fn read_matrix(path: &Path) -> Result<FloatImage, Box<dyn Error>> {
    let text = fs::read_to_string(path)?;
    let mut rows = Vec::<Vec<f32>>::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        rows.push(line.split_whitespace()
                  .map(|v| v.parse::<f32>())
                  .collect::<Result<_, _>>()?);
    }
    let height = rows.len() as u32;
    let width = rows.first().map_or(0, |r| r.len()) as u32;
    if rows.iter().any(|r| r.len() as u32 != width) {
        return Err(format!("Ragged matrix in {:?}", path).into());
    }
    Ok(FloatImage::from_fn(width, height, |x, y| Luma([rows[y as usize][x as usize]])))
}
