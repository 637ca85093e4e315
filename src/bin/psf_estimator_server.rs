// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::ffi::CString;
use std::io::Error;
use std::net::SocketAddr;
use std::time::Instant;

use clap::Parser;
use env_logger;
use libc::{close, mmap, munmap, shm_open, O_RDONLY, PROT_READ, MAP_FAILED, MAP_SHARED};
use log::{debug, info, warn};
use rayon::prelude::*;
use tonic::Status;

use ::iso_psf::FloatImage;
use ::iso_psf::error::PsfError;
use ::iso_psf::estimator::{PsfAccumulator, PsfEstimator, PsfEstimatorConfig};
use ::iso_psf::histogram_funcs::SplitCondition;
use crate::iso_psf::psf_estimation_server::{PsfEstimation, PsfEstimationServer};

use tonic_web::GrpcWebLayer;

pub mod iso_psf {
    // The string specified here must match the proto package name.
    tonic::include_proto!("iso_psf");
}

struct MyPsfEstimation {
    // No server state; each request builds its own estimator.
}

// Copies `num_pixels` f32 values out of the named POSIX shared memory object.
fn read_shmem(name: &str, num_pixels: usize) -> Result<Vec<f32>, Status> {
    let c_name = CString::new(name).map_err(|_| Status::invalid_argument(
        format!("Invalid shared memory name {:?}", name)))?;
    let num_bytes = num_pixels * std::mem::size_of::<f32>();
    debug!("Using shared memory at {:?}", c_name);
    unsafe {
        let fd = shm_open(c_name.as_ptr(), O_RDONLY, 0);
        if fd < 0 {
            let msg = format!("Could not open shared memory at {:?}: {}",
                              c_name, Error::last_os_error());
            warn!("{}", msg);
            // Clients can recognize the INTERNAL error and fall back to
            // sending pixels inline.
            return Err(Status::internal(msg));
        }
        let addr = mmap(std::ptr::null_mut(), num_bytes, PROT_READ, MAP_SHARED, fd, 0);
        if addr == MAP_FAILED {
            let msg = format!("Could not mmap shared memory at {:?} for {} bytes: {}",
                              c_name, num_bytes, Error::last_os_error());
            warn!("{}", msg);
            if close(fd) == -1 {
                warn!("Could not close shared memory file: {}", Error::last_os_error());
            }
            return Err(Status::internal(msg));
        }
        // mmap returns page-aligned memory, so the f32 view is aligned.
        let pixels = std::slice::from_raw_parts(addr as *const f32, num_pixels).to_vec();
        if munmap(addr, num_bytes) == -1 {
            warn!("Could not munmap shared memory: {}", Error::last_os_error());
        }
        if close(fd) == -1 {
            warn!("Could not close shared memory file: {}", Error::last_os_error());
        }
        Ok(pixels)
    }
}

fn to_float_image(image: iso_psf::Image, what: &str) -> Result<FloatImage, Status> {
    if image.width <= 0 || image.height <= 0 {
        return Err(Status::invalid_argument(format!(
            "Invalid {} dimensions {}x{}", what, image.width, image.height)));
    }
    let (width, height) = (image.width as u32, image.height as u32);
    let num_pixels = (width * height) as usize;
    let pixels = match &image.shmem_name {
        Some(name) => read_shmem(name, num_pixels)?,
        None => image.image_data,
    };
    FloatImage::from_raw(width, height, pixels).ok_or_else(|| Status::invalid_argument(
        format!("{} data does not match its {}x{} dimensions", what, width, height)))
}

fn status_for(e: PsfError) -> Status {
    match e {
        PsfError::Configuration(_) => Status::invalid_argument(e.to_string()),
        PsfError::Detection(_) => Status::failed_precondition(e.to_string()),
        PsfError::EmptyResult => Status::not_found(e.to_string()),
    }
}

// Neither option given keeps `default`; otherwise exactly one must be.
fn split_condition(width: Option<f64>, center: Option<f64>, default: SplitCondition)
                   -> Result<SplitCondition, PsfError> {
    if width.is_none() && center.is_none() {
        return Ok(default);
    }
    SplitCondition::from_options(width, center)
}

fn make_config(req: &iso_psf::PsfRequest, template: FloatImage)
               -> Result<PsfEstimatorConfig, PsfError> {
    let mut config = PsfEstimatorConfig::new(template);
    if let Some(s) = req.psf_supersample {
        config.psf_supersample = u32::try_from(s).map_err(|_| PsfError::Configuration(
            format!("psf_supersample {} must be positive", s)))?;
    }
    if let Some(t) = req.filter_inner_thr {
        config.filter_inner_thr = t;
    }
    if let Some(t) = req.filter_outer_thr {
        config.filter_outer_thr = t;
    }
    config.onsite_split = split_condition(
        req.onsite_split_width, req.onsite_split_center, config.onsite_split)?;
    config.neighbor_split = split_condition(
        req.neighbor_split_width, req.neighbor_split_center, config.neighbor_split)?;
    if let Some(r) = req.label_center_rel_im_size {
        config.label_center_rel_im_size = r;
    }
    if let Some(t) = req.rel_center_tol {
        config.label_center_tol.rel_center_tol = t;
    }
    if let Some(t) = req.rel_width_tol {
        config.label_center_tol.rel_width_tol = t;
    }
    if let Some(b) = req.histogram_bins {
        config.histogram_bins = Some(usize::try_from(b).map_err(|_| PsfError::Configuration(
            format!("histogram_bins {} must be positive", b)))?);
    }
    Ok(config)
}

// Returns the PSF, the number of regions and the number of images used.
fn estimate(estimator: &PsfEstimator, images: &[FloatImage], skip_failed: bool)
            -> Result<(FloatImage, usize, usize), PsfError> {
    let per_image: Vec<Result<Vec<FloatImage>, PsfError>> = images.par_iter()
        .map(|image| estimator.get_label_regions(image, true))
        .collect();
    let mut accumulator = PsfAccumulator::new();
    let mut num_images_used = 0;
    for (index, result) in per_image.into_iter().enumerate() {
        match result {
            Ok(regions) => {
                accumulator.add(&regions);
                num_images_used += 1;
            },
            Err(PsfError::Detection(msg)) if skip_failed => {
                warn!("Skipping image {} due to: {}", index, msg);
            },
            Err(e) => return Err(e),
        }
    }
    Ok((accumulator.mean()?, accumulator.num_regions(), num_images_used))
}

#[tonic::async_trait]
impl PsfEstimation for MyPsfEstimation {
    async fn estimate_psf(
        &self, request: tonic::Request<iso_psf::PsfRequest>)
        -> Result<tonic::Response<iso_psf::PsfResult>, Status>
    {
        let rpc_start = Instant::now();
        let mut req: iso_psf::PsfRequest = request.into_inner();

        let Some(template) = req.template.take() else {
            return Err(Status::invalid_argument("Request 'template' field is missing"));
        };
        let template = to_float_image(template, "template")?;
        let images = std::mem::take(&mut req.images).into_iter().enumerate()
            .map(|(i, image)| to_float_image(image, &format!("image {}", i)))
            .collect::<Result<Vec<_>, _>>()?;
        let config = make_config(&req, template).map_err(status_for)?;
        let estimator = PsfEstimator::build(config).map_err(status_for)?;
        let supersample = estimator.config().psf_supersample;
        let skip_failed = req.skip_failed;
        info!("Estimating PSF from {} images", images.len());

        let (psf, num_regions, num_images_used) = tokio::task::spawn_blocking(
            move || estimate(&estimator, &images, skip_failed))
            .await
            .map_err(|e| Status::internal(format!("Estimation task failed: {}", e)))?
            .map_err(status_for)?;
        info!("Averaged {} regions from {} images in {:?}",
              num_regions, num_images_used, rpc_start.elapsed());

        let response = iso_psf::PsfResult{
            psf: Some(iso_psf::Image{
                width: psf.width() as i32,
                height: psf.height() as i32,
                image_data: psf.into_raw(),
                shmem_name: None,
            }),
            supersample: supersample as i32,
            num_regions: num_regions as i32,
            num_images_used: num_images_used as i32,
            algorithm_time: prost_types::Duration::try_from(rpc_start.elapsed()).ok(),
        };
        Ok(tonic::Response::new(response))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about=None)]
struct Args {
    /// Port that the gRPC server listens on.
    #[arg(short, long, default_value_t = 50061)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    // Listen on any address for the given port.
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("PsfEstimationServer listening on {}", addr);

    tonic::transport::Server::builder()
        .accept_http1(true)
        .layer(GrpcWebLayer::new())
        .add_service(PsfEstimationServer::new(MyPsfEstimation{}))
        .serve(addr)
        .await?;
    Ok(())
}
