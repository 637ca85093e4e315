// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

/// Errors surfaced by the PSF estimation pipeline. Per-candidate fit failures
/// and tolerance rejections are not errors; see
/// [Candidate](crate::algorithm::Candidate).
#[derive(Debug, thiserror::Error)]
pub enum PsfError {
    /// Invalid or contradictory parameters. Raised before any image is
    /// processed.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The filter response histogram did not yield the two modes needed to
    /// derive a split value. Aborts the run for the image concerned.
    #[error("detection error: {0}")]
    Detection(String),

    /// No isolated emitter region survived across all processed images.
    #[error("no isolated emitter regions were collected")]
    EmptyResult,
}
