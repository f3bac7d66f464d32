//! Recoverable backend errors.
//!
//! Everything here is reported to the caller and leaves the device usable.
//! Conditions the hardware budget makes unrecoverable (out of memory after a
//! full eviction sweep, unsupported native formats, uninstancing hardware
//! geometry) abort at the point of detection instead; they indicate content
//! or policy bugs that must be fixed upstream.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GxError {
    #[error("palettized raster formats are not supported by this target")]
    PalettizedUnsupported,

    #[error("invalid raster type or format for this operation")]
    InvalidRaster,

    #[error("no raster format for image depth {depth}")]
    InvalidImageFormat { depth: i32 },

    #[error("texture chunk platform id {0:#x} does not match this target")]
    WrongPlatform(u32),

    #[error("compressed rasters cannot be read back")]
    CompressedReadback,

    #[error("native texture i/o failed")]
    Io(#[from] std::io::Error),
}
