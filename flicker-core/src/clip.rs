//! # Video Clip
//!
//! Immutable description of a compressed video stream: the raw bytes handed
//! to the decoder, the pixel geometry, the chroma sub-sampling layout, and
//! the target frame rate. Clips are cheap to clone (the compressed handle is
//! a refcounted `Bytes`) and are read-only to the rest of the pipeline.

use bytes::Bytes;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipError {
    #[error("Failed to read clip bytes: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid clip dimensions: {width}x{height}")]
    BadDimensions { width: u32, height: u32 },
    #[error("Invalid frame rate: {0}")]
    BadFrameRate(f64),
}

/// Chroma sub-sampling ratio relative to luma resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// U/V at half resolution in both axes (the common case).
    Chroma420,
    /// U/V at half horizontal resolution.
    Chroma422,
    /// U/V at full resolution.
    Chroma444,
}

impl PixelLayout {
    /// Chroma plane dimensions for a luma plane of `width` x `height`.
    /// Uses ceiling division so odd luma sizes round up.
    pub fn chroma_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        match self {
            Self::Chroma420 => (width.div_ceil(2), height.div_ceil(2)),
            Self::Chroma422 => (width.div_ceil(2), height),
            Self::Chroma444 => (width, height),
        }
    }
}

/// An opened video clip. Created once at load time, owned by the caller.
#[derive(Debug, Clone)]
pub struct VideoClip {
    data: Bytes,
    width: u32,
    height: u32,
    chroma_width: u32,
    chroma_height: u32,
    layout: PixelLayout,
    fps: f64,
}

impl VideoClip {
    /// Wrap an in-memory compressed stream.
    pub fn from_bytes(
        data: impl Into<Bytes>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        fps: f64,
    ) -> Result<Self, ClipError> {
        if width == 0 || height == 0 {
            return Err(ClipError::BadDimensions { width, height });
        }
        if !fps.is_finite() || fps <= 0.0 {
            return Err(ClipError::BadFrameRate(fps));
        }
        let (chroma_width, chroma_height) = layout.chroma_dimensions(width, height);
        Ok(Self {
            data: data.into(),
            width,
            height,
            chroma_width,
            chroma_height,
            layout,
            fps,
        })
    }

    /// Read the whole compressed file into memory and wrap it.
    pub fn from_path(
        path: impl AsRef<Path>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        fps: f64,
    ) -> Result<Self, ClipError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(data, width, height, layout, fps)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma_width(&self) -> u32 {
        self.chroma_width
    }

    pub fn chroma_height(&self) -> u32 {
        self.chroma_height
    }

    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    /// Seconds of playback one frame covers.
    pub fn frame_timestep(&self) -> f64 {
        1.0 / self.fps
    }
}
