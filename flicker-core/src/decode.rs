//! # Decoder Contract
//!
//! The bitstream decoder is an external collaborator: an opaque native
//! library exposed here as a pair of traits. [`DecoderProvider::open`] turns
//! a clip's compressed bytes into a live decoder instance; the instance
//! yields one planar frame at a time and can be reset in place for looping.
//! Closing is `Drop`.

use crate::clip::{PixelLayout, VideoClip};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Failed to open stream: {0}")]
    OpenFailed(String),
    #[error("Corrupt frame data: {0}")]
    Corrupt(String),
    #[error("Stream reset failed: {0}")]
    ResetFailed(String),
}

/// Stream properties reported by an open decoder.
#[derive(Debug, Clone, Copy)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

/// Borrowed Y/U/V planes of one decoded frame.
///
/// The slices alias decoder-owned memory and are only valid until the next
/// call into the decoder; the pipeline copies them into its
/// [`PlanarStore`](crate::planar::PlanarStore) before doing anything else.
#[derive(Debug)]
pub struct PlanarView<'a> {
    pub y: &'a [u8],
    pub u: &'a [u8],
    pub v: &'a [u8],
    /// Bytes per luma row (may exceed `width` for padded decoders).
    pub y_stride: usize,
    /// Bytes per chroma row.
    pub uv_stride: usize,
    pub width: u32,
    pub height: u32,
    pub chroma_width: u32,
    pub chroma_height: u32,
}

/// One open decoder instance. Driven exclusively by the decode thread.
pub trait VideoDecoder: Send {
    /// Decode and return the next frame in presentation order.
    ///
    /// `Ok(None)` means no frame was produced by this call, either because
    /// the stream is exhausted (see [`end_of_stream`](Self::end_of_stream))
    /// or because the decoder needs another call to make progress.
    fn read_next_frame(&mut self) -> Result<Option<PlanarView<'_>>, DecodeError>;

    /// True once the stream has no further frames to produce.
    fn end_of_stream(&self) -> bool;

    /// Rewind the stream to its first frame without reopening it.
    fn reset(&mut self) -> Result<(), DecodeError>;

    fn info(&self) -> VideoInfo;
}

/// Factory half of the native contract: `open(bytes) -> handle | error`.
pub trait DecoderProvider: Send + Sync {
    fn open(&self, clip: &VideoClip) -> Result<Box<dyn VideoDecoder>, DecodeError>;
}
