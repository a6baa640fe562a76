//! # Flicker Core
//!
//! Asynchronous video decode-and-buffer pipeline: a background scheduler
//! thread keeps a small ring of GPU textures filled with decoded frames
//! while the application's update loop presents them on a fixed timestep.

// ============================================================================
// Clip description / Decoder seam
// ============================================================================
pub mod clip;
pub mod decode;

// ============================================================================
// Staging / GPU upload
// ============================================================================
pub mod planar;
pub mod gpu;
pub mod texture;

// ============================================================================
// Playback
// ============================================================================
pub mod session;
pub mod scheduler;

// ============================================================================
// Test doubles
// ============================================================================
pub mod testing;

pub use clip::{ClipError, PixelLayout, VideoClip};
pub use decode::{DecodeError, DecoderProvider, PlanarView, VideoDecoder, VideoInfo};
pub use gpu::{FrameSink, GpuError, SamplerSet, TextureId, TextureKind, WgpuFrameSink};
pub use scheduler::{DecodeScheduler, SchedulerConfig, SessionId};
pub use session::{LoadOptions, PlayState, SessionError, VideoPipeline, VideoSession};
pub use texture::{PoolTexture, TexturePool, POOL_TEXTURES_PER_SESSION};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
