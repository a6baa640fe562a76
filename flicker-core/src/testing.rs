//! Deterministic doubles for exercising the pipeline without a GPU or a
//! real codec: a synthetic planar decoder and a recording [`FrameSink`].
//! Used by this crate's own tests and available to embedders for theirs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::clip::{PixelLayout, VideoClip};
use crate::decode::{DecodeError, DecoderProvider, PlanarView, VideoDecoder, VideoInfo};
use crate::gpu::{FrameSink, GpuError, SamplerSet, TextureId, TextureKind};
use crate::planar::PlanarStore;

// ============================================================================
// Stub decoder
// ============================================================================

/// Synthetic decoder producing `frames` frames whose first Y byte is the
/// frame index, so a test can tell which frame landed in which texture.
pub struct StubDecoder {
    info: VideoInfo,
    frames: u32,
    next: u32,
    /// Fail exactly this frame with a corrupt-data error, then recover.
    fail_at: Option<u32>,
    /// Every read fails. Models an unrecoverable mid-stream corruption.
    poisoned: bool,
    /// Never produce a frame and never reach end of stream.
    starved: bool,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

impl StubDecoder {
    pub fn new(width: u32, height: u32, layout: PixelLayout, frames: u32) -> Self {
        let (cw, ch) = layout.chroma_dimensions(width, height);
        Self {
            info: VideoInfo {
                width,
                height,
                layout,
            },
            frames,
            next: 0,
            fail_at: None,
            poisoned: false,
            starved: false,
            y: vec![0; width as usize * height as usize],
            u: vec![0; cw as usize * ch as usize],
            v: vec![0; cw as usize * ch as usize],
        }
    }

    pub fn failing_at(mut self, frame: u32) -> Self {
        self.fail_at = Some(frame);
        self
    }

    pub fn poisoned(mut self) -> Self {
        self.poisoned = true;
        self
    }

    pub fn starved(mut self) -> Self {
        self.starved = true;
        self
    }
}

impl VideoDecoder for StubDecoder {
    fn read_next_frame(&mut self) -> Result<Option<PlanarView<'_>>, DecodeError> {
        if self.starved {
            return Ok(None);
        }
        if self.poisoned {
            return Err(DecodeError::Corrupt("poisoned stream".into()));
        }
        if self.next >= self.frames {
            return Ok(None);
        }
        if self.fail_at == Some(self.next) {
            self.next += 1;
            return Err(DecodeError::Corrupt(format!("bad frame {}", self.next - 1)));
        }

        self.y[0] = self.next as u8;
        self.next += 1;

        let (cw, ch) = self
            .info
            .layout
            .chroma_dimensions(self.info.width, self.info.height);
        Ok(Some(PlanarView {
            y: &self.y,
            u: &self.u,
            v: &self.v,
            y_stride: self.info.width as usize,
            uv_stride: cw as usize,
            width: self.info.width,
            height: self.info.height,
            chroma_width: cw,
            chroma_height: ch,
        }))
    }

    fn end_of_stream(&self) -> bool {
        !self.starved && self.next >= self.frames
    }

    fn reset(&mut self) -> Result<(), DecodeError> {
        self.next = 0;
        Ok(())
    }

    fn info(&self) -> VideoInfo {
        self.info
    }
}

/// Opens [`StubDecoder`]s shaped to the clip. Reusable across loads.
#[derive(Default)]
pub struct StubProvider {
    pub frames: u32,
    pub fail_open: bool,
    pub poisoned: bool,
    pub starved: bool,
    pub fail_at: Option<u32>,
}

impl StubProvider {
    pub fn with_frames(frames: u32) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }
}

impl DecoderProvider for StubProvider {
    fn open(&self, clip: &VideoClip) -> Result<Box<dyn VideoDecoder>, DecodeError> {
        if self.fail_open {
            return Err(DecodeError::OpenFailed("stub open failure".into()));
        }
        let mut decoder =
            StubDecoder::new(clip.width(), clip.height(), clip.layout(), self.frames);
        if self.poisoned {
            decoder = decoder.poisoned();
        }
        if self.starved {
            decoder = decoder.starved();
        }
        if let Some(frame) = self.fail_at {
            decoder = decoder.failing_at(frame);
        }
        Ok(Box::new(decoder))
    }
}

// ============================================================================
// Recording sink
// ============================================================================

#[derive(Default)]
struct RecordingState {
    live: HashMap<u64, (u32, u32, TextureKind)>,
    destroyed: Vec<TextureId>,
    /// First Y byte of the most recent upload, pending a convert call.
    staged: Option<u8>,
    /// Frame marker last converted into each target.
    contents: HashMap<u64, u8>,
}

/// A [`FrameSink`] that records activity instead of touching a GPU.
pub struct RecordingSink {
    next_id: AtomicU64,
    fail_create: AtomicBool,
    state: Mutex<RecordingState>,
}

impl RecordingSink {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            fail_create: AtomicBool::new(false),
            state: Mutex::new(RecordingState::default()),
        })
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Frame index last drawn into the given target.
    pub fn frame_in(&self, id: TextureId) -> Option<u8> {
        self.state.lock().contents.get(&id.0).copied()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn destroyed_count(&self) -> usize {
        self.state.lock().destroyed.len()
    }
}

impl FrameSink for RecordingSink {
    fn create_texture(
        &self,
        width: u32,
        height: u32,
        kind: TextureKind,
    ) -> Result<TextureId, GpuError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GpuError::CreateFailed("recording sink refused".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.lock().live.insert(id, (width, height, kind));
        Ok(TextureId(id))
    }

    fn destroy_texture(&self, id: TextureId) {
        let mut state = self.state.lock();
        if state.live.remove(&id.0).is_some() {
            state.destroyed.push(id);
        }
    }

    fn upload_planes(&self, store: &PlanarStore, _samplers: &SamplerSet) -> Result<(), GpuError> {
        let marker = store.y().first().copied().unwrap_or(0);
        self.state.lock().staged = Some(marker);
        Ok(())
    }

    fn convert(&self, _samplers: &SamplerSet, target: TextureId) -> Result<(), GpuError> {
        let mut state = self.state.lock();
        let marker = state.staged.take().unwrap_or(0);
        state.contents.insert(target.0, marker);
        Ok(())
    }
}

// ============================================================================
// Polling helper
// ============================================================================

/// Poll `pred` until it holds or `timeout` elapses. Returns whether it held.
pub fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if pred() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}
