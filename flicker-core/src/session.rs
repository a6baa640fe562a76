//! # Video Session
//!
//! Per-clip playback state: the `Stopped / Playing / Paused` machine, the
//! fixed-timestep accumulator that makes playback frame-accurate, and the
//! consumer ends of the texture rings. Everything here runs on the
//! embedding application's update thread and never blocks: when the decode
//! thread falls behind, [`VideoSession::update`] simply keeps the last
//! presented frame and tries again next tick.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use thiserror::Error;

use crate::clip::VideoClip;
use crate::decode::{DecodeError, DecoderProvider};
use crate::gpu::{FrameSink, GpuError, SamplerSet, TextureId};
use crate::scheduler::{DecodeLane, DecodeScheduler, LaneShared, SessionId};
use crate::texture::{PoolTexture, TexturePool, POOL_TEXTURES_PER_SESSION};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
    #[error("Decode scheduler is not running")]
    SchedulerGone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOptions {
    pub looping: bool,
    /// Block the calling thread until the first frame is buffered, bounded
    /// by decode latency rather than the scheduler's wake interval.
    pub ready_timeout: Option<Duration>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            looping: false,
            ready_timeout: None,
        }
    }
}

pub struct VideoSession {
    clip: VideoClip,
    sink: Arc<dyn FrameSink>,
    pool: Arc<TexturePool>,
    provider: Arc<dyn DecoderProvider>,
    scheduler: Arc<DecodeScheduler>,
    id: SessionId,
    state: PlayState,
    looping: bool,
    speed: f64,
    accumulator: f64,
    timestep: f64,
    loaded: bool,
    current: Option<PoolTexture>,
    available_tx: Option<HeapProd<PoolTexture>>,
    buffered_rx: Option<HeapCons<PoolTexture>>,
    shared: Option<Arc<LaneShared>>,
}

impl VideoSession {
    pub fn new(
        clip: VideoClip,
        sink: Arc<dyn FrameSink>,
        pool: Arc<TexturePool>,
        provider: Arc<dyn DecoderProvider>,
        scheduler: Arc<DecodeScheduler>,
    ) -> Self {
        let timestep = clip.frame_timestep();
        Self {
            clip,
            sink,
            pool,
            provider,
            scheduler,
            id: SessionId::next(),
            state: PlayState::Stopped,
            looping: false,
            speed: 1.0,
            accumulator: 0.0,
            timestep,
            loaded: false,
            current: None,
            available_tx: None,
            buffered_rx: None,
            shared: None,
        }
    }

    /// Open the decoder, stock the available ring from the texture pool, and
    /// register a decode lane with the scheduler. Idempotent while loaded.
    pub fn load(&mut self, opts: LoadOptions) -> Result<(), SessionError> {
        if self.loaded {
            return Ok(());
        }

        let decoder = self.provider.open(&self.clip)?;
        let samplers = SamplerSet::new(
            self.sink.clone(),
            self.clip.width(),
            self.clip.height(),
            self.clip.chroma_width(),
            self.clip.chroma_height(),
        )?;

        let (mut available_tx, available_rx) =
            HeapRb::<PoolTexture>::new(POOL_TEXTURES_PER_SESSION).split();
        let (buffered_tx, buffered_rx) =
            HeapRb::<PoolTexture>::new(POOL_TEXTURES_PER_SESSION).split();
        for _ in 0..POOL_TEXTURES_PER_SESSION {
            let texture = self.pool.acquire(self.clip.width(), self.clip.height())?;
            // Ring capacity equals the pool bound, so this always fits.
            let _ = available_tx.try_push(texture);
        }

        let shared = Arc::new(LaneShared::new());
        let lane = DecodeLane::new(
            self.id,
            decoder,
            samplers,
            self.sink.clone(),
            available_rx,
            buffered_tx,
            opts.looping,
            shared.clone(),
        );
        self.scheduler
            .register(lane)
            .map_err(|_| SessionError::SchedulerGone)?;

        self.looping = opts.looping;
        self.accumulator = 0.0;
        self.timestep = self.clip.frame_timestep();
        self.available_tx = Some(available_tx);
        self.buffered_rx = Some(buffered_rx);
        self.loaded = true;

        if let Some(timeout) = opts.ready_timeout {
            if !shared.ready.wait_timeout(timeout) {
                tracing::warn!(id = ?self.id, "first frame not ready within load timeout");
            }
        }
        self.shared = Some(shared);
        Ok(())
    }

    /// Start the playback clock. No-op if already playing or not loaded.
    pub fn play(&mut self) {
        if !self.loaded || self.state == PlayState::Playing {
            return;
        }
        self.state = PlayState::Playing;
    }

    /// Freeze the clock, preserving the accumulator and buffered frames.
    pub fn pause(&mut self) {
        if self.state == PlayState::Playing {
            self.state = PlayState::Paused;
        }
    }

    /// Halt playback and release the decoder. The last presented frame stays
    /// visible; a new `load` is required to play again.
    pub fn stop(&mut self) {
        if !self.loaded {
            return;
        }
        self.scheduler.deregister(self.id);
        // Dropping the ring ends returns every queued texture to the pool.
        self.available_tx = None;
        self.buffered_rx = None;
        self.shared = None;
        self.accumulator = 0.0;
        self.state = PlayState::Stopped;
        self.loaded = false;
    }

    /// Full teardown: stop and retire the presented texture to the pool.
    pub fn unload(&mut self) {
        self.stop();
        self.current = None;
    }

    /// Advance playback time and present frames that have come due. Never
    /// blocks: a missed frame degrades to holding the previous one.
    pub fn update(&mut self, delta: f64) {
        if !self.loaded || self.state == PlayState::Stopped {
            return;
        }
        if self.state != PlayState::Playing {
            return;
        }
        self.accumulator += delta * self.speed;

        while self.accumulator >= self.timestep {
            let Some(buffered) = self.buffered_rx.as_mut() else {
                break;
            };
            match buffered.try_pop() {
                Some(next) => {
                    if let Some(previous) = self.current.take() {
                        if let Some(available) = self.available_tx.as_mut() {
                            // The ring holds the whole pool, so this fits.
                            let _ = available.try_push(previous);
                        }
                    }
                    self.current = Some(next);
                    self.accumulator -= self.timestep;
                }
                None => {
                    let exhausted = self
                        .shared
                        .as_ref()
                        .is_some_and(|shared| shared.eos.load(Ordering::Acquire));
                    if exhausted && !self.looping {
                        // End of clip: hold the final frame until unload.
                        self.state = PlayState::Stopped;
                        self.accumulator = 0.0;
                    }
                    break;
                }
            }
        }
    }

    /// The texture to sample this tick, if any frame has been presented yet.
    pub fn current_frame(&self) -> Option<TextureId> {
        self.current.as_ref().map(PoolTexture::id)
    }

    pub fn state(&self) -> PlayState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn clip(&self) -> &VideoClip {
        &self.clip
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn set_speed(&mut self, speed: f64) {
        if speed.is_finite() && speed > 0.0 {
            self.speed = speed;
        }
    }

    /// Frames decoded and waiting to be presented.
    pub fn buffered_len(&self) -> usize {
        self.buffered_rx.as_ref().map_or(0, Observer::occupied_len)
    }

    /// Free textures the decode thread may still fill.
    pub fn available_len(&self) -> usize {
        self.available_tx.as_ref().map_or(0, Observer::occupied_len)
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        self.unload();
    }
}

// ============================================================================
// Application-facing bundle
// ============================================================================

/// Everything a clip needs to play: the GPU sink, the shared texture pool,
/// the decoder factory, and the scheduler.
pub struct VideoPipeline {
    sink: Arc<dyn FrameSink>,
    pool: Arc<TexturePool>,
    provider: Arc<dyn DecoderProvider>,
    scheduler: Arc<DecodeScheduler>,
}

impl VideoPipeline {
    pub fn new(
        sink: Arc<dyn FrameSink>,
        provider: Arc<dyn DecoderProvider>,
        scheduler: Arc<DecodeScheduler>,
    ) -> Self {
        let pool = TexturePool::new(sink.clone());
        Self {
            sink,
            pool,
            provider,
            scheduler,
        }
    }

    /// `Load(clip, loop) -> Session`.
    pub fn load_clip(
        &self,
        clip: VideoClip,
        opts: LoadOptions,
    ) -> Result<VideoSession, SessionError> {
        let mut session = VideoSession::new(
            clip,
            self.sink.clone(),
            self.pool.clone(),
            self.provider.clone(),
            self.scheduler.clone(),
        );
        session.load(opts)?;
        Ok(session)
    }

    pub fn pool(&self) -> &Arc<TexturePool> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::PixelLayout;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::{wait_until, RecordingSink, StubProvider};

    const FPS: f64 = 30.0;
    const TS: f64 = 1.0 / FPS;

    fn clip() -> VideoClip {
        VideoClip::from_bytes(vec![0u8; 16], 64, 48, PixelLayout::Chroma420, FPS).unwrap()
    }

    fn pipeline(provider: StubProvider) -> (Arc<RecordingSink>, VideoPipeline) {
        let sink = RecordingSink::new();
        let scheduler = DecodeScheduler::spawn(SchedulerConfig::default());
        let pipe = VideoPipeline::new(sink.clone(), Arc::new(provider), scheduler);
        (sink, pipe)
    }

    fn ready() -> LoadOptions {
        LoadOptions {
            looping: false,
            ready_timeout: Some(Duration::from_secs(2)),
        }
    }

    /// Block until at least one frame is buffered, then advance one tick.
    fn advance(session: &mut VideoSession) {
        assert!(wait_until(Duration::from_secs(2), || {
            session.buffered_len() > 0
        }));
        session.update(TS);
    }

    #[test]
    fn open_failure_leaves_session_unloaded() {
        let (_sink, pipe) = pipeline(StubProvider {
            frames: 10,
            fail_open: true,
            ..StubProvider::default()
        });
        let result = pipe.load_clip(clip(), LoadOptions::default());
        assert!(matches!(result, Err(SessionError::Decode(_))));
    }

    #[test]
    fn texture_creation_failure_surfaces_from_load() {
        let (sink, pipe) = pipeline(StubProvider::with_frames(10));
        sink.set_fail_create(true);
        assert!(matches!(
            pipe.load_clip(clip(), LoadOptions::default()),
            Err(SessionError::Gpu(_))
        ));
    }

    #[test]
    fn state_machine_transitions() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(10));
        let mut session = pipe.load_clip(clip(), ready()).unwrap();
        assert_eq!(session.state(), PlayState::Stopped);

        // Pause from Stopped is a no-op.
        session.pause();
        assert_eq!(session.state(), PlayState::Stopped);

        session.play();
        assert_eq!(session.state(), PlayState::Playing);
        session.play();
        assert_eq!(session.state(), PlayState::Playing);

        session.pause();
        assert_eq!(session.state(), PlayState::Paused);

        session.play();
        assert_eq!(session.state(), PlayState::Playing);

        session.stop();
        assert_eq!(session.state(), PlayState::Stopped);
        assert!(!session.is_loaded());
        session.unload();
    }

    #[test]
    fn load_is_idempotent() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(10));
        let mut session = pipe.load_clip(clip(), ready()).unwrap();
        session.load(ready()).unwrap();
        assert!(session.is_loaded());
        session.unload();
    }

    #[test]
    fn zero_delta_update_changes_nothing() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(10));
        let mut session = pipe.load_clip(clip(), ready()).unwrap();
        session.play();
        advance(&mut session);

        let presented = session.current_frame();
        let buffered = session.buffered_len();
        session.update(0.0);
        assert_eq!(session.current_frame(), presented);
        assert_eq!(session.buffered_len(), buffered);
        session.unload();
    }

    #[test]
    fn update_never_blocks_on_a_starved_decoder() {
        let (_sink, pipe) = pipeline(StubProvider {
            frames: 0,
            starved: true,
            ..StubProvider::default()
        });
        let mut session = pipe.load_clip(clip(), LoadOptions::default()).unwrap();
        session.play();

        // No frame will ever arrive; every tick must return immediately,
        // hold no texture, and stay Playing.
        for _ in 0..10 {
            session.update(TS);
        }
        assert_eq!(session.current_frame(), None);
        assert_eq!(session.state(), PlayState::Playing);
        session.unload();
    }

    #[test]
    fn paused_session_keeps_accumulator_and_buffers() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(10));
        let mut session = pipe.load_clip(clip(), ready()).unwrap();
        session.play();
        advance(&mut session);
        let presented = session.current_frame();

        session.pause();
        for _ in 0..5 {
            session.update(TS);
        }
        assert_eq!(session.current_frame(), presented);
        session.unload();
    }

    #[test]
    fn playback_speed_scales_the_accumulator() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(10));
        let mut session = pipe.load_clip(clip(), ready()).unwrap();
        session.set_speed(2.0);
        session.play();

        assert!(wait_until(Duration::from_secs(2), || {
            session.buffered_len() >= 2
        }));
        let before = session.current_frame();
        // One tick at double speed presents two frames' worth of time.
        session.update(TS);
        assert_ne!(session.current_frame(), before);
        session.unload();
    }

    #[test]
    fn pool_invariant_holds_at_quiescence() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(100));
        let mut session = pipe.load_clip(clip(), ready()).unwrap();

        // Fully topped up: all five textures buffered, none available.
        assert!(wait_until(Duration::from_secs(2), || {
            session.buffered_len() == POOL_TEXTURES_PER_SESSION
        }));
        let presented = usize::from(session.current_frame().is_some());
        assert_eq!(
            session.available_len() + session.buffered_len() + presented,
            POOL_TEXTURES_PER_SESSION
        );

        session.play();
        advance(&mut session);

        // One texture presented; the rest are split between the rings and,
        // transiently, the decode thread. Wait for it to settle.
        assert!(wait_until(Duration::from_secs(2), || {
            session.available_len() + session.buffered_len() + 1 == POOL_TEXTURES_PER_SESSION
        }));
        session.unload();
    }

    #[test]
    fn finite_clip_plays_through_then_stops() {
        const FRAMES: usize = 30;
        let (sink, pipe) = pipeline(StubProvider::with_frames(FRAMES as u32));
        let mut session = pipe.load_clip(clip(), ready()).unwrap();
        session.play();

        let mut last = None;
        for expected in 0..FRAMES {
            advance(&mut session);
            let id = session.current_frame().expect("frame presented");
            assert_ne!(Some(id), last, "tick {expected} must swap textures");
            assert_eq!(sink.frame_in(id), Some(expected as u8));
            last = Some(id);
            assert_eq!(session.state(), PlayState::Playing);
        }

        // Past end of stream with the queue drained: ticking stops the
        // session once the decode thread has flagged exhaustion, keeping the
        // final frame visible.
        assert!(wait_until(Duration::from_secs(2), || {
            session.update(TS);
            session.state() == PlayState::Stopped
        }));
        assert_eq!(session.current_frame(), last);
        session.unload();
    }

    #[test]
    fn looping_clip_wraps_without_gap_or_duplicate() {
        const FRAMES: u32 = 4;
        let (sink, pipe) = pipeline(StubProvider::with_frames(FRAMES));

        // Stop -> Load -> Play, then advance two full passes.
        let mut session = pipe.load_clip(clip(), ready()).unwrap();
        session.stop();
        session
            .load(LoadOptions {
                looping: true,
                ready_timeout: Some(Duration::from_secs(2)),
            })
            .unwrap();
        session.play();

        let mut seen = Vec::new();
        for _ in 0..FRAMES * 2 {
            let before = session.current_frame();
            advance(&mut session);
            let id = session.current_frame().expect("frame presented");
            assert_ne!(Some(id), before, "every tick must observe a swap");
            seen.push(sink.frame_in(id).unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 0, 1, 2, 3]);
        session.unload();
    }
}
