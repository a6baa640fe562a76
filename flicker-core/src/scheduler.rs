//! # Decode Scheduler
//!
//! One background thread owning every decoder in the process. Other threads
//! talk to it only through its request inbox: activation hands a fully-built
//! decode lane across by ownership, deactivation tears the lane down on the
//! scheduler thread and acknowledges, so no decode work can overlap the
//! caller freeing anything.
//!
//! ```text
//! ┌──────────┐  activate/deactivate  ┌───────────┐  buffered ring  ┌──────────┐
//! │ Sessions │──────────────────────►│ Scheduler │────────────────►│ Render / │
//! │ (any     │                       │  thread   │                 │ update   │
//! │  thread) │◄──────────────────────│           │◄────────────────│ thread   │
//! └──────────┘     ready / ack       └───────────┘  available ring └──────────┘
//! ```
//!
//! Each iteration the thread drains pending requests, then runs one top-up
//! pass per active lane: decode a frame into the lane's planar store, upload
//! and convert it through the GPU sink into a pool texture popped from the
//! available ring, and push the result onto the buffered ring. The loop then
//! sleeps toward a fixed wake interval, but a new request wakes it early so
//! registration latency is bounded by delivery, not by the interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::{HeapCons, HeapProd};
use thiserror::Error;

use crate::decode::{DecodeError, VideoDecoder};
use crate::gpu::{FrameSink, GpuError, SamplerSet};
use crate::planar::PlanarStore;
use crate::texture::PoolTexture;

/// The scheduler thread has exited and no longer accepts requests.
#[derive(Debug, Error)]
#[error("Decode scheduler thread is not running")]
pub struct SchedulerClosed;

/// Identifies one registered session across the thread boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Target wake rate of the decode thread.
    pub tick_hz: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_hz: 200 }
    }
}

// ============================================================================
// Ready signal & lane state shared with the session
// ============================================================================

/// One-shot latch the session can block on until the first frame is buffered.
pub struct ReadySignal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl ReadySignal {
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Wait until the signal fires or `timeout` elapses. Returns whether it
    /// fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut flag = self.flag.lock();
        while !*flag {
            if self.cond.wait_until(&mut flag, deadline).timed_out() {
                return *flag;
            }
        }
        true
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Lane flags visible to both the scheduler thread and the session.
pub(crate) struct LaneShared {
    pub(crate) ready: ReadySignal,
    pub(crate) eos: AtomicBool,
}

impl LaneShared {
    pub(crate) fn new() -> Self {
        Self {
            ready: ReadySignal::new(),
            eos: AtomicBool::new(false),
        }
    }
}

// ============================================================================
// Decode lane
// ============================================================================

/// Everything the scheduler thread owns on behalf of one session: the open
/// decoder, the planar staging store, the Y/U/V samplers, and the decode-side
/// ends of the texture rings. Built by the session at load time and moved
/// into the scheduler whole.
pub(crate) struct DecodeLane {
    pub(crate) id: SessionId,
    pub(crate) decoder: Box<dyn VideoDecoder>,
    pub(crate) planes: PlanarStore,
    pub(crate) samplers: SamplerSet,
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) available: HeapCons<PoolTexture>,
    pub(crate) buffered: HeapProd<PoolTexture>,
    pub(crate) looping: bool,
    pub(crate) shared: Arc<LaneShared>,
    /// Texture retained across a failed upload so the session never loses a
    /// pool slot to a transient GPU error.
    parked: Option<PoolTexture>,
}

impl DecodeLane {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        decoder: Box<dyn VideoDecoder>,
        samplers: SamplerSet,
        sink: Arc<dyn FrameSink>,
        available: HeapCons<PoolTexture>,
        buffered: HeapProd<PoolTexture>,
        looping: bool,
        shared: Arc<LaneShared>,
    ) -> Self {
        Self {
            id,
            decoder,
            planes: PlanarStore::new(),
            samplers,
            sink,
            available,
            buffered,
            looping,
            shared,
            parked: None,
        }
    }
}

enum DecodeRequest {
    Activate(Box<DecodeLane>),
    Deactivate { id: SessionId, ack: Sender<()> },
    Shutdown,
}

// ============================================================================
// Scheduler
// ============================================================================

pub struct DecodeScheduler {
    inbox: Sender<DecodeRequest>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl DecodeScheduler {
    pub fn spawn(config: SchedulerConfig) -> Arc<Self> {
        let (inbox, rx) = crossbeam_channel::unbounded();
        let interval = Duration::from_secs_f64(1.0 / config.tick_hz.max(1) as f64);
        let handle = thread::spawn(move || run_loop(rx, interval));
        Arc::new(Self {
            inbox,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Process-wide scheduler: one decode thread regardless of how many
    /// clips are in flight.
    pub fn global() -> Arc<Self> {
        static GLOBAL: Lazy<Arc<DecodeScheduler>> =
            Lazy::new(|| DecodeScheduler::spawn(SchedulerConfig::default()));
        GLOBAL.clone()
    }

    pub(crate) fn register(&self, lane: DecodeLane) -> Result<(), SchedulerClosed> {
        self.inbox
            .send(DecodeRequest::Activate(Box::new(lane)))
            .map_err(|_| SchedulerClosed)
    }

    /// Deactivate a session and wait for the lane to be torn down on the
    /// scheduler thread, so no decode step can overlap the caller's cleanup.
    pub(crate) fn deregister(&self, id: SessionId) {
        let (ack, ack_rx) = crossbeam_channel::bounded(1);
        if self
            .inbox
            .send(DecodeRequest::Deactivate { id, ack })
            .is_ok()
        {
            // A dead scheduler already dropped the lane; nothing to wait for.
            let _ = ack_rx.recv_timeout(Duration::from_secs(2));
        }
    }
}

impl Drop for DecodeScheduler {
    fn drop(&mut self) {
        let _ = self.inbox.send(DecodeRequest::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Thread loop
// ============================================================================

fn run_loop(inbox: Receiver<DecodeRequest>, interval: Duration) {
    let mut lanes: Vec<DecodeLane> = Vec::new();
    tracing::debug!(interval_us = interval.as_micros() as u64, "decode scheduler running");

    loop {
        let deadline = Instant::now() + interval;

        loop {
            match inbox.try_recv() {
                Ok(request) => {
                    if handle_request(&mut lanes, request) {
                        return;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        for lane in lanes.iter_mut() {
            top_up(lane);
        }

        // Sleep out the remainder of the interval, but wake early for a new
        // request so registration latency is not interval-bounded.
        match inbox.recv_deadline(deadline) {
            Ok(request) => {
                if handle_request(&mut lanes, request) {
                    return;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Returns true on shutdown.
fn handle_request(lanes: &mut Vec<DecodeLane>, request: DecodeRequest) -> bool {
    match request {
        DecodeRequest::Activate(lane) => {
            tracing::debug!(id = ?lane.id, looping = lane.looping, "session activated");
            lanes.push(*lane);
            false
        }
        DecodeRequest::Deactivate { id, ack } => {
            if let Some(pos) = lanes.iter().position(|lane| lane.id == id) {
                // Dropping the lane here closes the decoder, frees the
                // planar store and samplers, and releases any textures still
                // in its rings back to the pool.
                drop(lanes.remove(pos));
                tracing::debug!(?id, "session deactivated");
            }
            let _ = ack.send(());
            false
        }
        DecodeRequest::Shutdown => {
            tracing::debug!("decode scheduler shutting down");
            true
        }
    }
}

#[derive(Debug, Error)]
enum TopUpError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Gpu(#[from] GpuError),
}

/// Refill one lane's buffered ring up to the textures the session has left
/// available. A failure abandons the lane for this iteration only.
fn top_up(lane: &mut DecodeLane) {
    let mut reset_done = false;
    loop {
        if lane.parked.is_none() && lane.available.is_empty() {
            break;
        }

        if lane.decoder.end_of_stream() {
            if !lane.looping {
                lane.shared.eos.store(true, Ordering::Release);
                break;
            }
            if reset_done {
                // Still at EOS after an in-place reset; try again next tick.
                break;
            }
            if let Err(e) = lane.decoder.reset() {
                tracing::warn!(id = ?lane.id, error = %e, "loop reset failed");
                break;
            }
            reset_done = true;
            continue;
        }

        match decode_one(lane) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::warn!(id = ?lane.id, error = %e, "decode step failed, keeping last good frame");
                break;
            }
        }
    }
}

/// Decode, upload, and buffer a single frame. `Ok(false)` means no frame was
/// produced or no texture was free.
fn decode_one(lane: &mut DecodeLane) -> Result<bool, TopUpError> {
    match lane.decoder.read_next_frame()? {
        Some(view) => lane.planes.copy_frame(&view),
        None => return Ok(false),
    }

    let texture = match lane.parked.take().or_else(|| lane.available.try_pop()) {
        Some(texture) => texture,
        None => return Ok(false),
    };

    let target = texture.id();
    if let Err(e) = lane
        .sink
        .upload_planes(&lane.planes, &lane.samplers)
        .and_then(|_| lane.sink.convert(&lane.samplers, target))
    {
        lane.parked = Some(texture);
        return Err(e.into());
    }

    if let Err(texture) = lane.buffered.try_push(texture) {
        // Ring capacity equals the pool bound, so this is unreachable in
        // practice; park rather than leak the slot.
        lane.parked = Some(texture);
        return Ok(false);
    }

    if !lane.shared.ready.is_set() {
        lane.shared.ready.notify();
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clip::{PixelLayout, VideoClip};
    use crate::session::{LoadOptions, VideoPipeline};
    use crate::testing::{wait_until, RecordingSink, StubProvider};
    use crate::texture::POOL_TEXTURES_PER_SESSION;

    fn clip(width: u32, height: u32) -> VideoClip {
        VideoClip::from_bytes(vec![0u8; 16], width, height, PixelLayout::Chroma420, 30.0).unwrap()
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn pipeline(provider: StubProvider) -> (Arc<crate::testing::RecordingSink>, VideoPipeline) {
        init_logging();
        let sink = RecordingSink::new();
        let scheduler = DecodeScheduler::spawn(SchedulerConfig::default());
        let pipe = VideoPipeline::new(sink.clone(), Arc::new(provider), scheduler);
        (sink, pipe)
    }

    #[test]
    fn ready_signal_latches() {
        let signal = ReadySignal::new();
        assert!(!signal.is_set());
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        signal.notify();
        assert!(signal.is_set());
        assert!(signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn load_blocks_until_first_frame_is_buffered() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(10));
        let mut session = pipe
            .load_clip(
                clip(64, 48),
                LoadOptions {
                    looping: false,
                    ready_timeout: Some(Duration::from_secs(2)),
                },
            )
            .unwrap();
        assert!(session.buffered_len() > 0);
        session.unload();
    }

    #[test]
    fn buffered_queue_fills_to_the_pool_bound() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(100));
        let mut session = pipe
            .load_clip(clip(64, 48), LoadOptions::default())
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            session.buffered_len() == POOL_TEXTURES_PER_SESSION
        }));
        assert_eq!(session.available_len(), 0);
        session.unload();
    }

    #[test]
    fn decode_error_does_not_affect_other_sessions() {
        let sink = RecordingSink::new();
        let scheduler = DecodeScheduler::spawn(SchedulerConfig::default());
        let poisoned_pipe = VideoPipeline::new(
            sink.clone(),
            Arc::new(StubProvider {
                frames: 10,
                poisoned: true,
                ..StubProvider::default()
            }),
            scheduler.clone(),
        );
        let healthy_pipe = VideoPipeline::new(
            sink.clone(),
            Arc::new(StubProvider::with_frames(10)),
            scheduler,
        );

        let mut poisoned = poisoned_pipe
            .load_clip(clip(64, 48), LoadOptions::default())
            .unwrap();
        let mut healthy = healthy_pipe
            .load_clip(
                clip(64, 48),
                LoadOptions {
                    looping: false,
                    ready_timeout: Some(Duration::from_secs(2)),
                },
            )
            .unwrap();

        // The healthy session buffers frames while the poisoned one is
        // skipped every iteration without taking the thread down.
        assert!(healthy.buffered_len() > 0);
        assert_eq!(poisoned.buffered_len(), 0);

        poisoned.unload();
        healthy.unload();
    }

    #[test]
    fn transient_decode_error_skips_one_frame() {
        let (sink, pipe) = pipeline(StubProvider {
            frames: 3,
            fail_at: Some(1),
            ..StubProvider::default()
        });
        let mut session = pipe
            .load_clip(
                clip(64, 48),
                LoadOptions {
                    looping: false,
                    ready_timeout: Some(Duration::from_secs(2)),
                },
            )
            .unwrap();

        // Frames 0 and 2 arrive; frame 1 is dropped.
        assert!(wait_until(Duration::from_secs(2), || session.buffered_len() == 2));
        session.play();
        let ts = session.clip().frame_timestep();
        session.update(ts);
        assert_eq!(sink.frame_in(session.current_frame().unwrap()), Some(0));
        session.update(ts);
        assert_eq!(sink.frame_in(session.current_frame().unwrap()), Some(2));
        session.unload();
    }

    #[test]
    fn looping_lane_resets_in_place() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(2));
        let mut session = pipe
            .load_clip(
                clip(64, 48),
                LoadOptions {
                    looping: true,
                    ready_timeout: Some(Duration::from_secs(2)),
                },
            )
            .unwrap();

        // More frames than the stream holds can only appear through resets.
        assert!(wait_until(Duration::from_secs(2), || {
            session.buffered_len() == POOL_TEXTURES_PER_SESSION
        }));
        session.unload();
    }

    #[test]
    fn deregistration_returns_every_texture_to_the_pool() {
        let (_sink, pipe) = pipeline(StubProvider::with_frames(100));
        let width = 64;
        let height = 48;
        let mut session = pipe
            .load_clip(
                clip(width, height),
                LoadOptions {
                    looping: false,
                    ready_timeout: Some(Duration::from_secs(2)),
                },
            )
            .unwrap();
        session.play();
        session.update(session.clip().frame_timestep());
        assert!(session.current_frame().is_some());

        session.unload();
        assert_eq!(
            pipe.pool().free_count(width, height),
            POOL_TEXTURES_PER_SESSION
        );
    }

    #[test]
    fn scheduler_drop_joins_thread() {
        let sink = RecordingSink::new();
        let scheduler = DecodeScheduler::spawn(SchedulerConfig::default());
        let pipe = VideoPipeline::new(
            sink,
            Arc::new(StubProvider::with_frames(10)),
            scheduler.clone(),
        );
        let mut session = pipe
            .load_clip(clip(64, 48), LoadOptions::default())
            .unwrap();
        session.unload();
        drop(pipe);
        drop(scheduler); // joins the decode thread
    }

    #[test]
    fn equal_resolution_sessions_share_the_pool_key() {
        let sink = RecordingSink::new();
        let scheduler = DecodeScheduler::spawn(SchedulerConfig::default());
        let pipe = VideoPipeline::new(
            sink,
            Arc::new(StubProvider::with_frames(100)),
            scheduler,
        );

        let mut a = pipe
            .load_clip(clip(64, 48), LoadOptions::default())
            .unwrap();
        let mut b = pipe
            .load_clip(clip(64, 48), LoadOptions::default())
            .unwrap();

        assert!(pipe.pool().created_for(64, 48) <= 2 * POOL_TEXTURES_PER_SESSION);

        a.unload();
        b.unload();

        // A third session of the same size reuses returned textures.
        let mut c = pipe
            .load_clip(clip(64, 48), LoadOptions::default())
            .unwrap();
        assert!(pipe.pool().created_for(64, 48) <= 2 * POOL_TEXTURES_PER_SESSION);
        c.unload();
    }
}
