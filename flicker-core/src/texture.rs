//! # Texture Pool
//!
//! Cache of RGBA render-target textures keyed by `(width, height)`, shared
//! across every session of matching resolution. Targets are created lazily
//! on a pool miss and never resized in place; a different size is simply a
//! different key. [`PoolTexture`] is a move-only RAII handle, so "a texture
//! lives in exactly one queue or the presented slot" is enforced by
//! ownership rather than by convention.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::gpu::{FrameSink, GpuError, TextureId, TextureKind};

/// Render-target textures each session keeps in flight, split across its
/// available and buffered queues plus the presented slot. Caps how far
/// ahead decode may run.
pub const POOL_TEXTURES_PER_SESSION: usize = 5;

#[derive(Default)]
struct PoolInner {
    free: HashMap<(u32, u32), Vec<TextureId>>,
    created: HashMap<(u32, u32), usize>,
}

pub struct TexturePool {
    sink: Arc<dyn FrameSink>,
    inner: Mutex<PoolInner>,
}

impl TexturePool {
    pub fn new(sink: Arc<dyn FrameSink>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            inner: Mutex::new(PoolInner::default()),
        })
    }

    /// Check out a target for the given size, creating one on a pool miss.
    pub fn acquire(self: &Arc<Self>, width: u32, height: u32) -> Result<PoolTexture, GpuError> {
        let cached = self
            .inner
            .lock()
            .free
            .get_mut(&(width, height))
            .and_then(Vec::pop);

        let id = match cached {
            Some(id) => id,
            None => {
                let id = self.sink.create_texture(width, height, TextureKind::Target)?;
                *self
                    .inner
                    .lock()
                    .created
                    .entry((width, height))
                    .or_insert(0) += 1;
                id
            }
        };

        Ok(PoolTexture {
            pool: self.clone(),
            id,
            width,
            height,
        })
    }

    fn release(&self, id: TextureId, width: u32, height: u32) {
        self.inner
            .lock()
            .free
            .entry((width, height))
            .or_default()
            .push(id);
    }

    /// Textures currently sitting unused in the cache for this size.
    pub fn free_count(&self, width: u32, height: u32) -> usize {
        self.inner
            .lock()
            .free
            .get(&(width, height))
            .map_or(0, Vec::len)
    }

    /// Total textures ever created for this size.
    pub fn created_for(&self, width: u32, height: u32) -> usize {
        self.inner
            .lock()
            .created
            .get(&(width, height))
            .copied()
            .unwrap_or(0)
    }
}

impl Drop for TexturePool {
    fn drop(&mut self) {
        let inner = self.inner.lock();
        for ids in inner.free.values() {
            for id in ids {
                self.sink.destroy_texture(*id);
            }
        }
    }
}

/// Exclusive handle to one pool texture. Returns to the pool on drop.
pub struct PoolTexture {
    pool: Arc<TexturePool>,
    id: TextureId,
    width: u32,
    height: u32,
}

impl PoolTexture {
    pub fn id(&self) -> TextureId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

impl Drop for PoolTexture {
    fn drop(&mut self) {
        self.pool.release(self.id, self.width, self.height);
    }
}

impl fmt::Debug for PoolTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolTexture")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}
