//! # Planar Frame Store
//!
//! A reusable pair of byte regions bridging decoder output to GPU upload:
//! one region for the Y plane, one sized for both chroma planes (U in the
//! first half, V in the second). The store grows by explicit reallocation
//! when a frame needs more room and never shrinks within a session, so the
//! steady-state decode path performs zero allocations.

use crate::decode::PlanarView;

#[derive(Debug, Default)]
pub struct PlanarStore {
    luma: Vec<u8>,
    chroma: Vec<u8>,
    width: u32,
    height: u32,
    chroma_width: u32,
    chroma_height: u32,
}

impl PlanarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pack one decoded frame into the store, collapsing any decoder row
    /// padding so the planes come out tightly packed (stride == width).
    pub fn copy_frame(&mut self, view: &PlanarView<'_>) {
        self.width = view.width;
        self.height = view.height;
        self.chroma_width = view.chroma_width;
        self.chroma_height = view.chroma_height;

        let luma_len = self.width as usize * self.height as usize;
        let chroma_len = self.chroma_width as usize * self.chroma_height as usize;
        grow_to(&mut self.luma, luma_len);
        grow_to(&mut self.chroma, chroma_len * 2);

        pack_rows(
            &mut self.luma[..luma_len],
            view.y,
            view.y_stride,
            self.width as usize,
            self.height as usize,
        );
        pack_rows(
            &mut self.chroma[..chroma_len],
            view.u,
            view.uv_stride,
            self.chroma_width as usize,
            self.chroma_height as usize,
        );
        pack_rows(
            &mut self.chroma[chroma_len..chroma_len * 2],
            view.v,
            view.uv_stride,
            self.chroma_width as usize,
            self.chroma_height as usize,
        );
    }

    pub fn y(&self) -> &[u8] {
        &self.luma[..self.width as usize * self.height as usize]
    }

    pub fn u(&self) -> &[u8] {
        let len = self.chroma_width as usize * self.chroma_height as usize;
        &self.chroma[..len]
    }

    pub fn v(&self) -> &[u8] {
        let len = self.chroma_width as usize * self.chroma_height as usize;
        &self.chroma[len..len * 2]
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

    /// Allocated byte counts for the (luma, chroma) regions. Monotonic over
    /// the store's lifetime.
    pub fn capacity(&self) -> (usize, usize) {
        (self.luma.len(), self.chroma.len())
    }
}

fn grow_to(buf: &mut Vec<u8>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0);
    }
}

fn pack_rows(dst: &mut [u8], src: &[u8], stride: usize, width: usize, rows: usize) {
    for row in 0..rows {
        let src_start = row * stride;
        let dst_start = row * width;
        dst[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}
