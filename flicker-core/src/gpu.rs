//! # GPU Frame Sink
//!
//! The GPU collaborator boundary. The pipeline talks to the GPU through the
//! [`FrameSink`] trait: create/destroy 2D textures, a copy pass uploading
//! planar bytes into the session's Y/U/V samplers, and a render pass that
//! draws a full-screen triangle converting those samplers into one RGBA
//! target. All sink calls are issued from the decode thread, which acts as
//! the single designated submission context.
//!
//! [`WgpuFrameSink`] is the reference backend over an existing wgpu device.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::planar::PlanarStore;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("Texture creation failed: {0}")]
    CreateFailed(String),
    #[error("Plane upload failed: {0}")]
    UploadFailed(String),
}

/// Opaque handle to a sink-owned texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    /// Single-channel plane texture sampled by the conversion pass.
    Plane,
    /// RGBA render target handed to the texture pool.
    Target,
}

/// GPU collaborator contract.
pub trait FrameSink: Send + Sync {
    fn create_texture(&self, width: u32, height: u32, kind: TextureKind)
        -> Result<TextureId, GpuError>;

    fn destroy_texture(&self, id: TextureId);

    /// Copy pass: upload the store's tightly-packed planes into the sampler
    /// textures.
    fn upload_planes(&self, store: &PlanarStore, samplers: &SamplerSet) -> Result<(), GpuError>;

    /// Render pass: bind the samplers, draw a full-screen conversion into
    /// `target`, submit.
    fn convert(&self, samplers: &SamplerSet, target: TextureId) -> Result<(), GpuError>;
}

/// A session's three plane textures, sized to its clip. Destroyed on drop.
pub struct SamplerSet {
    sink: Arc<dyn FrameSink>,
    pub y: TextureId,
    pub u: TextureId,
    pub v: TextureId,
}

impl SamplerSet {
    pub fn new(
        sink: Arc<dyn FrameSink>,
        width: u32,
        height: u32,
        chroma_width: u32,
        chroma_height: u32,
    ) -> Result<Self, GpuError> {
        let y = sink.create_texture(width, height, TextureKind::Plane)?;
        let u = match sink.create_texture(chroma_width, chroma_height, TextureKind::Plane) {
            Ok(id) => id,
            Err(e) => {
                sink.destroy_texture(y);
                return Err(e);
            }
        };
        let v = match sink.create_texture(chroma_width, chroma_height, TextureKind::Plane) {
            Ok(id) => id,
            Err(e) => {
                sink.destroy_texture(y);
                sink.destroy_texture(u);
                return Err(e);
            }
        };
        Ok(Self { sink, y, u, v })
    }
}

impl Drop for SamplerSet {
    fn drop(&mut self) {
        self.sink.destroy_texture(self.y);
        self.sink.destroy_texture(self.u);
        self.sink.destroy_texture(self.v);
    }
}

// ============================================================================
// wgpu backend
// ============================================================================

/// Full-screen triangle YUV to RGBA conversion, BT.709 limited range.
const SHADER_YUV_TO_RGBA: &str = r#"
struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@builtin(vertex_index) idx: u32) -> VsOut {
    // One oversized triangle covering the viewport.
    let x = f32(i32(idx) / 2) * 4.0 - 1.0;
    let y = f32(i32(idx) % 2) * 4.0 - 1.0;
    var out: VsOut;
    out.pos = vec4<f32>(x, y, 0.0, 1.0);
    out.uv = vec2<f32>((x + 1.0) * 0.5, 1.0 - (y + 1.0) * 0.5);
    return out;
}

@group(0) @binding(0) var y_tex: texture_2d<f32>;
@group(0) @binding(1) var u_tex: texture_2d<f32>;
@group(0) @binding(2) var v_tex: texture_2d<f32>;
@group(0) @binding(3) var yuv_sampler: sampler;

@fragment
fn fs_main(in: VsOut) -> @location(0) vec4<f32> {
    let y = textureSample(y_tex, yuv_sampler, in.uv).r;
    let u = textureSample(u_tex, yuv_sampler, in.uv).r;
    let v = textureSample(v_tex, yuv_sampler, in.uv).r;

    let y_scaled = (y - 16.0 / 255.0) * 1.164;
    let u_centered = u - 0.5;
    let v_centered = v - 0.5;

    let r = y_scaled + 1.793 * v_centered;
    let g = y_scaled - 0.213 * u_centered - 0.533 * v_centered;
    let b = y_scaled + 2.112 * u_centered;

    return vec4<f32>(clamp(vec3<f32>(r, g, b), vec3<f32>(0.0), vec3<f32>(1.0)), 1.0);
}
"#;

struct TextureEntry {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

/// [`FrameSink`] backend over an existing wgpu device and queue.
pub struct WgpuFrameSink {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    textures: Mutex<HashMap<u64, TextureEntry>>,
    next_id: AtomicU64,
}

impl WgpuFrameSink {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Arc<Self> {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("flicker_yuv_shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(SHADER_YUV_TO_RGBA)),
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("flicker_yuv_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("flicker_yuv_bind_group_layout"),
            entries: &[
                texture_entry(0),
                texture_entry(1),
                texture_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("flicker_yuv_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("flicker_yuv_pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: Some("vs_main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: Some("fs_main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState {
                count: 1,
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            multiview: None,
            cache: None,
        });

        Arc::new(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            textures: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Resolve a handle to its underlying texture, e.g. for the embedding
    /// application's own draw pass.
    pub fn texture(&self, id: TextureId) -> Option<wgpu::Texture> {
        self.textures.lock().get(&id.0).map(|e| e.texture.clone())
    }

    fn write_plane(&self, entry: &TextureEntry, data: &[u8]) {
        let (bytes_per_row, data) = pad_rows(data, entry.width as usize, entry.height);
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(entry.height),
            },
            wgpu::Extent3d {
                width: entry.width,
                height: entry.height,
                depth_or_array_layers: 1,
            },
        );
    }
}

impl FrameSink for WgpuFrameSink {
    fn create_texture(
        &self,
        width: u32,
        height: u32,
        kind: TextureKind,
    ) -> Result<TextureId, GpuError> {
        if width == 0 || height == 0 {
            return Err(GpuError::CreateFailed(format!(
                "zero-sized texture {width}x{height}"
            )));
        }
        let (format, usage, label) = match kind {
            TextureKind::Plane => (
                wgpu::TextureFormat::R8Unorm,
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                "flicker_plane",
            ),
            TextureKind::Target => (
                wgpu::TextureFormat::Rgba8Unorm,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
                "flicker_target",
            ),
        };

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.textures.lock().insert(
            id,
            TextureEntry {
                texture,
                view,
                width,
                height,
            },
        );
        Ok(TextureId(id))
    }

    fn destroy_texture(&self, id: TextureId) {
        if let Some(entry) = self.textures.lock().remove(&id.0) {
            entry.texture.destroy();
        }
    }

    fn upload_planes(&self, store: &PlanarStore, samplers: &SamplerSet) -> Result<(), GpuError> {
        let textures = self.textures.lock();
        let y = textures
            .get(&samplers.y.0)
            .ok_or_else(|| GpuError::UploadFailed("unknown Y texture".into()))?;
        let u = textures
            .get(&samplers.u.0)
            .ok_or_else(|| GpuError::UploadFailed("unknown U texture".into()))?;
        let v = textures
            .get(&samplers.v.0)
            .ok_or_else(|| GpuError::UploadFailed("unknown V texture".into()))?;

        if y.width != store.width() || y.height != store.height() {
            return Err(GpuError::UploadFailed(format!(
                "frame {}x{} does not match sampler {}x{}",
                store.width(),
                store.height(),
                y.width,
                y.height
            )));
        }

        self.write_plane(y, store.y());
        self.write_plane(u, store.u());
        self.write_plane(v, store.v());
        Ok(())
    }

    fn convert(&self, samplers: &SamplerSet, target: TextureId) -> Result<(), GpuError> {
        let textures = self.textures.lock();
        let y = textures
            .get(&samplers.y.0)
            .ok_or_else(|| GpuError::UploadFailed("unknown Y texture".into()))?;
        let u = textures
            .get(&samplers.u.0)
            .ok_or_else(|| GpuError::UploadFailed("unknown U texture".into()))?;
        let v = textures
            .get(&samplers.v.0)
            .ok_or_else(|| GpuError::UploadFailed("unknown V texture".into()))?;
        let out = textures
            .get(&target.0)
            .ok_or_else(|| GpuError::UploadFailed("unknown target texture".into()))?;

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("flicker_yuv_bind_group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&y.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&u.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&v.view),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("flicker_convert"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("flicker_yuv_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &out.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }
}

/// wgpu requires `bytes_per_row` aligned to 256.
fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Pad tightly-packed rows out to the copy alignment. Borrows when the row
/// width is already aligned.
fn pad_rows(data: &[u8], width: usize, rows: u32) -> (u32, Cow<'_, [u8]>) {
    let aligned = align_up(width as u32, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
    if aligned as usize == width {
        return (aligned, Cow::Borrowed(data));
    }

    let mut padded = Vec::with_capacity(aligned as usize * rows as usize);
    for row in 0..rows as usize {
        let start = row * width;
        padded.extend_from_slice(&data[start..start + width]);
        padded.resize(padded.len() + aligned as usize - width, 0);
    }
    (aligned, Cow::Owned(padded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_copy_alignment() {
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(1920, 256), 2048);
    }

    #[test]
    fn pad_rows_borrows_when_aligned() {
        let data = vec![7u8; 256 * 2];
        let (bpr, padded) = pad_rows(&data, 256, 2);
        assert_eq!(bpr, 256);
        assert!(matches!(padded, Cow::Borrowed(_)));
    }

    #[test]
    fn pad_rows_zero_fills_row_tails() {
        let data = vec![9u8; 10 * 3];
        let (bpr, padded) = pad_rows(&data, 10, 3);
        assert_eq!(bpr, 256);
        assert_eq!(padded.len(), 256 * 3);
        assert_eq!(&padded[..10], &[9u8; 10]);
        assert_eq!(padded[10], 0);
        assert_eq!(&padded[256..266], &[9u8; 10]);
    }
}
