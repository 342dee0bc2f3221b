use std::{marker::PhantomData, sync::Arc};

use wgpu::{BindGroup, BindGroupEntry, BindGroupLayoutEntry};

pub mod framework;
pub mod kernel;
pub mod pacing;
pub mod presenter;
pub mod shader;
pub mod swapchain;
pub mod texture;

pub use pacing::{FramePacingController, PacingConfig, PacingDecision, SampleState};
pub use presenter::{BackBufferIndex, FramePresenter, FrameState, PresentationBackend};
pub use swapchain::OffscreenSwapChain;

/// Represents a shader.
///
/// It's just a wrapper around [`wgpu::ShaderModule`].
pub struct Shader(wgpu::ShaderModule);

/// Entry point of `gpgpu-dynres`. A [`Framework`] must be created
/// first as all GPU primitives needs it to be created.
pub struct Framework {
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    adapter: wgpu::Adapter,
}

/// Holds `BindGroupEntries` and their layout. DescriptorSet is basically used to bind resources as entries.
#[derive(Default, Debug)]
pub struct DescriptorSet<'a> {
    layout: Vec<BindGroupLayoutEntry>,
    set: Vec<BindGroupEntry<'a>>,
}

#[derive(PartialEq, Eq)]
pub enum GpuBufferUsage {
    /// Read-only object.
    /// ### Example WGSL syntax:
    /// ```ignore
    /// @group(0) @binding(0) var<storage, read> input: Vector;
    /// ```
    ReadOnly,
    /// Read-write object.
    /// ### Example WGSL syntax:
    /// ```ignore
    /// @group(0) @binding(0) var<storage, read_write> input: Vector;
    /// ```
    ReadWrite,
}

/// Vector of contiguous homogeneous elements on GPU memory.
/// Its elements must implement [`bytemuck::Pod`].
///
/// Basically wraps a [`wgpu::Buffer`] i.e. a gpu accessible buffer.
pub struct GpuBuffer<'fw, T> {
    fw: &'fw Framework,
    buf: wgpu::Buffer,
    size: u64,
    marker: PhantomData<T>,
}

/// A single [`bytemuck::Pod`] value kept in a uniform buffer.
pub struct GpuUniform<'fw, T> {
    fw: &'fw Framework,
    buf: wgpu::Buffer,
    marker: PhantomData<T>,
}

/// A 2D `Rgba8Unorm` texture, the equivalent of a read-write texture in a compute shader.
pub struct GpuTexture<'fw> {
    fw: &'fw Framework,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

/// Represents a shader with its bindings and entry-point
pub struct Program<'sha, 'res> {
    shader: &'sha Shader,
    entry_point: String,
    descriptors: Vec<DescriptorSet<'res>>,
}

/// dispatches the shader with its bindings
pub struct Kernel<'fw> {
    fw: &'fw Framework,
    pipeline: wgpu::ComputePipeline,
    bindgroups: Vec<BindGroup>,
    entry_point: String,
}
