//! A headless swap chain: two back buffers, a scaled render target and a
//! fence, all on top of plain `wgpu` resources.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use thiserror::Error;

use crate::{
    kernel::dispatch_size,
    presenter::{BackBufferIndex, FrameContext, PresentationBackend},
    DescriptorSet, Framework, GpuBuffer, GpuBufferUsage, GpuTexture, GpuUniform, Kernel, Program,
    Shader,
};

/// Workgroup edge length of the fill and upscale shaders.
pub const WORKGROUP_SIZE: u32 = 8;

const UPSCALE_SHADER: &str = include_str!("../shaders/upscale.wgsl");
const FRACTAL_TILES_SHADER: &str = include_str!("../shaders/fractal_tiles.wgsl");

/// Hash offsets and gamma of the fractal tiles shader.
pub const FRACTAL_TILES_PALETTE: [[f32; 4]; 2] = [[0.035, 0.01, 0.0, 0.7], [0.7, 0.8, 0.5, 1.0]];

#[derive(Error, Debug)]
pub enum SwapChainError {
    #[error("fence value {0} was never signalled")]
    UnsignalledFence(u64),
}

/// Per-frame values shared by the fill and upscale shaders.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameConstants {
    pub time: f32,
    pub scale: f32,
    pub render_size: [u32; 2],
    pub output_size: [u32; 2],
    padding: [u32; 2],
}

/// Monotonic fence emulated with `Queue::on_submitted_work_done`.
#[derive(Debug, Default)]
struct Fence {
    next_value: u64,
    completed: Arc<AtomicU64>,
}

impl Fence {
    /// Signals the next value once all work submitted so far has completed.
    fn signal(&mut self, queue: &wgpu::Queue) -> u64 {
        self.next_value += 1;
        let value = self.next_value;
        let completed = Arc::clone(&self.completed);
        queue.on_submitted_work_done(move || {
            completed.fetch_max(value, Ordering::AcqRel);
        });
        value
    }

    fn completed_value(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }
}

const BACK_BUFFER_USAGES: wgpu::TextureUsages = wgpu::TextureUsages::from_bits_truncate(
    wgpu::TextureUsages::STORAGE_BINDING.bits() | wgpu::TextureUsages::COPY_SRC.bits(),
);

const RENDER_TARGET_USAGES: wgpu::TextureUsages = wgpu::TextureUsages::from_bits_truncate(
    wgpu::TextureUsages::STORAGE_BINDING.bits()
        | wgpu::TextureUsages::TEXTURE_BINDING.bits()
        | wgpu::TextureUsages::COPY_SRC.bits(),
);

/// [`PresentationBackend`] rendering with a user compute shader.
///
/// The fill shader binds, in group 0, the render target as a write-only
/// `rgba8unorm` storage texture, the [`FrameConstants`] uniform and a
/// read-only `array<vec4<f32>>` palette. Presenting a back buffer makes it
/// the [`OffscreenSwapChain::front_buffer`].
pub struct OffscreenSwapChain<'fw> {
    fw: &'fw Framework,
    fill_shader: Shader,
    fill_entry_point: String,
    upscale_shader: Shader,
    palette: GpuBuffer<'fw, [f32; 4]>,
    constants: GpuUniform<'fw, FrameConstants>,
    back_buffers: [GpuTexture<'fw>; BackBufferIndex::COUNT],
    render_target: GpuTexture<'fw>,
    fill_kernel: Kernel<'fw>,
    upscale_kernels: [Kernel<'fw>; BackBufferIndex::COUNT],
    encoder: Option<wgpu::CommandEncoder>,
    fence: Fence,
    front_buffer: Option<BackBufferIndex>,
}

impl<'fw> OffscreenSwapChain<'fw> {
    /// Creates a swap chain with `width` x `height` back buffers. The render
    /// target starts at full size until the first resize.
    pub fn new(
        fw: &'fw Framework,
        width: u32,
        height: u32,
        fill_shader: Shader,
        fill_entry_point: impl Into<String>,
        palette: &[[f32; 4]],
    ) -> Self {
        let fill_entry_point = fill_entry_point.into();
        let upscale_shader = Shader::from_wgsl_source(fw, "upscale.wgsl", UPSCALE_SHADER);
        let palette = GpuBuffer::from_slice(fw, palette);
        let constants = GpuUniform::new(fw, &FrameConstants::default());
        let back_buffers = [
            GpuTexture::new(fw, width, height, BACK_BUFFER_USAGES),
            GpuTexture::new(fw, width, height, BACK_BUFFER_USAGES),
        ];
        let render_target = GpuTexture::new(fw, width, height, RENDER_TARGET_USAGES);

        let fill_kernel = fill_kernel(
            fw,
            &fill_shader,
            &fill_entry_point,
            &render_target,
            &constants,
            &palette,
        );
        let upscale_kernels = [&back_buffers[0], &back_buffers[1]].map(|back_buffer| {
            upscale_kernel(fw, &upscale_shader, &render_target, back_buffer, &constants)
        });

        log::info!("Created {}x{} off-screen swap chain", width, height);

        Self {
            fw,
            fill_shader,
            fill_entry_point,
            upscale_shader,
            palette,
            constants,
            back_buffers,
            render_target,
            fill_kernel,
            upscale_kernels,
            encoder: None,
            fence: Fence::default(),
            front_buffer: None,
        }
    }

    /// A swap chain rendering the bundled fractal tiles shader.
    pub fn with_fractal_tiles(fw: &'fw Framework, width: u32, height: u32) -> Self {
        let shader = Shader::from_wgsl_source(fw, "fractal_tiles.wgsl", FRACTAL_TILES_SHADER);
        Self::new(fw, width, height, shader, "main", &FRACTAL_TILES_PALETTE)
    }

    /// The most recently presented back buffer.
    pub fn front_buffer(&self) -> Option<&GpuTexture<'fw>> {
        self.front_buffer.map(|index| &self.back_buffers[index.get()])
    }

    pub fn render_target(&self) -> &GpuTexture<'fw> {
        &self.render_target
    }
}

/// The command encoder of the frame being recorded.
fn frame_encoder<'a>(
    slot: &'a mut Option<wgpu::CommandEncoder>,
    device: &wgpu::Device,
) -> &'a mut wgpu::CommandEncoder {
    slot.get_or_insert_with(|| {
        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("frame encoder"),
        })
    })
}

fn fill_kernel<'fw>(
    fw: &'fw Framework,
    shader: &Shader,
    entry_point: &str,
    target: &GpuTexture,
    constants: &GpuUniform<FrameConstants>,
    palette: &GpuBuffer<[f32; 4]>,
) -> Kernel<'fw> {
    let bindings = DescriptorSet::default()
        .bind_storage_texture(target)
        .bind_uniform(constants)
        .bind_buffer(palette, GpuBufferUsage::ReadOnly);

    Kernel::new(fw, Program::new(shader, entry_point).add_descriptor(bindings))
}

fn upscale_kernel<'fw>(
    fw: &'fw Framework,
    shader: &Shader,
    source: &GpuTexture,
    destination: &GpuTexture,
    constants: &GpuUniform<FrameConstants>,
) -> Kernel<'fw> {
    let bindings = DescriptorSet::default()
        .bind_texture(source)
        .bind_storage_texture(destination)
        .bind_uniform(constants);

    Kernel::new(fw, Program::new(shader, "upscale").add_descriptor(bindings))
}

impl<'fw> PresentationBackend for OffscreenSwapChain<'fw> {
    type Error = SwapChainError;

    fn output_size(&self) -> (u32, u32) {
        self.back_buffers[0].extent()
    }

    fn resize_render_target(&mut self, width: u32, height: u32) -> Result<(), SwapChainError> {
        if self.render_target.extent() == (width, height) {
            return Ok(());
        }

        // Bind groups keep the old texture alive until in-flight work is done.
        self.render_target = GpuTexture::new(self.fw, width, height, RENDER_TARGET_USAGES);
        self.fill_kernel = fill_kernel(
            self.fw,
            &self.fill_shader,
            &self.fill_entry_point,
            &self.render_target,
            &self.constants,
            &self.palette,
        );
        for (kernel, back_buffer) in self.upscale_kernels.iter_mut().zip(&self.back_buffers) {
            *kernel = upscale_kernel(
                self.fw,
                &self.upscale_shader,
                &self.render_target,
                back_buffer,
                &self.constants,
            );
        }
        Ok(())
    }

    fn render(&mut self, frame: &FrameContext) -> Result<(), SwapChainError> {
        let (width, height) = self.render_target.extent();
        let (output_width, output_height) = self.output_size();
        self.constants.write(&FrameConstants {
            time: frame.time.as_secs_f32(),
            scale: frame.scale as f32,
            render_size: [width, height],
            output_size: [output_width, output_height],
            padding: [0; 2],
        });

        let groups = (
            dispatch_size(width, WORKGROUP_SIZE),
            dispatch_size(height, WORKGROUP_SIZE),
        );
        let encoder = frame_encoder(&mut self.encoder, &self.fw.device);
        self.fill_kernel.record(encoder, groups.0, groups.1, 1);
        Ok(())
    }

    fn copy_to_back_buffer(&mut self, index: BackBufferIndex) -> Result<(), SwapChainError> {
        let (width, height) = self.output_size();
        let groups = (
            dispatch_size(width, WORKGROUP_SIZE),
            dispatch_size(height, WORKGROUP_SIZE),
        );
        let encoder = frame_encoder(&mut self.encoder, &self.fw.device);
        self.upscale_kernels[index.get()].record(encoder, groups.0, groups.1, 1);
        Ok(())
    }

    fn submit(&mut self) -> Result<u64, SwapChainError> {
        if let Some(encoder) = self.encoder.take() {
            self.fw.queue.submit(Some(encoder.finish()));
        }
        Ok(self.fence.signal(&self.fw.queue))
    }

    fn completed_fence_value(&self) -> u64 {
        self.fence.completed_value()
    }

    fn wait_for_fence(&mut self, value: u64) -> Result<(), SwapChainError> {
        if value > self.fence.next_value {
            return Err(SwapChainError::UnsignalledFence(value));
        }
        while self.fence.completed_value() < value {
            self.fw.device.poll(wgpu::Maintain::Wait);
        }
        Ok(())
    }

    fn present(&mut self, index: BackBufferIndex) -> Result<(), SwapChainError> {
        log::trace!("Presenting back buffer {}", index.get());
        self.front_buffer = Some(index);
        Ok(())
    }
}
