use std::num::NonZeroU32;

use crate::{kernel::BufferResult, Framework, GpuBuffer, GpuTexture};

const BYTES_PER_PIXEL: u32 = 4;

/// Row pitch of a texture-to-buffer copy, `wgpu` wants 256 byte aligned rows.
pub fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * BYTES_PER_PIXEL;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    (unpadded + align - 1) / align * align
}

impl<'fw> GpuTexture<'fw> {
    pub const FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

    /// Allocates a `width` x `height` texture. A zero extent is bumped to one texel.
    pub fn new(fw: &'fw Framework, width: u32, height: u32, usage: wgpu::TextureUsages) -> Self {
        let (width, height) = (width.max(1), height.max(1));
        let texture = fw.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("GpuTexture"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::FORMAT,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        log::debug!("Allocated {}x{} texture with {:?}", width, height, usage);

        Self {
            fw,
            texture,
            view,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub(crate) fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    /// Copies the texture back to the host as tightly packed RGBA8 rows.
    ///
    /// The texture must have been created with [`wgpu::TextureUsages::COPY_SRC`].
    pub async fn read_pixels(&self) -> BufferResult<Vec<u8>> {
        let padded_row = padded_bytes_per_row(self.width);
        let staging: GpuBuffer<u8> =
            GpuBuffer::staging(self.fw, padded_row as u64 * self.height as u64);

        let mut encoder = self
            .fw
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("texture readback encoder"),
            });
        encoder.copy_texture_to_buffer(
            self.texture.as_image_copy(),
            wgpu::ImageCopyBuffer {
                buffer: staging.as_gpu_buffer(),
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: NonZeroU32::new(padded_row),
                    rows_per_image: None,
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        self.fw.queue.submit(Some(encoder.finish()));

        let padded = staging.read_vec().await?;
        let row = (self.width * BYTES_PER_PIXEL) as usize;

        Ok(padded
            .chunks_exact(padded_row as usize)
            .flat_map(|line| &line[..row])
            .copied()
            .collect())
    }
}
