use std::marker::PhantomData;

use thiserror::Error;
use wgpu::{util::DeviceExt, MapMode};

use crate::{
    DescriptorSet, Framework, GpuBuffer, GpuBufferUsage, GpuTexture, GpuUniform, Kernel, Program,
    Shader,
};

const STORAGE_BUFFER_USAGES: wgpu::BufferUsages = wgpu::BufferUsages::from_bits_truncate(
    wgpu::BufferUsages::STORAGE.bits()
        | wgpu::BufferUsages::COPY_SRC.bits()
        | wgpu::BufferUsages::COPY_DST.bits(),
);

const STAGING_BUFFER_USAGES: wgpu::BufferUsages = wgpu::BufferUsages::from_bits_truncate(
    wgpu::BufferUsages::MAP_READ.bits() | wgpu::BufferUsages::COPY_DST.bits(),
);

pub type BufferResult<T> = Result<T, BufferError>;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error(transparent)]
    AsyncMapError(#[from] wgpu::BufferAsyncError),
    #[error("buffer mapping callback was dropped")]
    ChannelClosed,
}

/// Number of workgroups needed to cover `extent` threads with groups of `group` threads.
pub fn dispatch_size(extent: u32, group: u32) -> u32 {
    (extent + group - 1) / group
}

impl<'res> DescriptorSet<'res> {
    fn push(mut self, ty: wgpu::BindingType, resource: wgpu::BindingResource<'res>) -> Self {
        let bind_id = self.layout.len() as u32;
        // describe a bindgroupentry's layout
        let entry_layout = wgpu::BindGroupLayoutEntry {
            binding: bind_id,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty,
            count: None,
        };

        let entry = wgpu::BindGroupEntry {
            binding: bind_id,
            resource,
        };

        self.layout.push(entry_layout);
        self.set.push(entry);

        self
    }

    pub fn bind_buffer<T>(self, storage_buf: &'res GpuBuffer<T>, usage: GpuBufferUsage) -> Self
    where
        T: bytemuck::Pod,
    {
        let ty = wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: usage == GpuBufferUsage::ReadOnly,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        };
        self.push(ty, storage_buf.as_binding_resource())
    }

    pub fn bind_uniform<T>(self, uniform: &'res GpuUniform<T>) -> Self
    where
        T: bytemuck::Pod,
    {
        let ty = wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        };
        self.push(ty, uniform.buf.as_entire_binding())
    }

    /// Binds `texture` as a write-only storage texture.
    /// ### Example WGSL syntax:
    /// ```ignore
    /// @group(0) @binding(0) var output: texture_storage_2d<rgba8unorm, write>;
    /// ```
    pub fn bind_storage_texture(self, texture: &'res GpuTexture) -> Self {
        let ty = wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: GpuTexture::FORMAT,
            view_dimension: wgpu::TextureViewDimension::D2,
        };
        self.push(ty, wgpu::BindingResource::TextureView(texture.view()))
    }

    /// Binds `texture` for `textureLoad` reads.
    /// ### Example WGSL syntax:
    /// ```ignore
    /// @group(0) @binding(0) var input: texture_2d<f32>;
    /// ```
    pub fn bind_texture(self, texture: &'res GpuTexture) -> Self {
        let ty = wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        };
        self.push(ty, wgpu::BindingResource::TextureView(texture.view()))
    }
}

impl<'fw, T> GpuBuffer<'fw, T>
where
    T: bytemuck::Pod,
{
    /// Returns a [`wgpu::BindingResource`] of all the elements in the buffer.
    fn as_binding_resource(&self) -> wgpu::BindingResource {
        self.buf.as_entire_binding()
    }

    pub(crate) fn as_gpu_buffer(&self) -> &wgpu::Buffer {
        &self.buf
    }

    fn size(&self) -> u64 {
        self.size
    }

    /// Returns the number of elements the buffer can hold.
    fn capacity(&self) -> u64 {
        self.size() / std::mem::size_of::<T>() as u64
    }

    /// get a GPU accessible storage buffer from a slice
    pub fn from_slice(fw: &'fw Framework, slice: &[T]) -> Self {
        let size = (slice.len() * std::mem::size_of::<T>()) as u64;
        let buf = fw
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuBuffer: from slice"),
                contents: bytemuck::cast_slice(slice),
                usage: STORAGE_BUFFER_USAGES,
            });
        Self {
            fw,
            buf,
            size,
            marker: PhantomData,
        }
    }

    /// A host-readable buffer that copies land in before being read back.
    pub fn staging(fw: &'fw Framework, capacity: u64) -> Self {
        let size = capacity * std::mem::size_of::<T>() as u64;
        let buf = fw.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuBuffer: staging"),
            size,
            usage: STAGING_BUFFER_USAGES,
            mapped_at_creation: false,
        });
        Self {
            fw,
            buf,
            size,
            marker: PhantomData,
        }
    }

    /// Pulls some elements from the [`GpuBuffer`] into `buf`, returning how many bytes were read.
    pub async fn read(&self, buf: &mut [T]) -> BufferResult<u64> {
        let output_size = (buf.len() * std::mem::size_of::<T>()) as u64;
        let download_size = output_size.min(self.size);
        let count = download_size as usize / std::mem::size_of::<T>();

        let download = self.buf.slice(..download_size);

        let (tx, rx) = futures::channel::oneshot::channel();
        download.map_async(MapMode::Read, move |result| {
            // the receiver only disappears if the read future was dropped.
            let _ = tx.send(result);
        });
        self.fw.device.poll(wgpu::Maintain::Poll);
        rx.await.map_err(|_| BufferError::ChannelClosed)??;

        {
            let mapped = download.get_mapped_range();
            buf[..count].copy_from_slice(bytemuck::cast_slice(&mapped));
        }
        self.buf.unmap();

        Ok(download_size)
    }

    /// Pulls all the elements from the [`GpuBuffer`] into a [`Vec`].
    pub async fn read_vec(&self) -> BufferResult<Vec<T>> {
        let mut buf = vec![T::zeroed(); self.capacity() as usize];
        self.read(&mut buf).await?;

        Ok(buf)
    }

    /// Blocking version of `GpuBuffer::read_vec()`.
    pub fn read_vec_blocking(&self) -> BufferResult<Vec<T>> {
        futures::executor::block_on(self.read_vec())
    }
}

impl<'fw, T> GpuUniform<'fw, T>
where
    T: bytemuck::Pod,
{
    pub fn new(fw: &'fw Framework, value: &T) -> Self {
        let buf = fw
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuUniform"),
                contents: bytemuck::bytes_of(value),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        Self {
            fw,
            buf,
            marker: PhantomData,
        }
    }

    /// Schedules an update, visible to the next submission on the queue.
    pub fn write(&self, value: &T) {
        self.fw.queue.write_buffer(&self.buf, 0, bytemuck::bytes_of(value));
    }
}

impl<'sha, 'res> Program<'sha, 'res> {
    pub fn new(shader: &'sha Shader, entry_point: impl Into<String>) -> Self {
        Self {
            shader,
            entry_point: entry_point.into(),
            descriptors: Vec::new(),
        }
    }

    /// add a descriptor set to the program. another way of saying the descriptor set contains
    /// the resources the shader needs access to
    pub fn add_descriptor(mut self, desc: DescriptorSet<'res>) -> Self {
        self.descriptors.push(desc);
        self
    }
}

impl<'sha, 'res, 'fw> Kernel<'fw> {
    pub fn new(fw: &'fw Framework, program: Program<'sha, 'res>) -> Self {
        let mut bindgroup_layouts = Vec::new();
        let mut bindgroups = Vec::new();

        for (set_id, desc) in program.descriptors.iter().enumerate() {
            let bindgroup_layout =
                fw.device
                    .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: None,
                        entries: &desc.layout,
                    });
            let bind_group = fw.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &bindgroup_layout,
                entries: &desc.set,
            });

            log::debug!("Binding set = {} with {:#?}", set_id, &desc.set);

            bindgroup_layouts.push(bindgroup_layout);
            bindgroups.push(bind_group);
        }

        let bindgroup_layouts = bindgroup_layouts.iter().collect::<Vec<_>>();

        let compute_pipeline_layout =
            fw.device
                .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(program.entry_point.as_str()),
                    bind_group_layouts: &bindgroup_layouts,
                    push_constant_ranges: &[],
                });
        let compute_pipeline =
            fw.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(program.entry_point.as_str()),
                    layout: Some(&compute_pipeline_layout),
                    module: &program.shader.0,
                    entry_point: &program.entry_point,
                });

        Self {
            fw,
            pipeline: compute_pipeline,
            bindgroups,
            entry_point: program.entry_point,
        }
    }

    /// Records a dispatch of `x * y * z` workgroups into `encoder`.
    pub fn record(&self, encoder: &mut wgpu::CommandEncoder, x: u32, y: u32, z: u32) {
        let mut compute_pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(self.entry_point.as_str()),
        });

        compute_pass.set_pipeline(&self.pipeline);

        for (id, bindgroup) in self.bindgroups.iter().enumerate() {
            compute_pass.set_bind_group(id as u32, bindgroup, &[]);
        }

        compute_pass.insert_debug_marker(&self.entry_point);
        compute_pass.dispatch_workgroups(x, y, z);
    }

    /// Records and submits a dispatch on its own command buffer.
    pub fn enqueue(&self, x: u32, y: u32, z: u32) -> wgpu::SubmissionIndex {
        let mut encoder = self
            .fw
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compute encoder"),
            });
        self.record(&mut encoder, x, y, z);

        self.fw.queue.submit(Some(encoder.finish()))
    }
}
