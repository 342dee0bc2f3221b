use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::Framework;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum FrameworkError {
    #[error("no suitable GPU adapter found")]
    NoAdapter,
    #[error(transparent)]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

impl Framework {
    pub async fn new() -> Result<Self, FrameworkError> {
        // specify the backend, we'll just pick one from the environment i.e. whatever's available.
        let backend = wgpu::util::backend_bits_from_env().unwrap_or(wgpu::Backends::PRIMARY);
        // specify a power profile for the gpu, again pick one from the environment.
        let power_preference = wgpu::util::power_preference_from_env()
            .unwrap_or(wgpu::PowerPreference::HighPerformance);
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: backend,
            dx12_shader_compiler: wgpu::Dx12Compiler::default(),
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                ..Default::default()
            })
            .await
            .ok_or(FrameworkError::NoAdapter)?;

        log::info!("Using adapter {:?}", adapter.get_info());

        // the device creates textures, buffers and pipelines. the work recorded
        // against them is submitted to the [`wgpu::Queue`].
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("gpgpu-dynres device"),
                    features: adapter.features(),
                    limits: adapter.limits(),
                },
                None,
            )
            .await?;

        let device = Arc::new(device);
        let polling_device = Arc::clone(&device);

        // keeps map_async and on_submitted_work_done callbacks flowing.
        std::thread::spawn(move || loop {
            polling_device.poll(wgpu::Maintain::Poll);
            std::thread::sleep(POLL_INTERVAL);
        });

        Ok(Framework {
            device,
            queue,
            adapter,
        })
    }

    /// Blocking version of [`Framework::new`].
    pub fn new_blocking() -> Result<Self, FrameworkError> {
        futures::executor::block_on(Self::new())
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub fn adapter_info(&self) -> wgpu::AdapterInfo {
        self.adapter.get_info()
    }
}
