use std::{borrow::Cow, path::Path};

use crate::{Framework, Shader};

impl Shader {
    /// Initialises a [`Shader`] from a `WGSL` file.
    pub fn from_wgsl_file(fw: &Framework, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let source_string = std::fs::read_to_string(&path)?;
        let shader_name = path.as_ref().to_str();

        Ok(Self::create(fw, shader_name, Cow::Owned(source_string)))
    }

    /// Initialises a [`Shader`] from in-memory `WGSL` source, usually an `include_str!`.
    pub fn from_wgsl_source(fw: &Framework, label: &str, source: &'static str) -> Self {
        Self::create(fw, Some(label), Cow::Borrowed(source))
    }

    fn create(fw: &Framework, label: Option<&str>, source: Cow<'static, str>) -> Self {
        log::debug!("Compiling shader {:?}", label);
        Self(fw.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label,
            source: wgpu::ShaderSource::Wgsl(source),
        }))
    }
}
