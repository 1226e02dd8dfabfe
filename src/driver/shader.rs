//! Shader resource types
//!
//! Shader bytecode is consumed as opaque SPIR-V blobs; no reflection is
//! performed. Pipeline interfaces (descriptor-set layouts and push-constant
//! ranges) are supplied by the caller alongside the blobs.

use {
    super::{DriverError, device::Device},
    ash::vk,
    log::warn,
};

/// Describes a shader program which runs on some pipeline stage.
#[derive(Clone, Debug)]
pub struct Shader {
    /// The name of the entry point which will be executed by this shader.
    ///
    /// The default value is `main`.
    pub entry_name: String,

    /// Opaque SPIR-V bytecode.
    pub spirv: Vec<u8>,

    /// The shader stage this structure applies to.
    pub stage: vk::ShaderStageFlags,
}

impl Shader {
    /// Specifies a shader with the given `stage` and shader code values.
    pub fn new(stage: vk::ShaderStageFlags, spirv: impl Into<Vec<u8>>) -> Self {
        Self {
            entry_name: "main".to_owned(),
            spirv: spirv.into(),
            stage,
        }
    }

    /// Sets the entry point name.
    pub fn entry_name(mut self, entry_name: impl Into<String>) -> Self {
        self.entry_name = entry_name.into();
        self
    }

    pub(super) fn create_module(&self, device: &Device) -> Result<vk::ShaderModule, DriverError> {
        debug_assert_eq!(self.spirv.len() % 4, 0, "spirv length must be a multiple of four");

        let shader_module_info = vk::ShaderModuleCreateInfo {
            code_size: self.spirv.len(),
            p_code: self.spirv.as_ptr() as *const u32,
            ..Default::default()
        };

        unsafe {
            device
                .create_shader_module(&shader_module_info, None)
                .map_err(|err| {
                    warn!("unable to create shader module: {err}");

                    DriverError::InvalidData
                })
        }
    }
}
