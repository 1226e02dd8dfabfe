use {
    super::{DriverError, Shader, device::Device},
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::{trace, warn},
    std::{ffi::CString, ops::Deref, slice::from_ref, sync::Arc, thread::panicking},
};

/// Smart pointer handle to a compute pipeline object.
#[derive(Debug)]
pub struct ComputePipeline {
    device: Arc<Device>,

    /// Information used to create this object.
    pub info: ComputePipelineInfo,

    /// The pipeline layout, needed to bind descriptor sets and push
    /// constants against this pipeline.
    pub layout: vk::PipelineLayout,

    pipeline: vk::Pipeline,
}

impl ComputePipeline {
    /// Creates a new compute pipeline on the given device.
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        info: impl Into<ComputePipelineInfo>,
    ) -> Result<Self, DriverError> {
        trace!("create");

        let device = Arc::clone(device);
        let info: ComputePipelineInfo = info.into();
        let shader = Shader::new(vk::ShaderStageFlags::COMPUTE, info.spirv.clone())
            .entry_name(info.entry_name.clone());
        let shader_module = shader.create_module(&device)?;
        let entry_name = CString::new(info.entry_name.as_bytes()).map_err(|_| {
            unsafe {
                device.destroy_shader_module(shader_module, None);
            }

            DriverError::InvalidData
        })?;
        let layout = match unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(&info.set_layouts)
                    .push_constant_ranges(&info.push_constants),
                None,
            )
        } {
            Ok(layout) => layout,
            Err(err) => {
                warn!("unable to create pipeline layout: {err}");

                unsafe {
                    device.destroy_shader_module(shader_module, None);
                }

                return Err(DriverError::Unsupported);
            }
        };
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .module(shader_module)
            .stage(vk::ShaderStageFlags::COMPUTE)
            .name(&entry_name);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);
        let pipeline = unsafe {
            device.create_compute_pipelines(
                Device::pipeline_cache(&device),
                from_ref(&pipeline_info),
                None,
            )
        };

        unsafe {
            device.destroy_shader_module(shader_module, None);
        }

        match pipeline {
            Ok(pipelines) => Ok(Self {
                device,
                info,
                layout,
                pipeline: pipelines[0],
            }),
            Err((_, err)) => {
                warn!("unable to create compute pipeline: {err}");

                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                }

                Err(DriverError::Unsupported)
            }
        }
    }
}

impl Deref for ComputePipeline {
    type Target = vk::Pipeline;

    fn deref(&self) -> &Self::Target {
        &self.pipeline
    }
}

impl Drop for ComputePipeline {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

/// Information used to create a [`ComputePipeline`] instance.
#[derive(Builder, Clone, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "ComputePipelineInfoBuilderError"),
    derive(Clone, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct ComputePipelineInfo {
    /// The name of the entry point which will be executed by this pipeline.
    #[builder(default = "String::from(\"main\")")]
    pub entry_name: String,

    /// Push constant ranges visible to the shader.
    #[builder(default)]
    pub push_constants: Vec<vk::PushConstantRange>,

    /// Descriptor set layouts the pipeline layout is built from.
    ///
    /// Pipelines which pull all of their inputs through buffer device
    /// addresses leave this empty.
    #[builder(default)]
    pub set_layouts: Vec<vk::DescriptorSetLayout>,

    /// Opaque SPIR-V bytecode.
    pub spirv: Vec<u8>,
}

impl ComputePipelineInfo {
    /// Specifies a compute pipeline with the given shader code.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(spirv: impl Into<Vec<u8>>) -> ComputePipelineInfoBuilder {
        ComputePipelineInfoBuilder::default().spirv(spirv.into())
    }
}

impl ComputePipelineInfoBuilder {
    /// Builds a new `ComputePipelineInfo`.
    pub fn build(self) -> ComputePipelineInfo {
        match self.fallible_build() {
            Err(ComputePipelineInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

impl From<ComputePipelineInfoBuilder> for ComputePipelineInfo {
    fn from(info: ComputePipelineInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct ComputePipelineInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for ComputePipelineInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}
