use {
    super::{DriverError, Shader, device::Device},
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::{trace, warn},
    std::{ffi::CString, ops::Deref, slice::from_ref, sync::Arc, thread::panicking},
};

/// Smart pointer handle to a graphics pipeline object.
///
/// Vertex data is pulled by the shaders through buffer device addresses, so
/// pipelines are created without vertex input state; only the index buffer is
/// bound at draw time.
#[derive(Debug)]
pub struct GraphicPipeline {
    device: Arc<Device>,

    /// Information used to create this object.
    pub info: GraphicPipelineInfo,

    /// The pipeline layout, needed to bind descriptor sets and push
    /// constants against this pipeline.
    pub layout: vk::PipelineLayout,

    pipeline: vk::Pipeline,
}

impl GraphicPipeline {
    /// Creates a new graphics pipeline on the given device.
    ///
    /// The usual stages are vertex and fragment; the blobs are consumed as-is.
    #[profiling::function]
    pub fn create<S>(
        device: &Arc<Device>,
        info: impl Into<GraphicPipelineInfo>,
        shaders: impl IntoIterator<Item = S>,
    ) -> Result<Self, DriverError>
    where
        S: Into<Shader>,
    {
        trace!("create");

        let device = Arc::clone(device);
        let info: GraphicPipelineInfo = info.into();
        let shaders = shaders
            .into_iter()
            .map(|shader| shader.into())
            .collect::<Vec<_>>();

        let layout = unsafe {
            device
                .create_pipeline_layout(
                    &vk::PipelineLayoutCreateInfo::default()
                        .set_layouts(&info.set_layouts)
                        .push_constant_ranges(&info.push_constants),
                    None,
                )
                .map_err(|err| {
                    warn!("unable to create pipeline layout: {err}");

                    DriverError::Unsupported
                })?
        };

        let mut shader_modules = Vec::with_capacity(shaders.len());
        let mut entry_names = Vec::with_capacity(shaders.len());
        let destroy_modules = |device: &Device, shader_modules: &[vk::ShaderModule]| unsafe {
            for shader_module in shader_modules {
                device.destroy_shader_module(*shader_module, None);
            }
        };

        for shader in &shaders {
            let shader_module = match shader.create_module(&device) {
                Ok(shader_module) => shader_module,
                Err(err) => {
                    destroy_modules(&device, &shader_modules);

                    unsafe {
                        device.destroy_pipeline_layout(layout, None);
                    }

                    return Err(err);
                }
            };

            shader_modules.push(shader_module);
            entry_names.push(CString::new(shader.entry_name.as_bytes()).unwrap_or_default());
        }

        let stages = shaders
            .iter()
            .enumerate()
            .map(|(idx, shader)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .module(shader_modules[idx])
                    .stage(shader.stage)
                    .name(&entry_names[idx])
            })
            .collect::<Vec<_>>();

        // Vertex pulling: no vertex input bindings or attributes
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(info.topology);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(info.polygon_mode)
            .cull_mode(info.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);
        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(info.samples);
        let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(info.depth_test)
            .depth_write_enable(info.depth_write)
            .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL);
        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(from_ref(&color_blend_attachment));
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .depth_stencil_state(&depth_stencil_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(info.render_pass)
            .subpass(info.subpass);
        let pipeline = unsafe {
            device.create_graphics_pipelines(
                Device::pipeline_cache(&device),
                from_ref(&pipeline_info),
                None,
            )
        };

        destroy_modules(&device, &shader_modules);

        match pipeline {
            Ok(pipelines) => Ok(Self {
                device,
                info,
                layout,
                pipeline: pipelines[0],
            }),
            Err((_, err)) => {
                warn!("unable to create graphics pipeline: {err}");

                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                }

                Err(DriverError::Unsupported)
            }
        }
    }
}

impl Deref for GraphicPipeline {
    type Target = vk::Pipeline;

    fn deref(&self) -> &Self::Target {
        &self.pipeline
    }
}

impl Drop for GraphicPipeline {
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

/// Information used to create a [`GraphicPipeline`] instance.
#[derive(Builder, Clone, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "GraphicPipelineInfoBuilderError"),
    derive(Clone, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct GraphicPipelineInfo {
    /// Specifies how polygons will be culled during rasterization.
    #[builder(default = "vk::CullModeFlags::BACK")]
    pub cull_mode: vk::CullModeFlags,

    /// Enables depth testing.
    #[builder(default = "true")]
    pub depth_test: bool,

    /// Enables writing to the depth attachment.
    #[builder(default = "true")]
    pub depth_write: bool,

    /// Specifies how polygons are rasterized.
    #[builder(default = "vk::PolygonMode::FILL")]
    pub polygon_mode: vk::PolygonMode,

    /// Push constant ranges visible to the shaders.
    #[builder(default)]
    pub push_constants: Vec<vk::PushConstantRange>,

    /// The render pass this pipeline will be used within.
    ///
    /// Render passes and framebuffers are owned by the surrounding
    /// application; the runtime records into them but does not create them.
    pub render_pass: vk::RenderPass,

    /// Rasterization sample count.
    #[builder(default = "vk::SampleCountFlags::TYPE_1")]
    pub samples: vk::SampleCountFlags,

    /// Descriptor set layouts the pipeline layout is built from.
    #[builder(default)]
    pub set_layouts: Vec<vk::DescriptorSetLayout>,

    /// The subpass of the render pass this pipeline is used within.
    #[builder(default)]
    pub subpass: u32,

    /// The primitive topology fed to the input assembler.
    #[builder(default = "vk::PrimitiveTopology::TRIANGLE_LIST")]
    pub topology: vk::PrimitiveTopology,
}

impl GraphicPipelineInfo {
    /// Specifies a graphics pipeline for the given render pass.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(render_pass: vk::RenderPass) -> GraphicPipelineInfoBuilder {
        GraphicPipelineInfoBuilder::default().render_pass(render_pass)
    }
}

impl GraphicPipelineInfoBuilder {
    /// Builds a new `GraphicPipelineInfo`.
    pub fn build(self) -> GraphicPipelineInfo {
        match self.fallible_build() {
            Err(GraphicPipelineInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

impl From<GraphicPipelineInfoBuilder> for GraphicPipelineInfo {
    fn from(info: GraphicPipelineInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct GraphicPipelineInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for GraphicPipelineInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}
