use {
    super::{DriverError, device::Device},
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::warn,
    std::{ops::Deref, slice::from_ref, sync::Arc, thread::panicking},
};

/// Smart pointer handle to a descriptor set layout object.
pub struct DescriptorSetLayout {
    device: Arc<Device>,
    layout: vk::DescriptorSetLayout,
}

impl DescriptorSetLayout {
    /// Creates a descriptor set layout from the given bindings.
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        binding_flags: &[vk::DescriptorBindingFlags],
    ) -> Result<Self, DriverError> {
        debug_assert!(binding_flags.is_empty() || binding_flags.len() == bindings.len());

        let device = Arc::clone(device);
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::default().binding_flags(binding_flags);
        let mut layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);

        if !binding_flags.is_empty() {
            layout_info = layout_info.push_next(&mut flags_info);
        }

        let layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(|err| {
                    warn!("unable to create descriptor set layout: {err}");

                    DriverError::Unsupported
                })?
        };

        Ok(Self { device, layout })
    }

    /// Creates the layout used for a bindless sampled-image array of
    /// `max_textures` descriptors, partially bound and variably sized.
    pub fn create_bindless_textures(
        device: &Arc<Device>,
        max_textures: u32,
    ) -> Result<Self, DriverError> {
        let binding = vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(max_textures)
            .stage_flags(vk::ShaderStageFlags::ALL);
        let binding_flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;

        Self::create(device, from_ref(&binding), from_ref(&binding_flags))
    }
}

impl Deref for DescriptorSetLayout {
    type Target = vk::DescriptorSetLayout;

    fn deref(&self) -> &Self::Target {
        &self.layout
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

/// Smart pointer handle to a descriptor pool object.
pub struct DescriptorPool {
    device: Arc<Device>,

    /// Information used to create this object.
    pub info: DescriptorPoolInfo,

    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Creates a descriptor pool on the given device.
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        info: impl Into<DescriptorPoolInfo>,
    ) -> Result<Self, DriverError> {
        let info: DescriptorPoolInfo = info.into();
        let device = Arc::clone(device);
        let mut pool_sizes = vec![];

        if info.combined_image_sampler_count > 0 {
            pool_sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(info.combined_image_sampler_count),
            );
        }

        if info.storage_buffer_count > 0 {
            pool_sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(info.storage_buffer_count),
            );
        }

        if info.uniform_buffer_count > 0 {
            pool_sizes.push(
                vk::DescriptorPoolSize::default()
                    .ty(vk::DescriptorType::UNIFORM_BUFFER)
                    .descriptor_count(info.uniform_buffer_count),
            );
        }

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(info.max_sets)
            .pool_sizes(&pool_sizes);
        let pool = unsafe {
            device.create_descriptor_pool(&pool_info, None).map_err(|err| {
                warn!("unable to create descriptor pool: {err}");

                DriverError::OutOfMemory
            })?
        };

        Ok(Self { device, info, pool })
    }

    /// Allocates one descriptor set of the given layout.
    ///
    /// For variable-count layouts, `variable_count` gives the size of the
    /// final binding's descriptor array.
    #[profiling::function]
    pub fn allocate_set(
        this: &Self,
        layout: &DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> Result<vk::DescriptorSet, DriverError> {
        let counts = [variable_count.unwrap_or_default()];
        let mut variable_count_info =
            vk::DescriptorSetVariableDescriptorCountAllocateInfo::default()
                .descriptor_counts(&counts);
        let mut alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(this.pool)
            .set_layouts(from_ref(&**layout));

        if variable_count.is_some() {
            alloc_info = alloc_info.push_next(&mut variable_count_info);
        }

        unsafe {
            this.device
                .allocate_descriptor_sets(&alloc_info)
                .map(|sets| sets[0])
                .map_err(|err| {
                    warn!("unable to allocate descriptor set: {err}");

                    DriverError::OutOfMemory
                })
        }
    }
}

impl Deref for DescriptorPool {
    type Target = vk::DescriptorPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            self.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

/// Information used to create a [`DescriptorPool`] instance.
#[derive(Builder, Clone, Copy, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "DescriptorPoolInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct DescriptorPoolInfo {
    /// Number of combined image sampler descriptors available in the pool.
    #[builder(default)]
    pub combined_image_sampler_count: u32,

    /// Maximum number of descriptor sets that may be allocated.
    #[builder(default = "1")]
    pub max_sets: u32,

    /// Number of storage buffer descriptors available in the pool.
    #[builder(default)]
    pub storage_buffer_count: u32,

    /// Number of uniform buffer descriptors available in the pool.
    #[builder(default)]
    pub uniform_buffer_count: u32,
}

impl DescriptorPoolInfo {
    /// Specifies a default pool configuration.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> DescriptorPoolInfoBuilder {
        Default::default()
    }
}

impl DescriptorPoolInfoBuilder {
    /// Builds a new `DescriptorPoolInfo`.
    pub fn build(self) -> DescriptorPoolInfo {
        match self.fallible_build() {
            Err(DescriptorPoolInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

impl From<DescriptorPoolInfoBuilder> for DescriptorPoolInfo {
    fn from(info: DescriptorPoolInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct DescriptorPoolInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for DescriptorPoolInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}
