//! Logical device resource types

use {
    super::{DriverError, Instance, physical_device::PhysicalDevice},
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::{debug, error, info, trace, warn},
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        slice::from_ref,
        sync::Arc,
        thread::panicking,
        time::Duration,
    },
};

/// Fence waits beyond this deadline are treated as an unrecoverable GPU hang.
const FENCE_TIMEOUT: Duration = Duration::from_secs(3);

/// Opaque handle to a device object.
///
/// The device owns the device-scope function-pointer table; all driver calls
/// made by the storages and the renderer go through it.
pub struct Device {
    device: ash::Device,

    /// Vulkan instance pointer, which includes useful functions.
    pub instance: Arc<Instance>,

    /// The physical device, which contains useful data about features,
    /// properties, and limits.
    pub physical_device: PhysicalDevice,

    pipeline_cache: vk::PipelineCache,

    queue: vk::Queue,

    /// The queue family the device queue was created from.
    pub queue_family_index: u32,
}

impl Device {
    /// Creates a logical device on the given physical device.
    ///
    /// Requires Vulkan 1.2 with the `bufferDeviceAddress` and
    /// descriptor-indexing features; creation fails with
    /// [`DriverError::Unsupported`] when the driver does not offer them.
    #[profiling::function]
    pub fn create(
        instance: &Arc<Instance>,
        physical_device: PhysicalDevice,
        info: impl Into<DeviceInfo>,
    ) -> Result<Self, DriverError> {
        let info: DeviceInfo = info.into();
        let instance = Arc::clone(instance);
        let queue_family_index = physical_device
            .queue_families
            .iter()
            .find(|queue_family| {
                queue_family
                    .props
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .map(|queue_family| queue_family.idx)
            .ok_or_else(|| {
                warn!("no graphics+compute queue family");

                DriverError::Unsupported
            })?;

        let queue_priorities = [1.0];
        let queue_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities);

        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(true)
            .descriptor_indexing(true)
            .runtime_descriptor_array(true)
            .descriptor_binding_partially_bound(true)
            .descriptor_binding_variable_descriptor_count(true)
            .shader_sampled_image_array_non_uniform_indexing(true);
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .features(vk::PhysicalDeviceFeatures::default().multi_draw_indirect(true))
            .push_next(&mut vulkan_1_2_features);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(from_ref(&queue_info))
            .push_next(&mut features);
        let device = unsafe {
            instance
                .create_device(*physical_device, &device_info, None)
                .map_err(|err| {
                    warn!("unable to create device: {err}");

                    DriverError::Unsupported
                })?
        };
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };

        // The cache may be seeded with a blob produced by a previous run
        let pipeline_cache = unsafe {
            device
                .create_pipeline_cache(
                    &vk::PipelineCacheCreateInfo::default().initial_data(&info.pipeline_cache_data),
                    None,
                )
                .unwrap_or_default()
        };

        trace!("created a Vulkan device");

        Ok(Self {
            device,
            instance,
            physical_device,
            pipeline_cache,
            queue,
            queue_family_index,
        })
    }

    /// Loads the driver, selects the highest-scoring physical device and
    /// creates a logical device on it.
    ///
    /// The runtime does not own windows or surfaces, so no presentation
    /// support is requested.
    #[profiling::function]
    pub fn create_headless(info: impl Into<DeviceInfo>) -> Result<Self, DriverError> {
        let info: DeviceInfo = info.into();
        let instance = Arc::new(Instance::create(info.debug)?);
        let physical_devices = Instance::physical_devices(&instance)?.collect::<Vec<_>>();

        for physical_device in &physical_devices {
            debug!("supported: {physical_device:?}");
        }

        let physical_device = physical_devices
            .into_iter()
            // If there are multiple devices with the same score, `max_by_key`
            // would choose the last, and we want to preserve the order of
            // devices from `enumerate_physical_devices`.
            .rev()
            .max_by_key(PhysicalDevice::score_device_type)
            .ok_or(DriverError::Unsupported)?;

        info!("selected: {physical_device:?}");

        Self::create(&instance, physical_device, info)
    }

    /// Allocates raw device memory of the given memory type.
    ///
    /// When `device_address` is set the allocation is made with the
    /// device-address flag so buffers bound to it may be queried with
    /// [`Buffer::device_address`][super::Buffer::device_address].
    #[profiling::function]
    pub fn allocate_memory(
        this: &Self,
        size: vk::DeviceSize,
        memory_type_index: u32,
        device_address: bool,
    ) -> Result<vk::DeviceMemory, DriverError> {
        let mut flags_info = vk::MemoryAllocateFlagsInfo::default()
            .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        if device_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }

        unsafe {
            this.device.allocate_memory(&alloc_info, None).map_err(|err| {
                warn!("unable to allocate {size} bytes of memory type {memory_type_index}: {err}");

                DriverError::OutOfMemory
            })
        }
    }

    /// The device's pipeline cache, fed to every pipeline creation.
    pub fn pipeline_cache(this: &Self) -> vk::PipelineCache {
        this.pipeline_cache
    }

    /// Retrieves the pipeline-cache blob so the caller may persist it and
    /// feed it back through [`DeviceInfo`] on the next launch.
    pub fn pipeline_cache_data(this: &Self) -> Result<Vec<u8>, DriverError> {
        unsafe {
            this.device
                .get_pipeline_cache_data(this.pipeline_cache)
                .map_err(|err| {
                    warn!("unable to retrieve pipeline cache data: {err}");

                    DriverError::OutOfMemory
                })
        }
    }

    /// Returns the device queue.
    pub fn queue(this: &Self) -> vk::Queue {
        this.queue
    }

    /// The alignment the storages leave between buffer subregions.
    ///
    /// Derived from the storage-buffer offset alignment limit with a floor of
    /// 16 bytes so vec4 accesses stay naturally aligned.
    pub fn standard_buffer_alignment(this: &Self) -> vk::DeviceSize {
        this.physical_device
            .props
            .limits
            .min_storage_buffer_offset_alignment
            .max(16)
    }

    /// Submits a command buffer to the device queue, signalling `fence` on
    /// completion.
    #[profiling::function]
    pub fn submit(this: &Self, cmd_buf: vk::CommandBuffer, fence: vk::Fence) -> Result<(), DriverError> {
        let submit_info = vk::SubmitInfo::default().command_buffers(from_ref(&cmd_buf));

        unsafe {
            this.device
                .queue_submit(this.queue, from_ref(&submit_info), fence)
                .map_err(|err| {
                    warn!("unable to submit command buffer: {err}");

                    DriverError::OutOfMemory
                })
        }
    }

    /// Nanoseconds per tick of the timestamps written by
    /// `vkCmdWriteTimestamp`.
    pub fn timestamp_period(this: &Self) -> f32 {
        this.physical_device.props.limits.timestamp_period
    }

    /// Blocks until the given fence signals.
    ///
    /// Waits up to [`FENCE_TIMEOUT`]; timing out is reported as
    /// [`DriverError::Timeout`] which callers treat as fatal.
    #[profiling::function]
    pub fn wait_for_fence(this: &Self, fence: vk::Fence) -> Result<(), DriverError> {
        trace!("wait_for_fence {fence:?}");

        unsafe {
            match this.device.wait_for_fences(
                from_ref(&fence),
                true,
                FENCE_TIMEOUT.as_nanos() as u64,
            ) {
                Ok(()) => Ok(()),
                Err(vk::Result::TIMEOUT) => {
                    error!("fence wait timed out after {FENCE_TIMEOUT:?}; device is hung");

                    Err(DriverError::Timeout)
                }
                Err(err) => {
                    warn!("unable to wait for fence: {err}");

                    Err(DriverError::OutOfMemory)
                }
            }
        }
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Device")
    }
}

impl Deref for Device {
    type Target = ash::Device;

    fn deref(&self) -> &Self::Target {
        &self.device
    }
}

impl Drop for Device {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        // The storages destroy their buffers and memories before the renderer
        // drops its device reference, so nothing is in flight here.
        unsafe {
            self.device.device_wait_idle().unwrap_or_default();
            self.device.destroy_pipeline_cache(self.pipeline_cache, None);
            self.device.destroy_device(None);
        }
    }
}

/// Information used to create a [`Device`] instance.
#[derive(Builder, Clone, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "DeviceInfoBuilderError"),
    derive(Clone, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct DeviceInfo {
    /// Enables Vulkan validation layers.
    ///
    /// This requires a Vulkan SDK installation and will cause validation
    /// errors to be logged as they happen.
    #[builder(default)]
    pub debug: bool,

    /// A pipeline-cache blob from a previous run, as returned by
    /// [`Device::pipeline_cache_data`]. Drivers validate and may reject the
    /// blob, in which case the cache simply starts cold.
    #[builder(default)]
    pub pipeline_cache_data: Vec<u8>,
}

impl DeviceInfo {
    /// Specifies a default device configuration.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> DeviceInfoBuilder {
        Default::default()
    }
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            debug: false,
            pipeline_cache_data: vec![],
        }
    }
}

impl From<DeviceInfoBuilder> for DeviceInfo {
    fn from(info: DeviceInfoBuilder) -> Self {
        info.build()
    }
}

impl DeviceInfoBuilder {
    /// Builds a new `DeviceInfo`.
    pub fn build(self) -> DeviceInfo {
        match self.fallible_build() {
            Err(DeviceInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

#[derive(Debug)]
struct DeviceInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for DeviceInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}
