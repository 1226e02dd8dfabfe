//! Buffer resource types

use {
    super::{DriverError, device::Device, physical_device::PhysicalDevice},
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::{trace, warn},
    std::{
        fmt::{Debug, Formatter},
        ops::Deref,
        sync::Arc,
        thread::panicking,
    },
};

/// Smart pointer handle to a [buffer] object paired with its backing device
/// memory.
///
/// Unlike general-purpose allocators, each `Buffer` owns one dedicated
/// `vk::DeviceMemory` allocation; the storages of this crate suballocate
/// inside these buffers themselves.
///
/// ## `Deref` behavior
///
/// `Buffer` automatically dereferences to [`vk::Buffer`] (via the [`Deref`]
/// trait), so you can call `vk::Buffer`'s methods on a value of type
/// `Buffer`. The methods of `Buffer` itself are associated functions, called
/// using fully qualified syntax.
///
/// [buffer]: https://registry.khronos.org/vulkan/specs/1.2-extensions/man/html/VkBuffer.html
pub struct Buffer {
    buffer: vk::Buffer,
    device: Arc<Device>,

    /// Information used to create this object.
    pub info: BufferInfo,

    mapped_ptr: *mut u8,
    memory: vk::DeviceMemory,
}

impl Buffer {
    /// Creates a new buffer on the given device.
    #[profiling::function]
    pub fn create(device: &Arc<Device>, info: impl Into<BufferInfo>) -> Result<Self, DriverError> {
        let info: BufferInfo = info.into();

        trace!("create: {info:?}");

        debug_assert_ne!(info.size, 0, "size must be non-zero");

        let device = Arc::clone(device);
        let buffer_info = vk::BufferCreateInfo::default()
            .size(info.size)
            .usage(info.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe {
            device.create_buffer(&buffer_info, None).map_err(|err| {
                warn!("unable to create buffer: {err}");

                DriverError::Unsupported
            })?
        };
        let mut requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(info.alignment);

        let memory_type_index = if info.mappable {
            PhysicalDevice::memory_type_index(
                &device.physical_device,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .or_else(|| {
                PhysicalDevice::memory_type_index(
                    &device.physical_device,
                    requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::HOST_VISIBLE,
                )
            })
        } else {
            PhysicalDevice::memory_type_index(
                &device.physical_device,
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .or_else(|| {
                PhysicalDevice::memory_type_index(
                    &device.physical_device,
                    requirements.memory_type_bits,
                    vk::MemoryPropertyFlags::empty(),
                )
            })
        };
        let Some(memory_type_index) = memory_type_index else {
            warn!("no suitable memory type for {info:?}");

            unsafe {
                device.destroy_buffer(buffer, None);
            }

            return Err(DriverError::Unsupported);
        };

        let device_address = info
            .usage
            .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let memory =
            match Device::allocate_memory(&device, requirements.size, memory_type_index, device_address)
            {
                Ok(memory) => memory,
                Err(err) => {
                    unsafe {
                        device.destroy_buffer(buffer, None);
                    }

                    return Err(err);
                }
            };

        if let Err(err) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            warn!("unable to bind buffer memory: {err}");

            unsafe {
                device.free_memory(memory, None);
                device.destroy_buffer(buffer, None);
            }

            return Err(DriverError::OutOfMemory);
        }

        let mapped_ptr = if info.mappable {
            match unsafe {
                device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            } {
                Ok(ptr) => ptr as *mut u8,
                Err(err) => {
                    warn!("unable to map buffer memory: {err}");

                    unsafe {
                        device.free_memory(memory, None);
                        device.destroy_buffer(buffer, None);
                    }

                    return Err(DriverError::OutOfMemory);
                }
            }
        } else {
            std::ptr::null_mut()
        };

        debug_assert_ne!(buffer, vk::Buffer::null());

        Ok(Self {
            buffer,
            device,
            info,
            mapped_ptr,
            memory,
        })
    }

    /// Returns the device address of this object.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the buffer was not created with the
    /// `SHADER_DEVICE_ADDRESS` usage flag.
    #[profiling::function]
    pub fn device_address(this: &Self) -> vk::DeviceAddress {
        debug_assert!(
            this.info
                .usage
                .contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS)
        );

        unsafe {
            this.device
                .get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(this.buffer))
        }
    }

    /// Returns the persistently mapped host pointer.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the buffer was not created with the
    /// `mappable` flag set to `true`.
    pub fn mapped_ptr(this: &Self) -> *mut u8 {
        debug_assert!(
            this.info.mappable,
            "buffer is not mappable - create using mappable flag"
        );

        this.mapped_ptr
    }

    /// Returns a mapped mutable slice.
    ///
    /// # Panics
    ///
    /// Panics in debug builds if the buffer was not created with the
    /// `mappable` flag set to `true`.
    pub fn mapped_slice_mut(this: &mut Self) -> &mut [u8] {
        debug_assert!(
            this.info.mappable,
            "buffer is not mappable - create using mappable flag"
        );

        unsafe { std::slice::from_raw_parts_mut(this.mapped_ptr, this.info.size as usize) }
    }
}

impl Debug for Buffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.buffer)
    }
}

impl Deref for Buffer {
    type Target = vk::Buffer;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl Drop for Buffer {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        // Freeing the memory implicitly unmaps it
        unsafe {
            self.device.destroy_buffer(self.buffer, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

/// Information used to create a [`Buffer`] instance.
#[derive(Builder, Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[builder(
    build_fn(private, name = "fallible_build", error = "BufferInfoBuilderError"),
    derive(Clone, Copy, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct BufferInfo {
    /// Byte alignment of the base device address of the buffer.
    ///
    /// Must be a power of two.
    #[builder(default = "1")]
    pub alignment: vk::DeviceSize,

    /// Specifies a buffer whose memory is host visible and persistently
    /// mapped.
    #[builder(default)]
    pub mappable: bool,

    /// Size in bytes of the buffer to be created.
    pub size: vk::DeviceSize,

    /// A bitmask specifying allowed usages of the buffer.
    #[builder(default)]
    pub usage: vk::BufferUsageFlags,
}

impl BufferInfo {
    /// Specifies a non-mappable buffer with the given `size` and `usage`
    /// values.
    ///
    /// Device-local memory (located on the GPU) is used.
    #[inline(always)]
    pub const fn device_mem(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> BufferInfo {
        BufferInfo {
            alignment: 1,
            mappable: false,
            size,
            usage,
        }
    }

    /// Specifies a mappable buffer with the given `size` and `usage` values.
    ///
    /// Host-local memory (located in CPU-accessible RAM) is used.
    #[inline(always)]
    pub const fn host_mem(size: vk::DeviceSize, usage: vk::BufferUsageFlags) -> BufferInfo {
        BufferInfo {
            alignment: 1,
            mappable: true,
            size,
            usage,
        }
    }

    /// Converts a `BufferInfo` into a `BufferInfoBuilder`.
    #[inline(always)]
    pub fn to_builder(self) -> BufferInfoBuilder {
        BufferInfoBuilder {
            alignment: Some(self.alignment),
            mappable: Some(self.mappable),
            size: Some(self.size),
            usage: Some(self.usage),
        }
    }
}

impl BufferInfoBuilder {
    /// Builds a new `BufferInfo`.
    ///
    /// # Panics
    ///
    /// If `size` has not been set, or `alignment` is not a power of two,
    /// this function will panic.
    #[inline(always)]
    pub fn build(self) -> BufferInfo {
        let res = match self.fallible_build() {
            Err(BufferInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        };

        assert_eq!(
            res.alignment.count_ones(),
            1,
            "alignment must be a power of two"
        );

        res
    }
}

impl From<BufferInfoBuilder> for BufferInfo {
    fn from(info: BufferInfoBuilder) -> Self {
        info.build()
    }
}

#[derive(Debug)]
struct BufferInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for BufferInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Info = BufferInfo;
    type Builder = BufferInfoBuilder;

    #[test]
    pub fn buffer_info() {
        let info = Info::device_mem(42, vk::BufferUsageFlags::empty());
        let builder = info.to_builder().build();

        assert_eq!(info, builder);
    }

    #[test]
    pub fn buffer_info_alignment() {
        let info = Info::device_mem(0, vk::BufferUsageFlags::empty());

        assert_eq!(info.alignment, 1);
    }

    #[test]
    pub fn buffer_info_builder() {
        let info = Info::device_mem(0, vk::BufferUsageFlags::empty());
        let builder = Builder::default().size(0).build();

        assert_eq!(info, builder);
    }

    #[test]
    #[should_panic(expected = "alignment must be a power of two")]
    pub fn buffer_info_builder_alignment_0() {
        Builder::default().size(0).alignment(0).build();
    }

    #[test]
    #[should_panic(expected = "alignment must be a power of two")]
    pub fn buffer_info_builder_alignment_42() {
        Builder::default().size(0).alignment(42).build();
    }

    #[test]
    #[should_panic(expected = "Field not initialized: size")]
    pub fn buffer_info_builder_uninit_size() {
        Builder::default().build();
    }
}
