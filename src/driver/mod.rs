//! [Vulkan 1.2](https://registry.khronos.org/vulkan/specs/1.2-extensions/html/index.html)
//! interface based on smart pointers.
//!
//! The driver is never linked statically: [`Instance`] discovers the loader
//! library by name (`vulkan-1.dll` on Windows, `libvulkan.so.1` elsewhere),
//! resolves a single entry symbol and fills three function-pointer tables
//! scoped to the library, the instance and the device. Every subsequent call
//! goes through the appropriate table, so different devices may live behind
//! different drivers.
//!
//! # Resources
//!
//! Each resource contains an opaque Vulkan object handle and an information
//! structure which describes the object:
//!
//! - [`Buffer`]
//! - [`CommandBuffer`]
//!
//! # Pipelines
//!
//! Pipelines are immutable once created and consume precompiled SPIR-V as
//! opaque byte blobs; descriptor-set layouts and push-constant ranges are
//! supplied by the caller.
//!
//! - [`ComputePipeline`]
//! - [`GraphicPipeline`]

pub mod buffer;
pub mod cmd_buf;
pub mod compute_pipeline;
pub mod descriptor_set;
pub mod device;
pub mod graphic_pipeline;
pub mod instance;
pub mod physical_device;
pub mod shader;

pub use {
    self::{
        buffer::{Buffer, BufferInfo, BufferInfoBuilder},
        cmd_buf::{CommandBuffer, CommandBufferInfo},
        compute_pipeline::{ComputePipeline, ComputePipelineInfo, ComputePipelineInfoBuilder},
        descriptor_set::{
            DescriptorPool, DescriptorPoolInfo, DescriptorPoolInfoBuilder, DescriptorSetLayout,
        },
        device::{Device, DeviceInfo, DeviceInfoBuilder},
        graphic_pipeline::{GraphicPipeline, GraphicPipelineInfo, GraphicPipelineInfoBuilder},
        instance::Instance,
        physical_device::{PhysicalDevice, QueueFamily, QueueFamilyProperties},
        shader::Shader,
    },
    ash::{self},
    vk_sync::AccessType,
};

use {
    ash::vk,
    std::{
        error::Error,
        fmt::{Display, Formatter},
    },
};

/// Describes the general category of all graphics driver failure cases.
///
/// In the event of a failure you should follow the `cadre` code to the
/// responsible Vulkan API and then to the `ash` stub call; it will generally
/// contain a link to the appropriate specification.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DriverError {
    /// The input data, or referenced data, is not valid for the current state.
    InvalidData,

    /// The device has run out of physical memory, or every memory pool
    /// refused the allocation.
    ///
    /// Many drivers return this value for generic or unhandled error
    /// conditions.
    OutOfMemory,

    /// A fence wait exceeded its deadline.
    ///
    /// This is treated as an unrecoverable GPU hang.
    Timeout,

    /// The requested feature, or input configuration, is not supported for
    /// the current state.
    Unsupported,
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Error for DriverError {}

/// Rounds `offset` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
pub(crate) const fn align_up(offset: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    debug_assert!(alignment.count_ones() == 1);

    (offset + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn align_up_powers_of_two() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(255, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }
}
