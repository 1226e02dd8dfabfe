use {
    ash::vk,
    std::{
        ffi::CStr,
        fmt::{Debug, Formatter},
        ops::Deref,
        os::raw::c_char,
    },
};

/// Structure which describes a physical hardware device.
pub struct PhysicalDevice {
    /// Memory heaps and types reported by the driver.
    pub mem_props: vk::PhysicalDeviceMemoryProperties,

    physical_device: vk::PhysicalDevice,

    /// Device properties, including limits.
    pub props: vk::PhysicalDeviceProperties,

    /// Queue families reported by the driver.
    pub queue_families: Vec<QueueFamily>,
}

impl PhysicalDevice {
    pub(super) fn new(
        physical_device: vk::PhysicalDevice,
        mem_props: vk::PhysicalDeviceMemoryProperties,
        props: vk::PhysicalDeviceProperties,
        queue_families: Vec<QueueFamily>,
    ) -> Self {
        Self {
            mem_props,
            physical_device,
            props,
            queue_families,
        }
    }

    /// Returns the index of the first memory type whose bit is set in
    /// `memory_type_bits` and whose property flags contain `flags`.
    pub fn memory_type_index(
        this: &Self,
        memory_type_bits: u32,
        flags: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        this.mem_props.memory_types[..this.mem_props.memory_type_count as usize]
            .iter()
            .enumerate()
            .find(|(idx, memory_type)| {
                memory_type_bits & (1 << idx) != 0 && memory_type.property_flags.contains(flags)
            })
            .map(|(idx, _)| idx as u32)
    }

    /// Used to rank devices; discrete GPUs score the highest.
    pub fn score_device_type(this: &Self) -> usize {
        match this.props.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 4,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
            vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
            vk::PhysicalDeviceType::CPU => 1,
            _ => 0,
        }
    }
}

impl Debug for PhysicalDevice {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = unsafe { CStr::from_ptr(self.props.device_name.as_ptr() as *const c_char) };

        write!(f, "{name:?} ({:?})", self.props.device_type)
    }
}

impl Deref for PhysicalDevice {
    type Target = vk::PhysicalDevice;

    fn deref(&self) -> &Self::Target {
        &self.physical_device
    }
}

/// Properties of a queue family and its index.
#[derive(Clone, Copy, Debug)]
pub struct QueueFamily {
    /// The index of this family within the device's list of queue families.
    pub idx: u32,

    /// Properties of this queue family.
    pub props: QueueFamilyProperties,
}

/// Properties of a single queue family.
#[derive(Clone, Copy, Debug)]
pub struct QueueFamilyProperties {
    /// Capabilities of the queues in this family.
    pub queue_flags: vk::QueueFlags,

    /// Number of queues in this family.
    pub queue_count: u32,

    /// Count of meaningful bits in the timestamps written by
    /// `vkCmdWriteTimestamp`; zero indicates no timestamp support.
    pub timestamp_valid_bits: u32,
}
