use {
    super::{DriverError, PhysicalDevice, QueueFamily, QueueFamilyProperties},
    ash::{Entry, ext, vk},
    log::{debug, error, trace, warn},
    std::{
        ffi::{CStr, CString, c_void},
        fmt::{Debug, Formatter},
        ops::Deref,
        os::raw::c_char,
        thread::panicking,
    },
};

unsafe extern "system" fn vulkan_debug_callback(
    _message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    error!("🆘 {message}");

    vk::FALSE
}

/// An instance of the graphics driver.
///
/// Loading the instance resolves the Vulkan loader library by its platform
/// name, retrieves `vkGetInstanceProcAddr` by symbol, and fills the
/// library-scope and instance-scope function-pointer tables. The device-scope
/// table is filled later by [`Device`][super::Device].
pub struct Instance {
    _debug_callback: Option<vk::DebugUtilsMessengerEXT>,
    _debug_utils: Option<ext::debug_utils::Instance>,
    entry: Entry,
    instance: ash::Instance,
}

impl Instance {
    /// Loads the driver and creates a new Vulkan instance.
    ///
    /// Setting `debug` to `true` requires a Vulkan SDK installation; it
    /// enables the Khronos validation layer and routes messages through the
    /// debug-utils messenger.
    #[profiling::function]
    pub fn create(debug: bool) -> Result<Self, DriverError> {
        let entry = unsafe {
            // Resolves vulkan-1.dll on Windows and libvulkan.so.1 elsewhere
            Entry::load().map_err(|err| {
                error!("Vulkan driver not found: {err}");

                DriverError::Unsupported
            })?
        };

        let layer_names = Self::layer_names(debug);
        let layer_names = layer_names
            .iter()
            .map(|layer_name| layer_name.as_ptr())
            .collect::<Box<[_]>>();
        let extension_names = Self::extension_names(debug);
        let app_info = vk::ApplicationInfo::default().api_version(vk::API_VERSION_1_2);
        let instance_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&extension_names);
        let instance = unsafe {
            entry.create_instance(&instance_info, None).map_err(|err| {
                if debug {
                    warn!("debug may only be enabled with a valid Vulkan SDK installation");
                }

                error!("Vulkan driver does not support API v1.2: {err}");

                DriverError::Unsupported
            })?
        };

        trace!("created a Vulkan instance");

        let (debug_utils, debug_callback) = if debug {
            let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            let debug_utils = ext::debug_utils::Instance::new(&entry, &instance);
            let debug_callback = unsafe {
                debug_utils
                    .create_debug_utils_messenger(&debug_info, None)
                    .map_err(|err| {
                        warn!("unable to create debug callback: {err}");

                        DriverError::Unsupported
                    })?
            };

            (Some(debug_utils), Some(debug_callback))
        } else {
            (None, None)
        };

        Ok(Self {
            _debug_callback: debug_callback,
            _debug_utils: debug_utils,
            entry,
            instance,
        })
    }

    fn extension_names(debug: bool) -> Vec<*const c_char> {
        let mut res = vec![];

        if debug {
            res.push(ext::debug_utils::NAME.as_ptr());
        }

        res
    }

    fn layer_names(debug: bool) -> Vec<CString> {
        let mut res = vec![];

        if debug {
            if let Ok(name) = CString::new("VK_LAYER_KHRONOS_validation") {
                res.push(name);
            }
        }

        res
    }

    /// Returns the library-scope entry point table.
    pub fn entry(this: &Self) -> &Entry {
        &this.entry
    }

    /// Enumerates the installed physical devices which support Vulkan 1.2.
    #[profiling::function]
    pub fn physical_devices(
        this: &Self,
    ) -> Result<impl Iterator<Item = PhysicalDevice> + '_, DriverError> {
        unsafe {
            Ok(this
                .enumerate_physical_devices()
                .map_err(|err| {
                    warn!("unable to enumerate physical devices: {err}");

                    DriverError::Unsupported
                })?
                .into_iter()
                .map(|physical_device| {
                    let props = this.get_physical_device_properties(physical_device);
                    let queue_families = this
                        .get_physical_device_queue_family_properties(physical_device)
                        .into_iter()
                        .enumerate()
                        .map(|(idx, props)| QueueFamily {
                            idx: idx as _,
                            props: QueueFamilyProperties {
                                queue_flags: props.queue_flags,
                                queue_count: props.queue_count,
                                timestamp_valid_bits: props.timestamp_valid_bits,
                            },
                        })
                        .collect();
                    let mem_props = this.get_physical_device_memory_properties(physical_device);

                    PhysicalDevice::new(physical_device, mem_props, props, queue_families)
                })
                .filter(|physical_device: &PhysicalDevice| {
                    let major = vk::api_version_major(physical_device.props.api_version);
                    let minor = vk::api_version_minor(physical_device.props.api_version);
                    let supported = major > 1 || (major == 1 && minor >= 2);

                    if !supported {
                        debug!("{physical_device:?} does not support Vulkan 1.2");
                    }

                    supported
                }))
        }
    }
}

impl Debug for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Instance")
    }
}

impl Deref for Instance {
    type Target = ash::Instance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            if let Some(debug_utils) = &self._debug_utils {
                if let Some(debug_callback) = self._debug_callback {
                    debug_utils.destroy_debug_utils_messenger(debug_callback, None);
                }
            }

            self.instance.destroy_instance(None);
        }
    }
}
