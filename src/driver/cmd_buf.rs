use {
    super::{DriverError, device::Device},
    ash::vk,
    log::{trace, warn},
    std::{ops::Deref, slice::from_ref, sync::Arc, thread::panicking},
    vk_sync::{AccessType, BufferBarrier, GlobalBarrier, cmd},
};

/// A command pool, one primary command buffer allocated from it, and the
/// fence which signals its completion.
#[derive(Debug)]
pub struct CommandBuffer {
    cmd_buf: vk::CommandBuffer,
    device: Arc<Device>,

    /// Signalled when the most recent submission of this command buffer has
    /// completed execution.
    pub fence: vk::Fence,

    pool: vk::CommandPool,
}

impl CommandBuffer {
    /// Creates a command buffer on the given device.
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        info: impl Into<CommandBufferInfo>,
    ) -> Result<Self, DriverError> {
        let info: CommandBufferInfo = info.into();
        let device = Arc::clone(device);
        let cmd_pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(info.queue_family_index);
        let cmd_pool = unsafe {
            device
                .create_command_pool(&cmd_pool_info, None)
                .map_err(|err| {
                    warn!("unable to create command pool: {err}");

                    DriverError::Unsupported
                })?
        };
        let cmd_buf_info = vk::CommandBufferAllocateInfo::default()
            .command_buffer_count(1)
            .command_pool(cmd_pool)
            .level(vk::CommandBufferLevel::PRIMARY);
        let cmd_buf = match unsafe { device.allocate_command_buffers(&cmd_buf_info) } {
            Ok(cmd_bufs) => cmd_bufs[0],
            Err(err) => {
                warn!("unable to allocate command buffer: {err}");

                unsafe {
                    device.destroy_command_pool(cmd_pool, None);
                }

                return Err(DriverError::Unsupported);
            }
        };
        let fence = match unsafe {
            device.create_fence(
                &vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED),
                None,
            )
        } {
            Ok(fence) => fence,
            Err(err) => {
                warn!("unable to create fence: {err}");

                unsafe {
                    device.destroy_command_pool(cmd_pool, None);
                }

                return Err(DriverError::Unsupported);
            }
        };

        Ok(Self {
            cmd_buf,
            device,
            fence,
            pool: cmd_pool,
        })
    }

    /// Begins recording; waits for and resets the fence of any prior
    /// submission first.
    #[profiling::function]
    pub fn begin(this: &Self) -> Result<(), DriverError> {
        unsafe {
            Device::wait_for_fence(&this.device, this.fence)?;

            this.device
                .reset_fences(from_ref(&this.fence))
                .map_err(|_| DriverError::Unsupported)?;
            this.device
                .begin_command_buffer(
                    this.cmd_buf,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(|err| {
                    warn!("unable to begin command buffer: {err}");

                    DriverError::Unsupported
                })
        }
    }

    /// Records a buffer memory barrier.
    pub fn buffer_barrier(
        this: &Self,
        previous_access: AccessType,
        next_access: AccessType,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) {
        trace!("buffer_barrier {buffer:?} {offset}..{}", offset + size);

        cmd::pipeline_barrier(
            &this.device,
            this.cmd_buf,
            None,
            &[BufferBarrier {
                previous_accesses: from_ref(&previous_access),
                next_accesses: from_ref(&next_access),
                src_queue_family_index: this.device.queue_family_index,
                dst_queue_family_index: this.device.queue_family_index,
                buffer,
                offset: offset as _,
                size: size as _,
            }],
            &[],
        );
    }

    /// Ends recording and submits, signalling the fence on completion.
    #[profiling::function]
    pub fn end_and_submit(this: &Self) -> Result<(), DriverError> {
        unsafe {
            this.device
                .end_command_buffer(this.cmd_buf)
                .map_err(|err| {
                    warn!("unable to end command buffer: {err}");

                    DriverError::Unsupported
                })?;
        }

        Device::submit(&this.device, this.cmd_buf, this.fence)
    }

    /// Records a global (all-resources) memory barrier.
    pub fn global_barrier(this: &Self, previous_access: AccessType, next_access: AccessType) {
        trace!("global_barrier {previous_access:?} -> {next_access:?}");

        cmd::pipeline_barrier(
            &this.device,
            this.cmd_buf,
            Some(GlobalBarrier {
                previous_accesses: from_ref(&previous_access),
                next_accesses: from_ref(&next_access),
            }),
            &[],
            &[],
        );
    }
}

impl Deref for CommandBuffer {
    type Target = vk::CommandBuffer;

    fn deref(&self) -> &Self::Target {
        &self.cmd_buf
    }
}

impl Drop for CommandBuffer {
    #[profiling::function]
    fn drop(&mut self) {
        if panicking() {
            return;
        }

        unsafe {
            Device::wait_for_fence(&self.device, self.fence).unwrap_or_default();

            self.device
                .free_command_buffers(self.pool, from_ref(&self.cmd_buf));
            self.device.destroy_command_pool(self.pool, None);
            self.device.destroy_fence(self.fence, None);
        }
    }
}

/// Information used to create a [`CommandBuffer`] instance.
#[derive(Clone, Copy, Debug)]
pub struct CommandBufferInfo {
    /// The queue family the command pool is created against.
    pub queue_family_index: u32,
}

impl CommandBufferInfo {
    /// Specifies a command buffer for the given queue family.
    pub const fn new(queue_family_index: u32) -> Self {
        Self { queue_family_index }
    }
}

impl From<u32> for CommandBufferInfo {
    fn from(queue_family_index: u32) -> Self {
        Self::new(queue_family_index)
    }
}
