//! The frame driver: orchestration, transfer records and timing.
//!
//! A [`Renderer`] owns the storages (data, image, geometry), the staging
//! manager, the handle table and the shared indirect-draw buffer, and walks
//! them through the frame sequence:
//!
//! 1. User code allocates and writes (staged) data, geometry and images.
//! 2. [`record_frame_build`][Renderer::record_frame_build] records every
//!    staged copy into the transfer section of the frame's command buffer,
//!    dispatches the indirect-build compute pass and returns a
//!    [`TransferRecord`] plus the frame's [`DrawPlan`].
//! 3. [`record_draws`][Renderer::record_draws] replays the plan inside the
//!    caller's render pass.
//! 4. After the frame's fence signals, the transfer record is handed back
//!    through [`upload_done`][Renderer::upload_done] (FIFO order) and the
//!    staging memory recycles.
//!
//! The renderer is single-threaded-cooperative: every entry point asserts
//! the render-thread contract in debug builds.

use {
    crate::{
        data::{DataAllocation, DataMemory, DataStorage, UploadCtx},
        driver::{
            Buffer, BufferInfo, CommandBuffer, ComputePipeline, ComputePipelineInfo,
            DescriptorSetLayout, DriverError, device::Device,
        },
        geometry::{AttribSizeList, Geometry, GeometryMemory, GeometryStorage},
        graph::{DrawPlan, StateSetGraph, StateSetId},
        handle_table::HandleTable,
        image::{ImageAllocation, ImageCreateDesc, ImageMemory, ImageStagingBuffer, ImageStorage},
        staging::{StagingData, StagingManager, StagingMemory, TransferRecord},
    },
    ash::vk,
    derive_builder::{Builder, UninitializedFieldError},
    log::{trace, warn},
    std::{collections::HashMap, slice::from_ref, sync::Arc, thread::ThreadId},
    vk_sync::{AccessType, GlobalBarrier, cmd},
};

/// Bytes of one `VkDrawIndexedIndirectCommand`.
const INDIRECT_COMMAND_SIZE: vk::DeviceSize =
    std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as vk::DeviceSize;

/// Workgroup size of the indirect-build compute pipeline.
const DRAWABLE_COMPILER_GROUP_SIZE: u32 = 64;

/// Per-frame statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameInfo {
    /// Buffer bytes recorded for transfer this frame.
    pub bytes_transferred: vk::DeviceSize,

    /// The frame number the statistics belong to.
    pub frame_number: u64,

    /// GPU time of the most recently completed timed frame, in nanoseconds,
    /// once the timestamps have resolved.
    pub gpu_time_ns: Option<u64>,
}

/// Information used to create a [`Renderer`] instance.
#[derive(Builder, Clone, Debug)]
#[builder(
    build_fn(private, name = "fallible_build", error = "RendererInfoBuilderError"),
    derive(Clone, Debug),
    pattern = "owned"
)]
#[non_exhaustive]
pub struct RendererInfo {
    /// Memory-tier byte sizes: small, medium, large.
    ///
    /// These size both the data-memory growth cascade and the staging
    /// memory tiers.
    #[builder(default = "[64 << 10, 2 << 20, 32 << 20]")]
    pub buffer_size_list: [vk::DeviceSize; 3],

    /// Upper bound on the bindless texture descriptor array size.
    #[builder(default = "250_000")]
    pub max_textures: u32,

    /// Flag bit-sets controlling attribute/material/light/texture
    /// uberization in externally generated pipelines.
    #[builder(default)]
    pub optimization_levels: Vec<u64>,
}

impl RendererInfo {
    /// Specifies a default renderer configuration.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> RendererInfoBuilder {
        Default::default()
    }
}

impl Default for RendererInfo {
    fn default() -> Self {
        RendererInfoBuilder::default().build()
    }
}

impl From<RendererInfoBuilder> for RendererInfo {
    fn from(info: RendererInfoBuilder) -> Self {
        info.build()
    }
}

impl RendererInfoBuilder {
    /// Builds a new `RendererInfo`.
    pub fn build(self) -> RendererInfo {
        match self.fallible_build() {
            Err(RendererInfoBuilderError(err)) => panic!("{err}"),
            Ok(info) => info,
        }
    }
}

#[derive(Debug)]
struct RendererInfoBuilderError(UninitializedFieldError);

impl From<UninitializedFieldError> for RendererInfoBuilderError {
    fn from(err: UninitializedFieldError) -> Self {
        Self(err)
    }
}

/// The CAD rendering runtime: storages, staging, handle table, draw-state
/// compilation and the frame loop.
pub struct Renderer {
    data: DataStorage,
    device: Arc<Device>,
    draw_compiler: Option<ComputePipeline>,
    frame_number: u64,
    geometries: HashMap<AttribSizeList, GeometryStorage>,
    handle_table: HandleTable,
    images: ImageStorage,
    indirect_buffer: Option<Buffer>,
    info: RendererInfo,
    render_thread: ThreadId,
    retired_buffers: Vec<Buffer>,
    staging: StagingManager,
    timestamp_pool: Option<vk::QueryPool>,
    timestamps_written: bool,
}

impl Renderer {
    /// Creates a renderer on the given device.
    pub fn new(device: &Arc<Device>, info: impl Into<RendererInfo>) -> Self {
        let info: RendererInfo = info.into();

        trace!("new: {info:?}");

        Self {
            data: DataStorage::new(),
            device: Arc::clone(device),
            draw_compiler: None,
            frame_number: 0,
            geometries: HashMap::new(),
            handle_table: HandleTable::new(),
            images: ImageStorage::new(),
            indirect_buffer: None,
            info,
            render_thread: std::thread::current().id(),
            retired_buffers: vec![],
            staging: StagingManager::new(),
            timestamp_pool: None,
            timestamps_written: false,
        }
    }

    fn assert_render_thread(&self) {
        debug_assert_eq!(
            std::thread::current().id(),
            self.render_thread,
            "renderer used outside the render thread"
        );
    }

    /// The device this renderer was created on.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The current frame number; advanced by [`end_frame`][Self::end_frame].
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// The renderer's configuration.
    pub fn info(&self) -> &RendererInfo {
        &self.info
    }

    /// Builds an [`UploadCtx`] over the renderer's storages for a batch of
    /// allocation and staging operations.
    pub fn upload_ctx(&mut self) -> UploadCtx<'_> {
        self.assert_render_thread();

        let Self {
            data,
            device,
            frame_number,
            info,
            staging,
            ..
        } = self;
        let device: &Arc<Device> = device;

        UploadCtx::new(
            data,
            staging,
            *frame_number,
            info.buffer_size_list,
            Box::new(move |size| DataMemory::try_create(device, size)),
            Box::new(move |size| StagingMemory::create(device, size)),
        )
    }

    /// Allocates device-local data with staging attached; see
    /// [`UploadCtx::alloc`].
    pub fn alloc_data(&mut self, num_bytes: vk::DeviceSize) -> Result<DataAllocation, DriverError> {
        self.upload_ctx().alloc(num_bytes)
    }

    /// Frees a data allocation.
    pub fn free_data(&mut self, allocation: DataAllocation) {
        self.upload_ctx().free(allocation);
    }

    /// Reallocates a data allocation; the old range is untouched on failure.
    pub fn realloc_data(
        &mut self,
        allocation: &mut DataAllocation,
        num_bytes: vk::DeviceSize,
    ) -> Result<(), DriverError> {
        self.upload_ctx().realloc(allocation, num_bytes)
    }

    /// Returns writable staging bytes bound for a data allocation.
    pub fn create_staging_data(
        &mut self,
        allocation: &DataAllocation,
    ) -> Result<StagingData, DriverError> {
        self.upload_ctx().create_staging_data(allocation)
    }

    /// Releases one staging reference; at zero the bytes join the next
    /// recorded upload.
    pub fn submit_staging(&mut self, staging_data: StagingData) {
        self.assert_render_thread();
        self.staging.submit(staging_data);
    }

    /// Convenience: stage, copy and submit `bytes` into a data allocation.
    pub fn upload_data(
        &mut self,
        allocation: &DataAllocation,
        bytes: &[u8],
    ) -> Result<(), DriverError> {
        self.upload_ctx().upload(allocation, bytes)
    }

    /// Mints a new 64-bit handle.
    pub fn create_handle(&mut self) -> Result<u64, DriverError> {
        self.assert_render_thread();

        let Self {
            data,
            device,
            frame_number,
            handle_table,
            info,
            staging,
            ..
        } = self;
        let device: &Arc<Device> = device;
        let mut ctx = UploadCtx::new(
            data,
            staging,
            *frame_number,
            info.buffer_size_list,
            Box::new(move |size| DataMemory::try_create(device, size)),
            Box::new(move |size| StagingMemory::create(device, size)),
        );

        handle_table.create(&mut ctx)
    }

    /// Points a handle at a device address; the GPU mirror updates with the
    /// next upload.
    pub fn set_handle(
        &mut self,
        handle: u64,
        device_address: vk::DeviceAddress,
    ) -> Result<(), DriverError> {
        self.assert_render_thread();

        let Self {
            data,
            device,
            frame_number,
            handle_table,
            info,
            staging,
            ..
        } = self;
        let device: &Arc<Device> = device;
        let mut ctx = UploadCtx::new(
            data,
            staging,
            *frame_number,
            info.buffer_size_list,
            Box::new(move |size| DataMemory::try_create(device, size)),
            Box::new(move |size| StagingMemory::create(device, size)),
        );

        handle_table.set(&mut ctx, handle, device_address)
    }

    /// Releases a handle; handles are not recycled.
    pub fn destroy_handle(&mut self, handle: u64) {
        self.handle_table.destroy(handle);
    }

    /// Resolves a handle against the CPU-side table.
    pub fn lookup_handle(&self, handle: u64) -> vk::DeviceAddress {
        self.handle_table.lookup(handle)
    }

    /// Device address of the handle table's root, for shader consumption.
    pub fn handle_root_address(&self) -> vk::DeviceAddress {
        self.handle_table.root_device_address()
    }

    /// The geometry storage for an attribute layout, created on first use.
    pub fn geometry_storage(&mut self, attribs: &AttribSizeList) -> &mut GeometryStorage {
        self.geometries
            .entry(attribs.clone())
            .or_insert_with(|| GeometryStorage::new(attribs.clone()))
    }

    /// Allocates geometry space for the given counts.
    pub fn alloc_geometry(
        &mut self,
        geometry: &mut Geometry,
        attribs: &AttribSizeList,
        num_vertices: u32,
        num_indices: u32,
        num_primitive_sets: u32,
    ) -> Result<(), DriverError> {
        self.assert_render_thread();

        let device = Arc::clone(&self.device);
        let storage = self.geometry_storage(attribs);

        geometry.alloc(
            storage,
            num_vertices,
            num_indices,
            num_primitive_sets,
            &mut |attribs, nv, ni, nps, id| {
                GeometryMemory::create(&device, attribs, nv, ni, nps, id)
            },
        )
    }

    /// Resizes geometry space, re-homing and rewriting drawables on growth.
    pub fn realloc_geometry(
        &mut self,
        geometry: &mut Geometry,
        attribs: &AttribSizeList,
        graph: &mut StateSetGraph,
        num_vertices: u32,
        num_indices: u32,
        num_primitive_sets: u32,
    ) -> Result<(), DriverError> {
        self.assert_render_thread();

        let device = Arc::clone(&self.device);
        let storage = self.geometry_storage(attribs);

        geometry.realloc(
            storage,
            graph,
            num_vertices,
            num_indices,
            num_primitive_sets,
            &mut |attribs, nv, ni, nps, id| {
                GeometryMemory::create(&device, attribs, nv, ni, nps, id)
            },
        )
    }

    /// Frees geometry space.
    pub fn free_geometry(&mut self, geometry: &mut Geometry, attribs: &AttribSizeList) {
        let storage = self.geometry_storage(attribs);

        geometry.free(storage);
    }

    /// Stages one vertex attribute of a geometry for upload.
    pub fn stage_vertices(
        &mut self,
        geometry: &Geometry,
        attribs: &AttribSizeList,
        attrib_index: usize,
    ) -> Result<StagingData, DriverError> {
        self.assert_render_thread();

        let Self {
            data,
            device,
            frame_number,
            geometries,
            info,
            staging,
            ..
        } = self;
        let device: &Arc<Device> = device;
        let storage = geometries.get(attribs).ok_or(DriverError::InvalidData)?;
        let mut ctx = UploadCtx::new(
            data,
            staging,
            *frame_number,
            info.buffer_size_list,
            Box::new(move |size| DataMemory::try_create(device, size)),
            Box::new(move |size| StagingMemory::create(device, size)),
        );

        geometry.create_vertex_staging(storage, attrib_index, &mut ctx)
    }

    /// Stages a geometry's index range for upload.
    pub fn stage_indices(
        &mut self,
        geometry: &Geometry,
        attribs: &AttribSizeList,
    ) -> Result<StagingData, DriverError> {
        self.assert_render_thread();

        let Self {
            data,
            device,
            frame_number,
            geometries,
            info,
            staging,
            ..
        } = self;
        let device: &Arc<Device> = device;
        let storage = geometries.get(attribs).ok_or(DriverError::InvalidData)?;
        let mut ctx = UploadCtx::new(
            data,
            staging,
            *frame_number,
            info.buffer_size_list,
            Box::new(move |size| DataMemory::try_create(device, size)),
            Box::new(move |size| StagingMemory::create(device, size)),
        );

        geometry.create_index_staging(storage, &mut ctx)
    }

    /// Uploads a geometry's primitive sets, fixing up vertex offsets.
    pub fn upload_primitive_sets(
        &mut self,
        geometry: &Geometry,
        attribs: &AttribSizeList,
        sets: &[crate::primitive_set::PrimitiveSetGpuData],
    ) -> Result<(), DriverError> {
        self.assert_render_thread();

        let Self {
            data,
            device,
            frame_number,
            geometries,
            info,
            staging,
            ..
        } = self;
        let device: &Arc<Device> = device;
        let storage = geometries.get(attribs).ok_or(DriverError::InvalidData)?;
        let mut ctx = UploadCtx::new(
            data,
            staging,
            *frame_number,
            info.buffer_size_list,
            Box::new(move |size| DataMemory::try_create(device, size)),
            Box::new(move |size| StagingMemory::create(device, size)),
        );

        geometry.upload_primitive_sets(storage, &mut ctx, sets)
    }

    /// Creates an image from a create-info snapshot and allocates
    /// device-local memory for it.
    pub fn create_image(&mut self, desc: ImageCreateDesc) -> Result<ImageAllocation, DriverError> {
        self.assert_render_thread();

        let image = unsafe {
            self.device.create_image(&desc.to_vk(), None).map_err(|err| {
                warn!("unable to create image: {err}");

                DriverError::Unsupported
            })?
        };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let device = &self.device;
        let result = self.images.alloc(
            requirements.size,
            requirements.alignment,
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            image,
            desc,
            &device.physical_device.mem_props,
            self.info.buffer_size_list,
            &mut |size, memory_type_index| ImageMemory::try_create(device, size, memory_type_index),
            &mut |image, memory, offset| unsafe {
                device.bind_image_memory(image, memory, offset).map_err(|err| {
                    warn!("unable to bind image memory: {err}");

                    DriverError::OutOfMemory
                })
            },
        );

        if result.is_err() {
            unsafe {
                self.device.destroy_image(image, None);
            }
        }

        result
    }

    /// Frees an image allocation; the image is destroyed once no copy into
    /// it remains in flight.
    pub fn free_image(&mut self, allocation: ImageAllocation) {
        self.assert_render_thread();

        let device = &self.device;
        self.images.free(allocation, &mut |image| unsafe {
            device.destroy_image(image, None);
        });
    }

    /// The image backed by an allocation.
    pub fn image(&self, allocation: &ImageAllocation) -> vk::Image {
        self.images.image(allocation)
    }

    /// Reserves staging scratch for an image upload.
    pub fn create_image_staging(
        &mut self,
        num_bytes: vk::DeviceSize,
    ) -> Result<ImageStagingBuffer, DriverError> {
        self.assert_render_thread();

        let Self {
            device, staging, info, ..
        } = self;
        let device: &Arc<Device> = device;
        let (memory, buffer, offset, ptr) = staging.raw_alloc(
            info.buffer_size_list,
            num_bytes,
            &mut |size| StagingMemory::create(device, size),
        )?;

        Ok(ImageStagingBuffer::new(buffer, memory, offset, ptr, num_bytes))
    }

    /// Queues a buffer-to-image copy of staged bytes with the given layout
    /// transition triple.
    ///
    /// Region buffer offsets are relative to the staging buffer's bytes; the
    /// staging placement offset is applied here.
    #[allow(clippy::too_many_arguments)]
    pub fn submit_image_upload(
        &mut self,
        allocation: &ImageAllocation,
        staging: ImageStagingBuffer,
        old_layout: vk::ImageLayout,
        copy_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        new_layout_dst_stages: vk::PipelineStageFlags,
        new_layout_dst_access: vk::AccessFlags,
        mut regions: Vec<vk::BufferImageCopy>,
    ) -> Result<(), DriverError> {
        self.assert_render_thread();

        for region in &mut regions {
            region.buffer_offset += staging.offset();
        }

        self.images.submit_upload(
            allocation,
            staging.vk_buffer(),
            staging.memory_id(),
            old_layout,
            copy_layout,
            new_layout,
            new_layout_dst_stages,
            new_layout_dst_access,
            regions,
            staging.size(),
        )
    }

    /// Installs the compute pipeline which compiles drawables into
    /// indirect-draw commands, from opaque SPIR-V.
    pub fn set_drawable_compiler(&mut self, spirv: &[u8]) -> Result<(), DriverError> {
        let info = ComputePipelineInfo::new(spirv)
            .push_constants(vec![vk::PushConstantRange {
                stage_flags: vk::ShaderStageFlags::COMPUTE,
                offset: 0,
                size: DrawableCompilerPushConstants::SIZE,
            }])
            .build();

        self.draw_compiler = Some(ComputePipeline::create(&self.device, info)?);

        Ok(())
    }

    /// The bindless texture descriptor-set layout sized by
    /// [`RendererInfo::max_textures`].
    pub fn create_texture_descriptor_layout(&self) -> Result<DescriptorSetLayout, DriverError> {
        DescriptorSetLayout::create_bindless_textures(&self.device, self.info.max_textures)
    }

    /// Records every staged copy (buffers, geometry re-homing, images) into
    /// the command buffer and returns the frame's transfer record.
    #[profiling::function]
    pub fn record_upload(&mut self, cmd_buf: &CommandBuffer) -> TransferRecord {
        self.assert_render_thread();

        // Device-to-device copies queued by geometry re-homing
        for storage in self.geometries.values_mut() {
            for (src, dst, regions) in storage.take_pending_copies() {
                unsafe {
                    self.device.cmd_copy_buffer(**cmd_buf, src, dst, &regions);
                }
            }
        }

        let mut record = self.staging.record_upload(&self.device, **cmd_buf);
        let (image_uploads, _image_bytes, image_staging) =
            self.images.record_uploads(&self.device, **cmd_buf);

        record.image_uploads = image_uploads;
        record.extra_memories = image_staging;

        // Make every transferred byte visible to the consumers: shaders,
        // index fetch and the indirect-build compute pass
        cmd::pipeline_barrier(
            &self.device,
            **cmd_buf,
            Some(GlobalBarrier {
                previous_accesses: from_ref(&AccessType::TransferWrite),
                next_accesses: &[
                    AccessType::AnyShaderReadOther,
                    AccessType::IndexBuffer,
                    AccessType::ComputeShaderReadOther,
                ],
            }),
            &[],
            &[],
        );

        record
    }

    /// Returns a transfer record once its fence has signalled, recycling
    /// staging memory and draining image copy records.
    ///
    /// Records must come back in the order they were produced.
    #[profiling::function]
    pub fn upload_done(&mut self, record: TransferRecord) {
        self.assert_render_thread();

        self.staging
            .upload_done(self.info.buffer_size_list, &record, &mut self.data);

        let device = &self.device;
        self.images
            .uploads_done(&record.image_uploads, &mut |image| unsafe {
                device.destroy_image(image, None);
            });

        // Buffers retired by indirect-buffer growth are safe to drop now
        self.retired_buffers.clear();
    }

    /// Rotates per-frame staging statistics and advances the frame number.
    pub fn end_frame(&mut self) {
        self.assert_render_thread();

        self.staging.end_frame();
        self.frame_number += 1;
    }

    fn ensure_indirect_capacity(&mut self, total_drawables: u32) -> Result<(), DriverError> {
        let needed = total_drawables as vk::DeviceSize * INDIRECT_COMMAND_SIZE;
        let current = self
            .indirect_buffer
            .as_ref()
            .map(|buffer| buffer.info.size)
            .unwrap_or_default();

        if needed > current {
            let size = needed.next_power_of_two().max(64 * INDIRECT_COMMAND_SIZE);
            let buffer = Buffer::create(
                &self.device,
                BufferInfo::device_mem(
                    size,
                    vk::BufferUsageFlags::INDIRECT_BUFFER
                        | vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                ),
            )?;

            // The old buffer may still be referenced by in-flight frames;
            // park it until the next completed transfer
            if let Some(old) = self.indirect_buffer.replace(buffer) {
                self.retired_buffers.push(old);
            }
        }

        Ok(())
    }

    /// The transfer, indirect-build and barrier section of a frame.
    ///
    /// Walks the state-set tree, uploads drawable data, records every staged
    /// copy, then dispatches the drawable compiler once per visible drawable
    /// container. Record the returned plan's draws inside a render pass with
    /// [`record_draws`][Self::record_draws].
    #[profiling::function]
    pub fn record_frame_build(
        &mut self,
        cmd_buf: &CommandBuffer,
        graph: &mut StateSetGraph,
        root: StateSetId,
    ) -> Result<(TransferRecord, DrawPlan), DriverError> {
        self.assert_render_thread();

        let total_drawables = graph.prepare_recording(root);
        self.ensure_indirect_capacity(total_drawables)?;

        {
            let mut ctx = self.upload_ctx();
            graph.upload_drawable_data(&mut ctx, root)?;
        }

        let plan = graph.build_draw_plan(root);
        let record = self.record_upload(cmd_buf);

        if plan.total_drawables() > 0 {
            let compiler = self.draw_compiler.as_ref().ok_or_else(|| {
                warn!("no drawable compiler pipeline is set");

                DriverError::InvalidData
            })?;
            let indirect_buffer = self
                .indirect_buffer
                .as_ref()
                .ok_or(DriverError::InvalidData)?;
            let indirect_address = Buffer::device_address(indirect_buffer);
            let handle_root = self.handle_table.root_device_address();

            unsafe {
                self.device.cmd_bind_pipeline(
                    **cmd_buf,
                    vk::PipelineBindPoint::COMPUTE,
                    **compiler,
                );
            }

            for dispatch in &plan.dispatches {
                let push_constants = DrawableCompilerPushConstants {
                    drawable_count: dispatch.count,
                    drawable_data: dispatch.gpu_data_addr,
                    handle_root,
                    indirect: indirect_address
                        + dispatch.first_drawable as vk::DeviceSize * INDIRECT_COMMAND_SIZE,
                };

                unsafe {
                    self.device.cmd_push_constants(
                        **cmd_buf,
                        compiler.layout,
                        vk::ShaderStageFlags::COMPUTE,
                        0,
                        &push_constants.to_bytes(),
                    );
                    self.device.cmd_dispatch(
                        **cmd_buf,
                        dispatch.count.div_ceil(DRAWABLE_COMPILER_GROUP_SIZE),
                        1,
                        1,
                    );
                }
            }

            // The draws read what the compute pass wrote
            cmd::pipeline_barrier(
                &self.device,
                **cmd_buf,
                Some(GlobalBarrier {
                    previous_accesses: from_ref(&AccessType::ComputeShaderWrite),
                    next_accesses: from_ref(&AccessType::IndirectBuffer),
                }),
                &[],
                &[],
            );
        }

        Ok((record, plan))
    }

    /// Replays the frame's draw plan; must be recorded inside the caller's
    /// render pass.
    pub fn record_draws(
        &mut self,
        cmd_buf: &CommandBuffer,
        graph: &mut StateSetGraph,
        plan: &DrawPlan,
    ) {
        self.assert_render_thread();

        let indirect_buffer = self
            .indirect_buffer
            .as_ref()
            .map(|buffer| **buffer)
            .unwrap_or_default();

        graph.record(&self.device, **cmd_buf, plan, indirect_buffer);
    }

    /// Writes the frame-start timestamp; pair with
    /// [`write_end_timestamp`][Self::write_end_timestamp].
    pub fn write_start_timestamp(&mut self, cmd_buf: &CommandBuffer) -> Result<(), DriverError> {
        self.assert_render_thread();

        let pool = match self.timestamp_pool {
            Some(pool) => pool,
            None => {
                let pool = unsafe {
                    self.device
                        .create_query_pool(
                            &vk::QueryPoolCreateInfo::default()
                                .query_type(vk::QueryType::TIMESTAMP)
                                .query_count(2),
                            None,
                        )
                        .map_err(|err| {
                            warn!("unable to create query pool: {err}");

                            DriverError::Unsupported
                        })?
                };

                self.timestamp_pool = Some(pool);
                pool
            }
        };

        unsafe {
            self.device.cmd_reset_query_pool(**cmd_buf, pool, 0, 2);
            self.device.cmd_write_timestamp(
                **cmd_buf,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                pool,
                0,
            );
        }

        Ok(())
    }

    /// Writes the frame-end timestamp.
    pub fn write_end_timestamp(&mut self, cmd_buf: &CommandBuffer) {
        self.assert_render_thread();

        if let Some(pool) = self.timestamp_pool {
            unsafe {
                self.device.cmd_write_timestamp(
                    **cmd_buf,
                    vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                    pool,
                    1,
                );
            }

            self.timestamps_written = true;
        }
    }

    /// Per-frame statistics; GPU time resolves once the timed frame has
    /// completed.
    pub fn frame_info(&self) -> FrameInfo {
        let gpu_time_ns = self
            .timestamp_pool
            .filter(|_| self.timestamps_written)
            .and_then(|pool| {
                let mut timestamps = [0u64; 2];
                let result = unsafe {
                    self.device.get_query_pool_results(
                        pool,
                        0,
                        &mut timestamps,
                        vk::QueryResultFlags::TYPE_64,
                    )
                };

                result.ok().map(|_| {
                    let ticks = timestamps[1].saturating_sub(timestamps[0]);

                    (ticks as f64 * Device::timestamp_period(&self.device) as f64) as u64
                })
            });

        FrameInfo {
            bytes_transferred: self.staging.frame_bytes(),
            frame_number: self.frame_number,
            gpu_time_ns,
        }
    }

    /// Blocks until the device is idle; used to drain in-flight transfers at
    /// shutdown.
    pub fn wait_idle(&self) {
        unsafe {
            self.device.device_wait_idle().unwrap_or_default();
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        self.wait_idle();
        self.data.cancel_all_allocations(&mut self.staging);
        self.images.destroy(&self.device);

        if let Some(pool) = self.timestamp_pool.take() {
            unsafe {
                self.device.destroy_query_pool(pool, None);
            }
        }
    }
}

/// Push constants handed to the drawable compiler: base pointers to the
/// drawable payloads, the indirect output and the handle-table root.
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct DrawableCompilerPushConstants {
    drawable_data: vk::DeviceAddress,
    indirect: vk::DeviceAddress,
    handle_root: vk::DeviceAddress,
    drawable_count: u32,
}

impl DrawableCompilerPushConstants {
    const SIZE: u32 = 32;

    fn to_bytes(self) -> [u8; Self::SIZE as usize] {
        let mut bytes = [0; Self::SIZE as usize];

        bytes[0..8].copy_from_slice(&self.drawable_data.to_ne_bytes());
        bytes[8..16].copy_from_slice(&self.indirect.to_ne_bytes());
        bytes[16..24].copy_from_slice(&self.handle_root.to_ne_bytes());
        bytes[24..28].copy_from_slice(&self.drawable_count.to_ne_bytes());

        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn renderer_info_defaults() {
        let info = RendererInfo::default();

        assert_eq!(info.buffer_size_list, [64 << 10, 2 << 20, 32 << 20]);
        assert_eq!(info.max_textures, 250_000);
        assert!(info.optimization_levels.is_empty());
    }

    #[test]
    pub fn renderer_info_builder() {
        let info = RendererInfo::new()
            .buffer_size_list([1 << 10, 1 << 16, 1 << 20])
            .max_textures(1024)
            .build();

        assert_eq!(info.buffer_size_list, [1 << 10, 1 << 16, 1 << 20]);
        assert_eq!(info.max_textures, 1024);
    }

    #[test]
    pub fn push_constants_layout() {
        let push_constants = DrawableCompilerPushConstants {
            drawable_count: 7,
            drawable_data: 0x1000,
            handle_root: 0x3000,
            indirect: 0x2000,
        };
        let bytes = push_constants.to_bytes();

        assert_eq!(bytes.len(), 32);
        assert_eq!(u64::from_ne_bytes(bytes[0..8].try_into().unwrap()), 0x1000);
        assert_eq!(u64::from_ne_bytes(bytes[8..16].try_into().unwrap()), 0x2000);
        assert_eq!(u64::from_ne_bytes(bytes[16..24].try_into().unwrap()), 0x3000);
        assert_eq!(u32::from_ne_bytes(bytes[24..28].try_into().unwrap()), 7);
    }
}
