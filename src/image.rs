//! Image-backed allocations: per-memory-type pools plus the copy and
//! layout-transition batching for buffer-to-image uploads.
//!
//! Unlike data uploads, image uploads are layout-aware: every upload carries
//! an `old -> copy -> new` layout triple plus the destination stage and
//! access masks for the post-copy barrier. Recording emits a pre-barrier, the
//! copy, and a post-barrier, eliding barriers whose transition is a no-op.

use {
    crate::{
        arena::{CircularArena, RecordId},
        driver::{DriverError, device::Device},
        staging::StagingMemoryId,
    },
    ash::vk,
    log::trace,
    slotmap::{SlotMap, new_key_type},
    std::collections::VecDeque,
};

/// Records per allocation block inside an image memory's arena.
const IMAGE_RECORDS_PER_BLOCK: usize = 32;

new_key_type! {
    struct CopyRecordId;
}

/// A plain-data snapshot of the create-info an image was made with.
#[derive(Clone, Copy, Debug)]
pub struct ImageCreateDesc {
    /// Number of array layers.
    pub array_layers: u32,

    /// Image extent in texels.
    pub extent: vk::Extent3D,

    /// Image creation flags.
    pub flags: vk::ImageCreateFlags,

    /// Texel format.
    pub format: vk::Format,

    /// Image dimensionality.
    pub image_type: vk::ImageType,

    /// Number of mip levels.
    pub mip_levels: u32,

    /// Sample count.
    pub samples: vk::SampleCountFlags,

    /// Tiling arrangement.
    pub tiling: vk::ImageTiling,

    /// Allowed usages.
    pub usage: vk::ImageUsageFlags,
}

impl ImageCreateDesc {
    /// Specifies a single-mip 2D image.
    pub fn image_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            array_layers: 1,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            flags: vk::ImageCreateFlags::empty(),
            format,
            image_type: vk::ImageType::TYPE_2D,
            mip_levels: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage,
        }
    }

    /// The equivalent `vk::ImageCreateInfo`.
    pub fn to_vk(&self) -> vk::ImageCreateInfo<'static> {
        vk::ImageCreateInfo::default()
            .flags(self.flags)
            .image_type(self.image_type)
            .format(self.format)
            .extent(self.extent)
            .mip_levels(self.mip_levels)
            .array_layers(self.array_layers)
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
    }
}

#[derive(Debug)]
pub(crate) struct ImagePayload {
    pub copy_record: Option<CopyRecordId>,
    pub desc: ImageCreateDesc,
    pub image: vk::Image,
}

/// Tracks the in-flight copies targeting one image allocation.
#[derive(Debug)]
struct CopyRecord {
    /// Incremented when an upload is recorded, decremented when the command
    /// buffer's execution completes.
    copy_op_counter: u32,

    /// Image parked here when its allocation was replaced while a copy was
    /// still in flight; destroyed once the counter drains.
    image_to_destroy: Option<vk::Image>,

    owner: Option<RecordId>,

    /// Number of queued-but-unrecorded uploads pointing at this record.
    ref_count: u32,
}

/// An image plus its backing memory range.
#[derive(Debug)]
pub struct ImageAllocation {
    memory: usize,
    memory_type: u32,
    offset: vk::DeviceSize,
    record: Option<RecordId>,
    size: vk::DeviceSize,
}

impl ImageAllocation {
    /// An allocation with no backing range.
    pub const fn null() -> Self {
        Self {
            memory: 0,
            memory_type: 0,
            offset: 0,
            record: None,
            size: 0,
        }
    }

    /// Returns `true` when no range is allocated.
    pub fn is_null(&self) -> bool {
        self.record.is_none()
    }

    /// Byte offset of the range inside its device memory.
    pub fn memory_offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Size in bytes of the range.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

/// Writable staging scratch reserved for a buffer-to-image upload.
///
/// The bytes live in a staging memory referenced until the upload's transfer
/// completes; region buffer offsets passed at submit are relative to these
/// bytes.
#[derive(Debug)]
pub struct ImageStagingBuffer {
    buffer: vk::Buffer,
    memory: StagingMemoryId,
    offset: vk::DeviceSize,
    ptr: *mut u8,
    size: vk::DeviceSize,
}

impl ImageStagingBuffer {
    pub(crate) fn new(
        buffer: vk::Buffer,
        memory: StagingMemoryId,
        offset: vk::DeviceSize,
        ptr: *mut u8,
        size: vk::DeviceSize,
    ) -> Self {
        Self {
            buffer,
            memory,
            offset,
            ptr,
            size,
        }
    }

    /// The staged bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size as usize) }
    }

    /// Size in bytes of the staged range.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub(crate) fn memory_id(&self) -> StagingMemoryId {
        self.memory
    }

    pub(crate) fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    pub(crate) fn vk_buffer(&self) -> vk::Buffer {
        self.buffer
    }
}

/// One buffer-to-image upload waiting to be recorded.
#[derive(Debug)]
pub(crate) struct BufferToImageUpload {
    copy_layout: vk::ImageLayout,
    copy_record: CopyRecordId,
    data_size: vk::DeviceSize,
    dst_image: vk::Image,
    new_layout: vk::ImageLayout,
    new_layout_dst_access: vk::AccessFlags,
    new_layout_dst_stages: vk::PipelineStageFlags,
    old_layout: vk::ImageLayout,
    regions: Vec<vk::BufferImageCopy>,
    src_buffer: vk::Buffer,
    staging_memory: StagingMemoryId,
}

/// The barrier/copy sequence one upload records: an optional pre-barrier
/// batch, the copy regions, and an optional post-barrier batch.
#[derive(Debug)]
pub(crate) struct UploadBarrierPlan {
    pub post: Vec<vk::ImageMemoryBarrier<'static>>,
    pub post_dst_stages: vk::PipelineStageFlags,
    pub pre: Vec<vk::ImageMemoryBarrier<'static>>,
}

fn subresource_range_of(region: &vk::BufferImageCopy) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: region.image_subresource.aspect_mask,
        base_mip_level: region.image_subresource.mip_level,
        level_count: 1,
        base_array_layer: region.image_subresource.base_array_layer,
        layer_count: region.image_subresource.layer_count,
    }
}

/// Plans the barriers for one upload.
///
/// The pre-barrier (`old -> copy`, top-of-pipe to transfer) is omitted when
/// the layouts already match; the post-barrier (`copy -> new`, transfer to
/// the caller's stages) is omitted when the layouts match and the caller's
/// destination stage mask is empty.
pub(crate) fn plan_upload_barriers(upload: &BufferToImageUpload) -> UploadBarrierPlan {
    let pre = if upload.old_layout != upload.copy_layout {
        upload
            .regions
            .iter()
            .map(|region| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .old_layout(upload.old_layout)
                    .new_layout(upload.copy_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(upload.dst_image)
                    .subresource_range(subresource_range_of(region))
            })
            .collect()
    } else {
        vec![]
    };

    let post = if !upload.new_layout_dst_stages.is_empty()
        || upload.copy_layout != upload.new_layout
    {
        upload
            .regions
            .iter()
            .map(|region| {
                vk::ImageMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(upload.new_layout_dst_access)
                    .old_layout(upload.copy_layout)
                    .new_layout(upload.new_layout)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(upload.dst_image)
                    .subresource_range(subresource_range_of(region))
            })
            .collect()
    } else {
        vec![]
    };

    let post_dst_stages = if upload.new_layout_dst_stages.is_empty() {
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    } else {
        upload.new_layout_dst_stages
    };

    UploadBarrierPlan {
        post,
        post_dst_stages,
        pre,
    }
}

struct UploadInProgress {
    copy_records: Vec<CopyRecordId>,
    token: u64,
}

/// One device memory allocation of a specific memory type, suballocated for
/// image-backed ranges by a circular arena.
pub struct ImageMemory {
    arena: CircularArena<ImagePayload, IMAGE_RECORDS_PER_BLOCK>,
    copy_records: SlotMap<CopyRecordId, CopyRecord>,
    in_progress: VecDeque<UploadInProgress>,
    memory: Option<vk::DeviceMemory>,
    memory_type_index: u32,
    next_token: u64,
    uploads: Vec<BufferToImageUpload>,
}

impl ImageMemory {
    /// Attempts to allocate a device memory of the given size and type.
    #[profiling::function]
    pub fn try_create(device: &Device, size: vk::DeviceSize, memory_type_index: u32) -> Option<Self> {
        trace!("try_create: {size} bytes of memory type {memory_type_index}");

        let memory = Device::allocate_memory(device, size, memory_type_index, false).ok()?;

        Some(Self {
            arena: CircularArena::new(0, size),
            copy_records: SlotMap::default(),
            in_progress: VecDeque::new(),
            memory: Some(memory),
            memory_type_index,
            next_token: 0,
            uploads: vec![],
        })
    }

    /// A memoryless stand-in used by GPU-free tests.
    #[cfg(test)]
    pub(crate) fn unbacked(size: vk::DeviceSize, memory_type_index: u32) -> Self {
        Self {
            arena: CircularArena::new(0, size),
            copy_records: SlotMap::default(),
            in_progress: VecDeque::new(),
            memory: None,
            memory_type_index,
            next_token: 0,
            uploads: vec![],
        }
    }

    /// The memory type this memory was allocated from.
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Size in bytes of the device memory.
    pub fn size(&self) -> vk::DeviceSize {
        self.arena.buffer_end()
    }

    /// Sum of the sizes of all live allocations.
    pub fn used_bytes(&self) -> vk::DeviceSize {
        self.arena.used_bytes()
    }

    pub(crate) fn vk_memory(&self) -> vk::DeviceMemory {
        self.memory.unwrap_or_default()
    }

    fn alloc(
        &mut self,
        num_bytes: vk::DeviceSize,
        alignment: vk::DeviceSize,
        image: vk::Image,
        desc: ImageCreateDesc,
    ) -> Option<(RecordId, vk::DeviceSize)> {
        self.arena.alloc(
            num_bytes,
            alignment,
            ImagePayload {
                copy_record: None,
                desc,
                image,
            },
        )
    }

    /// Records every queued upload into the command buffer and returns the
    /// FIFO token for this batch plus the referenced staging memories.
    #[profiling::function]
    pub(crate) fn record_uploads(
        &mut self,
        device: &Device,
        cmd_buf: vk::CommandBuffer,
    ) -> (u64, vk::DeviceSize, Vec<StagingMemoryId>) {
        let uploads = std::mem::take(&mut self.uploads);
        let mut copy_records = vec![];
        let mut staging_memories = vec![];
        let mut bytes = 0;

        for upload in &uploads {
            let plan = plan_upload_barriers(upload);

            unsafe {
                if !plan.pre.is_empty() {
                    device.cmd_pipeline_barrier(
                        cmd_buf,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &plan.pre,
                    );
                }

                device.cmd_copy_buffer_to_image(
                    cmd_buf,
                    upload.src_buffer,
                    upload.dst_image,
                    upload.copy_layout,
                    &upload.regions,
                );

                if !plan.post.is_empty() {
                    device.cmd_pipeline_barrier(
                        cmd_buf,
                        vk::PipelineStageFlags::TRANSFER,
                        plan.post_dst_stages,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &plan.post,
                    );
                }
            }

            let copy_record = &mut self.copy_records[upload.copy_record];
            copy_record.ref_count -= 1;
            copy_record.copy_op_counter += 1;

            bytes += upload.data_size;
            copy_records.push(upload.copy_record);
            staging_memories.push(upload.staging_memory);
        }

        let token = self.next_token;
        self.next_token += 1;
        self.in_progress.push_back(UploadInProgress {
            copy_records,
            token,
        });

        (token, bytes, staging_memories)
    }

    /// Completes one recorded batch, draining copy-op counters and
    /// destroying any images parked while their copies were in flight.
    pub(crate) fn upload_done(&mut self, token: u64, destroy_image: &mut dyn FnMut(vk::Image)) {
        let in_progress = self
            .in_progress
            .pop_front()
            .expect("upload_done called with no uploads in flight");

        debug_assert_eq!(
            in_progress.token, token,
            "upload_done must be called on transfer records in FIFO order"
        );

        for id in in_progress.copy_records {
            let copy_record = &mut self.copy_records[id];

            debug_assert!(copy_record.copy_op_counter > 0);

            copy_record.copy_op_counter -= 1;
            if copy_record.copy_op_counter == 0 && copy_record.ref_count == 0 {
                if let Some(image) = copy_record.image_to_destroy.take() {
                    destroy_image(image);
                }

                if let Some(owner) = copy_record.owner {
                    if let Some(payload) = self
                        .arena
                        .record_mut(owner)
                        .and_then(|record| record.payload.as_mut())
                    {
                        if payload.copy_record == Some(id) {
                            payload.copy_record = None;
                        }
                    }
                }

                self.copy_records.remove(id);
            }
        }
    }
}

impl std::fmt::Debug for ImageMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageMemory")
            .field("memory_type_index", &self.memory_type_index)
            .field("size", &self.size())
            .field("used_bytes", &self.used_bytes())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct MemoryTypeManagement {
    first_alloc: Option<usize>,
    memories: Vec<ImageMemory>,
    second_alloc: Option<usize>,
}

/// Pools of image-backed device memory, indexed by memory type.
#[derive(Debug, Default)]
pub struct ImageStorage {
    types: Vec<MemoryTypeManagement>,
}

impl ImageStorage {
    /// Creates an empty storage; memories are created on demand.
    pub fn new() -> Self {
        Self::default()
    }

    /// The image backed by an allocation.
    pub fn image(&self, allocation: &ImageAllocation) -> vk::Image {
        allocation
            .record
            .and_then(|record| {
                self.types[allocation.memory_type as usize].memories[allocation.memory]
                    .arena
                    .record(record)
            })
            .and_then(|record| record.payload.as_ref())
            .map(|payload| payload.image)
            .unwrap_or_default()
    }

    /// The create-info snapshot of the image backed by an allocation.
    pub fn image_desc(&self, allocation: &ImageAllocation) -> Option<ImageCreateDesc> {
        allocation
            .record
            .and_then(|record| {
                self.types[allocation.memory_type as usize].memories[allocation.memory]
                    .arena
                    .record(record)
            })
            .and_then(|record| record.payload.as_ref())
            .map(|payload| payload.desc)
    }

    /// Scans the driver's memory-type table and allocates from the first
    /// type whose bit is set in `memory_type_bits` and whose flags include
    /// `required_flags`; each type runs the first/second/new cascade.
    ///
    /// `bind` attaches the image to the reserved memory range.
    #[profiling::function]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn alloc(
        &mut self,
        num_bytes: vk::DeviceSize,
        alignment: vk::DeviceSize,
        memory_type_bits: u32,
        required_flags: vk::MemoryPropertyFlags,
        image: vk::Image,
        desc: ImageCreateDesc,
        mem_props: &vk::PhysicalDeviceMemoryProperties,
        tiers: [vk::DeviceSize; 3],
        new_memory: &mut dyn FnMut(vk::DeviceSize, u32) -> Option<ImageMemory>,
        bind: &mut dyn FnMut(vk::Image, vk::DeviceMemory, vk::DeviceSize) -> Result<(), DriverError>,
    ) -> Result<ImageAllocation, DriverError> {
        debug_assert_ne!(num_bytes, 0);

        if self.types.len() < mem_props.memory_type_count as usize {
            self.types
                .resize_with(mem_props.memory_type_count as usize, Default::default);
        }

        for memory_type_index in 0..mem_props.memory_type_count {
            if memory_type_bits & (1 << memory_type_index) == 0 {
                continue;
            }

            if !mem_props.memory_types[memory_type_index as usize]
                .property_flags
                .contains(required_flags)
            {
                continue;
            }

            if let Some((memory, record, offset)) = self.alloc_from_memory_type(
                num_bytes,
                alignment,
                memory_type_index,
                image,
                desc,
                tiers,
                new_memory,
            )? {
                let vk_memory =
                    self.types[memory_type_index as usize].memories[memory].vk_memory();

                if let Err(err) = bind(image, vk_memory, offset) {
                    self.types[memory_type_index as usize].memories[memory]
                        .arena
                        .free(record);

                    return Err(err);
                }

                return Ok(ImageAllocation {
                    memory,
                    memory_type: memory_type_index,
                    offset,
                    record: Some(record),
                    size: num_bytes,
                });
            }
        }

        Err(DriverError::OutOfMemory)
    }

    /// The §4.2 cascade parameterized by memory type; image memories start
    /// at the medium tier.
    #[allow(clippy::too_many_arguments)]
    fn alloc_from_memory_type(
        &mut self,
        num_bytes: vk::DeviceSize,
        alignment: vk::DeviceSize,
        memory_type_index: u32,
        image: vk::Image,
        desc: ImageCreateDesc,
        tiers: [vk::DeviceSize; 3],
        new_memory: &mut dyn FnMut(vk::DeviceSize, u32) -> Option<ImageMemory>,
    ) -> Result<Option<(usize, RecordId, vk::DeviceSize)>, DriverError> {
        let mtm = &mut self.types[memory_type_index as usize];

        if mtm.first_alloc.is_none() {
            let size = if num_bytes < tiers[1] {
                tiers[1]
            } else {
                num_bytes.max(tiers[2])
            };
            let Some(memory) = new_memory(size, memory_type_index) else {
                return Ok(None);
            };

            mtm.memories.push(memory);
            mtm.first_alloc = Some(mtm.memories.len() - 1);
        }

        let first = mtm.first_alloc.unwrap();
        if let Some((record, offset)) = mtm.memories[first].alloc(num_bytes, alignment, image, desc)
        {
            return Ok(Some((first, record, offset)));
        }

        if mtm.second_alloc.is_none() {
            let size = num_bytes.max(tiers[2]);
            let Some(memory) = new_memory(size, memory_type_index) else {
                return Ok(None);
            };

            mtm.memories.push(memory);
            mtm.second_alloc = Some(mtm.memories.len() - 1);
        }

        let second = mtm.second_alloc.unwrap();
        if let Some((record, offset)) = mtm.memories[second].alloc(num_bytes, alignment, image, desc)
        {
            return Ok(Some((second, record, offset)));
        }

        let size = num_bytes.max(tiers[2]);
        let Some(memory) = new_memory(size, memory_type_index) else {
            return Ok(None);
        };

        mtm.memories.push(memory);
        let idx = mtm.memories.len() - 1;
        mtm.first_alloc = mtm.second_alloc;
        mtm.second_alloc = Some(idx);

        mtm.memories[idx]
            .alloc(num_bytes, alignment, image, desc)
            .map(|(record, offset)| Some((idx, record, offset)))
            .ok_or(DriverError::OutOfMemory)
    }

    /// Frees an allocation.
    ///
    /// With no copy in flight the image is destroyed immediately; otherwise
    /// it is parked on the live copy record and destroyed once the copy-op
    /// counter drains.
    #[profiling::function]
    pub(crate) fn free(
        &mut self,
        allocation: ImageAllocation,
        destroy_image: &mut dyn FnMut(vk::Image),
    ) {
        let Some(record) = allocation.record else {
            return;
        };

        let memory =
            &mut self.types[allocation.memory_type as usize].memories[allocation.memory];
        let payload = memory.arena.free(record);

        let in_flight = payload
            .copy_record
            .and_then(|id| memory.copy_records.get_mut(id))
            .filter(|copy_record| copy_record.copy_op_counter > 0 || copy_record.ref_count > 0);

        if let Some(copy_record) = in_flight {
            // Detach so later completions do not touch the dead record
            copy_record.image_to_destroy = Some(payload.image);
            copy_record.owner = None;
        } else if payload.image != vk::Image::null() {
            destroy_image(payload.image);
        }
    }

    /// Queues a buffer-to-image upload from staged bytes.
    #[profiling::function]
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn submit_upload(
        &mut self,
        allocation: &ImageAllocation,
        src_buffer: vk::Buffer,
        staging_memory: StagingMemoryId,
        old_layout: vk::ImageLayout,
        copy_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        new_layout_dst_stages: vk::PipelineStageFlags,
        new_layout_dst_access: vk::AccessFlags,
        regions: Vec<vk::BufferImageCopy>,
        data_size: vk::DeviceSize,
    ) -> Result<(), DriverError> {
        debug_assert!(!regions.is_empty());

        let record = allocation.record.ok_or(DriverError::InvalidData)?;
        let memory =
            &mut self.types[allocation.memory_type as usize].memories[allocation.memory];
        let payload = memory
            .arena
            .record_mut(record)
            .and_then(|record| record.payload.as_mut())
            .ok_or(DriverError::InvalidData)?;
        let dst_image = payload.image;

        let copy_record = match payload.copy_record {
            Some(copy_record) => copy_record,
            None => {
                let id = memory.copy_records.insert(CopyRecord {
                    copy_op_counter: 0,
                    image_to_destroy: None,
                    owner: Some(record),
                    ref_count: 0,
                });

                // Re-borrow: the payload reference was invalidated by the
                // insert above
                let payload = memory
                    .arena
                    .record_mut(record)
                    .and_then(|record| record.payload.as_mut())
                    .ok_or(DriverError::InvalidData)?;
                payload.copy_record = Some(id);

                id
            }
        };

        memory.copy_records[copy_record].ref_count += 1;
        memory.uploads.push(BufferToImageUpload {
            copy_layout,
            copy_record,
            data_size,
            dst_image,
            new_layout,
            new_layout_dst_access,
            new_layout_dst_stages,
            old_layout,
            regions,
            src_buffer,
            staging_memory,
        });

        Ok(())
    }

    /// Records every memory's queued uploads, returning per-memory tokens
    /// and the referenced staging memories.
    pub(crate) fn record_uploads(
        &mut self,
        device: &Device,
        cmd_buf: vk::CommandBuffer,
    ) -> (Vec<(u32, usize, u64)>, vk::DeviceSize, Vec<StagingMemoryId>) {
        let mut tokens = vec![];
        let mut staging_memories = vec![];
        let mut bytes = 0;

        for (type_idx, mtm) in self.types.iter_mut().enumerate() {
            for (memory_idx, memory) in mtm.memories.iter_mut().enumerate() {
                if memory.uploads.is_empty() && memory.in_progress.is_empty() {
                    continue;
                }

                let (token, memory_bytes, memory_staging) =
                    memory.record_uploads(device, cmd_buf);

                tokens.push((type_idx as u32, memory_idx, token));
                bytes += memory_bytes;
                staging_memories.extend(memory_staging);
            }
        }

        (tokens, bytes, staging_memories)
    }

    /// Completes recorded uploads named by a transfer record.
    pub(crate) fn uploads_done(
        &mut self,
        tokens: &[(u32, usize, u64)],
        destroy_image: &mut dyn FnMut(vk::Image),
    ) {
        for (type_idx, memory_idx, token) in tokens {
            self.types[*type_idx as usize].memories[*memory_idx]
                .upload_done(*token, destroy_image);
        }
    }

    /// Destroys every image memory; images themselves belong to their
    /// allocations and must have been freed already.
    pub(crate) fn destroy(&mut self, device: &Device) {
        for mtm in &mut self.types {
            for memory in &mut mtm.memories {
                if let Some(vk_memory) = memory.memory.take() {
                    unsafe {
                        device.free_memory(vk_memory, None);
                    }
                }
            }
        }

        self.types.clear();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, ash::vk::Handle};

    const TEST_TIERS: [vk::DeviceSize; 3] = [64 << 10, 2 << 20, 32 << 20];

    fn test_mem_props() -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };

        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        props.memory_types[2].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;

        props
    }

    fn test_factory() -> impl FnMut(vk::DeviceSize, u32) -> Option<ImageMemory> {
        |size, memory_type_index| Some(ImageMemory::unbacked(size, memory_type_index))
    }

    fn test_upload(
        old_layout: vk::ImageLayout,
        copy_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
    ) -> BufferToImageUpload {
        BufferToImageUpload {
            copy_layout,
            copy_record: CopyRecordId::default(),
            data_size: 4096,
            dst_image: vk::Image::from_raw(0x77),
            new_layout,
            new_layout_dst_access: access,
            new_layout_dst_stages: stages,
            old_layout,
            regions: vec![vk::BufferImageCopy {
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            }],
            src_buffer: vk::Buffer::null(),
            staging_memory: StagingMemoryId::default(),
        }
    }

    #[test]
    pub fn alloc_selects_memory_type() {
        let mut storage = ImageStorage::new();
        let mut factory = test_factory();
        let mut bind =
            |_: vk::Image, _: vk::DeviceMemory, _: vk::DeviceSize| -> Result<(), DriverError> {
                Ok(())
            };
        let props = test_mem_props();

        // Only types 0 and 2 are device-local; bit mask excludes type 0
        let allocation = storage
            .alloc(
                4096,
                256,
                0b110,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::Image::from_raw(1),
                ImageCreateDesc::image_2d(
                    vk::Format::R8G8B8A8_UNORM,
                    64,
                    64,
                    vk::ImageUsageFlags::SAMPLED,
                ),
                &props,
                TEST_TIERS,
                &mut factory,
                &mut bind,
            )
            .unwrap();

        assert_eq!(allocation.memory_type, 2);
        assert_eq!(allocation.memory_offset(), 0);
        assert_eq!(storage.image(&allocation), vk::Image::from_raw(1));

        // No matching type at all
        let err = storage
            .alloc(
                4096,
                256,
                0b001,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
                vk::Image::from_raw(2),
                ImageCreateDesc::image_2d(
                    vk::Format::R8G8B8A8_UNORM,
                    64,
                    64,
                    vk::ImageUsageFlags::SAMPLED,
                ),
                &props,
                TEST_TIERS,
                &mut factory,
                &mut bind,
            )
            .unwrap_err();
        assert_eq!(err, DriverError::OutOfMemory);

        let mut destroyed = vec![];
        storage.free(allocation, &mut |image| destroyed.push(image));
        assert_eq!(destroyed, vec![vk::Image::from_raw(1)]);
    }

    #[test]
    pub fn alloc_respects_alignment() {
        let mut storage = ImageStorage::new();
        let mut factory = test_factory();
        let mut bind =
            |_: vk::Image, _: vk::DeviceMemory, _: vk::DeviceSize| -> Result<(), DriverError> {
                Ok(())
            };
        let props = test_mem_props();
        let desc = ImageCreateDesc::image_2d(
            vk::Format::R8G8B8A8_UNORM,
            64,
            64,
            vk::ImageUsageFlags::SAMPLED,
        );

        let a = storage
            .alloc(
                100,
                1,
                0b001,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::Image::from_raw(1),
                desc,
                &props,
                TEST_TIERS,
                &mut factory,
                &mut bind,
            )
            .unwrap();
        let b = storage
            .alloc(
                100,
                4096,
                0b001,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::Image::from_raw(2),
                desc,
                &props,
                TEST_TIERS,
                &mut factory,
                &mut bind,
            )
            .unwrap();

        assert_eq!(a.memory_offset(), 0);
        assert_eq!(b.memory_offset(), 4096);
    }

    #[test]
    pub fn upload_with_layout_transition_plans_both_barriers() {
        // R8G8B8A8 upload: undefined -> transferDst -> shaderReadOnly
        let upload = test_upload(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        );
        let plan = plan_upload_barriers(&upload);

        assert_eq!(plan.pre.len(), 1);
        assert_eq!(plan.pre[0].src_access_mask, vk::AccessFlags::empty());
        assert_eq!(plan.pre[0].dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(plan.pre[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(plan.pre[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        assert_eq!(plan.post.len(), 1);
        assert_eq!(plan.post[0].src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(plan.post[0].dst_access_mask, vk::AccessFlags::SHADER_READ);
        assert_eq!(plan.post[0].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(
            plan.post[0].new_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(plan.post_dst_stages, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    pub fn upload_barrier_elision() {
        // old == copy: no pre-barrier
        let upload = test_upload(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
        );
        let plan = plan_upload_barriers(&upload);
        assert!(plan.pre.is_empty());
        assert_eq!(plan.post.len(), 1);

        // copy == new and empty stages: no post-barrier
        let upload = test_upload(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::PipelineStageFlags::empty(),
            vk::AccessFlags::empty(),
        );
        let plan = plan_upload_barriers(&upload);
        assert_eq!(plan.pre.len(), 1);
        assert!(plan.post.is_empty());
    }

    #[test]
    pub fn replaced_allocation_parks_image_until_copy_drains() {
        let mut storage = ImageStorage::new();
        let mut factory = test_factory();
        let mut bind =
            |_: vk::Image, _: vk::DeviceMemory, _: vk::DeviceSize| -> Result<(), DriverError> {
                Ok(())
            };
        let props = test_mem_props();
        let desc = ImageCreateDesc::image_2d(
            vk::Format::R8G8B8A8_UNORM,
            64,
            64,
            vk::ImageUsageFlags::SAMPLED,
        );

        let allocation = storage
            .alloc(
                4096,
                256,
                0b001,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                vk::Image::from_raw(7),
                desc,
                &props,
                TEST_TIERS,
                &mut factory,
                &mut bind,
            )
            .unwrap();

        storage
            .submit_upload(
                &allocation,
                vk::Buffer::null(),
                StagingMemoryId::default(),
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::AccessFlags::SHADER_READ,
                vec![vk::BufferImageCopy::default()],
                4096,
            )
            .unwrap();

        // Freed while the upload is still queued: the image must be parked,
        // not destroyed
        let mut destroyed = vec![];
        storage.free(allocation, &mut |image| destroyed.push(image));
        assert!(destroyed.is_empty());
    }
}
