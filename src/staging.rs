//! Staging memory pools and the host-to-device upload pipeline.
//!
//! A [`StagingMemory`] is a persistently mapped host-visible buffer. The
//! [`StagingManager`] keeps four pairs of available/in-use lists, tiered by
//! size (small, medium, large, super-size), and recycles memories once the
//! frame that copied out of them has completed on the GPU.
//!
//! Writes go through [`StagingData`] handles: user code fills the mapped
//! bytes and submits; `record_upload` batches every submitted range into one
//! command-buffer's worth of `vkCmdCopyBuffer` calls and returns a
//! [`TransferRecord`] which must be handed back, in FIFO order, once the
//! transfer's fence has signalled.

use {
    crate::{
        data::{DataRecordRef, DataStorage},
        driver::{Buffer, BufferInfo, DriverError, align_up, device::Device},
    },
    ash::vk,
    log::trace,
    slotmap::{SlotMap, new_key_type},
    std::{collections::HashMap, sync::Arc},
};

new_key_type! {
    /// Identifies one [`StagingMemory`] inside a [`StagingManager`].
    pub struct StagingMemoryId;

    /// Identifies one staging allocation inside a [`StagingManager`].
    pub struct StagingAllocId;
}

/// Number of size tiers: small, medium, large and super-size.
const TIER_COUNT: usize = 4;

const TIER_SMALL: usize = 0;
const TIER_MEDIUM: usize = 1;
const TIER_LARGE: usize = 2;
const TIER_SUPER: usize = 3;

/// Staging suballocations are aligned so casting the mapped bytes to small
/// POD types stays sound.
const STAGING_ALIGNMENT: vk::DeviceSize = 16;

/// One persistently mapped host-visible buffer used as copy scratch.
#[derive(Debug)]
pub struct StagingMemory {
    buffer: Option<Buffer>,
    offset: vk::DeviceSize,
    ptr: *mut u8,
    ref_count: u32,
    size: vk::DeviceSize,
}

impl StagingMemory {
    /// Creates a staging memory of the given size on the device.
    #[profiling::function]
    pub fn create(device: &Arc<Device>, size: vk::DeviceSize) -> Result<Self, DriverError> {
        trace!("create staging memory: {size} bytes");

        let buffer = Buffer::create(
            device,
            BufferInfo::host_mem(size, vk::BufferUsageFlags::TRANSFER_SRC),
        )?;
        let ptr = Buffer::mapped_ptr(&buffer);

        Ok(Self {
            buffer: Some(buffer),
            offset: 0,
            ptr,
            ref_count: 0,
            size,
        })
    }

    /// A host-backed stand-in used by GPU-free tests; the mapped range is
    /// plain heap memory.
    #[cfg(test)]
    pub(crate) fn host_backed(size: vk::DeviceSize) -> Self {
        let ptr = Box::leak(vec![0u8; size as usize].into_boxed_slice()).as_mut_ptr();

        Self {
            buffer: None,
            offset: 0,
            ptr,
            ref_count: 0,
            size,
        }
    }

    /// Size in bytes of the mapped range.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn vk_buffer(&self) -> vk::Buffer {
        self.buffer.as_ref().map(|buffer| **buffer).unwrap_or_default()
    }

    /// Bumps the per-frame cursor; returns the offset of the reserved range.
    fn bump(&mut self, size: vk::DeviceSize) -> Option<vk::DeviceSize> {
        let offset = align_up(self.offset, STAGING_ALIGNMENT);
        (offset + size <= self.size).then(|| {
            self.offset = offset + size;
            offset
        })
    }

    fn ptr_at(&self, offset: vk::DeviceSize) -> *mut u8 {
        unsafe { self.ptr.add(offset as usize) }
    }
}

#[derive(Debug)]
struct StagingAllocation {
    dst_buffer: vk::Buffer,
    dst_offset: vk::DeviceSize,
    memory: StagingMemoryId,
    owner: Option<DataRecordRef>,
    ref_count: u32,
    size: vk::DeviceSize,
    staging_offset: vk::DeviceSize,
    written: bool,
}

/// A writable view of staged bytes bound for one destination range.
///
/// The pointer stays valid until the backing staging memory is recycled,
/// which cannot happen before the range has been submitted, recorded and its
/// transfer completed; all of that is sequenced on the render thread.
#[derive(Debug)]
pub struct StagingData {
    alloc: StagingAllocId,
    need_init: bool,
    ptr: *mut u8,
    size: vk::DeviceSize,
}

impl StagingData {
    /// The staged bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size as usize) }
    }

    /// `true` the first time the destination is staged in the current frame:
    /// the caller must supply all of the data, not just a patch.
    pub fn need_init(&self) -> bool {
        self.need_init
    }

    /// Size in bytes of the staged range.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Copies `data` to the front of the staged range.
    pub fn write(&mut self, data: &[u8]) {
        self.bytes_mut()[0..data.len()].copy_from_slice(data);
    }
}

/// An opaque token tying one recorded group of staging memories to one
/// submitted command buffer.
///
/// Tokens must be returned to [`StagingManager::upload_done`] in the order
/// they were produced by `record_upload`.
#[derive(Debug)]
pub struct TransferRecord {
    allocs: Vec<StagingAllocId>,
    bytes: vk::DeviceSize,
    /// Staging memories referenced outside the buffer-copy path, e.g. by
    /// buffer-to-image uploads.
    pub(crate) extra_memories: Vec<StagingMemoryId>,
    id: u64,
    /// Per-image-memory upload tokens: (memory type index, memory index,
    /// token).
    pub(crate) image_uploads: Vec<(u32, usize, u64)>,
}

impl TransferRecord {
    /// Bytes of buffer-to-buffer copy work recorded for this transfer.
    pub fn bytes_transferred(&self) -> vk::DeviceSize {
        self.bytes
    }
}

/// CPU-visible scratch pools, tiered by size, recycled per frame.
#[derive(Debug, Default)]
pub struct StagingManager {
    allocs: SlotMap<StagingAllocId, StagingAllocation>,
    available: [Vec<StagingMemoryId>; TIER_COUNT],
    current_frame_bytes: vk::DeviceSize,
    current_frame_counts: [usize; TIER_COUNT],
    expected_done_id: u64,
    in_use: [Vec<StagingMemoryId>; TIER_COUNT],
    last_frame_bytes: vk::DeviceSize,
    last_memory: Option<StagingMemoryId>,
    memories: SlotMap<StagingMemoryId, StagingMemory>,
    next_transfer_id: u64,
    submitted: Vec<StagingAllocId>,
}

impl StagingManager {
    /// Creates an empty manager; memories are created on demand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the size tier for a staging request.
    ///
    /// A fresh small or medium memory is handed out once per frame and only
    /// while the previous frame's transfer volume stayed within the tier;
    /// recycled memories sitting on a tier's available list stay eligible all
    /// frame. Everything else escalates to large or super-size. The
    /// aggressive escalation keeps the number of live device memories well
    /// under the driver-guaranteed 4096-allocation cap for multi-gigabyte
    /// scenes.
    fn choose_tier(&self, tiers: [vk::DeviceSize; 3], size: vk::DeviceSize) -> usize {
        let tier_open = |tier: usize| {
            self.current_frame_counts[tier] == 0 || !self.available[tier].is_empty()
        };

        if self.last_frame_bytes <= tiers[TIER_SMALL]
            && size <= tiers[TIER_SMALL]
            && tier_open(TIER_SMALL)
        {
            TIER_SMALL
        } else if self.last_frame_bytes <= tiers[TIER_MEDIUM]
            && size <= tiers[TIER_MEDIUM]
            && tier_open(TIER_MEDIUM)
        {
            TIER_MEDIUM
        } else if size <= tiers[TIER_LARGE] {
            TIER_LARGE
        } else {
            TIER_SUPER
        }
    }

    fn tier_of_size(tiers: [vk::DeviceSize; 3], size: vk::DeviceSize) -> usize {
        if size <= tiers[TIER_SMALL] {
            TIER_SMALL
        } else if size <= tiers[TIER_MEDIUM] {
            TIER_MEDIUM
        } else if size <= tiers[TIER_LARGE] {
            TIER_LARGE
        } else {
            TIER_SUPER
        }
    }

    /// Reserves `size` staging bytes bound for `(dst_buffer, dst_offset)`.
    ///
    /// Reuses the last-touched memory when it has room; otherwise splices an
    /// available memory of the chosen tier into the in-use list, creating one
    /// through `new_memory` when the tier is dry.
    #[profiling::function]
    pub(crate) fn staging_alloc(
        &mut self,
        tiers: [vk::DeviceSize; 3],
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
        owner: Option<DataRecordRef>,
        new_memory: &mut dyn FnMut(vk::DeviceSize) -> Result<StagingMemory, DriverError>,
    ) -> Result<StagingAllocId, DriverError> {
        debug_assert_ne!(size, 0, "staging allocations must not be zero-sized");

        // Fast path: keep packing the most recently touched memory
        let mut selected = self.last_memory.and_then(|id| {
            self.memories
                .get_mut(id)
                .and_then(|memory| memory.bump(size).map(|offset| (id, offset)))
        });

        if selected.is_none() {
            let tier = self.choose_tier(tiers, size);
            self.current_frame_counts[tier] += 1;

            let reused = if tier == TIER_SUPER {
                // Best fit: the smallest sufficient super-size memory
                self.available[TIER_SUPER]
                    .iter()
                    .enumerate()
                    .filter(|(_, id)| self.memories[**id].size() >= size)
                    .min_by_key(|(_, id)| self.memories[**id].size())
                    .map(|(idx, _)| idx)
                    .map(|idx| self.available[TIER_SUPER].remove(idx))
            } else {
                self.available[tier].pop()
            };

            let id = match reused {
                Some(id) => {
                    self.memories[id].offset = 0;
                    id
                }
                None => {
                    let capacity = if tier == TIER_SUPER {
                        size
                    } else {
                        tiers[tier]
                    };
                    let memory = new_memory(capacity)?;
                    self.memories.insert(memory)
                }
            };

            self.in_use[tier].push(id);
            self.last_memory = Some(id);

            let offset = self.memories[id]
                .bump(size)
                .ok_or(DriverError::OutOfMemory)?;
            selected = Some((id, offset));
        }

        let (memory, staging_offset) = selected.unwrap();
        self.memories[memory].ref_count += 1;

        Ok(self.allocs.insert(StagingAllocation {
            dst_buffer,
            dst_offset,
            memory,
            owner,
            ref_count: 0,
            size,
            staging_offset,
            written: false,
        }))
    }

    /// Builds the user-facing write handle for a staging allocation.
    fn staging_data(&self, alloc: StagingAllocId, need_init: bool) -> StagingData {
        let allocation = &self.allocs[alloc];
        let memory = &self.memories[allocation.memory];

        StagingData {
            alloc,
            need_init,
            ptr: memory.ptr_at(allocation.staging_offset),
            size: allocation.size,
        }
    }

    /// References a staging allocation for a write, returning the handle.
    ///
    /// The first acquisition of an allocation reports `need_init`: nothing
    /// has been written yet, so the caller must supply all of the data. If
    /// the allocation had already been submitted it is pulled back off the
    /// submitted list; the copy will be recorded once per final submit.
    pub(crate) fn acquire(&mut self, alloc: StagingAllocId) -> StagingData {
        let allocation = &mut self.allocs[alloc];
        allocation.ref_count += 1;

        let need_init = !allocation.written;
        allocation.written = true;

        if let Some(idx) = self.submitted.iter().position(|id| *id == alloc) {
            self.submitted.remove(idx);
        }

        self.staging_data(alloc, need_init)
    }

    /// Releases one reference; at zero the allocation joins the submitted
    /// list and will be copied by the next `record_upload`.
    #[profiling::function]
    pub(crate) fn submit(&mut self, staging_data: StagingData) {
        let alloc = staging_data.alloc;
        let allocation = &mut self.allocs[alloc];

        debug_assert!(allocation.ref_count > 0);

        allocation.ref_count -= 1;
        if allocation.ref_count == 0 {
            debug_assert!(!self.submitted.contains(&alloc));

            self.submitted.push(alloc);
        }
    }

    /// Detaches a staging allocation whose owning data allocation is being
    /// freed before the copy was recorded.
    pub(crate) fn on_owner_freed(&mut self, alloc: StagingAllocId) {
        let Some(allocation) = self.allocs.get_mut(alloc) else {
            return;
        };

        allocation.owner = None;

        if let Some(idx) = self.submitted.iter().position(|id| *id == alloc) {
            self.submitted.remove(idx);
        } else if allocation.ref_count > 0 {
            // Outstanding StagingData handles keep the bytes writable; the
            // copy is simply never recorded
            allocation.ref_count = 0;
        } else {
            // Already drained into a transfer record; it completes normally
            return;
        }

        let memory = allocation.memory;
        self.allocs.remove(alloc);
        self.release_memory_ref(memory, None);
    }

    /// Emits one or more buffer-to-buffer copies per contiguous run of
    /// submitted allocations and returns the transfer record for this batch.
    #[profiling::function]
    pub(crate) fn record_upload(&mut self, device: &Device, cmd_buf: vk::CommandBuffer) -> TransferRecord {
        let mut groups: HashMap<(StagingMemoryId, vk::Buffer), Vec<vk::BufferCopy>> = HashMap::new();
        let mut bytes = 0;
        let allocs = std::mem::take(&mut self.submitted);

        for alloc in &allocs {
            let allocation = &self.allocs[*alloc];
            let memory = &self.memories[allocation.memory];

            bytes += allocation.size;
            groups
                .entry((allocation.memory, allocation.dst_buffer))
                .or_default()
                .push(vk::BufferCopy {
                    src_offset: allocation.staging_offset,
                    dst_offset: allocation.dst_offset,
                    size: allocation.size,
                });

            debug_assert_ne!(memory.vk_buffer(), vk::Buffer::null());
        }

        for ((memory, dst_buffer), regions) in groups {
            let regions = merge_copy_runs(regions);
            let src_buffer = self.memories[memory].vk_buffer();

            trace!(
                "copy {} regions {src_buffer:?} -> {dst_buffer:?}",
                regions.len()
            );

            unsafe {
                device.cmd_copy_buffer(cmd_buf, src_buffer, dst_buffer, &regions);
            }
        }

        self.current_frame_bytes += bytes;

        let id = self.next_transfer_id;
        self.next_transfer_id += 1;

        TransferRecord {
            allocs,
            bytes,
            extra_memories: vec![],
            id,
            image_uploads: vec![],
        }
    }

    /// Returns a transfer record after its fence has signalled.
    ///
    /// Must be called in the order the records were produced. Staging
    /// memories whose reference count reaches zero are spliced back onto the
    /// available list of their tier.
    #[profiling::function]
    pub(crate) fn upload_done(
        &mut self,
        tiers: [vk::DeviceSize; 3],
        record: &TransferRecord,
        data: &mut DataStorage,
    ) {
        debug_assert_eq!(
            record.id, self.expected_done_id,
            "upload_done must be called on transfer records in FIFO order"
        );

        self.expected_done_id = record.id + 1;

        for alloc in &record.allocs {
            let Some(allocation) = self.allocs.remove(*alloc) else {
                continue;
            };

            if let Some(owner) = allocation.owner {
                data.detach_staging(owner, *alloc);
            }

            self.release_memory_ref(allocation.memory, Some(tiers));
        }

        for memory in &record.extra_memories {
            self.release_memory_ref(*memory, Some(tiers));
        }
    }

    /// Reserves raw staging bytes with no buffer-copy destination; used by
    /// buffer-to-image uploads which record their own copy commands.
    pub(crate) fn raw_alloc(
        &mut self,
        tiers: [vk::DeviceSize; 3],
        size: vk::DeviceSize,
        new_memory: &mut dyn FnMut(vk::DeviceSize) -> Result<StagingMemory, DriverError>,
    ) -> Result<(StagingMemoryId, vk::Buffer, vk::DeviceSize, *mut u8), DriverError> {
        let alloc = self.staging_alloc(tiers, vk::Buffer::null(), 0, size, None, new_memory)?;
        let allocation = self.allocs.remove(alloc).unwrap();
        let memory = &self.memories[allocation.memory];

        // The reference taken by staging_alloc is carried by the image upload
        // and released through TransferRecord::extra_memories
        Ok((
            allocation.memory,
            memory.vk_buffer(),
            allocation.staging_offset,
            memory.ptr_at(allocation.staging_offset),
        ))
    }

    fn release_memory_ref(&mut self, memory: StagingMemoryId, tiers: Option<[vk::DeviceSize; 3]>) {
        let mem = &mut self.memories[memory];

        debug_assert!(mem.ref_count > 0);

        mem.ref_count -= 1;
        if mem.ref_count == 0 {
            let size = mem.size;
            let tier = tiers
                .map(|tiers| Self::tier_of_size(tiers, size))
                .unwrap_or_else(|| {
                    self.in_use
                        .iter()
                        .position(|list| list.contains(&memory))
                        .unwrap_or(TIER_SUPER)
                });

            if let Some(idx) = self.in_use[tier].iter().position(|id| *id == memory) {
                self.in_use[tier].remove(idx);
                self.available[tier].push(memory);
            }

            if self.last_memory == Some(memory) {
                self.last_memory = None;
            }
        }
    }

    /// Buffer bytes recorded for transfer in the current frame so far.
    pub(crate) fn frame_bytes(&self) -> vk::DeviceSize {
        self.current_frame_bytes
    }

    /// Rotates the per-frame staging statistics.
    pub(crate) fn end_frame(&mut self) {
        self.last_frame_bytes = self.current_frame_bytes;
        self.current_frame_bytes = 0;
        self.current_frame_counts = [0; TIER_COUNT];
        self.last_memory = None;
    }

    /// Count of staging memories currently owned by the manager.
    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }

    #[cfg(test)]
    pub(crate) fn memory_of(&self, alloc: StagingAllocId) -> StagingMemoryId {
        self.allocs[alloc].memory
    }

    #[cfg(test)]
    pub(crate) fn available_count(&self, tier: usize) -> usize {
        self.available[tier].len()
    }
}

/// Merges contiguous copy regions: two regions fuse when both their source
/// and destination ranges are adjacent.
fn merge_copy_runs(mut regions: Vec<vk::BufferCopy>) -> Vec<vk::BufferCopy> {
    regions.sort_unstable_by_key(|region| region.src_offset);

    let mut merged: Vec<vk::BufferCopy> = Vec::with_capacity(regions.len());
    for region in regions {
        if let Some(last) = merged.last_mut() {
            if last.src_offset + last.size == region.src_offset
                && last.dst_offset + last.size == region.dst_offset
            {
                last.size += region.size;
                continue;
            }
        }

        merged.push(region);
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const TEST_TIERS: [vk::DeviceSize; 3] = [64 << 10, 2 << 20, 32 << 20];

    fn host_factory() -> impl FnMut(vk::DeviceSize) -> Result<StagingMemory, DriverError> {
        |size| Ok(StagingMemory::host_backed(size))
    }

    #[test]
    pub fn tier_choice_small_first() {
        let manager = StagingManager::new();

        assert_eq!(manager.choose_tier(TEST_TIERS, 1024), TIER_SMALL);
        assert_eq!(manager.choose_tier(TEST_TIERS, 64 << 10), TIER_SMALL);
        assert_eq!(manager.choose_tier(TEST_TIERS, (64 << 10) + 1), TIER_MEDIUM);
        assert_eq!(manager.choose_tier(TEST_TIERS, 2 << 20), TIER_MEDIUM);
        assert_eq!(manager.choose_tier(TEST_TIERS, (2 << 20) + 1), TIER_LARGE);
        assert_eq!(manager.choose_tier(TEST_TIERS, 32 << 20), TIER_LARGE);
        assert_eq!(manager.choose_tier(TEST_TIERS, (32 << 20) + 1), TIER_SUPER);
    }

    #[test]
    pub fn tier_escalates_after_heavy_frame() {
        let mut manager = StagingManager::new();
        manager.current_frame_bytes = (64 << 10) + 1;
        manager.end_frame();

        // Last frame was bigger than the small tier: small is skipped
        assert_eq!(manager.choose_tier(TEST_TIERS, 1024), TIER_MEDIUM);
    }

    #[test]
    pub fn tier_small_handed_out_once_per_frame() {
        let mut manager = StagingManager::new();
        let mut new_memory = host_factory();

        let a = manager
            .staging_alloc(TEST_TIERS, vk::Buffer::null(), 0, 64 << 10, None, &mut new_memory)
            .unwrap();
        let _ = a;

        // The small memory is exhausted and the last-memory fast path cannot
        // serve the request, so the next allocation escalates to medium
        assert_eq!(manager.choose_tier(TEST_TIERS, 1024), TIER_MEDIUM);
    }

    #[test]
    pub fn last_memory_fast_path_packs() {
        let mut manager = StagingManager::new();
        let mut new_memory = host_factory();

        let a = manager
            .staging_alloc(TEST_TIERS, vk::Buffer::null(), 0, 1000, None, &mut new_memory)
            .unwrap();
        let b = manager
            .staging_alloc(TEST_TIERS, vk::Buffer::null(), 4096, 500, None, &mut new_memory)
            .unwrap();

        assert_eq!(manager.memory_of(a), manager.memory_of(b));
        assert_eq!(manager.memory_count(), 1);
        assert_eq!(manager.allocs[b].staging_offset, 1008, "bump is 16-byte aligned");
    }

    #[test]
    pub fn staging_recycle_within_frame() {
        let mut manager = StagingManager::new();
        let mut data = DataStorage::new();
        let mut new_memory = host_factory();

        // Write 16 KiB, submit, record, done
        let a = manager
            .staging_alloc(TEST_TIERS, vk::Buffer::null(), 0, 16 << 10, None, &mut new_memory)
            .unwrap();
        let first_memory = manager.memory_of(a);
        let staging_data = manager.acquire(a);
        manager.submit(staging_data);

        let record = manager.drain_for_test();
        manager.upload_done(TEST_TIERS, &record, &mut data);

        assert_eq!(manager.available_count(TIER_SMALL), 1);

        // An 8 KiB allocation in the same frame reuses the same small memory
        let b = manager
            .staging_alloc(TEST_TIERS, vk::Buffer::null(), 0, 8 << 10, None, &mut new_memory)
            .unwrap();

        assert_eq!(manager.memory_of(b), first_memory);
        assert_eq!(manager.memory_count(), 1);
    }

    #[test]
    pub fn submit_with_two_references() {
        let mut manager = StagingManager::new();
        let mut new_memory = host_factory();

        let alloc = manager
            .staging_alloc(TEST_TIERS, vk::Buffer::null(), 0, 64, None, &mut new_memory)
            .unwrap();
        let first = manager.acquire(alloc);
        let second = manager.acquire(alloc);

        manager.submit(first);
        assert!(manager.submitted.is_empty());

        manager.submit(second);
        assert_eq!(manager.submitted, vec![alloc]);
    }

    #[test]
    pub fn staged_bytes_round_trip() {
        let mut manager = StagingManager::new();
        let mut new_memory = host_factory();

        let alloc = manager
            .staging_alloc(TEST_TIERS, vk::Buffer::null(), 0, 8, None, &mut new_memory)
            .unwrap();
        let mut staging_data = manager.acquire(alloc);

        assert!(staging_data.need_init());

        staging_data.write(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let again = manager.acquire(alloc);
        assert!(!again.need_init());
        assert_eq!(
            unsafe { std::slice::from_raw_parts(again.ptr, 8) },
            &[1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    #[should_panic(expected = "FIFO order")]
    pub fn upload_done_out_of_order_is_a_bug() {
        let mut manager = StagingManager::new();
        let mut data = DataStorage::new();

        let first = manager.drain_for_test();
        let second = manager.drain_for_test();

        let _ = first;
        manager.upload_done(TEST_TIERS, &second, &mut data);
    }

    #[test]
    pub fn merge_copy_runs_fuses_adjacent() {
        let copy = |src_offset, dst_offset, size| vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        };

        let merged = merge_copy_runs(vec![copy(64, 1064, 32), copy(0, 1000, 64), copy(128, 2000, 8)]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].src_offset, 0);
        assert_eq!(merged[0].dst_offset, 1000);
        assert_eq!(merged[0].size, 96);
        assert_eq!(merged[1].src_offset, 128);
    }

    impl StagingManager {
        /// Test stand-in for `record_upload`: drains the submitted list
        /// without touching a command buffer.
        pub(crate) fn drain_for_test(&mut self) -> TransferRecord {
            let allocs = std::mem::take(&mut self.submitted);
            let bytes = allocs.iter().map(|alloc| self.allocs[*alloc].size).sum();
            self.current_frame_bytes += bytes;

            let id = self.next_transfer_id;
            self.next_transfer_id += 1;

            TransferRecord {
                allocs,
                bytes,
                extra_memories: vec![],
                id,
                image_uploads: vec![],
            }
        }
    }
}
