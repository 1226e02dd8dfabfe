//! Device-local data memories and the storage that suballocates them.
//!
//! A [`DataMemory`] is one device-local buffer managed by a circular arena;
//! [`DataStorage`] owns a list of them and serves allocations through a
//! three-step cascade (first memory, second memory, new memory). Allocating
//! returns a [`DataAllocation`]: a stable handle carrying the device address
//! and size of the range.
//!
//! CAD applications usually cannot size their GPU storage up front, and
//! reallocating multi-gigabyte buffers costs whole frames, so storage grows
//! in tiered chunks (64 KiB / 2 MiB / 32 MiB by default) and never moves an
//! existing memory.

use {
    crate::{
        arena::{CircularArena, RecordId},
        driver::{Buffer, BufferInfo, DriverError, device::Device},
        staging::{StagingAllocId, StagingData, StagingManager, StagingMemory},
    },
    ash::vk,
    log::trace,
    std::sync::Arc,
};

/// Records per allocation block inside a data memory's arena.
const DATA_RECORDS_PER_BLOCK: usize = 200;

/// Response returned by a relocation callback.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Relocation {
    /// The holder dropped its reference; the allocation is freed
    /// automatically.
    Released,

    /// The holder updated its copies of the device address and keeps the
    /// allocation.
    Retained,
}

/// Invoked when an allocation is moved or destroyed.
///
/// The argument is the new device address, or `None` when the allocation is
/// going away. Consumers whose device address is embedded in GPU-resident
/// structures pass no callback and accept the fragmentation cost instead.
pub type MoveCallback = Box<dyn FnMut(Option<vk::DeviceAddress>) -> Relocation>;

pub(crate) struct DataPayload {
    pub move_callback: Option<MoveCallback>,
    pub staging: Option<StagingAllocId>,
    pub staging_frame: u64,
}

impl std::fmt::Debug for DataPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPayload")
            .field("staging", &self.staging)
            .field("staging_frame", &self.staging_frame)
            .finish_non_exhaustive()
    }
}

/// Locates one live allocation record inside a [`DataStorage`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct DataRecordRef {
    pub memory: usize,
    pub record: RecordId,
}

/// Placement granularity for a data allocation of the given size.
///
/// Small records land on coarse grids (16/32/48/64/128) so the arena markers
/// advance in predictable strides; larger records use a 64-byte grid.
pub(crate) fn data_granularity(size: vk::DeviceSize) -> vk::DeviceSize {
    match size {
        0..=16 => 16,
        17..=32 => 32,
        33..=48 => 48,
        49..=64 => 64,
        65..=128 => 128,
        _ => 64,
    }
}

/// One device-local buffer plus its arena state.
///
/// The buffer is allocated at construction and never resized; when a storage
/// needs more space it allocates another `DataMemory`.
#[derive(Debug)]
pub struct DataMemory {
    arena: CircularArena<DataPayload, DATA_RECORDS_PER_BLOCK>,
    buffer: Option<Buffer>,
}

impl DataMemory {
    /// Attempts to create a data memory of the given size.
    ///
    /// Returns `None` when the driver refuses the buffer or its memory; the
    /// caller falls back to other memories or surfaces out-of-resources.
    #[profiling::function]
    pub fn try_create(device: &Arc<Device>, size: vk::DeviceSize) -> Option<Self> {
        trace!("try_create: {size} bytes");

        let buffer = Buffer::create(
            device,
            BufferInfo::device_mem(
                size,
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            ),
        )
        .ok()?;
        let device_address = Buffer::device_address(&buffer);

        Some(Self {
            arena: CircularArena::new(device_address, size),
            buffer: Some(buffer),
        })
    }

    /// A bufferless stand-in over a fake address range, used by GPU-free
    /// tests.
    #[cfg(test)]
    pub(crate) fn with_address_range(
        device_address: vk::DeviceAddress,
        size: vk::DeviceSize,
    ) -> Self {
        Self {
            arena: CircularArena::new(device_address, size),
            buffer: None,
        }
    }

    /// Base device address of the underlying buffer.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.arena.buffer_start()
    }

    /// Size in bytes of the underlying buffer.
    pub fn size(&self) -> vk::DeviceSize {
        self.arena.buffer_end() - self.arena.buffer_start()
    }

    /// Sum of the sizes of all live allocations.
    pub fn used_bytes(&self) -> vk::DeviceSize {
        self.arena.used_bytes()
    }

    pub(crate) fn vk_buffer(&self) -> vk::Buffer {
        self.buffer.as_ref().map(|buffer| **buffer).unwrap_or_default()
    }

    pub(crate) fn alloc(
        &mut self,
        num_bytes: vk::DeviceSize,
    ) -> Option<(RecordId, vk::DeviceAddress)> {
        self.arena.alloc(
            num_bytes,
            data_granularity(num_bytes),
            DataPayload {
                move_callback: None,
                staging: None,
                staging_frame: 0,
            },
        )
    }

    pub(crate) fn arena(&self) -> &CircularArena<DataPayload, DATA_RECORDS_PER_BLOCK> {
        &self.arena
    }

    pub(crate) fn arena_mut(&mut self) -> &mut CircularArena<DataPayload, DATA_RECORDS_PER_BLOCK> {
        &mut self.arena
    }
}

/// A contiguous byte range inside a [`DataMemory`].
///
/// The handle is owned and non-clonable; dropping it without freeing leaks
/// the range until the storage is torn down. The zero-size allocation is a
/// shared null object: every zero-byte request returns it and freeing it is
/// a no-op.
#[derive(Debug)]
pub struct DataAllocation {
    device_address: vk::DeviceAddress,
    memory: usize,
    record: Option<RecordId>,
    size: vk::DeviceSize,
}

impl DataAllocation {
    /// The shared zero-size allocation.
    pub const fn null() -> Self {
        Self {
            device_address: 0,
            memory: usize::MAX,
            record: None,
            size: 0,
        }
    }

    /// Device address of the first byte of the range.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Returns `true` for the shared zero-size allocation.
    pub fn is_null(&self) -> bool {
        self.record.is_none()
    }

    /// Size in bytes of the range.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub(crate) fn record_ref(&self) -> Option<DataRecordRef> {
        self.record.map(|record| DataRecordRef {
            memory: self.memory,
            record,
        })
    }
}

/// Pools of device-local buffers for opaque data blobs.
#[derive(Debug, Default)]
pub struct DataStorage {
    first_alloc: Option<usize>,
    memories: Vec<DataMemory>,
    second_alloc: Option<usize>,
}

impl DataStorage {
    /// Creates an empty storage; memories are created on demand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrows a data memory by index.
    pub(crate) fn memory(&self, idx: usize) -> &DataMemory {
        &self.memories[idx]
    }

    pub(crate) fn memory_mut(&mut self, idx: usize) -> &mut DataMemory {
        &mut self.memories[idx]
    }

    /// Number of data memories created so far.
    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }

    /// Sum of live allocation sizes across all memories.
    pub fn used_bytes(&self) -> vk::DeviceSize {
        self.memories.iter().map(DataMemory::used_bytes).sum()
    }

    /// Returns `true` when every memory's allocation-block lists are empty.
    pub fn is_empty(&self) -> bool {
        self.memories.iter().all(|memory| memory.arena.is_empty())
    }

    /// The first/second/new-memory allocation cascade.
    ///
    /// The first memory is sized by the small tier, the second by the medium
    /// tier; once both refuse, the first is retired in favor of the second
    /// and a fresh large-tier memory becomes the new second. Requests larger
    /// than the large tier get a memory of their own size.
    #[profiling::function]
    pub(crate) fn alloc_record(
        &mut self,
        num_bytes: vk::DeviceSize,
        tiers: [vk::DeviceSize; 3],
        new_memory: &mut dyn FnMut(vk::DeviceSize) -> Option<DataMemory>,
    ) -> Result<(usize, RecordId, vk::DeviceAddress), DriverError> {
        debug_assert_ne!(num_bytes, 0);

        if self.first_alloc.is_none() {
            let size = if num_bytes < tiers[0] {
                tiers[0]
            } else if num_bytes < tiers[1] {
                tiers[1]
            } else {
                num_bytes.max(tiers[2])
            };
            let memory = new_memory(size).ok_or(DriverError::OutOfMemory)?;

            self.memories.push(memory);
            self.first_alloc = Some(self.memories.len() - 1);
        }

        let first = self.first_alloc.unwrap();
        if let Some((record, address)) = self.memories[first].alloc(num_bytes) {
            return Ok((first, record, address));
        }

        if self.second_alloc.is_none() {
            let size = if num_bytes < tiers[1] {
                tiers[1]
            } else {
                num_bytes.max(tiers[2])
            };
            let memory = new_memory(size).ok_or(DriverError::OutOfMemory)?;

            self.memories.push(memory);
            self.second_alloc = Some(self.memories.len() - 1);
        }

        let second = self.second_alloc.unwrap();
        if let Some((record, address)) = self.memories[second].alloc(num_bytes) {
            return Ok((second, record, address));
        }

        // The first memory is full and the second is almost full: retire the
        // first, promote the second and start a fresh memory
        let size = num_bytes.max(tiers[2]);
        let memory = new_memory(size).ok_or(DriverError::OutOfMemory)?;

        self.memories.push(memory);
        let idx = self.memories.len() - 1;
        self.first_alloc = self.second_alloc;
        self.second_alloc = Some(idx);

        self.memories[idx]
            .alloc(num_bytes)
            .map(|(record, address)| (idx, record, address))
            .ok_or(DriverError::OutOfMemory)
    }

    /// Frees one record, detaching any staging still bound to it.
    pub(crate) fn free_record(
        &mut self,
        memory: usize,
        record: RecordId,
        staging: &mut StagingManager,
    ) {
        let payload = self.memories[memory].arena.free(record);

        if let Some(alloc) = payload.staging {
            staging.on_owner_freed(alloc);
        }
    }

    /// Clears a record's staging link once the copy into it has completed.
    pub(crate) fn detach_staging(&mut self, owner: DataRecordRef, alloc: StagingAllocId) {
        if let Some(record) = self.memories.get_mut(owner.memory).and_then(|memory| {
            memory.arena.record_mut(owner.record)
        }) {
            if let Some(payload) = record.payload.as_mut() {
                if payload.staging == Some(alloc) {
                    payload.staging = None;
                }
            }
        }
    }

    /// Notifies every live allocation's relocation callback that its memory
    /// is going away, then drops all records.
    ///
    /// Consumers without a callback simply lose their ranges; this is called
    /// at storage shutdown when nothing references the device addresses any
    /// more.
    #[profiling::function]
    pub fn cancel_all_allocations(&mut self, staging: &mut StagingManager) {
        for memory in &mut self.memories {
            let mut doomed = vec![];

            memory.arena.for_each_live(|id, record| {
                if let Some(payload) = record.payload.as_mut() {
                    if let Some(move_callback) = payload.move_callback.as_mut() {
                        // The response is necessarily Released: the range no
                        // longer exists
                        let _ = move_callback(None);
                    }
                }

                doomed.push(id);
            });

            for id in doomed {
                let payload = memory.arena.free(id);

                if let Some(alloc) = payload.staging {
                    staging.on_owner_freed(alloc);
                }
            }
        }
    }

    /// Installs a relocation callback on a live allocation.
    pub(crate) fn set_move_callback(
        &mut self,
        owner: DataRecordRef,
        move_callback: Option<MoveCallback>,
    ) {
        if let Some(payload) = self.memories[owner.memory]
            .arena
            .record_mut(owner.record)
            .and_then(|record| record.payload.as_mut())
        {
            payload.move_callback = move_callback;
        }
    }
}

/// Borrowed context for allocation and staging operations.
///
/// The storages hold no back-references to the renderer, the device or each
/// other; instead the renderer splits its fields into this bundle per
/// operation. The memory factories create device-backed memories in
/// production and host-backed ones in tests.
pub struct UploadCtx<'a> {
    data: &'a mut DataStorage,
    frame: u64,
    new_data_memory: Box<dyn FnMut(vk::DeviceSize) -> Option<DataMemory> + 'a>,
    new_staging_memory: Box<dyn FnMut(vk::DeviceSize) -> Result<StagingMemory, DriverError> + 'a>,
    staging: &'a mut StagingManager,
    tiers: [vk::DeviceSize; 3],
}

impl<'a> UploadCtx<'a> {
    pub(crate) fn new(
        data: &'a mut DataStorage,
        staging: &'a mut StagingManager,
        frame: u64,
        tiers: [vk::DeviceSize; 3],
        new_data_memory: Box<dyn FnMut(vk::DeviceSize) -> Option<DataMemory> + 'a>,
        new_staging_memory: Box<dyn FnMut(vk::DeviceSize) -> Result<StagingMemory, DriverError> + 'a>,
    ) -> Self {
        Self {
            data,
            frame,
            new_data_memory,
            new_staging_memory,
            staging,
            tiers,
        }
    }

    /// The current frame number.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Allocates `num_bytes` of device-local data and attaches a fresh
    /// staging range to it.
    ///
    /// A zero-byte request returns the shared zero-size allocation. On any
    /// failure after space was reserved, the reservation is unwound so the
    /// caller observes the pre-call state.
    #[profiling::function]
    pub fn alloc(&mut self, num_bytes: vk::DeviceSize) -> Result<DataAllocation, DriverError> {
        if num_bytes == 0 {
            return Ok(DataAllocation::null());
        }

        let (memory, record, device_address) =
            self.data
                .alloc_record(num_bytes, self.tiers, &mut self.new_data_memory)?;

        let dst_buffer = self.data.memory(memory).vk_buffer();
        let dst_offset = device_address - self.data.memory(memory).device_address();
        let owner = DataRecordRef { memory, record };

        match self.staging.staging_alloc(
            self.tiers,
            dst_buffer,
            dst_offset,
            num_bytes,
            Some(owner),
            &mut self.new_staging_memory,
        ) {
            Ok(alloc) => {
                let payload = self.data.memory_mut(memory).arena_mut().record_mut(record);
                let payload = payload.and_then(|record| record.payload.as_mut()).unwrap();
                payload.staging = Some(alloc);
                payload.staging_frame = self.frame;

                Ok(DataAllocation {
                    device_address,
                    memory,
                    record: Some(record),
                    size: num_bytes,
                })
            }
            Err(err) => {
                self.data.free_record(memory, record, self.staging);

                Err(err)
            }
        }
    }

    /// Reallocates to `num_bytes`: a new range with fresh staging and the
    /// same handle semantics; the old range is freed only on success.
    pub fn realloc(
        &mut self,
        allocation: &mut DataAllocation,
        num_bytes: vk::DeviceSize,
    ) -> Result<(), DriverError> {
        if num_bytes == 0 {
            let old = std::mem::replace(allocation, DataAllocation::null());
            self.free(old);

            return Ok(());
        }

        let new = self.alloc(num_bytes)?;
        let old = std::mem::replace(allocation, new);
        self.free(old);

        Ok(())
    }

    /// Frees an allocation. Freeing the zero-size allocation is a no-op.
    pub fn free(&mut self, allocation: DataAllocation) {
        if let Some(owner) = allocation.record_ref() {
            self.data.free_record(owner.memory, owner.record, self.staging);
        }
    }

    /// Returns writable staging bytes bound for the allocation.
    ///
    /// If staging is already attached the same bytes are returned again and
    /// [`StagingData::need_init`] is `false`; otherwise fresh staging is
    /// attached and the caller must supply all of the data.
    #[profiling::function]
    pub fn create_staging_data(
        &mut self,
        allocation: &DataAllocation,
    ) -> Result<StagingData, DriverError> {
        let owner = allocation
            .record_ref()
            .expect("zero-size allocations cannot be staged");
        let payload_staging = self.data.memory(owner.memory).arena()
            .record(owner.record)
            .and_then(|record| record.payload.as_ref())
            .and_then(|payload| payload.staging);

        if let Some(alloc) = payload_staging {
            return Ok(self.staging.acquire(alloc));
        }

        let memory = self.data.memory(owner.memory);
        let dst_buffer = memory.vk_buffer();
        let dst_offset = allocation.device_address() - memory.device_address();
        let alloc = self.staging.staging_alloc(
            self.tiers,
            dst_buffer,
            dst_offset,
            allocation.size(),
            Some(owner),
            &mut self.new_staging_memory,
        )?;

        let payload = self
            .data
            .memory_mut(owner.memory)
            .arena_mut()
            .record_mut(owner.record)
            .and_then(|record| record.payload.as_mut())
            .unwrap();
        payload.staging = Some(alloc);
        payload.staging_frame = self.frame;

        Ok(self.staging.acquire(alloc))
    }

    /// Installs a relocation callback on a live allocation.
    pub fn set_move_callback(
        &mut self,
        allocation: &DataAllocation,
        move_callback: Option<MoveCallback>,
    ) {
        if let Some(owner) = allocation.record_ref() {
            self.data.set_move_callback(owner, move_callback);
        }
    }

    /// Reserves one-shot staging bytes bound for an arbitrary buffer range,
    /// e.g. a geometry memory subregion.
    pub(crate) fn stage_buffer(
        &mut self,
        dst_buffer: vk::Buffer,
        dst_offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<StagingData, DriverError> {
        let alloc = self.staging.staging_alloc(
            self.tiers,
            dst_buffer,
            dst_offset,
            size,
            None,
            &mut self.new_staging_memory,
        )?;

        Ok(self.staging.acquire(alloc))
    }

    /// Releases one staging reference; at zero references the bytes join the
    /// next recorded upload.
    pub fn submit(&mut self, staging_data: StagingData) {
        self.staging.submit(staging_data);
    }

    /// Convenience: stage, copy and submit `bytes` into the allocation.
    pub fn upload(
        &mut self,
        allocation: &DataAllocation,
        bytes: &[u8],
    ) -> Result<(), DriverError> {
        debug_assert!(bytes.len() as vk::DeviceSize <= allocation.size());

        let mut staging_data = self.create_staging_data(allocation)?;
        staging_data.write(bytes);
        self.submit(staging_data);

        Ok(())
    }

}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const TEST_TIERS: [vk::DeviceSize; 3] = [1 << 16, 1 << 20, 4 << 20];
    const BASE: vk::DeviceAddress = 0x10_0000;

    /// Hands out fake device address ranges far enough apart to never
    /// overlap.
    pub fn test_memory_factory(
    ) -> impl FnMut(vk::DeviceSize) -> Option<DataMemory> {
        let mut next_base = BASE;

        move |size| {
            let base = next_base;
            next_base += size.next_power_of_two().max(1 << 24);

            Some(DataMemory::with_address_range(base, size))
        }
    }

    pub fn test_ctx<'a>(
        data: &'a mut DataStorage,
        staging: &'a mut StagingManager,
        frame: u64,
    ) -> UploadCtx<'a> {
        UploadCtx::new(
            data,
            staging,
            frame,
            TEST_TIERS,
            Box::new(test_memory_factory()),
            Box::new(|size| Ok(StagingMemory::host_backed(size))),
        )
    }

    #[test]
    pub fn granularity_table() {
        assert_eq!(data_granularity(1), 16);
        assert_eq!(data_granularity(16), 16);
        assert_eq!(data_granularity(17), 32);
        assert_eq!(data_granularity(32), 32);
        assert_eq!(data_granularity(33), 48);
        assert_eq!(data_granularity(48), 48);
        assert_eq!(data_granularity(49), 64);
        assert_eq!(data_granularity(64), 64);
        assert_eq!(data_granularity(65), 128);
        assert_eq!(data_granularity(128), 128);
        assert_eq!(data_granularity(129), 64);
    }

    #[test]
    pub fn allocation_strides_match_granularity() {
        // The second of two equal-size allocations sits at a well-known
        // stride from the first
        for size in 1..260u64 {
            let mut memory = DataMemory::with_address_range(BASE, 1 << 16);
            let (a, a_addr) = memory.alloc(size).unwrap();
            let (b, b_addr) = memory.alloc(size).unwrap();

            let expected = if size <= 16 {
                16
            } else if size <= 32 {
                32
            } else if size <= 48 {
                48
            } else if size <= 64 {
                64
            } else if size <= 128 {
                128
            } else {
                (size + 63) & !63
            };

            assert_eq!(a_addr, BASE, "size {size}");
            assert_eq!(b_addr - a_addr, expected, "size {size}");

            memory.arena_mut().free(a);
            memory.arena_mut().free(b);
            assert!(memory.arena().is_empty());
            assert_eq!(memory.used_bytes(), 0);
        }
    }

    #[test]
    pub fn zero_size_alloc_is_null_object() {
        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();
        let mut ctx = test_ctx(&mut data, &mut staging, 0);

        let a = ctx.alloc(0).unwrap();
        let b = ctx.alloc(0).unwrap();

        assert!(a.is_null());
        assert!(b.is_null());
        assert_eq!(a.device_address(), 0);
        assert_eq!(a.size(), 0);

        // Repeated free of the null object is a no-op
        ctx.free(a);
        ctx.free(b);
        assert_eq!(data.memory_count(), 0);
    }

    #[test]
    pub fn cascade_first_second_new() {
        let mut data = DataStorage::new();
        let tiers: [vk::DeviceSize; 3] = [256, 512, 1024];
        let mut created = vec![];
        let mut next_base = BASE;
        let mut new_memory = |size: vk::DeviceSize| {
            created.push(size);
            let base = next_base;
            next_base += 1 << 24;
            Some(DataMemory::with_address_range(base, size))
        };

        // First allocation creates the small-tier memory
        let a = data.alloc_record(64, tiers, &mut new_memory).unwrap();
        assert_eq!(a.0, 0);

        // Fill the first memory, forcing the medium-tier second
        let mut records = vec![];
        loop {
            let (idx, record, _) = data.alloc_record(64, tiers, &mut new_memory).unwrap();
            if idx != 0 {
                records.push((idx, record));
                break;
            }
        }
        assert_eq!(records[0].0, 1);

        // Fill the second as well; the next allocation retires the first and
        // mints a large-tier memory
        loop {
            let (idx, _, _) = data.alloc_record(64, tiers, &mut new_memory).unwrap();
            if idx == 2 {
                break;
            }
        }

        drop(new_memory);
        assert_eq!(created, vec![256, 512, 1024]);
    }

    #[test]
    pub fn super_size_request_succeeds() {
        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();
        let mut ctx = test_ctx(&mut data, &mut staging, 0);

        // Larger than the large tier: gets a memory of its own size
        let size = TEST_TIERS[2] * 2;
        let allocation = ctx.alloc(size).unwrap();

        assert_eq!(allocation.size(), size);
        assert_eq!(data.memory_count(), 1);
        assert_eq!(data.memory(0).size(), size);

        ctx.free(allocation);
        assert!(data.is_empty());
    }

    #[test]
    pub fn alloc_attaches_staging_and_upload_detaches() {
        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();

        let allocation = {
            let mut ctx = test_ctx(&mut data, &mut staging, 0);
            let allocation = ctx.alloc(1024).unwrap();
            let mut staging_data = ctx.create_staging_data(&allocation).unwrap();

            // Staging was attached by alloc; the first write must supply all
            // of the data
            assert!(staging_data.need_init());

            staging_data.write(&[7; 1024]);
            ctx.submit(staging_data);

            allocation
        };

        let record = staging.drain_for_test();
        assert_eq!(record.bytes_transferred(), 1024);

        staging.upload_done(TEST_TIERS, &record, &mut data);

        // Staging has been detached: the next write needs full init
        let mut ctx = test_ctx(&mut data, &mut staging, 1);
        let staging_data = ctx.create_staging_data(&allocation).unwrap();
        assert!(staging_data.need_init());
    }

    #[test]
    pub fn realloc_preserves_old_on_failure() {
        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();
        let mut allocation = {
            let mut ctx = test_ctx(&mut data, &mut staging, 0);
            ctx.alloc(64).unwrap()
        };
        let old_address = allocation.device_address();

        {
            // A context whose memory factory always fails
            let mut ctx = UploadCtx::new(
                &mut data,
                &mut staging,
                0,
                [16, 16, 16],
                Box::new(|_| None),
                Box::new(|size| Ok(StagingMemory::host_backed(size))),
            );

            // Bigger than every existing memory can serve
            let err = ctx.realloc(&mut allocation, 1 << 30).unwrap_err();
            assert_eq!(err, DriverError::OutOfMemory);
        }

        assert_eq!(allocation.device_address(), old_address);
        assert_eq!(allocation.size(), 64);
        assert_eq!(data.used_bytes(), 64);
    }

    #[test]
    pub fn alloc_free_drains_storage() {
        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();
        let mut ctx = test_ctx(&mut data, &mut staging, 0);

        let mut allocations = vec![];
        let mut prev = 0;
        for _ in 0..1000 {
            let allocation = ctx.alloc(1).unwrap();

            assert_eq!(allocation.device_address() % 16, 0);
            assert!(allocation.device_address() > prev);
            prev = allocation.device_address();

            allocations.push(allocation);
        }

        for allocation in allocations {
            ctx.free(allocation);
        }

        assert_eq!(data.used_bytes(), 0);
        assert!(data.is_empty());
    }

    #[test]
    pub fn cancel_all_notifies_callbacks() {
        use std::{cell::Cell, rc::Rc};

        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();
        let called = Rc::new(Cell::new(false));

        {
            let mut ctx = test_ctx(&mut data, &mut staging, 0);
            let allocation = ctx.alloc(64).unwrap();
            let called = Rc::clone(&called);

            ctx.set_move_callback(
                &allocation,
                Some(Box::new(move |new_address| {
                    assert!(new_address.is_none());
                    called.set(true);

                    Relocation::Released
                })),
            );

            // Intentionally not freed; cancel_all_allocations reclaims it
            drop(allocation);
        }

        data.cancel_all_allocations(&mut staging);

        assert!(called.get());
        assert!(data.is_empty());
    }
}
