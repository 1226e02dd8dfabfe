//! Geometry storage: vertex, index and primitive-set suballocation keyed by
//! attribute layout.
//!
//! All geometries sharing one [`AttribSizeList`] share [`GeometryMemory`]
//! instances. Each memory is a single buffer partitioned into one subregion
//! per vertex attribute, an index subregion and a primitive-set subregion,
//! separated by the device's standard buffer alignment. The three subregions
//! are managed by independent array allocation managers keyed by 32-bit ids,
//! with id 0 reserved as the zero-size null item.

use {
    crate::{
        data::UploadCtx,
        driver::{Buffer, BufferInfo, DriverError, device::Device},
        graph::DrawableId,
        primitive_set::PrimitiveSetGpuData,
        staging::StagingData,
    },
    ash::vk,
    log::trace,
    std::{cell::RefCell, rc::Rc, sync::Arc},
};

/// Per-vertex byte counts, one entry per attribute slot.
///
/// A zero entry keeps the slot's position without consuming space, e.g.
/// `[12, 0, 16]` for position + unused slot + color. Geometries can only
/// share a memory when their size lists are equal.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct AttribSizeList(Vec<u32>);

impl AttribSizeList {
    /// Number of attribute slots.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when there are no attribute slots.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Byte size of one whole vertex.
    pub fn vertex_size(&self) -> u32 {
        self.0.iter().sum()
    }

    /// Byte size of the attribute in `slot`.
    pub fn attrib_size(&self, slot: usize) -> u32 {
        self.0[slot]
    }

    /// Iterates the per-attribute byte counts.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }
}

impl From<&[u32]> for AttribSizeList {
    fn from(sizes: &[u32]) -> Self {
        Self(sizes.to_vec())
    }
}

impl<const N: usize> From<[u32; N]> for AttribSizeList {
    fn from(sizes: [u32; N]) -> Self {
        Self(sizes.to_vec())
    }
}

impl From<Vec<u32>> for AttribSizeList {
    fn from(sizes: Vec<u32>) -> Self {
        Self(sizes)
    }
}

/// One contiguous range of items inside a geometry memory subregion.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArrayAllocation {
    /// First item of the range.
    pub start_index: u32,

    /// Item count of the range.
    pub num_items: u32,
}

#[derive(Clone, Copy, Debug)]
struct ArraySlot {
    live: bool,
    range: ArrayAllocation,
}

/// Range allocator over a fixed item capacity: bump allocation with a
/// first-fit free-gap list. Ids are dense and recycled; id 0 is the shared
/// zero-size null item.
#[derive(Debug)]
pub(crate) struct ArrayAllocationManager {
    allocated: u32,
    capacity: u32,
    cursor: u32,
    free_ids: Vec<u32>,
    gaps: Vec<ArrayAllocation>,
    slots: Vec<ArraySlot>,
}

impl ArrayAllocationManager {
    pub fn new(capacity: u32) -> Self {
        Self {
            allocated: 0,
            capacity,
            cursor: 0,
            free_ids: vec![],
            gaps: vec![],
            // The null item occupies id 0
            slots: vec![ArraySlot {
                live: true,
                range: ArrayAllocation::default(),
            }],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Total items currently allocated.
    pub fn allocated(&self) -> u32 {
        self.allocated
    }

    pub fn allocation(&self, id: u32) -> ArrayAllocation {
        let slot = &self.slots[id as usize];
        debug_assert!(slot.live);

        slot.range
    }

    pub fn can_alloc(&self, num_items: u32) -> bool {
        num_items == 0
            || self.capacity - self.cursor >= num_items
            || self.gaps.iter().any(|gap| gap.num_items >= num_items)
    }

    /// Allocates a range of `num_items`; zero items returns the null id.
    pub fn alloc(&mut self, num_items: u32) -> Option<u32> {
        if num_items == 0 {
            return Some(0);
        }

        let start_index = if let Some(idx) = self
            .gaps
            .iter()
            .position(|gap| gap.num_items >= num_items)
        {
            let gap = &mut self.gaps[idx];
            let start = gap.start_index;

            gap.start_index += num_items;
            gap.num_items -= num_items;
            if gap.num_items == 0 {
                self.gaps.remove(idx);
            }

            start
        } else if self.capacity - self.cursor >= num_items {
            let start = self.cursor;
            self.cursor += num_items;

            start
        } else {
            return None;
        };

        self.allocated += num_items;

        let slot = ArraySlot {
            live: true,
            range: ArrayAllocation {
                start_index,
                num_items,
            },
        };

        Some(if let Some(id) = self.free_ids.pop() {
            self.slots[id as usize] = slot;
            id
        } else {
            self.slots.push(slot);
            self.slots.len() as u32 - 1
        })
    }

    /// Frees a range; freeing the null id is a no-op.
    pub fn free(&mut self, id: u32) {
        if id == 0 {
            return;
        }

        let slot = &mut self.slots[id as usize];
        debug_assert!(slot.live, "double free of array allocation {id}");

        slot.live = false;
        let range = slot.range;
        self.allocated -= range.num_items;
        self.free_ids.push(id);

        if range.num_items > 0 {
            self.insert_gap(range);
        }
    }

    /// Returns `true` when the range can change to `num_items` without
    /// moving.
    pub fn can_resize(&self, id: u32, num_items: u32) -> bool {
        if id == 0 {
            return num_items == 0;
        }

        let range = self.allocation(id);
        if num_items <= range.num_items {
            return true;
        }

        let grow = num_items - range.num_items;
        let end = range.start_index + range.num_items;

        if end == self.cursor {
            return self.capacity - self.cursor >= grow;
        }

        self.gaps
            .iter()
            .any(|gap| gap.start_index == end && gap.num_items >= grow)
    }

    /// Resizes the range in place. Shrinking always succeeds; growing
    /// consumes the gap (or bump space) directly after the range.
    pub fn resize(&mut self, id: u32, num_items: u32) -> bool {
        if id == 0 {
            return num_items == 0;
        }

        let range = self.allocation(id);
        let end = range.start_index + range.num_items;

        if num_items < range.num_items {
            let shrink = range.num_items - num_items;

            self.slots[id as usize].range.num_items = num_items;
            self.allocated -= shrink;
            self.insert_gap(ArrayAllocation {
                start_index: range.start_index + num_items,
                num_items: shrink,
            });

            return true;
        }

        if num_items == range.num_items {
            return true;
        }

        let grow = num_items - range.num_items;

        if end == self.cursor && self.capacity - self.cursor >= grow {
            self.cursor += grow;
        } else if let Some(idx) = self
            .gaps
            .iter()
            .position(|gap| gap.start_index == end && gap.num_items >= grow)
        {
            let gap = &mut self.gaps[idx];

            gap.start_index += grow;
            gap.num_items -= grow;
            if gap.num_items == 0 {
                self.gaps.remove(idx);
            }
        } else {
            return false;
        }

        self.slots[id as usize].range.num_items = num_items;
        self.allocated += grow;

        true
    }

    fn insert_gap(&mut self, mut gap: ArrayAllocation) {
        // Reclaim bump space directly
        if gap.start_index + gap.num_items == self.cursor {
            self.cursor = gap.start_index;
            self.coalesce_tail();

            return;
        }

        let idx = self
            .gaps
            .partition_point(|existing| existing.start_index < gap.start_index);

        // Merge with the gap before and/or after
        if idx > 0 {
            let before = self.gaps[idx - 1];
            if before.start_index + before.num_items == gap.start_index {
                gap.start_index = before.start_index;
                gap.num_items += before.num_items;
                self.gaps.remove(idx - 1);

                return self.insert_gap(gap);
            }
        }

        if idx < self.gaps.len() {
            let after = self.gaps[idx];
            if gap.start_index + gap.num_items == after.start_index {
                gap.num_items += after.num_items;
                self.gaps.remove(idx);

                return self.insert_gap(gap);
            }
        }

        self.gaps.insert(idx, gap);
    }

    fn coalesce_tail(&mut self) {
        while let Some(last) = self.gaps.last() {
            if last.start_index + last.num_items == self.cursor {
                self.cursor = last.start_index;
                self.gaps.pop();
            } else {
                break;
            }
        }
    }
}

/// Byte layout of a geometry memory: one offset per attribute subregion,
/// the index subregion offset, the primitive-set subregion offset and the
/// total size. Subregions are separated by `alignment` padding.
pub(crate) fn geometry_memory_layout(
    attribs: &AttribSizeList,
    vertex_capacity: u32,
    index_capacity: u32,
    primitive_set_capacity: u32,
    alignment: vk::DeviceSize,
) -> (Vec<vk::DeviceSize>, vk::DeviceSize, vk::DeviceSize, vk::DeviceSize) {
    let align = |offset: vk::DeviceSize| offset.div_ceil(alignment) * alignment;

    let mut offset = 0;
    let mut attrib_offsets = Vec::with_capacity(attribs.len());
    for attrib_size in attribs.iter() {
        attrib_offsets.push(offset);
        offset = align(offset + attrib_size as vk::DeviceSize * vertex_capacity as vk::DeviceSize);
    }

    let index_offset = offset;
    offset = align(offset + 4 * index_capacity as vk::DeviceSize);

    let primitive_set_offset = offset;
    let size = offset
        + PrimitiveSetGpuData::SIZE as vk::DeviceSize * primitive_set_capacity as vk::DeviceSize;

    (attrib_offsets, index_offset, primitive_set_offset, size)
}

/// New memory capacities when every existing memory refused an allocation:
/// twice the existing totals plus the request, floored so a newly minted
/// memory serving a small scene fits within a single 64 KiB GPU memory page.
pub(crate) fn grown_capacities(
    totals: (u32, u32, u32),
    requested: (u32, u32, u32),
) -> (u32, u32, u32) {
    let mut vertex_capacity = 2 * (totals.0 + requested.0);
    let mut index_capacity = 2 * (totals.1 + requested.1);
    let mut primitive_set_capacity = 2 * (totals.2 + requested.2);

    if vertex_capacity < 1024 {
        vertex_capacity = 1024;
    }
    if index_capacity < 6 * 1024 {
        index_capacity = 6 * 1024;
    }
    if primitive_set_capacity < 128 {
        primitive_set_capacity = 128;
    }

    (vertex_capacity, index_capacity, primitive_set_capacity)
}

/// One device-local buffer storing co-located vertex, index and
/// primitive-set regions for a fixed attribute size list.
///
/// The buffer is allocated at construction and never resized; a storage
/// needing more space allocates another `GeometryMemory`.
#[derive(Debug)]
pub struct GeometryMemory {
    attrib_offsets: Vec<vk::DeviceSize>,
    buffer: Option<Buffer>,
    device_address: vk::DeviceAddress,
    id: u32,
    index_manager: ArrayAllocationManager,
    index_offset: vk::DeviceSize,
    primitive_set_manager: ArrayAllocationManager,
    primitive_set_offset: vk::DeviceSize,
    size: vk::DeviceSize,
    vertex_manager: ArrayAllocationManager,
}

impl GeometryMemory {
    /// Creates a geometry memory with the given capacities.
    #[profiling::function]
    pub fn create(
        device: &Arc<Device>,
        attribs: &AttribSizeList,
        vertex_capacity: u32,
        index_capacity: u32,
        primitive_set_capacity: u32,
        id: u32,
    ) -> Result<Self, DriverError> {
        let alignment = Device::standard_buffer_alignment(device);
        let (attrib_offsets, index_offset, primitive_set_offset, size) = geometry_memory_layout(
            attribs,
            vertex_capacity,
            index_capacity,
            primitive_set_capacity,
            alignment,
        );

        trace!("create: {size} bytes for {vertex_capacity} vertices");

        let (buffer, device_address) = if size > 0 {
            let buffer = Buffer::create(
                device,
                BufferInfo::device_mem(
                    size,
                    vk::BufferUsageFlags::VERTEX_BUFFER
                        | vk::BufferUsageFlags::INDEX_BUFFER
                        | vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                        | vk::BufferUsageFlags::TRANSFER_SRC
                        | vk::BufferUsageFlags::TRANSFER_DST,
                ),
            )?;
            let device_address = Buffer::device_address(&buffer);

            (Some(buffer), device_address)
        } else {
            (None, 0)
        };

        Ok(Self {
            attrib_offsets,
            buffer,
            device_address,
            id,
            index_manager: ArrayAllocationManager::new(index_capacity),
            index_offset,
            primitive_set_manager: ArrayAllocationManager::new(primitive_set_capacity),
            primitive_set_offset,
            size,
            vertex_manager: ArrayAllocationManager::new(vertex_capacity),
        })
    }

    /// A bufferless stand-in over a fake address range, used by GPU-free
    /// tests.
    #[cfg(test)]
    pub(crate) fn unbacked(
        attribs: &AttribSizeList,
        vertex_capacity: u32,
        index_capacity: u32,
        primitive_set_capacity: u32,
        id: u32,
        device_address: vk::DeviceAddress,
    ) -> Self {
        let (attrib_offsets, index_offset, primitive_set_offset, size) =
            geometry_memory_layout(attribs, vertex_capacity, index_capacity, primitive_set_capacity, 16);

        Self {
            attrib_offsets,
            buffer: None,
            device_address,
            id,
            index_manager: ArrayAllocationManager::new(index_capacity),
            index_offset,
            primitive_set_manager: ArrayAllocationManager::new(primitive_set_capacity),
            primitive_set_offset,
            size,
            vertex_manager: ArrayAllocationManager::new(vertex_capacity),
        }
    }

    /// Base device address of the underlying buffer.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.device_address
    }

    /// Unique id minted by the owning storage.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Byte offset of the attribute subregion in `slot`.
    pub fn attrib_offset(&self, slot: usize) -> vk::DeviceSize {
        self.attrib_offsets[slot]
    }

    /// Byte offset of the index subregion.
    pub fn index_offset(&self) -> vk::DeviceSize {
        self.index_offset
    }

    /// Byte offset of the primitive-set subregion.
    pub fn primitive_set_offset(&self) -> vk::DeviceSize {
        self.primitive_set_offset
    }

    /// Total buffer size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub(crate) fn vk_buffer(&self) -> vk::Buffer {
        self.buffer.as_ref().map(|buffer| **buffer).unwrap_or_default()
    }

    fn try_alloc(&mut self, nv: u32, ni: u32, nps: u32) -> Option<(u32, u32, u32)> {
        if !self.vertex_manager.can_alloc(nv)
            || !self.index_manager.can_alloc(ni)
            || !self.primitive_set_manager.can_alloc(nps)
        {
            return None;
        }

        let vertex_id = self.vertex_manager.alloc(nv)?;
        let index_id = self.index_manager.alloc(ni)?;
        let primitive_set_id = self.primitive_set_manager.alloc(nps)?;

        Some((vertex_id, index_id, primitive_set_id))
    }

    fn try_resize(&mut self, ids: (u32, u32, u32), nv: u32, ni: u32, nps: u32) -> bool {
        if !self.vertex_manager.can_resize(ids.0, nv)
            || !self.index_manager.can_resize(ids.1, ni)
            || !self.primitive_set_manager.can_resize(ids.2, nps)
        {
            return false;
        }

        let resized = self.vertex_manager.resize(ids.0, nv)
            && self.index_manager.resize(ids.1, ni)
            && self.primitive_set_manager.resize(ids.2, nps);
        debug_assert!(resized);

        resized
    }

    fn free(&mut self, ids: (u32, u32, u32)) {
        self.vertex_manager.free(ids.0);
        self.index_manager.free(ids.1);
        self.primitive_set_manager.free(ids.2);
    }

    pub(crate) fn vertex_allocation(&self, id: u32) -> ArrayAllocation {
        self.vertex_manager.allocation(id)
    }

    pub(crate) fn index_allocation(&self, id: u32) -> ArrayAllocation {
        self.index_manager.allocation(id)
    }

    pub(crate) fn primitive_set_allocation(&self, id: u32) -> ArrayAllocation {
        self.primitive_set_manager.allocation(id)
    }
}

/// GPU data storage for [`Geometry`] objects sharing one attribute layout.
#[derive(Debug)]
pub struct GeometryStorage {
    attribs: AttribSizeList,
    free_memory_ids: Vec<u32>,
    memories: Vec<GeometryMemory>,
    next_memory_id: u32,
    pending_copies: Vec<(vk::Buffer, vk::Buffer, Vec<vk::BufferCopy>)>,
}

impl GeometryStorage {
    /// Creates an empty storage for the given attribute layout.
    pub fn new(attribs: AttribSizeList) -> Self {
        Self {
            attribs,
            free_memory_ids: vec![],
            memories: vec![],
            next_memory_id: 0,
            pending_copies: vec![],
        }
    }

    /// The attribute layout shared by every geometry in this storage.
    pub fn attribs(&self) -> &AttribSizeList {
        &self.attribs
    }

    /// Number of geometry memories created so far.
    pub fn memory_count(&self) -> usize {
        self.memories.len()
    }

    /// Borrows a geometry memory by list index.
    pub fn memory(&self, idx: usize) -> &GeometryMemory {
        &self.memories[idx]
    }

    fn mint_memory_id(&mut self) -> u32 {
        self.free_memory_ids.pop().unwrap_or_else(|| {
            let id = self.next_memory_id;
            self.next_memory_id += 1;

            id
        })
    }

    /// Device-to-device copies queued by geometry re-homing, drained by the
    /// frame's upload recording.
    pub(crate) fn take_pending_copies(
        &mut self,
    ) -> Vec<(vk::Buffer, vk::Buffer, Vec<vk::BufferCopy>)> {
        std::mem::take(&mut self.pending_copies)
    }

    #[cfg(test)]
    pub(crate) fn pending_copy_count(&self) -> usize {
        self.pending_copies.len()
    }

    fn totals(&self) -> (u32, u32, u32) {
        self.memories.iter().fold((0, 0, 0), |acc, memory| {
            (
                acc.0 + memory.vertex_manager.allocated(),
                acc.1 + memory.index_manager.allocated(),
                acc.2 + memory.primitive_set_manager.allocated(),
            )
        })
    }

    /// Allocates space for a geometry: every existing memory is tried in
    /// turn, then a new memory is created by the growth rule.
    #[profiling::function]
    pub(crate) fn alloc(
        &mut self,
        nv: u32,
        ni: u32,
        nps: u32,
        new_memory: &mut dyn FnMut(
            &AttribSizeList,
            u32,
            u32,
            u32,
            u32,
        ) -> Result<GeometryMemory, DriverError>,
    ) -> Result<(usize, (u32, u32, u32)), DriverError> {
        for (idx, memory) in self.memories.iter_mut().enumerate() {
            if let Some(ids) = memory.try_alloc(nv, ni, nps) {
                return Ok((idx, ids));
            }
        }

        let (vertex_capacity, index_capacity, primitive_set_capacity) =
            grown_capacities(self.totals(), (nv, ni, nps));
        let id = self.mint_memory_id();
        let memory = match new_memory(
            &self.attribs,
            vertex_capacity,
            index_capacity,
            primitive_set_capacity,
            id,
        ) {
            Ok(memory) => memory,
            Err(err) => {
                self.free_memory_ids.push(id);

                return Err(err);
            }
        };

        self.memories.push(memory);
        let idx = self.memories.len() - 1;
        let ids = self.memories[idx]
            .try_alloc(nv, ni, nps)
            .ok_or(DriverError::OutOfMemory)?;

        Ok((idx, ids))
    }
}

/// One logical mesh: three allocation ids inside a [`GeometryMemory`] plus
/// the list of drawables rendering it.
///
/// The drawable list is shared with the drawables themselves so relocations
/// can find and rewrite every affected entry; neither side owns the other.
#[derive(Debug, Default)]
pub struct Geometry {
    drawables: Rc<RefCell<Vec<DrawableId>>>,
    ids: (u32, u32, u32),
    memory: Option<usize>,
}

impl Geometry {
    /// Creates a geometry with no allocated space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the owning memory inside the storage's memory list.
    pub fn memory_index(&self) -> Option<usize> {
        self.memory
    }

    /// The vertex, index and primitive-set allocation ids.
    pub fn allocation_ids(&self) -> (u32, u32, u32) {
        self.ids
    }

    pub(crate) fn drawables(&self) -> &Rc<RefCell<Vec<DrawableId>>> {
        &self.drawables
    }

    /// Allocates space for the given counts, freeing any previous space.
    #[profiling::function]
    pub fn alloc(
        &mut self,
        storage: &mut GeometryStorage,
        num_vertices: u32,
        num_indices: u32,
        num_primitive_sets: u32,
        new_memory: &mut dyn FnMut(
            &AttribSizeList,
            u32,
            u32,
            u32,
            u32,
        ) -> Result<GeometryMemory, DriverError>,
    ) -> Result<(), DriverError> {
        self.free(storage);

        let (memory, ids) = storage.alloc(num_vertices, num_indices, num_primitive_sets, new_memory)?;
        self.memory = Some(memory);
        self.ids = ids;

        Ok(())
    }

    /// Resizes the geometry's space.
    ///
    /// Shrinking is in-place; growing tries in-place first, then re-homes the
    /// geometry in another memory, queueing device copies of the live data
    /// and rewriting the affected drawables.
    #[profiling::function]
    pub fn realloc(
        &mut self,
        storage: &mut GeometryStorage,
        graph: &mut crate::graph::StateSetGraph,
        num_vertices: u32,
        num_indices: u32,
        num_primitive_sets: u32,
        new_memory: &mut dyn FnMut(
            &AttribSizeList,
            u32,
            u32,
            u32,
            u32,
        ) -> Result<GeometryMemory, DriverError>,
    ) -> Result<(), DriverError> {
        let old_memory = self.memory.ok_or(DriverError::InvalidData)?;

        if storage.memories[old_memory].try_resize(
            self.ids,
            num_vertices,
            num_indices,
            num_primitive_sets,
        ) {
            return Ok(());
        }

        // Re-home: allocate elsewhere, queue copies of the live regions and
        // rewrite every drawable referencing the old placement
        let old_ids = self.ids;
        let (new_memory_idx, new_ids) =
            storage.alloc(num_vertices, num_indices, num_primitive_sets, new_memory)?;

        let attribs = storage.attribs.clone();
        let (src_buffer, dst_buffer, regions) = {
            let src = &storage.memories[old_memory];
            let dst = &storage.memories[new_memory_idx];
            let src_vertex = src.vertex_allocation(old_ids.0);
            let dst_vertex = dst.vertex_allocation(new_ids.0);
            let src_index = src.index_allocation(old_ids.1);
            let dst_index = dst.index_allocation(new_ids.1);
            let src_ps = src.primitive_set_allocation(old_ids.2);
            let dst_ps = dst.primitive_set_allocation(new_ids.2);

            let mut regions = vec![];
            for (slot, attrib_size) in attribs.iter().enumerate() {
                if attrib_size == 0 || src_vertex.num_items == 0 {
                    continue;
                }

                let attrib_size = attrib_size as vk::DeviceSize;
                regions.push(vk::BufferCopy {
                    src_offset: src.attrib_offset(slot)
                        + src_vertex.start_index as vk::DeviceSize * attrib_size,
                    dst_offset: dst.attrib_offset(slot)
                        + dst_vertex.start_index as vk::DeviceSize * attrib_size,
                    size: src_vertex.num_items as vk::DeviceSize * attrib_size,
                });
            }

            if src_index.num_items > 0 {
                regions.push(vk::BufferCopy {
                    src_offset: src.index_offset() + 4 * src_index.start_index as vk::DeviceSize,
                    dst_offset: dst.index_offset() + 4 * dst_index.start_index as vk::DeviceSize,
                    size: 4 * src_index.num_items as vk::DeviceSize,
                });
            }

            if src_ps.num_items > 0 {
                regions.push(vk::BufferCopy {
                    src_offset: src.primitive_set_offset()
                        + PrimitiveSetGpuData::SIZE as vk::DeviceSize
                            * src_ps.start_index as vk::DeviceSize,
                    dst_offset: dst.primitive_set_offset()
                        + PrimitiveSetGpuData::SIZE as vk::DeviceSize
                            * dst_ps.start_index as vk::DeviceSize,
                    size: PrimitiveSetGpuData::SIZE as vk::DeviceSize
                        * src_ps.num_items as vk::DeviceSize,
                });
            }

            (src.vk_buffer(), dst.vk_buffer(), regions)
        };

        if !regions.is_empty() {
            storage.pending_copies.push((src_buffer, dst_buffer, regions));
        }

        storage.memories[old_memory].free(old_ids);
        self.memory = Some(new_memory_idx);
        self.ids = new_ids;

        for drawable in self.drawables.borrow().iter() {
            graph.relocate_drawable(*drawable, storage, self);
        }

        Ok(())
    }

    /// Frees the geometry's space; safe to call on an unallocated geometry.
    pub fn free(&mut self, storage: &mut GeometryStorage) {
        if let Some(memory) = self.memory.take() {
            storage.memories[memory].free(self.ids);
            self.ids = (0, 0, 0);
        }
    }

    /// Stages the whole of one vertex attribute for upload.
    pub fn create_vertex_staging(
        &self,
        storage: &GeometryStorage,
        attrib_index: usize,
        ctx: &mut UploadCtx<'_>,
    ) -> Result<StagingData, DriverError> {
        let allocation = self.vertex_allocation(storage).ok_or(DriverError::InvalidData)?;

        self.vertex_subset_staging(storage, attrib_index, 0, allocation.num_items, ctx)
    }

    /// Stages `num_vertices` of one vertex attribute starting at
    /// `first_vertex` (relative to the geometry's own vertex range).
    pub fn create_vertex_subset_staging(
        &self,
        storage: &GeometryStorage,
        attrib_index: usize,
        first_vertex: u32,
        num_vertices: u32,
        ctx: &mut UploadCtx<'_>,
    ) -> Result<StagingData, DriverError> {
        self.vertex_subset_staging(storage, attrib_index, first_vertex, num_vertices, ctx)
    }

    fn vertex_subset_staging(
        &self,
        storage: &GeometryStorage,
        attrib_index: usize,
        first_vertex: u32,
        num_vertices: u32,
        ctx: &mut UploadCtx<'_>,
    ) -> Result<StagingData, DriverError> {
        let memory = self.memory.ok_or(DriverError::InvalidData)?;
        let memory = &storage.memories[memory];
        let allocation = memory.vertex_allocation(self.ids.0);

        if attrib_index >= storage.attribs.len()
            || first_vertex + num_vertices > allocation.num_items
        {
            return Err(DriverError::InvalidData);
        }

        let attrib_size = storage.attribs.attrib_size(attrib_index) as vk::DeviceSize;
        let dst_offset = memory.attrib_offset(attrib_index)
            + (allocation.start_index + first_vertex) as vk::DeviceSize * attrib_size;

        ctx.stage_buffer(
            memory.vk_buffer(),
            dst_offset,
            num_vertices as vk::DeviceSize * attrib_size,
        )
    }

    /// Stages the geometry's whole index range for upload.
    pub fn create_index_staging(
        &self,
        storage: &GeometryStorage,
        ctx: &mut UploadCtx<'_>,
    ) -> Result<StagingData, DriverError> {
        let memory = self.memory.ok_or(DriverError::InvalidData)?;
        let memory = &storage.memories[memory];
        let allocation = memory.index_allocation(self.ids.1);
        let dst_offset = memory.index_offset() + 4 * allocation.start_index as vk::DeviceSize;

        ctx.stage_buffer(
            memory.vk_buffer(),
            dst_offset,
            4 * allocation.num_items as vk::DeviceSize,
        )
    }

    /// Uploads the geometry's primitive sets, fixing up each entry's
    /// `vertex_offset` to the geometry's vertex placement.
    pub fn upload_primitive_sets(
        &self,
        storage: &GeometryStorage,
        ctx: &mut UploadCtx<'_>,
        sets: &[PrimitiveSetGpuData],
    ) -> Result<(), DriverError> {
        let memory = self.memory.ok_or(DriverError::InvalidData)?;
        let memory = &storage.memories[memory];
        let allocation = memory.primitive_set_allocation(self.ids.2);

        if sets.len() as u32 > allocation.num_items {
            return Err(DriverError::InvalidData);
        }

        let vertex_offset = memory.vertex_allocation(self.ids.0).start_index;
        let dst_offset = memory.primitive_set_offset()
            + PrimitiveSetGpuData::SIZE as vk::DeviceSize
                * allocation.start_index as vk::DeviceSize;
        let mut staging_data = ctx.stage_buffer(
            memory.vk_buffer(),
            dst_offset,
            (PrimitiveSetGpuData::SIZE as usize * sets.len()) as vk::DeviceSize,
        )?;

        let bytes = staging_data.bytes_mut();
        for (idx, set) in sets.iter().enumerate() {
            let fixed = PrimitiveSetGpuData {
                vertex_offset,
                ..*set
            };
            let offset = idx * PrimitiveSetGpuData::SIZE as usize;

            bytes[offset..offset + 4].copy_from_slice(&fixed.count.to_ne_bytes());
            bytes[offset + 4..offset + 8].copy_from_slice(&fixed.first.to_ne_bytes());
            bytes[offset + 8..offset + 12].copy_from_slice(&fixed.vertex_offset.to_ne_bytes());
        }

        ctx.submit(staging_data);

        Ok(())
    }

    /// The geometry's vertex range, if allocated.
    pub fn vertex_allocation(&self, storage: &GeometryStorage) -> Option<ArrayAllocation> {
        self.memory
            .map(|memory| storage.memories[memory].vertex_allocation(self.ids.0))
    }

    /// The geometry's index range, if allocated.
    pub fn index_allocation(&self, storage: &GeometryStorage) -> Option<ArrayAllocation> {
        self.memory
            .map(|memory| storage.memories[memory].index_allocation(self.ids.1))
    }

    /// The geometry's primitive-set range, if allocated.
    pub fn primitive_set_allocation(&self, storage: &GeometryStorage) -> Option<ArrayAllocation> {
        self.memory
            .map(|memory| storage.memories[memory].primitive_set_allocation(self.ids.2))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub fn test_geometry_memory_factory() -> impl FnMut(
        &AttribSizeList,
        u32,
        u32,
        u32,
        u32,
    ) -> Result<GeometryMemory, DriverError> {
        let mut next_base = 0x4000_0000u64;

        move |attribs, nv, ni, nps, id| {
            let base = next_base;
            next_base += 1 << 28;

            Ok(GeometryMemory::unbacked(attribs, nv, ni, nps, id, base))
        }
    }

    #[test]
    pub fn array_manager_alloc_free() {
        let mut manager = ArrayAllocationManager::new(100);

        let a = manager.alloc(10).unwrap();
        let b = manager.alloc(20).unwrap();

        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_eq!(manager.allocation(a).start_index, 0);
        assert_eq!(manager.allocation(b).start_index, 10);
        assert_eq!(manager.allocated(), 30);

        manager.free(a);
        assert_eq!(manager.allocated(), 20);

        // The freed gap is reused first-fit
        let c = manager.alloc(10).unwrap();
        assert_eq!(manager.allocation(c).start_index, 0);

        manager.free(b);
        manager.free(c);
        assert_eq!(manager.allocated(), 0);

        // Everything coalesced back into bump space
        let d = manager.alloc(100).unwrap();
        assert_eq!(manager.allocation(d).start_index, 0);
    }

    #[test]
    pub fn array_manager_null_item() {
        let mut manager = ArrayAllocationManager::new(10);

        assert_eq!(manager.alloc(0).unwrap(), 0);
        assert_eq!(manager.allocation(0).num_items, 0);

        // Freeing the null item is a no-op
        manager.free(0);
        manager.free(0);
        assert_eq!(manager.allocated(), 0);
    }

    #[test]
    pub fn array_manager_resize() {
        let mut manager = ArrayAllocationManager::new(100);

        let a = manager.alloc(10).unwrap();
        let b = manager.alloc(10).unwrap();

        // Shrink in place
        assert!(manager.resize(a, 4));
        assert_eq!(manager.allocation(a).num_items, 4);

        // a cannot grow past b
        assert!(!manager.can_resize(a, 20));
        assert!(!manager.resize(a, 20));

        // But it can grow back into its own gap
        assert!(manager.resize(a, 10));
        assert_eq!(manager.allocation(a).start_index, 0);

        // b is the bump tail and can grow freely
        assert!(manager.resize(b, 80));
        assert_eq!(manager.allocated(), 90);
    }

    #[test]
    pub fn layout_respects_alignment() {
        let attribs = AttribSizeList::from([12u32, 0, 16]);
        let (attrib_offsets, index_offset, ps_offset, size) =
            geometry_memory_layout(&attribs, 100, 300, 10, 64);

        assert_eq!(attrib_offsets, vec![0, 1216, 1216]);
        // 1216 + 16 * 100 = 2816, already a multiple of 64
        assert_eq!(index_offset, 2816);
        // 2816 + 4 * 300 = 4016 -> 4032
        assert_eq!(ps_offset, 4032);
        assert_eq!(size, 4032 + 12 * 10);
    }

    #[test]
    pub fn growth_rule_floors() {
        assert_eq!(grown_capacities((0, 0, 0), (0, 0, 0)), (1024, 6144, 128));
        assert_eq!(grown_capacities((0, 0, 0), (100, 600, 10)), (1024, 6144, 128));

        // Doubled capacities just under the floors are still raised
        assert_eq!(grown_capacities((0, 0, 0), (300, 0, 0)), (1024, 6144, 128));
        assert_eq!(
            grown_capacities((0, 0, 0), (511, 3071, 63)),
            (1024, 6144, 128)
        );

        // At or above the floors the doubled capacities stand
        assert_eq!(
            grown_capacities((0, 0, 0), (512, 3072, 64)),
            (1024, 6144, 128)
        );
        assert_eq!(
            grown_capacities((1000, 6000, 100), (500, 3000, 50)),
            (3000, 18_000, 300)
        );
    }

    #[test]
    pub fn storage_allocates_and_grows() {
        let mut storage = GeometryStorage::new(AttribSizeList::from([12u32]));
        let mut factory = test_geometry_memory_factory();
        let mut geometry = Geometry::new();

        geometry
            .alloc(&mut storage, 100, 300, 4, &mut factory)
            .unwrap();

        assert_eq!(storage.memory_count(), 1);
        assert_eq!(geometry.vertex_allocation(&storage).unwrap().num_items, 100);

        // Exhausts the first memory (floor capacity 1024 vertices)
        let mut big = Geometry::new();
        big.alloc(&mut storage, 2000, 12_000, 200, &mut factory)
            .unwrap();

        assert_eq!(storage.memory_count(), 2);
        assert_eq!(big.memory_index(), Some(1));

        geometry.free(&mut storage);
        big.free(&mut storage);
        assert_eq!(storage.memories[0].vertex_manager.allocated(), 0);
    }

    #[test]
    pub fn zero_size_geometry() {
        let mut storage = GeometryStorage::new(AttribSizeList::from([12u32]));
        let mut factory = test_geometry_memory_factory();
        let mut geometry = Geometry::new();

        geometry.alloc(&mut storage, 0, 0, 0, &mut factory).unwrap();

        assert_eq!(geometry.allocation_ids(), (0, 0, 0));
        assert_eq!(geometry.vertex_allocation(&storage).unwrap().num_items, 0);

        geometry.free(&mut storage);
    }
}
