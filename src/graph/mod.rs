//! The scene graph of draw state: state sets, drawables and the per-frame
//! indirect-draw build.
//!
//! A [`StateSetGraph`] owns every [`StateSet`] and [`Drawable`] behind
//! generational keys, breaking the geometry/drawable/state-set reference
//! triangle without ownership cycles: a geometry holds the keys of its
//! drawables, a drawable holds its state-set key and back-index.
//!
//! Rendering a frame is a three-step pipeline:
//!
//! 1. [`prepare_recording`][StateSetGraph::prepare_recording] walks the tree
//!    and marks empty subtrees to be skipped.
//! 2. The renderer uploads each visible container's drawable data and
//!    dispatches the indirect-build compute pipeline once per container,
//!    writing `VkDrawIndexedIndirectCommand` records into the shared
//!    indirect buffer.
//! 3. [`record`][StateSetGraph::record] replays the draw plan onto the
//!    command buffer: bind pipeline when it changes, bind descriptors, run
//!    user record callbacks, and issue one indexed-indirect draw per
//!    container at its drawable-counter offset.

mod drawable;
mod state_set;

pub use self::{
    drawable::{Drawable, DrawableGpuData, DrawableId},
    state_set::{RecordCallback, StateSet, StateSetId},
};

use {
    self::drawable::INVALID_INDEX,
    crate::{
        data::UploadCtx,
        driver::{DriverError, device::Device},
        geometry::{Geometry, GeometryMemory, GeometryStorage},
        primitive_set::PrimitiveSetGpuData,
    },
    ash::vk,
    log::trace,
    slotmap::SlotMap,
    std::rc::Rc,
};

/// One indirect-build compute dispatch: a visible drawable container.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DrawableDispatch {
    /// Number of drawables compiled by this dispatch.
    pub count: u32,

    /// Index of the container's first drawable within the shared indirect
    /// buffer.
    pub first_drawable: u32,

    /// Device address of the container's drawable-data array.
    pub gpu_data_addr: vk::DeviceAddress,
}

#[derive(Debug)]
pub(crate) enum DrawOp {
    BindDescriptorSets {
        dynamic_offsets: Vec<u32>,
        layout: vk::PipelineLayout,
        sets: Vec<vk::DescriptorSet>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
    },
    BindPipeline {
        pipeline: vk::Pipeline,
    },
    Callbacks {
        state_set: StateSetId,
    },
    DrawIndexedIndirect {
        draw_count: u32,
        first_drawable: u32,
    },
}

/// The compiled shape of one frame's draws, produced by the build step and
/// replayed into a command buffer by [`StateSetGraph::record`].
#[derive(Debug, Default)]
pub struct DrawPlan {
    pub(crate) dispatches: Vec<DrawableDispatch>,
    pub(crate) ops: Vec<DrawOp>,
    pub(crate) total_drawables: u32,
}

impl DrawPlan {
    /// Number of indirect-draw commands the plan writes and draws.
    pub fn total_drawables(&self) -> u32 {
        self.total_drawables
    }

    /// Number of `vkCmdDrawIndexedIndirect` calls the plan will record.
    pub fn draw_count(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, DrawOp::DrawIndexedIndirect { .. }))
            .count()
    }
}

/// Owns the draw-state tree and its drawables.
#[derive(Debug, Default)]
pub struct StateSetGraph {
    drawables: SlotMap<DrawableId, Drawable>,
    state_sets: SlotMap<StateSetId, StateSet>,
}

impl StateSetGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty state set.
    pub fn create_state_set(&mut self) -> StateSetId {
        self.state_sets.insert(StateSet::default())
    }

    /// Destroys a state set.
    ///
    /// The state set must hold no drawables; its parent and child links are
    /// severed.
    pub fn destroy_state_set(&mut self, id: StateSetId) {
        debug_assert_eq!(self.state_sets[id].num_drawables(), 0);

        let parents = std::mem::take(&mut self.state_sets[id].parents);
        for parent in parents {
            self.state_sets[parent].children.retain(|child| *child != id);
        }

        let children = std::mem::take(&mut self.state_sets[id].children);
        for child in children {
            self.state_sets[child].parents.retain(|parent| *parent != id);
        }

        self.state_sets.remove(id);
    }

    /// Appends `child` to `parent`'s child list; children record in
    /// insertion order.
    pub fn add_child(&mut self, parent: StateSetId, child: StateSetId) {
        debug_assert_ne!(parent, child);

        self.state_sets[parent].children.push(child);
        self.state_sets[child].parents.push(parent);
    }

    /// Severs a parent/child link.
    pub fn remove_child(&mut self, parent: StateSetId, child: StateSetId) {
        self.state_sets[parent].children.retain(|id| *id != child);
        self.state_sets[child].parents.retain(|id| *id != parent);
    }

    /// Borrows a state set.
    pub fn state_set(&self, id: StateSetId) -> &StateSet {
        &self.state_sets[id]
    }

    /// Mutably borrows a state set.
    pub fn state_set_mut(&mut self, id: StateSetId) -> &mut StateSet {
        &mut self.state_sets[id]
    }

    /// Borrows a drawable.
    pub fn drawable(&self, id: DrawableId) -> &Drawable {
        &self.drawables[id]
    }

    /// Index of a drawable within its state set's drawable vector, or
    /// `None` while inactive.
    pub fn drawable_index(&self, id: DrawableId) -> Option<u32> {
        let drawable = &self.drawables[id];

        (drawable.index_into_state_set != INVALID_INDEX).then_some(drawable.index_into_state_set)
    }

    /// Creates a drawable rendering `primitive_set_index` of `geometry`
    /// under `state_set`.
    ///
    /// The drawable registers on the geometry's drawable list so relocations
    /// can rewrite it. A geometry without primitive sets yields an inactive
    /// drawable which emits no draws until the geometry gains one.
    #[profiling::function]
    pub fn create_drawable(
        &mut self,
        geometry: &Geometry,
        storage: &GeometryStorage,
        primitive_set_index: u32,
        shader_data_id: u32,
        state_set: StateSetId,
    ) -> Result<DrawableId, DriverError> {
        let memory_idx = geometry.memory_index().ok_or(DriverError::InvalidData)?;
        let memory = storage.memory(memory_idx);
        let primitive_sets = memory.primitive_set_allocation(geometry.allocation_ids().2);

        let id = self.drawables.insert(Drawable {
            container: INVALID_INDEX,
            geometry_drawables: Rc::clone(geometry.drawables()),
            index_into_state_set: INVALID_INDEX,
            primitive_set_index,
            shader_data_id,
            state_set,
        });
        geometry.drawables().borrow_mut().push(id);

        if primitive_sets.num_items > 0 {
            debug_assert!(primitive_set_index < primitive_sets.num_items);

            self.attach(id, memory, primitive_sets.start_index);
        }

        Ok(id)
    }

    /// Re-targets an existing drawable at a (possibly different) geometry,
    /// primitive set, shader data and state set.
    ///
    /// When the drawable stays within a state set whose container matches
    /// the geometry's memory, the entry is patched in place; otherwise it is
    /// removed from the old state set and appended to the new one.
    #[profiling::function]
    pub fn update_drawable(
        &mut self,
        id: DrawableId,
        geometry: &Geometry,
        storage: &GeometryStorage,
        primitive_set_index: u32,
        shader_data_id: u32,
        state_set: StateSetId,
    ) -> Result<(), DriverError> {
        let memory_idx = geometry.memory_index().ok_or(DriverError::InvalidData)?;
        let memory = storage.memory(memory_idx);
        let primitive_sets = memory.primitive_set_allocation(geometry.allocation_ids().2);

        // Re-register on the (possibly different) geometry's drawable list
        {
            let drawable = &mut self.drawables[id];

            if !Rc::ptr_eq(&drawable.geometry_drawables, geometry.drawables()) {
                drawable
                    .geometry_drawables
                    .borrow_mut()
                    .retain(|other| *other != id);
                geometry.drawables().borrow_mut().push(id);
                drawable.geometry_drawables = Rc::clone(geometry.drawables());
            }

            drawable.primitive_set_index = primitive_set_index;
            drawable.shader_data_id = shader_data_id;
        }

        if primitive_sets.num_items == 0 {
            self.detach(id);
            self.drawables[id].state_set = state_set;

            return Ok(());
        }

        debug_assert!(primitive_set_index < primitive_sets.num_items);

        let drawable = &self.drawables[id];
        let same_container = drawable.index_into_state_set != INVALID_INDEX
            && drawable.state_set == state_set
            && self.state_sets[state_set].containers[drawable.container as usize]
                .geometry_memory_id
                == memory.id();

        if same_container {
            self.patch(id, memory, primitive_sets.start_index);
        } else {
            self.detach(id);
            self.drawables[id].state_set = state_set;
            self.attach(id, memory, primitive_sets.start_index);
        }

        Ok(())
    }

    /// Destroys a drawable, unlinking it from its state set and geometry.
    #[profiling::function]
    pub fn destroy_drawable(&mut self, id: DrawableId) {
        self.detach(id);

        let drawable = self.drawables.remove(id).unwrap();
        drawable
            .geometry_drawables
            .borrow_mut()
            .retain(|other| *other != id);
    }

    /// Rewrites a drawable after its geometry moved to another placement.
    pub(crate) fn relocate_drawable(
        &mut self,
        id: DrawableId,
        storage: &GeometryStorage,
        geometry: &Geometry,
    ) {
        let Some(memory_idx) = geometry.memory_index() else {
            self.detach(id);

            return;
        };
        let memory = storage.memory(memory_idx);
        let primitive_sets = memory.primitive_set_allocation(geometry.allocation_ids().2);

        if primitive_sets.num_items == 0 {
            self.detach(id);

            return;
        }

        let drawable = &self.drawables[id];
        let same_container = drawable.index_into_state_set != INVALID_INDEX
            && self.state_sets[drawable.state_set].containers[drawable.container as usize]
                .geometry_memory_id
                == memory.id();

        if same_container {
            self.patch(id, memory, primitive_sets.start_index);
        } else {
            self.detach(id);
            self.attach(id, memory, primitive_sets.start_index);
        }
    }

    fn gpu_data(&self, id: DrawableId, memory: &GeometryMemory, ps_start: u32) -> DrawableGpuData {
        let drawable = &self.drawables[id];
        let primitive_set_addr = memory.device_address()
            + memory.primitive_set_offset()
            + (ps_start + drawable.primitive_set_index) as vk::DeviceAddress
                * PrimitiveSetGpuData::SIZE as vk::DeviceAddress;

        DrawableGpuData::new(primitive_set_addr, drawable.shader_data_id)
    }

    fn attach(&mut self, id: DrawableId, memory: &GeometryMemory, ps_start: u32) {
        let gpu_data = self.gpu_data(id, memory, ps_start);
        let state_set = self.drawables[id].state_set;
        let container_idx = self.state_sets[state_set].container_for(
            memory.id(),
            memory.vk_buffer(),
            memory.index_offset(),
        );
        let container = &mut self.state_sets[state_set].containers[container_idx];

        let drawable = &mut self.drawables[id];
        drawable.container = container_idx as u32;
        drawable.index_into_state_set = container.drawables.len() as u32;

        container.drawables.push(id);
        container.gpu_data.push(gpu_data);
        container.gpu_data_dirty = true;
    }

    fn patch(&mut self, id: DrawableId, memory: &GeometryMemory, ps_start: u32) {
        let gpu_data = self.gpu_data(id, memory, ps_start);
        let drawable = &self.drawables[id];
        let container =
            &mut self.state_sets[drawable.state_set].containers[drawable.container as usize];

        container.gpu_data[drawable.index_into_state_set as usize] = gpu_data;
        container.gpu_data_dirty = true;
    }

    /// Swap-removes a drawable from its container, fixing up the back-index
    /// of the drawable swapped into its slot.
    fn detach(&mut self, id: DrawableId) {
        let drawable = &self.drawables[id];
        if drawable.index_into_state_set == INVALID_INDEX {
            return;
        }

        let state_set = drawable.state_set;
        let container_idx = drawable.container as usize;
        let index = drawable.index_into_state_set as usize;
        let container = &mut self.state_sets[state_set].containers[container_idx];

        debug_assert_eq!(container.drawables[index], id);

        container.drawables.swap_remove(index);
        container.gpu_data.swap_remove(index);
        container.gpu_data_dirty = true;

        if let Some(moved) = container.drawables.get(index).copied() {
            self.drawables[moved].index_into_state_set = index as u32;
        }

        let drawable = &mut self.drawables[id];
        drawable.container = INVALID_INDEX;
        drawable.index_into_state_set = INVALID_INDEX;
    }

    /// Walks the tree from `root`, marking empty subtrees to be skipped by
    /// the record step. Returns the total drawable count.
    #[profiling::function]
    pub fn prepare_recording(&mut self, root: StateSetId) -> u32 {
        fn visit(state_sets: &mut SlotMap<StateSetId, StateSet>, id: StateSetId) -> u32 {
            let children = state_sets[id].children.clone();
            let mut count = state_sets[id].num_drawables() as u32;

            for child in children {
                count += visit(state_sets, child);
            }

            state_sets[id].skip_recording = count == 0;

            count
        }

        visit(&mut self.state_sets, root)
    }

    /// Depth-first list of state sets that survive the skip marking, in
    /// insertion order.
    fn visible_sets(&self, root: StateSetId) -> Vec<StateSetId> {
        fn visit(
            state_sets: &SlotMap<StateSetId, StateSet>,
            id: StateSetId,
            out: &mut Vec<StateSetId>,
        ) {
            if state_sets[id].skip_recording {
                return;
            }

            out.push(id);
            for child in &state_sets[id].children {
                visit(state_sets, *child, out);
            }
        }

        let mut out = vec![];
        visit(&self.state_sets, root, &mut out);

        out
    }

    /// Refreshes the device-visible drawable-data copy of every visible
    /// container through the staging pipeline.
    #[profiling::function]
    pub fn upload_drawable_data(
        &mut self,
        ctx: &mut UploadCtx<'_>,
        root: StateSetId,
    ) -> Result<(), DriverError> {
        for id in self.visible_sets(root) {
            for container in &mut self.state_sets[id].containers {
                if container.drawables.is_empty() {
                    continue;
                }

                let needed = (container.gpu_data.len() * DrawableGpuData::SIZE) as vk::DeviceSize;
                let resized = container.gpu_allocation.size() != needed;

                if resized {
                    ctx.realloc(&mut container.gpu_allocation, needed)?;
                }

                if resized || container.gpu_data_dirty {
                    let mut staging_data = ctx.create_staging_data(&container.gpu_allocation)?;
                    let bytes = staging_data.bytes_mut();

                    for (idx, gpu_data) in container.gpu_data.iter().enumerate() {
                        gpu_data.write_to(
                            &mut bytes[idx * DrawableGpuData::SIZE..(idx + 1) * DrawableGpuData::SIZE],
                        );
                    }

                    ctx.submit(staging_data);
                    container.gpu_data_dirty = false;
                }
            }
        }

        Ok(())
    }

    /// Compiles the visible tree into a draw plan: compute dispatches for
    /// the indirect build plus the ordered command sequence for the draws.
    #[profiling::function]
    pub fn build_draw_plan(&self, root: StateSetId) -> DrawPlan {
        let mut plan = DrawPlan::default();
        let mut last_pipeline = None;

        for id in self.visible_sets(root) {
            let state_set = &self.state_sets[id];

            if let Some(pipeline) = state_set.pipeline {
                if last_pipeline != Some(pipeline) {
                    plan.ops.push(DrawOp::BindPipeline { pipeline });
                    last_pipeline = Some(pipeline);
                }
            }

            if !state_set.descriptor_sets.is_empty() {
                plan.ops.push(DrawOp::BindDescriptorSets {
                    dynamic_offsets: state_set.dynamic_offsets.clone(),
                    layout: state_set.pipeline_layout,
                    sets: state_set.descriptor_sets.clone(),
                });
            }

            if !state_set.record_callbacks.is_empty() {
                plan.ops.push(DrawOp::Callbacks { state_set: id });
            }

            for container in &state_set.containers {
                let count = container.drawables.len() as u32;
                if count == 0 {
                    continue;
                }

                plan.dispatches.push(DrawableDispatch {
                    count,
                    first_drawable: plan.total_drawables,
                    gpu_data_addr: container.gpu_allocation.device_address(),
                });
                plan.ops.push(DrawOp::BindIndexBuffer {
                    buffer: container.index_buffer,
                    offset: container.index_offset,
                });
                plan.ops.push(DrawOp::DrawIndexedIndirect {
                    draw_count: count,
                    first_drawable: plan.total_drawables,
                });

                plan.total_drawables += count;
            }
        }

        trace!(
            "draw plan: {} drawables in {} draws",
            plan.total_drawables,
            plan.draw_count()
        );

        plan
    }

    /// Replays a draw plan onto the command buffer.
    ///
    /// Must be recorded inside the caller's render pass; the indirect buffer
    /// is the one the renderer's compute pass filled for this plan.
    #[profiling::function]
    pub fn record(
        &mut self,
        device: &Device,
        cmd_buf: vk::CommandBuffer,
        plan: &DrawPlan,
        indirect_buffer: vk::Buffer,
    ) {
        const STRIDE: u32 = std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32;

        for op in &plan.ops {
            match op {
                DrawOp::BindDescriptorSets {
                    dynamic_offsets,
                    layout,
                    sets,
                } => unsafe {
                    device.cmd_bind_descriptor_sets(
                        cmd_buf,
                        vk::PipelineBindPoint::GRAPHICS,
                        *layout,
                        0,
                        sets,
                        dynamic_offsets,
                    );
                },
                DrawOp::BindIndexBuffer { buffer, offset } => unsafe {
                    device.cmd_bind_index_buffer(cmd_buf, *buffer, *offset, vk::IndexType::UINT32);
                },
                DrawOp::BindPipeline { pipeline } => unsafe {
                    device.cmd_bind_pipeline(cmd_buf, vk::PipelineBindPoint::GRAPHICS, *pipeline);
                },
                DrawOp::Callbacks { state_set } => {
                    for callback in &mut self.state_sets[*state_set].record_callbacks {
                        callback(device, cmd_buf);
                    }
                }
                DrawOp::DrawIndexedIndirect {
                    draw_count,
                    first_drawable,
                } => unsafe {
                    device.cmd_draw_indexed_indirect(
                        cmd_buf,
                        indirect_buffer,
                        *first_drawable as vk::DeviceSize * STRIDE as vk::DeviceSize,
                        *draw_count,
                        STRIDE,
                    );
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        ash::vk::Handle,
        crate::{
            data::{DataStorage, tests::test_ctx},
            geometry::{AttribSizeList, tests::test_geometry_memory_factory},
            staging::StagingManager,
        },
    };

    fn test_geometry(
        storage: &mut GeometryStorage,
        num_primitive_sets: u32,
    ) -> Geometry {
        let mut factory = test_geometry_memory_factory();
        let mut geometry = Geometry::new();
        geometry
            .alloc(storage, 12, 24, num_primitive_sets, &mut factory)
            .unwrap();

        geometry
    }

    #[test]
    pub fn swap_remove_stability() {
        let mut storage = GeometryStorage::new(AttribSizeList::from([12u32]));
        let geometry = test_geometry(&mut storage, 3);
        let mut graph = StateSetGraph::new();
        let state_set = graph.create_state_set();

        let d0 = graph
            .create_drawable(&geometry, &storage, 0, 0, state_set)
            .unwrap();
        let d1 = graph
            .create_drawable(&geometry, &storage, 1, 16, state_set)
            .unwrap();
        let d2 = graph
            .create_drawable(&geometry, &storage, 2, 32, state_set)
            .unwrap();

        assert_eq!(graph.drawable_index(d0), Some(0));
        assert_eq!(graph.drawable_index(d1), Some(1));
        assert_eq!(graph.drawable_index(d2), Some(2));

        graph.destroy_drawable(d1);

        // The tail entry was swapped into the freed slot
        assert_eq!(graph.drawable_index(d0), Some(0));
        assert_eq!(graph.drawable_index(d2), Some(1));
        assert_eq!(graph.state_set(state_set).num_drawables(), 2);

        // The geometry's drawable list no longer knows d1
        assert_eq!(geometry.drawables().borrow().len(), 2);
    }

    #[test]
    pub fn zero_size_geometry_emits_no_draws() {
        let mut storage = GeometryStorage::new(AttribSizeList::from([12u32]));
        let geometry = test_geometry(&mut storage, 0);
        let mut graph = StateSetGraph::new();
        let state_set = graph.create_state_set();

        let drawable = graph
            .create_drawable(&geometry, &storage, 0, 0, state_set)
            .unwrap();

        assert!(!graph.drawable(drawable).is_active());

        let total = graph.prepare_recording(state_set);
        assert_eq!(total, 0);
        assert!(graph.state_set(state_set).skip_recording);

        let plan = graph.build_draw_plan(state_set);
        assert_eq!(plan.draw_count(), 0);
        assert_eq!(plan.total_drawables(), 0);
        assert!(plan.dispatches.is_empty());
    }

    #[test]
    pub fn drawable_gpu_data_addresses() {
        let mut storage = GeometryStorage::new(AttribSizeList::from([12u32]));
        let a = test_geometry(&mut storage, 2);
        let b = test_geometry(&mut storage, 2);
        let mut graph = StateSetGraph::new();
        let state_set = graph.create_state_set();

        let da = graph.create_drawable(&a, &storage, 1, 64, state_set).unwrap();
        let _db = graph.create_drawable(&b, &storage, 0, 0, state_set).unwrap();

        // Both geometries share the first memory, so one container exists
        assert_eq!(graph.state_set(state_set).containers.len(), 1);

        let memory = storage.memory(a.memory_index().unwrap());
        let ps = a.primitive_set_allocation(&storage).unwrap();
        let expected = memory.device_address()
            + memory.primitive_set_offset()
            + (ps.start_index + 1) as u64 * PrimitiveSetGpuData::SIZE as u64;

        let container = &graph.state_set(state_set).containers[0];
        let idx = graph.drawable_index(da).unwrap() as usize;
        assert_eq!(container.gpu_data[idx].primitive_set_addr, expected);
        assert_eq!(container.gpu_data[idx].shader_data_offset4, 16);
    }

    #[test]
    pub fn plan_orders_sets_depth_first() {
        let mut storage = GeometryStorage::new(AttribSizeList::from([12u32]));
        let geometry = test_geometry(&mut storage, 2);
        let mut graph = StateSetGraph::new();

        let root = graph.create_state_set();
        let child_a = graph.create_state_set();
        let child_b = graph.create_state_set();
        graph.add_child(root, child_a);
        graph.add_child(root, child_b);

        graph
            .create_drawable(&geometry, &storage, 0, 0, child_a)
            .unwrap();
        graph
            .create_drawable(&geometry, &storage, 1, 0, child_b)
            .unwrap();

        let pipeline = vk::Pipeline::from_raw(0x1234);
        graph
            .state_set_mut(child_a)
            .set_pipeline(pipeline, vk::PipelineLayout::null());
        graph
            .state_set_mut(child_b)
            .set_pipeline(pipeline, vk::PipelineLayout::null());

        graph.prepare_recording(root);
        let plan = graph.build_draw_plan(root);

        assert_eq!(plan.total_drawables(), 2);
        assert_eq!(plan.draw_count(), 2);
        assert_eq!(plan.dispatches.len(), 2);
        assert_eq!(plan.dispatches[0].first_drawable, 0);
        assert_eq!(plan.dispatches[1].first_drawable, 1);

        // The shared pipeline is bound exactly once
        let binds = plan
            .ops
            .iter()
            .filter(|op| matches!(op, DrawOp::BindPipeline { .. }))
            .count();
        assert_eq!(binds, 1);
    }

    #[test]
    pub fn empty_subtrees_are_skipped() {
        let mut storage = GeometryStorage::new(AttribSizeList::from([12u32]));
        let geometry = test_geometry(&mut storage, 1);
        let mut graph = StateSetGraph::new();

        let root = graph.create_state_set();
        let empty = graph.create_state_set();
        let full = graph.create_state_set();
        graph.add_child(root, empty);
        graph.add_child(root, full);

        graph
            .create_drawable(&geometry, &storage, 0, 0, full)
            .unwrap();

        let total = graph.prepare_recording(root);

        assert_eq!(total, 1);
        assert!(graph.state_set(empty).skip_recording);
        assert!(!graph.state_set(root).skip_recording);
        assert!(!graph.state_set(full).skip_recording);
    }

    #[test]
    pub fn upload_drawable_data_allocates_and_refreshes() {
        let mut storage = GeometryStorage::new(AttribSizeList::from([12u32]));
        let geometry = test_geometry(&mut storage, 2);
        let mut graph = StateSetGraph::new();
        let state_set = graph.create_state_set();

        graph
            .create_drawable(&geometry, &storage, 0, 0, state_set)
            .unwrap();

        let mut data = DataStorage::new();
        let mut staging = StagingManager::new();

        graph.prepare_recording(state_set);
        {
            let mut ctx = test_ctx(&mut data, &mut staging, 0);
            graph.upload_drawable_data(&mut ctx, state_set).unwrap();
        }

        let container = &graph.state_set(state_set).containers[0];
        assert_eq!(container.gpu_allocation.size(), 16);
        assert!(!container.gpu_data_dirty);

        // A second drawable grows the device copy
        graph
            .create_drawable(&geometry, &storage, 1, 4, state_set)
            .unwrap();
        graph.prepare_recording(state_set);
        {
            let mut ctx = test_ctx(&mut data, &mut staging, 0);
            graph.upload_drawable_data(&mut ctx, state_set).unwrap();
        }

        let container = &graph.state_set(state_set).containers[0];
        assert_eq!(container.gpu_allocation.size(), 32);
    }

    #[test]
    pub fn geometry_rehoming_rewrites_drawables() {
        let mut storage = GeometryStorage::new(AttribSizeList::from([4u32]));
        let mut factory = test_geometry_memory_factory();
        let mut geometry = Geometry::new();
        geometry.alloc(&mut storage, 8, 12, 2, &mut factory).unwrap();

        let mut graph = StateSetGraph::new();
        let state_set = graph.create_state_set();
        let drawable = graph
            .create_drawable(&geometry, &storage, 0, 0, state_set)
            .unwrap();

        let old_addr = graph.state_set(state_set).containers[0].gpu_data[0].primitive_set_addr;

        // Grow past the first memory's capacity: the geometry re-homes
        geometry
            .realloc(&mut storage, &mut graph, 4000, 24_000, 300, &mut factory)
            .unwrap();

        assert_eq!(geometry.memory_index(), Some(1));
        assert_eq!(storage.pending_copy_count(), 1);
        assert!(graph.drawable(drawable).is_active());

        // The drawable now lives in a container for the new memory
        let containers = &graph.state_set(state_set).containers;
        let active = containers
            .iter()
            .find(|container| !container.drawables.is_empty())
            .unwrap();
        assert_eq!(active.geometry_memory_id, storage.memory(1).id());
        assert_ne!(active.gpu_data[0].primitive_set_addr, old_addr);
    }
}
