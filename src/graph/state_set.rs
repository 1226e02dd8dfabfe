use {
    super::drawable::{DrawableGpuData, DrawableId},
    crate::{data::DataAllocation, driver::device::Device},
    ash::vk,
    slotmap::new_key_type,
};

new_key_type! {
    /// Identifies one [`StateSet`] inside a
    /// [`StateSetGraph`][super::StateSetGraph].
    pub struct StateSetId;
}

/// A user callback invoked while the state set is recorded, used to emit raw
/// commands such as push constants.
pub type RecordCallback = Box<dyn FnMut(&Device, vk::CommandBuffer)>;

/// Drawables of one state set sharing one geometry memory.
///
/// Grouping by memory lets the recorder bind the memory's index subregion
/// once and issue a single indirect draw covering the whole container.
#[derive(Debug)]
pub(crate) struct DrawableContainer {
    pub drawables: Vec<DrawableId>,
    pub geometry_memory_id: u32,
    /// Device-visible copy of `gpu_data`, refreshed through the staging
    /// pipeline whenever the vector changes.
    pub gpu_allocation: DataAllocation,
    pub gpu_data: Vec<DrawableGpuData>,
    pub gpu_data_dirty: bool,
    pub index_buffer: vk::Buffer,
    pub index_offset: vk::DeviceSize,
}

/// A node in the draw-state tree: a pipeline binding, descriptor sets and
/// the drawables rendered under them.
///
/// State sets participate in a parent/child DAG; children are visited in
/// insertion order and drawables draw in insertion order. There is no
/// re-sorting for depth: ordering is the caller's responsibility via the
/// graph shape.
#[derive(Default)]
pub struct StateSet {
    pub(crate) children: Vec<StateSetId>,
    pub(crate) containers: Vec<DrawableContainer>,
    pub(crate) descriptor_sets: Vec<vk::DescriptorSet>,
    pub(crate) dynamic_offsets: Vec<u32>,
    pub(crate) parents: Vec<StateSetId>,
    pub(crate) pipeline: Option<vk::Pipeline>,
    pub(crate) pipeline_layout: vk::PipelineLayout,
    pub(crate) record_callbacks: Vec<RecordCallback>,
    /// Set by `prepare_recording` when the whole subtree holds no
    /// drawables, so the record step does not visit it.
    pub(crate) skip_recording: bool,
}

impl StateSet {
    /// Binds a pipeline and the layout used for descriptor and
    /// push-constant binding under this node.
    pub fn set_pipeline(&mut self, pipeline: vk::Pipeline, layout: vk::PipelineLayout) {
        self.pipeline = Some(pipeline);
        self.pipeline_layout = layout;
    }

    /// Binds descriptor sets (with dynamic offsets) under this node.
    pub fn set_descriptor_sets(
        &mut self,
        descriptor_sets: Vec<vk::DescriptorSet>,
        dynamic_offsets: Vec<u32>,
    ) {
        self.descriptor_sets = descriptor_sets;
        self.dynamic_offsets = dynamic_offsets;
    }

    /// Appends a user callback run at record time, e.g. to push constants.
    pub fn add_record_callback(&mut self, callback: RecordCallback) {
        self.record_callbacks.push(callback);
    }

    /// Total drawables attached to this state set.
    pub fn num_drawables(&self) -> usize {
        self.containers
            .iter()
            .map(|container| container.drawables.len())
            .sum()
    }

    /// Children of this node, in insertion order.
    pub fn children(&self) -> &[StateSetId] {
        &self.children
    }

    /// Parents of this node.
    pub fn parents(&self) -> &[StateSetId] {
        &self.parents
    }

    pub(crate) fn container_for(
        &mut self,
        geometry_memory_id: u32,
        index_buffer: vk::Buffer,
        index_offset: vk::DeviceSize,
    ) -> usize {
        if let Some(idx) = self
            .containers
            .iter()
            .position(|container| container.geometry_memory_id == geometry_memory_id)
        {
            return idx;
        }

        self.containers.push(DrawableContainer {
            drawables: vec![],
            geometry_memory_id,
            gpu_allocation: DataAllocation::null(),
            gpu_data: vec![],
            gpu_data_dirty: false,
            index_buffer,
            index_offset,
        });

        self.containers.len() - 1
    }
}

impl std::fmt::Debug for StateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSet")
            .field("children", &self.children)
            .field("containers", &self.containers)
            .field("pipeline", &self.pipeline)
            .field("skip_recording", &self.skip_recording)
            .finish_non_exhaustive()
    }
}
