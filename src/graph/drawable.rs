use {
    super::state_set::StateSetId,
    ash::vk,
    slotmap::new_key_type,
    std::{cell::RefCell, rc::Rc},
};

new_key_type! {
    /// Identifies one [`Drawable`] inside a
    /// [`StateSetGraph`][super::StateSetGraph].
    pub struct DrawableId;
}

/// Marks a drawable that is not currently attached to any state set entry.
pub(crate) const INVALID_INDEX: u32 = !0;

/// Per-drawable data consumed by the compute pass which builds
/// indirect-draw commands.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(C)]
pub struct DrawableGpuData {
    /// Device address of the drawable's packed primitive-set record.
    pub primitive_set_addr: vk::DeviceAddress,

    /// Offset of the drawable's shader data in the shared payload buffer,
    /// in 4-byte units.
    pub shader_data_offset4: u32,

    pad: u32,
}

impl DrawableGpuData {
    pub(crate) const SIZE: usize = std::mem::size_of::<Self>();

    /// Builds the GPU record from a primitive-set address and a shader-data
    /// id (a byte offset into the shared payload buffer).
    pub fn new(primitive_set_addr: vk::DeviceAddress, shader_data_id: u32) -> Self {
        Self {
            primitive_set_addr,
            shader_data_offset4: shader_data_id / 4,
            pad: 0,
        }
    }

    pub(crate) fn write_to(&self, bytes: &mut [u8]) {
        bytes[0..8].copy_from_slice(&self.primitive_set_addr.to_ne_bytes());
        bytes[8..12].copy_from_slice(&self.shader_data_offset4.to_ne_bytes());
        bytes[12..16].copy_from_slice(&self.pad.to_ne_bytes());
    }
}

/// A renderable entity tying one primitive set of a geometry to a state set.
#[derive(Debug)]
pub struct Drawable {
    /// Index of the drawable container within the state set, or
    /// [`INVALID_INDEX`] while inactive.
    pub(crate) container: u32,

    /// Shared list of drawables registered on the drawable's geometry;
    /// relocations walk it to find and rewrite affected entries.
    pub(crate) geometry_drawables: Rc<RefCell<Vec<DrawableId>>>,

    /// Index into the container's drawable vector, or [`INVALID_INDEX`]
    /// while inactive. Not constant over time: removals swap other
    /// drawables into freed slots.
    pub(crate) index_into_state_set: u32,

    /// The drawable's primitive set, as an index into its geometry's range.
    pub(crate) primitive_set_index: u32,

    /// Byte offset of the drawable's shader data in the shared payload
    /// buffer.
    pub(crate) shader_data_id: u32,

    /// The state set that renders this drawable. Kept while inactive so a
    /// later activation reuses it.
    pub(crate) state_set: StateSetId,
}

impl Drawable {
    /// Returns `true` when the drawable currently participates in
    /// rendering.
    pub fn is_active(&self) -> bool {
        self.index_into_state_set != INVALID_INDEX
    }

    /// The state set rendering this drawable.
    pub fn state_set(&self) -> StateSetId {
        self.state_set
    }

    /// The drawable's shader-data byte offset.
    pub fn shader_data_id(&self) -> u32 {
        self.shader_data_id
    }
}

const _: () = assert!(std::mem::size_of::<DrawableGpuData>() == 16);
