//! A GPU-driven Vulkan rendering runtime for massive CAD scenes.
//!
//! `cadre` renders scenes of hundreds of thousands to millions of small,
//! heterogeneous objects at interactive rates. Its value is not window
//! management or shader authoring but how it lays out GPU memory, schedules
//! asynchronous host-to-device transfers, amortizes draw-call cost through
//! indirect rendering and keeps per-object overhead low:
//!
//! - A suballocation layer over large GPU buffers — data, geometry and image
//!   storage — built on a two-block [circular arena](arena) with O(1)
//!   amortized allocation and relocation callbacks.
//! - A [staging pipeline](staging) coupling CPU-visible scratch memory to
//!   device-local targets, batching copies into one submission per frame and
//!   recycling scratch once the frame's fence signals.
//! - A [handle table](handle_table) providing indirection from stable 64-bit
//!   handles to device addresses, mirrored on the GPU.
//! - A [scene graph of draw state](graph) — pipelines, state sets,
//!   drawables — compiled each frame into a single compact indirect-draw
//!   buffer by a compute pass.
//!
//! The [`Renderer`] ties these together and drives the frame loop. Windowing,
//! swapchains and shader authoring stay outside: surfaces belong to the host
//! application and all shader bytecode is consumed as opaque SPIR-V blobs.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cadre::{
//!     driver::{Device, DeviceInfo, DriverError},
//!     Renderer, RendererInfo,
//! };
//!
//! fn main() -> Result<(), DriverError> {
//!     let device = Arc::new(Device::create_headless(DeviceInfo::default())?);
//!     let mut renderer = Renderer::new(&device, RendererInfo::default());
//!
//!     let data = renderer.alloc_data(1024)?;
//!     renderer.upload_data(&data, &[0u8; 1024])?;
//!
//!     let handle = renderer.create_handle()?;
//!     renderer.set_handle(handle, data.device_address())?;
//!     assert_eq!(renderer.lookup_handle(handle), data.device_address());
//!
//!     renderer.free_data(data);
//!     Ok(())
//! }
//! ```

pub mod arena;
pub mod data;
pub mod driver;
pub mod geometry;
pub mod graph;
pub mod handle_table;
pub mod image;
pub mod primitive_set;
pub mod staging;

mod renderer;

pub use self::renderer::{FrameInfo, Renderer, RendererInfo, RendererInfoBuilder};

/// Things which are used in almost every program built on this crate.
pub mod prelude {
    pub use super::{
        FrameInfo, Renderer, RendererInfo,
        data::{DataAllocation, Relocation, UploadCtx},
        driver::{
            AccessType, Buffer, BufferInfo, CommandBuffer, ComputePipeline, Device, DeviceInfo,
            DriverError, GraphicPipeline, GraphicPipelineInfo, Instance, Shader,
        },
        geometry::{AttribSizeList, Geometry},
        graph::{DrawableGpuData, DrawableId, StateSetGraph, StateSetId},
        image::{ImageAllocation, ImageCreateDesc},
        primitive_set::{PrimitiveSet, PrimitiveSetGpuData},
        staging::{StagingData, TransferRecord},
    };
}
