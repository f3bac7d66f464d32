//! Kiln GX - rendering backend for the tile-based handheld target
//!
//! Translates the engine's retained scene description into commands for a
//! fixed-function-influenced, tile-based mobile GPU with a small linear
//! texture heap and no virtual memory.
//!
//! # Architecture
//!
//! **engine core** → **`Device`** (state cache, texture memory, instancing)
//! → **`GxHardware`** (command emission)
//!
//! - The engine calls the backend through `Device`'s capability methods
//!   (open/close, frame begin/end, clear, present, render-state get/set,
//!   immediate draws, device-control requests)
//! - `Device` owns every piece of backend state: the render-state cache, the
//!   texture memory pool and its scratch staging buffer, the raster handle
//!   table and the per-geometry instance cache
//! - Hardware is reached only through the `GxHardware` interface; the
//!   software-simulated `SimGx` satisfies it for tests

pub mod camera;
pub mod codec;
pub mod device;
pub mod draw;
mod error;
pub mod gui;
pub mod hw;
pub mod immed;
pub mod instance;
pub mod raster;
pub mod render_state;
pub mod skin;
pub mod stream;
pub mod texture_memory;
pub mod uniforms;

pub use device::{Device, DeviceConfig, DeviceRequest, DeviceResponse, VideoMode};
pub use error::GxError;
pub use gui::{GuiDrawCmd, GuiDrawData, GuiDrawList, GuiVertex};
pub use hw::GxHardware;
pub use hw::sim::SimGx;
pub use immed::{Im2DVertex, Im3DVertex};
pub use instance::PipelineKind;
pub use raster::{LockMode, RasterDesc, RasterFormat, RasterType};
pub use render_state::RenderState;
pub use stream::PLATFORM_GX;
pub use texture_memory::MemoryBudget;
