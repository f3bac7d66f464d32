//! Kiln - Shared scene types
//!
//! Data model shared between the generic engine core and the hardware
//! rendering backends: geometry, materials, cameras, skins, lights and
//! images. Backends read these types; they never mutate anything except
//! the lock-dirty bits they are documented to clear.

pub mod camera;
pub mod geometry;
pub mod image;
pub mod lights;
pub mod material;
pub mod skin;
mod types;

pub use camera::{Camera, ClearFlags, Frame, Projection};
pub use geometry::{
    Geometry, GeometryFlags, GeometryId, LockFlags, Mesh, MeshHeader, MeshPrimitive, MorphTarget,
};
pub use image::Image;
pub use lights::{Light, WorldLights};
pub use material::{
    EnvMapEffect, Material, MaterialEffect, MaterialId, SurfaceProperties, Texture, TextureAddress,
    TextureFilter,
};
pub use skin::{Hierarchy, HierarchyFlags, Skin};
pub use types::{PrimitiveType, RasterId, Rect, Rgba, Rgbaf};
