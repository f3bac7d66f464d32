//! Small shared value types: colors, rectangles, handles, primitive topology.

use bytemuck::{Pod, Zeroable};

/// Handle to a backend-owned raster (texture, render target or depth buffer).
///
/// The engine core only passes these around; resolving a handle to an actual
/// resource is the backend's business.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterId(pub u32);

impl RasterId {
    /// Invalid/null raster handle
    pub const INVALID: RasterId = RasterId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

/// 8-bit-per-channel RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const WHITE: Rgba = Rgba::new(255, 255, 255, 255);
    pub const BLACK: Rgba = Rgba::new(0, 0, 0, 255);

    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

/// Float RGBA color (uniform upload form)
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct Rgbaf {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Rgbaf {
    pub const BLACK: Rgbaf = Rgbaf::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn to_array(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl From<Rgba> for Rgbaf {
    fn from(c: Rgba) -> Self {
        Rgbaf::new(
            c.r as f32 / 255.0,
            c.g as f32 / 255.0,
            c.b as f32 / 255.0,
            c.a as f32 / 255.0,
        )
    }
}

/// Integer rectangle (viewports, sub-raster placement)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self { x, y, w, h }
    }
}

/// Immediate-mode primitive topology as submitted by the engine core.
///
/// The hardware only rasterizes triangles; backends convert the other
/// topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PrimitiveType {
    None = 0,
    LineList = 1,
    PolyLine = 2,
    TriList = 3,
    TriStrip = 4,
    TriFan = 5,
    PointList = 6,
}
