//! Cameras and frames as read by backends.

use bitflags::bitflags;
use glam::{Mat4, Vec2};

use crate::types::{RasterId, Rect};

/// A scene-graph frame reduced to what backends need: the local-to-world
/// matrix. Columns are right/up/at/position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub ltm: Mat4,
}

impl Frame {
    pub const IDENTITY: Frame = Frame {
        ltm: Mat4::IDENTITY,
    };
}

/// Projection kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    Perspective,
    Parallel,
}

bitflags! {
    /// What a camera clear touches
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClearFlags: u32 {
        const IMAGE = 0x1;
        const Z = 0x2;
        const STENCIL = 0x4;
    }
}

/// A camera as read by backends.
///
/// The framebuffer raster may be a sub-rect of a larger parent raster;
/// `sub_rect` carries the placement in that case.
#[derive(Debug, Clone)]
pub struct Camera {
    pub frame: Frame,
    /// Half extents of the view window on the near plane
    pub view_window: Vec2,
    pub view_offset: Vec2,
    pub near_plane: f32,
    pub far_plane: f32,
    /// Distance at which fog starts
    pub fog_plane: f32,
    pub projection: Projection,
    pub frame_buffer: RasterId,
    pub z_buffer: Option<RasterId>,
    /// Placement of the camera's output on the framebuffer raster; the
    /// whole raster when absent
    pub sub_rect: Option<Rect>,
}

impl Camera {
    pub fn new(frame_buffer: RasterId, z_buffer: Option<RasterId>) -> Self {
        Self {
            frame: Frame::IDENTITY,
            view_window: Vec2::new(1.0, 1.0),
            view_offset: Vec2::ZERO,
            near_plane: 0.05,
            far_plane: 10.0,
            fog_plane: 5.0,
            projection: Projection::Perspective,
            frame_buffer,
            z_buffer,
            sub_rect: None,
        }
    }
}
