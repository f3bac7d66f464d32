//! World lighting as enumerated for one atomic's draw.

use glam::Vec3;

use crate::types::Rgbaf;

/// One light, reduced to what the fixed-function backends consume.
#[derive(Debug, Clone, Copy)]
pub struct Light {
    pub color: Rgbaf,
    /// World-space direction the light points at
    pub direction: Vec3,
    pub position: Vec3,
    pub radius: f32,
}

impl Light {
    pub fn directional(color: Rgbaf, direction: Vec3) -> Self {
        Self {
            color,
            direction,
            position: Vec3::ZERO,
            radius: 0.0,
        }
    }
}

/// Lights affecting one draw, already enumerated by the world.
#[derive(Debug, Clone, Default)]
pub struct WorldLights {
    pub ambient: Option<Rgbaf>,
    pub directionals: Vec<Light>,
    /// Point/spot lights; enumerated but not consumed by the current
    /// backends (directional-only lighting)
    pub locals: Vec<Light>,
}

impl WorldLights {
    pub fn none() -> Self {
        Self::default()
    }
}
