//! Materials and engine-side texture objects.

use crate::types::{RasterId, Rgba};

/// Index of a material in the caller-owned material table passed alongside
/// a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialId(pub u32);

/// Lighting coefficients of a material
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceProperties {
    pub ambient: f32,
    pub specular: f32,
    pub diffuse: f32,
}

impl Default for SurfaceProperties {
    fn default() -> Self {
        Self {
            ambient: 1.0,
            specular: 1.0,
            diffuse: 1.0,
        }
    }
}

/// Texture filtering as requested by content. Backends map this onto
/// whatever the hardware actually supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TextureFilter {
    #[default]
    None = 0,
    Nearest = 1,
    Linear = 2,
    MipNearest = 3,
    MipLinear = 4,
    LinearMipNearest = 5,
    LinearMipLinear = 6,
}

impl TextureFilter {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => TextureFilter::Nearest,
            2 => TextureFilter::Linear,
            3 => TextureFilter::MipNearest,
            4 => TextureFilter::MipLinear,
            5 => TextureFilter::LinearMipNearest,
            6 => TextureFilter::LinearMipLinear,
            _ => TextureFilter::None,
        }
    }
}

/// Texture addressing as requested by content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TextureAddress {
    #[default]
    None = 0,
    Wrap = 1,
    Mirror = 2,
    Clamp = 3,
    Border = 4,
}

impl TextureAddress {
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => TextureAddress::Wrap,
            2 => TextureAddress::Mirror,
            3 => TextureAddress::Clamp,
            4 => TextureAddress::Border,
            _ => TextureAddress::None,
        }
    }
}

/// Engine-side texture object: a named reference to a backend raster plus
/// the sampling state content asked for.
#[derive(Debug, Clone)]
pub struct Texture {
    /// Content name, at most 32 bytes when serialized
    pub name: String,
    /// Name of the separate mask texture this texture was combined with
    pub mask: String,
    pub filter: TextureFilter,
    pub address_u: TextureAddress,
    pub address_v: TextureAddress,
    pub raster: RasterId,
}

impl Texture {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mask: String::new(),
            filter: TextureFilter::Nearest,
            address_u: TextureAddress::Wrap,
            address_v: TextureAddress::Wrap,
            raster: RasterId::INVALID,
        }
    }

    /// Packed filter/addressing word used by the native texture container:
    /// filter in the low byte, U addressing in bits 8-11, V in bits 12-15.
    pub fn filter_addressing(&self) -> u32 {
        (self.filter as u32) | ((self.address_u as u32) << 8) | ((self.address_v as u32) << 12)
    }

    pub fn set_filter_addressing(&mut self, packed: u32) {
        self.filter = TextureFilter::from_u32(packed & 0xFF);
        self.address_u = TextureAddress::from_u32((packed >> 8) & 0xF);
        self.address_v = TextureAddress::from_u32((packed >> 12) & 0xF);
    }
}

/// Environment-map material effect parameters
#[derive(Debug, Clone)]
pub struct EnvMapEffect {
    pub texture: Option<Texture>,
    /// Frame whose inverted matrix orients the reflection; the current
    /// camera frame when absent
    pub frame: Option<glam::Mat4>,
    pub coefficient: f32,
    pub fb_alpha: bool,
}

/// Optional per-material render effect
#[derive(Debug, Clone, Default)]
pub enum MaterialEffect {
    #[default]
    None,
    EnvMap(EnvMapEffect),
}

/// A material as read by backends
#[derive(Debug, Clone)]
pub struct Material {
    pub color: Rgba,
    pub surface_props: SurfaceProperties,
    pub texture: Option<Texture>,
    pub effect: MaterialEffect,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            color: Rgba::WHITE,
            surface_props: SurfaceProperties::default(),
            texture: None,
            effect: MaterialEffect::None,
        }
    }
}
