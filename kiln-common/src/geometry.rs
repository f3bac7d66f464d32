//! Geometry as the engine core hands it to a backend: morph targets,
//! per-vertex colors and texture coordinates, and the mesh partitioning
//! (one index list + material per submesh).
//!
//! Backends derive their own hardware-ready instance data from this and key
//! it on `MeshHeader::serial`; whenever the partitioning changes the serial
//! is bumped and the derived data is stale.

use bitflags::bitflags;
use glam::{Vec2, Vec3};

use crate::material::MaterialId;
use crate::types::Rgba;

/// Engine-side identity of a geometry, used by backends to key derived data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryId(pub u32);

bitflags! {
    /// What a geometry carries and how it wants to be rendered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GeometryFlags: u32 {
        /// Triangle strips (informational; the mesh header decides topology)
        const TRISTRIP = 0x01;
        /// Vertex positions present (always set in practice)
        const POSITIONS = 0x02;
        /// Texture coordinates present
        const TEXTURED = 0x04;
        /// Per-vertex colors present
        const PRELIT = 0x08;
        /// Vertex normals present
        const NORMALS = 0x10;
        /// Geometry wants lighting
        const LIGHT = 0x20;
        /// Material color modulates vertex color
        const MODULATE_MATERIAL_COLOR = 0x40;
        /// Geometry data is already in a backend's hardware format.
        /// Instancing must leave such a geometry alone.
        const NATIVE = 0x0100_0000;
    }
}

bitflags! {
    /// Which vertex attributes were locked for writing since the backend
    /// last instanced this geometry. Backends re-pack exactly these and
    /// clear the bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LockFlags: u32 {
        const POLYGONS = 0x01;
        const VERTICES = 0x02;
        const NORMALS = 0x04;
        const PRELIGHT = 0x08;
        const TEXCOORDS0 = 0x10;
        const TEXCOORDS1 = 0x20;
    }
}

impl LockFlags {
    /// Lock bit for texture coordinate set `n`
    pub fn texcoords(n: usize) -> LockFlags {
        LockFlags::from_bits_truncate(LockFlags::TEXCOORDS0.bits() << n)
    }
}

/// Index list topology of a mesh header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshPrimitive {
    TriList,
    TriStrip,
}

/// One submesh: an index list into the geometry's vertex arrays plus the
/// material it is drawn with.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub indices: Vec<u16>,
    pub material: MaterialId,
}

/// The mesh partitioning of a geometry.
#[derive(Debug, Clone)]
pub struct MeshHeader {
    /// Bumped by the engine whenever the partitioning changes; derived
    /// backend data carrying a different serial must be rebuilt.
    pub serial: u32,
    pub primitive: MeshPrimitive,
    pub meshes: Vec<Mesh>,
}

impl MeshHeader {
    pub fn total_indices(&self) -> usize {
        self.meshes.iter().map(|m| m.indices.len()).sum()
    }
}

/// One morph target's vertex data. Target 0 is the rest pose; backends only
/// read target 0 (morph interpolation happens upstream).
#[derive(Debug, Clone, Default)]
pub struct MorphTarget {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
}

/// A geometry as read by backends.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub id: GeometryId,
    pub flags: GeometryFlags,
    pub morph_targets: Vec<MorphTarget>,
    /// Per-vertex prelight colors; present when `PRELIT` is set
    pub colors: Vec<Rgba>,
    /// Texture coordinate sets; one Vec per set
    pub tex_coords: Vec<Vec<Vec2>>,
    pub mesh_header: MeshHeader,
    /// Dirty bits since the last instancing pass; cleared by the backend
    pub locked_since_inst: LockFlags,
}

impl Geometry {
    pub fn num_vertices(&self) -> usize {
        self.morph_targets.first().map_or(0, |t| t.vertices.len())
    }

    pub fn num_tex_coord_sets(&self) -> usize {
        self.tex_coords.len()
    }
}
