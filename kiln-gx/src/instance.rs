//! Vertex instancing: converting generic geometry into hardware vertex
//! buffers.
//!
//! The first `instance_geometry` call for a geometry builds everything:
//! per-submesh index buffers, the interleaved attribute layout, and one
//! vertex buffer of `vertex_count * stride` bytes in the linear heap.
//! Subsequent calls are keyed on the mesh serial number:
//!
//! - same serial, dirty lock bits: only the locked attributes are
//!   re-packed in place. No allocation happens on this path; it runs every
//!   frame for skinned/morphed geometry.
//! - different serial: the whole instance is discarded and rebuilt.
//!
//! Geometry already in hardware format is left alone, and converting
//! hardware data back to generic geometry does not exist on this target.

use bytemuck::cast_slice;
use glam::{Vec2, Vec3};
use hashbrown::HashMap;
use kiln_common::{
    Geometry, GeometryFlags, GeometryId, LockFlags, MaterialId, MeshPrimitive, Rgba,
};
use smallvec::SmallVec;

use crate::device::Device;
use crate::hw::{AttrEntry, AttrKind, GxHardware, Primitive, TexMem};
use crate::texture_memory::safe_linear_alloc;

/// Attribute registers of the default vertex programs
pub const ATTRIB_POS: usize = 0;
pub const ATTRIB_NORMAL: usize = 1;
pub const ATTRIB_COLOR: usize = 2;
pub const ATTRIB_TEXCOORDS0: usize = 3;
pub const ATTRIB_TEXCOORDS1: usize = 4;
pub const MAX_ATTRIBS: usize = 5;

/// Texture coordinate sets the attribute registers can carry
pub const MAX_TEXCOORD_SETS: usize = 2;

/// Which instance callback packs the vertex data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    Default,
    Skin,
}

/// One attribute of the interleaved layout. `count == 0` means the
/// register is fed the fixed default value instead of buffer data.
#[derive(Debug, Clone, Copy)]
pub struct AttribDesc {
    pub index: u8,
    pub offset: u8,
    pub count: u8,
    pub kind: AttrKind,
}

impl Default for AttribDesc {
    fn default() -> Self {
        Self {
            index: 0,
            offset: 0,
            count: 0,
            kind: AttrKind::Float,
        }
    }
}

/// One submesh of an instanced geometry
#[derive(Debug)]
pub struct InstanceData {
    pub num_index: u32,
    pub min_vert: u32,
    pub num_vertices: i32,
    pub material: MaterialId,
    /// Any vertex in this submesh's range carries non-opaque alpha;
    /// decides whether its draw needs blending
    pub vertex_alpha: bool,
    pub index_buffer: TexMem,
}

/// Hardware-ready derived data of one geometry
#[derive(Debug)]
pub struct InstanceDataHeader {
    /// Mesh version this instance was derived from
    pub serial: u32,
    pub prim: Primitive,
    pub total_num_vertex: u32,
    pub total_num_index: u32,
    pub stride: usize,
    pub num_attribs: u8,
    pub attribs: [AttribDesc; MAX_ATTRIBS],
    pub vertex_buffer: Option<TexMem>,
    pub vertex_buffer_size: usize,
    pub layout: SmallVec<[AttrEntry; MAX_ATTRIBS]>,
    pub inst: Vec<InstanceData>,
}

/// Instance cache keyed by geometry identity
pub type InstanceTable = HashMap<GeometryId, InstanceDataHeader>;

fn find_min_vert_and_num_vertices(indices: &[u16]) -> (u32, i32) {
    let mut min = u32::MAX;
    let mut max = 0u32;
    for &i in indices {
        min = min.min(i as u32);
        max = max.max(i as u32);
    }
    assert!(min != u32::MAX, "instancing a submesh with no indices");
    (min, (max - min + 1) as i32)
}

/// Signed-byte normal packing used by the normal attribute register
fn pack_normal(n: Vec3) -> [i8; 4] {
    let clamp = |v: f32| (v.clamp(-1.0, 1.0) * 127.0) as i8;
    [clamp(n.x), clamp(n.y), clamp(n.z), 0]
}

fn inst_positions(buf: &mut [u8], verts: &[Vec3], offset: usize, stride: usize) {
    for (i, v) in verts.iter().enumerate() {
        let at = i * stride + offset;
        buf[at..at + 12].copy_from_slice(cast_slice(&v.to_array()));
    }
}

fn inst_normals(buf: &mut [u8], normals: &[Vec3], offset: usize, stride: usize) {
    for (i, n) in normals.iter().enumerate() {
        let at = i * stride + offset;
        buf[at..at + 4].copy_from_slice(cast_slice(&pack_normal(*n)));
    }
}

/// Pack colors for one submesh's vertex range; reports whether any packed
/// vertex has non-opaque alpha.
fn inst_colors(
    buf: &mut [u8],
    colors: &[Rgba],
    min_vert: u32,
    num_vertices: i32,
    offset: usize,
    stride: usize,
) -> bool {
    let mut has_alpha = false;
    for i in min_vert as usize..(min_vert as i64 + num_vertices as i64) as usize {
        let c = colors[i];
        has_alpha |= c.a != 255;
        let at = i * stride + offset;
        buf[at..at + 4].copy_from_slice(&[c.r, c.g, c.b, c.a]);
    }
    has_alpha
}

fn inst_texcoords(buf: &mut [u8], uvs: &[Vec2], offset: usize, stride: usize) {
    for (i, uv) in uvs.iter().enumerate() {
        let at = i * stride + offset;
        buf[at..at + 8].copy_from_slice(cast_slice(&uv.to_array()));
    }
}

/// Derive the register layout from the attribute descriptors
pub(crate) fn gen_attrib_layout(
    attribs: &[AttribDesc; MAX_ATTRIBS],
) -> SmallVec<[AttrEntry; MAX_ATTRIBS]> {
    attribs
        .iter()
        .map(|a| {
            if a.count > 0 {
                AttrEntry::Loader {
                    kind: a.kind,
                    count: a.count,
                }
            } else {
                AttrEntry::Fixed
            }
        })
        .collect()
}

impl<G: GxHardware> Device<G> {
    /// Ensure hardware-ready instance data exists and is current for this
    /// geometry. Idempotent per mesh version; clears the geometry's
    /// lock-dirty bits.
    pub fn instance_geometry(&mut self, geo: &mut Geometry, pipeline: PipelineKind) {
        // don't try to (re)instance native data
        if geo.flags.contains(GeometryFlags::NATIVE) {
            return;
        }

        if let Some(header) = self.instances.get(&geo.id)
            && header.serial != geo.mesh_header.serial
        {
            // mesh changed, reinstance everything
            self.free_instance_data(geo.id);
        }

        if !self.instances.contains_key(&geo.id) {
            let header = self.instance_mesh(geo);
            self.instances.insert(geo.id, header);
            self.run_instance_cb(geo, pipeline, false);
        } else if !geo.locked_since_inst.is_empty() {
            self.run_instance_cb(geo, pipeline, true);
        }

        geo.locked_since_inst = LockFlags::empty();
    }

    /// Converting hardware-format geometry back to generic data is not a
    /// thing this backend can do.
    pub fn uninstance_geometry(&mut self, _geo: &mut Geometry) -> ! {
        panic!("uninstancing hardware geometry is not supported");
    }

    fn run_instance_cb(&mut self, geo: &Geometry, pipeline: PipelineKind, reinstance: bool) {
        match pipeline {
            PipelineKind::Default => self.default_instance_cb(geo, reinstance),
            PipelineKind::Skin => self.skin_instance_cb(geo, reinstance),
        }
    }

    /// Extract the per-submesh index buffers and bookkeeping that partial
    /// reinstancing never touches.
    fn instance_mesh(&mut self, geo: &Geometry) -> InstanceDataHeader {
        let meshh = &geo.mesh_header;
        let prim = match meshh.primitive {
            MeshPrimitive::TriStrip => Primitive::TriangleStrip,
            MeshPrimitive::TriList => Primitive::Triangles,
        };

        let mut inst = Vec::with_capacity(meshh.meshes.len());
        for mesh in &meshh.meshes {
            let (min_vert, num_vertices) = find_min_vert_and_num_vertices(&mesh.indices);
            let index_buffer = safe_linear_alloc(
                &mut self.gx,
                &mut self.rasters,
                &mut self.texmem,
                mesh.indices.len() * 2,
            );
            self.gx
                .mem_mut(index_buffer)
                .copy_from_slice(cast_slice(&mesh.indices));
            inst.push(InstanceData {
                num_index: mesh.indices.len() as u32,
                min_vert,
                num_vertices,
                material: mesh.material,
                vertex_alpha: false,
                index_buffer,
            });
        }

        InstanceDataHeader {
            serial: meshh.serial,
            prim,
            total_num_vertex: geo.num_vertices() as u32,
            total_num_index: meshh.total_indices() as u32,
            stride: 0,
            num_attribs: 0,
            attribs: [AttribDesc::default(); MAX_ATTRIBS],
            vertex_buffer: None,
            vertex_buffer_size: 0,
            layout: SmallVec::new(),
            inst,
        }
    }

    /// Build (or partially refresh) the interleaved vertex buffer for
    /// unskinned geometry.
    fn default_instance_cb(&mut self, geo: &Geometry, reinstance: bool) {
        let is_prelit = geo.flags.contains(GeometryFlags::PRELIT);
        let has_normals = geo.flags.contains(GeometryFlags::NORMALS);
        let tex_sets = geo.num_tex_coord_sets().min(MAX_TEXCOORD_SETS);
        if geo.num_tex_coord_sets() > MAX_TEXCOORD_SETS {
            tracing::warn!(
                "geometry {} has {} texture coordinate sets, using {}",
                geo.id.0,
                geo.num_tex_coord_sets(),
                MAX_TEXCOORD_SETS
            );
        }

        if !reinstance {
            let header = self.instances.get_mut(&geo.id).unwrap();
            let mut attribs = [AttribDesc::default(); MAX_ATTRIBS];
            let mut stride = 0usize;
            let mut num_attribs = 0u8;

            let mut push = |reg: usize, count: u8, kind: AttrKind, width: usize| {
                attribs[reg] = AttribDesc {
                    index: num_attribs,
                    offset: stride as u8,
                    count,
                    kind,
                };
                stride += width * count as usize;
                num_attribs += 1;
            };

            push(ATTRIB_POS, 3, AttrKind::Float, 4);
            if has_normals {
                push(ATTRIB_NORMAL, 4, AttrKind::Byte, 1);
            }
            if is_prelit {
                push(ATTRIB_COLOR, 4, AttrKind::UnsignedByte, 1);
            }
            for n in 0..tex_sets {
                push(ATTRIB_TEXCOORDS0 + n, 2, AttrKind::Float, 4);
            }

            header.attribs = attribs;
            header.stride = stride;
            header.num_attribs = num_attribs;
            header.layout = gen_attrib_layout(&attribs);

            let size = header.total_num_vertex as usize * stride;
            header.vertex_buffer_size = size;
            let buffer = safe_linear_alloc(
                &mut self.gx,
                &mut self.rasters,
                &mut self.texmem,
                size,
            );
            self.instances.get_mut(&geo.id).unwrap().vertex_buffer = Some(buffer);
        }

        let header = self.instances.get_mut(&geo.id).unwrap();
        let stride = header.stride;
        let attribs = header.attribs;
        let buffer = header.vertex_buffer.expect("instance without vertex buffer");
        let locked = geo.locked_since_inst;
        let target = &geo.morph_targets[0];

        let buf = &mut self.gx.mem_mut(buffer)[..header.vertex_buffer_size];

        if !reinstance || locked.contains(LockFlags::VERTICES) {
            inst_positions(buf, &target.vertices, attribs[ATTRIB_POS].offset as usize, stride);
        }

        if has_normals && (!reinstance || locked.contains(LockFlags::NORMALS)) {
            inst_normals(
                buf,
                &target.normals,
                attribs[ATTRIB_NORMAL].offset as usize,
                stride,
            );
        }

        if is_prelit && (!reinstance || locked.contains(LockFlags::PRELIGHT)) {
            let offset = attribs[ATTRIB_COLOR].offset as usize;
            for inst in header.inst.iter_mut() {
                inst.vertex_alpha = inst_colors(
                    buf,
                    &geo.colors,
                    inst.min_vert,
                    inst.num_vertices,
                    offset,
                    stride,
                );
            }
        }

        for n in 0..tex_sets {
            if !reinstance || locked.contains(LockFlags::texcoords(n)) {
                inst_texcoords(
                    buf,
                    &geo.tex_coords[n],
                    attribs[ATTRIB_TEXCOORDS0 + n].offset as usize,
                    stride,
                );
            }
        }
    }

    /// Point the vertex input stage at a geometry's instance data.
    pub(crate) fn set_attrib_pointers(&mut self, geo_id: GeometryId) {
        let header = &self.instances[&geo_id];
        let layout: SmallVec<[AttrEntry; MAX_ATTRIBS]> = header.layout.clone();
        let buffer = header.vertex_buffer.expect("instance without vertex buffer");
        let stride = header.stride;
        self.gx.set_attr_layout(&layout);
        self.gx.bind_vertex_buffer(buffer, stride);
    }

    /// Drop a geometry's derived data, returning its linear memory. Called
    /// when the geometry dies or its mesh serial moves on.
    pub fn free_instance_data(&mut self, geo_id: GeometryId) {
        let Some(header) = self.instances.remove(&geo_id) else {
            return;
        };
        for inst in &header.inst {
            self.gx.release(inst.index_buffer);
        }
        if let Some(buffer) = header.vertex_buffer {
            self.gx.release(buffer);
        }
    }

    /// Geometry destruction hook from the engine core.
    pub fn destroy_native_data(&mut self, geo: &Geometry) {
        self.free_instance_data(geo.id);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::hw::GxHardware;
    use crate::hw::sim::SimGx;
    use kiln_common::{Mesh, MeshHeader, MorphTarget};

    pub(crate) fn quad_geometry(id: u32, flags: GeometryFlags) -> Geometry {
        let vertices = vec![
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ];
        let normals = vec![Vec3::Z; 4];
        let colors = vec![
            Rgba::new(255, 0, 0, 255),
            Rgba::new(0, 255, 0, 255),
            Rgba::new(0, 0, 255, 255),
            Rgba::new(255, 255, 255, 255),
        ];
        let uvs = vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ];
        Geometry {
            id: GeometryId(id),
            flags,
            morph_targets: vec![MorphTarget { vertices, normals }],
            colors,
            tex_coords: vec![uvs],
            mesh_header: MeshHeader {
                serial: 1,
                primitive: MeshPrimitive::TriList,
                meshes: vec![Mesh {
                    indices: vec![0, 1, 2, 0, 2, 3],
                    material: MaterialId(0),
                }],
            },
            locked_since_inst: LockFlags::empty(),
        }
    }

    pub(crate) fn full_flags() -> GeometryFlags {
        GeometryFlags::POSITIONS
            | GeometryFlags::NORMALS
            | GeometryFlags::PRELIT
            | GeometryFlags::TEXTURED
    }

    fn open_device() -> Device<SimGx> {
        Device::open(SimGx::new(), DeviceConfig::default())
    }

    #[test]
    fn test_full_instance_layout() {
        let mut dev = open_device();
        let mut geo = quad_geometry(1, full_flags());
        dev.instance_geometry(&mut geo, PipelineKind::Default);

        let header = &dev.instances[&geo.id];
        // pos(12) + normal(4) + color(4) + uv(8)
        assert_eq!(header.stride, 28);
        assert_eq!(header.num_attribs, 4);
        assert_eq!(header.attribs[ATTRIB_POS].offset, 0);
        assert_eq!(header.attribs[ATTRIB_NORMAL].offset, 12);
        assert_eq!(header.attribs[ATTRIB_COLOR].offset, 16);
        assert_eq!(header.attribs[ATTRIB_TEXCOORDS0].offset, 20);
        assert_eq!(header.vertex_buffer_size, 4 * 28);
        assert_eq!(header.inst.len(), 1);
        assert_eq!(header.inst[0].num_index, 6);
        assert_eq!(header.inst[0].min_vert, 0);
        assert_eq!(header.inst[0].num_vertices, 4);
        assert!(!header.inst[0].vertex_alpha);

        // layout: pos/normal/color/uv0 loaders, uv1 fixed
        assert!(matches!(header.layout[ATTRIB_POS], AttrEntry::Loader { kind: AttrKind::Float, count: 3 }));
        assert!(matches!(header.layout[ATTRIB_TEXCOORDS1], AttrEntry::Fixed));
    }

    #[test]
    fn test_position_only_layout() {
        let mut dev = open_device();
        let mut geo = quad_geometry(1, GeometryFlags::POSITIONS);
        dev.instance_geometry(&mut geo, PipelineKind::Default);
        let header = &dev.instances[&geo.id];
        assert_eq!(header.stride, 12);
        assert_eq!(header.num_attribs, 1);
    }

    #[test]
    fn test_instance_is_idempotent_per_serial() {
        let mut dev = open_device();
        let mut geo = quad_geometry(1, full_flags());
        dev.instance_geometry(&mut geo, PipelineKind::Default);
        let buffer0 = dev.instances[&geo.id].vertex_buffer;
        let snapshot = dev.gx.mem(buffer0.unwrap()).to_vec();

        // clean geometry: nothing should change
        dev.instance_geometry(&mut geo, PipelineKind::Default);
        assert_eq!(dev.instances[&geo.id].vertex_buffer, buffer0);
        assert_eq!(dev.gx.mem(buffer0.unwrap()), &snapshot[..]);
    }

    #[test]
    fn test_partial_reinstance_touches_only_dirty_attribute() {
        let mut dev = open_device();
        let mut geo = quad_geometry(1, full_flags());
        dev.instance_geometry(&mut geo, PipelineKind::Default);

        let header = &dev.instances[&geo.id];
        let buffer = header.vertex_buffer.unwrap();
        let stride = header.stride;
        let color_off = header.attribs[ATTRIB_COLOR].offset as usize;
        let before = dev.gx.mem(buffer).to_vec();

        // mutate colors only and mark them dirty
        for c in geo.colors.iter_mut() {
            *c = Rgba::new(9, 9, 9, 9);
        }
        geo.locked_since_inst = LockFlags::PRELIGHT;
        dev.instance_geometry(&mut geo, PipelineKind::Default);

        // allocation untouched
        assert_eq!(dev.instances[&geo.id].vertex_buffer, Some(buffer));
        let after = dev.gx.mem(buffer).to_vec();
        assert_ne!(before, after);

        for v in 0..4usize {
            for b in 0..stride {
                let i = v * stride + b;
                if (color_off..color_off + 4).contains(&b) {
                    assert_eq!(after[i], 9, "color byte {} not repacked", b);
                } else {
                    assert_eq!(after[i], before[i], "byte {} changed outside colors", b);
                }
            }
        }
        assert!(dev.instances[&geo.id].inst[0].vertex_alpha);
    }

    #[test]
    fn test_serial_change_forces_full_reinstance() {
        let mut dev = open_device();
        let mut geo = quad_geometry(1, full_flags());
        dev.instance_geometry(&mut geo, PipelineKind::Default);
        let buffer0 = dev.instances[&geo.id].vertex_buffer;

        geo.mesh_header.serial = 2;
        geo.mesh_header.meshes[0].indices = vec![0, 1, 2];
        dev.instance_geometry(&mut geo, PipelineKind::Default);

        let header = &dev.instances[&geo.id];
        assert_eq!(header.serial, 2);
        assert_eq!(header.inst[0].num_index, 3);
        // the old buffer was discarded; a fresh allocation took its place
        assert_ne!(header.vertex_buffer, buffer0);
    }

    #[test]
    fn test_native_geometry_is_skipped() {
        let mut dev = open_device();
        let mut geo = quad_geometry(1, full_flags() | GeometryFlags::NATIVE);
        dev.instance_geometry(&mut geo, PipelineKind::Default);
        assert!(!dev.instances.contains_key(&geo.id));
    }

    #[test]
    #[should_panic(expected = "uninstancing hardware geometry is not supported")]
    fn test_uninstance_is_fatal() {
        let mut dev = open_device();
        let mut geo = quad_geometry(1, full_flags());
        dev.uninstance_geometry(&mut geo);
    }

    #[test]
    fn test_vertex_alpha_detection_per_submesh() {
        let mut dev = open_device();
        let mut geo = quad_geometry(1, full_flags());
        // two submeshes over disjoint vertex ranges
        geo.mesh_header.meshes = vec![
            Mesh {
                indices: vec![0, 1, 2],
                material: MaterialId(0),
            },
            Mesh {
                indices: vec![1, 2, 3],
                material: MaterialId(1),
            },
        ];
        // only vertex 3 is translucent
        geo.colors[3] = Rgba::new(255, 255, 255, 100);
        dev.instance_geometry(&mut geo, PipelineKind::Default);

        let header = &dev.instances[&geo.id];
        assert!(!header.inst[0].vertex_alpha);
        assert!(header.inst[1].vertex_alpha);
    }

    #[test]
    fn test_destroy_native_data_releases_memory() {
        let mut dev = open_device();
        let mut geo = quad_geometry(1, full_flags());
        let free0 = dev.gx.linear_free();
        dev.instance_geometry(&mut geo, PipelineKind::Default);
        assert!(dev.gx.linear_free() < free0);
        dev.destroy_native_data(&geo);
        assert_eq!(dev.gx.linear_free(), free0);
        assert!(!dev.instances.contains_key(&geo.id));
    }

    #[test]
    fn test_packed_normal_range() {
        let n = pack_normal(Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(n, [0, 0, 127, 0]);
        let n = pack_normal(Vec3::new(-1.0, 0.5, 0.0));
        assert_eq!(n[0], -127);
        assert_eq!(n[1], 63);
    }
}
