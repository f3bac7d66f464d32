//! CPU skinning.
//!
//! The vertex units cannot hold enough bone matrices for real skeletons,
//! so skinning happens on the CPU: every draw of a skinned atomic
//! recomputes the object-space bone matrices and rewrites the instance's
//! vertex buffer with blended positions and normals. Nothing is cached
//! across frames; animated skeletons invalidate everything every frame
//! anyway.

use glam::{Mat4, Vec3};
use kiln_common::{Geometry, GeometryFlags, Hierarchy, HierarchyFlags, Skin};

use crate::device::Device;
use crate::hw::{AttrKind, GxHardware};
use crate::instance::{
    ATTRIB_COLOR, ATTRIB_NORMAL, ATTRIB_POS, ATTRIB_TEXCOORDS0, AttribDesc, MAX_ATTRIBS,
    gen_attrib_layout,
};
use crate::texture_memory::safe_linear_alloc;

/// Bone matrix budget. Content wants more; it gets blended down to this.
pub const MAX_BONES: usize = 64;

/// Compute the per-bone blend matrices for one draw.
///
/// With a hierarchy in local space each bone is the node matrix composed
/// with the skin's inverse bind matrix; in global space the inverse of the
/// atomic's world matrix is folded in as well. Without a hierarchy every
/// bone is identity.
pub fn compute_bone_matrices(
    skin: &Skin,
    hierarchy: Option<&Hierarchy>,
    atomic_world: &Mat4,
    out: &mut [Mat4; MAX_BONES],
) {
    match hierarchy {
        Some(hier) => {
            assert_eq!(skin.num_bones, hier.num_nodes());
            let n = hier.num_nodes().min(MAX_BONES);
            if hier.flags.contains(HierarchyFlags::LOCAL_SPACE_MATRICES) {
                for i in 0..n {
                    out[i] = hier.matrices[i] * skin.inverse_matrices[i];
                }
            } else {
                let inv_world = atomic_world.inverse();
                for i in 0..n {
                    out[i] = inv_world * hier.matrices[i] * skin.inverse_matrices[i];
                }
            }
        }
        None => {
            let n = skin.num_bones.min(MAX_BONES);
            out[..n].fill(Mat4::IDENTITY);
        }
    }
}

/// Blend one position over its (up to four) bone influences. The result is
/// the plain weighted sum; weights are taken as-is, with no implicit
/// renormalization.
pub fn skin_position(
    pos: Vec3,
    weights: &[f32; 4],
    indices: &[u8; 4],
    mats: &[Mat4; MAX_BONES],
) -> Vec3 {
    let mut out = Vec3::ZERO;
    for i in 0..4 {
        out += mats[indices[i] as usize].transform_point3(pos) * weights[i];
    }
    out
}

/// Blend one normal and pack it into the signed-byte attribute form.
/// The largest component is scaled to magnitude 127 so the byte lanes use
/// their full precision.
pub fn skin_normal_packed(
    nrm: Vec3,
    weights: &[f32; 4],
    indices: &[u8; 4],
    mats: &[Mat4; MAX_BONES],
) -> [i8; 4] {
    let mut v = Vec3::ZERO;
    for i in 0..4 {
        v += mats[indices[i] as usize].transform_vector3(nrm) * weights[i];
    }

    let m = v.x.abs().max(v.y.abs()).max(v.z.abs());
    if m == 0.0 {
        return [0, 0, 0, 0];
    }
    let s = 127.0 / m;
    [
        (s * v.x) as i8,
        (s * v.y) as i8,
        (s * v.z) as i8,
        0,
    ]
}

impl<G: GxHardware> Device<G> {
    /// Skin pipeline instance callback: builds the layout and the buffer,
    /// nothing else. The vertex data is rewritten at every draw by
    /// `transform_skinned_geometry`.
    pub(crate) fn skin_instance_cb(&mut self, geo: &Geometry, reinstance: bool) {
        if reinstance {
            return;
        }

        let is_prelit = geo.flags.contains(GeometryFlags::PRELIT);
        let has_normals = geo.flags.contains(GeometryFlags::NORMALS);
        let has_texcoords = geo.num_tex_coord_sets() > 0;

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
        if has_texcoords {
            push(ATTRIB_TEXCOORDS0, 2, AttrKind::Float, 4);
        }

        header.attribs = attribs;
        header.stride = stride;
        header.num_attribs = num_attribs;
        header.layout = gen_attrib_layout(&attribs);

        let size = header.total_num_vertex as usize * stride;
        header.vertex_buffer_size = size;
        let buffer = safe_linear_alloc(&mut self.gx, &mut self.rasters, &mut self.texmem, size);
        self.instances.get_mut(&geo.id).unwrap().vertex_buffer = Some(buffer);
    }

    /// Rewrite a skinned geometry's vertex buffer with blended data.
    pub(crate) fn transform_skinned_geometry(
        &mut self,
        geo: &Geometry,
        skin: &Skin,
        bone_mats: &[Mat4; MAX_BONES],
    ) {
        let header = self.instances.get(&geo.id).expect("geometry not instanced");
        let stride = header.stride;
        let attribs = header.attribs;
        let size = header.vertex_buffer_size;
        let buffer = header.vertex_buffer.expect("instance without vertex buffer");
        let nv = header.total_num_vertex as usize;

        let target = &geo.morph_targets[0];
        let buf = &mut self.gx.mem_mut(buffer)[..size];

        for i in 0..nv {
            let weights = &skin.weights[i];
            let indices = &skin.indices[i];
            let base = i * stride;

            let pos = skin_position(target.vertices[i], weights, indices, bone_mats);
            let at = base + attribs[ATTRIB_POS].offset as usize;
            buf[at..at + 12].copy_from_slice(bytemuck::cast_slice(&pos.to_array()));

            if attribs[ATTRIB_NORMAL].count > 0 {
                let packed = skin_normal_packed(target.normals[i], weights, indices, bone_mats);
                let at = base + attribs[ATTRIB_NORMAL].offset as usize;
                buf[at..at + 4].copy_from_slice(bytemuck::cast_slice(&packed));
            }

            if attribs[ATTRIB_COLOR].count > 0 {
                let c = geo.colors[i];
                let at = base + attribs[ATTRIB_COLOR].offset as usize;
                buf[at..at + 4].copy_from_slice(&[c.r, c.g, c.b, c.a]);
            }

            if attribs[ATTRIB_TEXCOORDS0].count > 0 {
                let uv = geo.tex_coords[0][i];
                let at = base + attribs[ATTRIB_TEXCOORDS0].offset as usize;
                buf[at..at + 8].copy_from_slice(bytemuck::cast_slice(&uv.to_array()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceConfig};
    use crate::hw::GxHardware;
    use crate::hw::sim::SimGx;
    use crate::instance::PipelineKind;
    use crate::instance::tests::{full_flags, quad_geometry};

    fn identity_mats() -> Box<[Mat4; MAX_BONES]> {
        Box::new([Mat4::IDENTITY; MAX_BONES])
    }

    fn simple_skin(num_vertices: usize, num_bones: usize) -> Skin {
        Skin {
            num_bones,
            weights: vec![[1.0, 0.0, 0.0, 0.0]; num_vertices],
            indices: vec![[0, 0, 0, 0]; num_vertices],
            inverse_matrices: vec![Mat4::IDENTITY; num_bones],
        }
    }

    #[test]
    fn test_single_full_weight_is_exact_transform() {
        let mut mats = identity_mats();
        mats[3] = Mat4::from_translation(Vec3::new(5.0, -2.0, 1.0));
        let pos = Vec3::new(1.0, 2.0, 3.0);
        let out = skin_position(pos, &[1.0, 0.0, 0.0, 0.0], &[3, 0, 0, 0], &mats);
        let expected = mats[3].transform_point3(pos);
        assert!((out - expected).length() < 1e-6);
    }

    #[test]
    fn test_weights_below_one_are_not_renormalized() {
        let mut mats = identity_mats();
        mats[1] = Mat4::from_translation(Vec3::X * 10.0);
        mats[2] = Mat4::from_translation(Vec3::Y * 10.0);
        let pos = Vec3::ZERO;
        // weights sum to 0.5: output is the exact weighted sum
        let out = skin_position(pos, &[0.25, 0.25, 0.0, 0.0], &[1, 2, 0, 0], &mats);
        let expected = Vec3::new(2.5, 2.5, 0.0);
        assert!((out - expected).length() < 1e-6);
    }

    #[test]
    fn test_four_bone_blend() {
        let mut mats = identity_mats();
        for (i, m) in mats.iter_mut().enumerate().take(4) {
            *m = Mat4::from_translation(Vec3::X * i as f32);
        }
        let out = skin_position(
            Vec3::ZERO,
            &[0.1, 0.2, 0.3, 0.4],
            &[0, 1, 2, 3],
            &mats,
        );
        // 0*0.1 + 1*0.2 + 2*0.3 + 3*0.4 = 2.0
        assert!((out - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_bone_matrices_identity_without_hierarchy() {
        let skin = simple_skin(1, 4);
        let mut mats = identity_mats();
        mats[0] = Mat4::from_translation(Vec3::X); // stale data
        compute_bone_matrices(&skin, None, &Mat4::IDENTITY, &mut mats);
        for m in mats.iter().take(4) {
            assert_eq!(*m, Mat4::IDENTITY);
        }
    }

    #[test]
    fn test_bone_matrices_local_space() {
        let mut skin = simple_skin(1, 2);
        skin.inverse_matrices = vec![
            Mat4::from_translation(Vec3::new(-1.0, 0.0, 0.0)),
            Mat4::from_translation(Vec3::new(0.0, -2.0, 0.0)),
        ];
        let hier = Hierarchy {
            flags: HierarchyFlags::LOCAL_SPACE_MATRICES,
            matrices: vec![
                Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0)),
                Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0)),
            ],
        };
        let mut mats = identity_mats();
        compute_bone_matrices(&skin, Some(&hier), &Mat4::IDENTITY, &mut mats);
        // inverse bind applies first, then the node matrix
        let p = mats[0].transform_point3(Vec3::new(1.0, 0.0, 0.0));
        assert!((p - Vec3::new(3.0, 0.0, 0.0)).length() < 1e-6);
        let p = mats[1].transform_point3(Vec3::new(0.0, 2.0, 0.0));
        assert!((p - Vec3::new(0.0, 5.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_bone_matrices_global_space_fold_in_world_inverse() {
        let mut skin = simple_skin(1, 1);
        skin.inverse_matrices = vec![Mat4::IDENTITY];
        let world = Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0));
        let hier = Hierarchy {
            flags: HierarchyFlags::empty(),
            matrices: vec![world],
        };
        let mut mats = identity_mats();
        compute_bone_matrices(&skin, Some(&hier), &world, &mut mats);
        // hierarchy matrices equal to the atomic's world cancel out
        let p = mats[0].transform_point3(Vec3::new(1.0, 2.0, 3.0));
        assert!((p - Vec3::new(1.0, 2.0, 3.0)).length() < 1e-6);
    }

    #[test]
    fn test_normal_packing_scales_dominant_axis() {
        let mats = identity_mats();
        let packed = skin_normal_packed(
            Vec3::new(0.0, 0.5, 0.0),
            &[1.0, 0.0, 0.0, 0.0],
            &[0, 0, 0, 0],
            &mats,
        );
        // dominant axis hits exactly 127 regardless of input magnitude
        assert_eq!(packed, [0, 127, 0, 0]);

        let packed = skin_normal_packed(
            Vec3::new(-0.8, 0.4, 0.0),
            &[1.0, 0.0, 0.0, 0.0],
            &[0, 0, 0, 0],
            &mats,
        );
        assert_eq!(packed[0], -127);
        assert_eq!(packed[1], 63);
    }

    #[test]
    fn test_zero_normal_packs_to_zero() {
        let mats = identity_mats();
        let packed = skin_normal_packed(
            Vec3::ZERO,
            &[0.0, 0.0, 0.0, 0.0],
            &[0, 0, 0, 0],
            &mats,
        );
        assert_eq!(packed, [0, 0, 0, 0]);
    }

    #[test]
    fn test_skin_instance_and_transform() {
        let mut dev = Device::open(SimGx::new(), DeviceConfig::default());
        let mut geo = quad_geometry(1, full_flags());
        dev.instance_geometry(&mut geo, PipelineKind::Skin);

        let header = &dev.instances[&geo.id];
        // pos(12) + normal(4) + color(4) + uv(8)
        assert_eq!(header.stride, 28);
        let buffer = header.vertex_buffer.unwrap();

        let skin = simple_skin(4, 2);
        let mut mats = identity_mats();
        mats[0] = Mat4::from_translation(Vec3::new(0.0, 0.0, 7.0));
        dev.transform_skinned_geometry(&geo, &skin, &mats);

        // vertex 0 position blended through bone 0
        let buf = dev.gx.mem(buffer);
        let z = f32::from_le_bytes(buf[8..12].try_into().unwrap());
        assert!((z - 7.0).abs() < 1e-6);
    }
}
