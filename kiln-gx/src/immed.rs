//! Immediate-mode rendering.
//!
//! The rasterizer only draws triangles, so line, polyline and point
//! topologies are converted into (degenerate) triangle lists through a
//! bounded scratch index buffer. 2D vertices arrive in screen space and go
//! through a transform uniform that also handles the rotated framebuffer.

use glam::{Mat4, Vec3, Vec4};
use kiln_common::PrimitiveType;

use crate::device::{Device, TMP_INDEX_CAPACITY};
use crate::hw::{AttrEntry, AttrKind, GxHardware, Primitive, ShaderProgram, UniformReg};
use crate::render_state::RenderState;

/// im3d transform flag: vertices carry texture coordinates
pub const IM3D_VERTEX_UV: u32 = 0x2;

/// Screen-space immediate vertex
#[derive(Debug, Clone, Copy, Default)]
pub struct Im2DVertex {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Camera-space depth (used for perspective-correct interpolation)
    pub w: f32,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
    pub u: f32,
    pub v: f32,
}

/// World-space immediate vertex
#[derive(Debug, Clone, Copy, Default)]
pub struct Im3DVertex {
    pub position: Vec3,
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
    pub u: f32,
    pub v: f32,
}

/// Vertex input layout shared by both immediate paths:
/// position (f32x4), color (f32x4), texcoord (f32x2)
const IMM_LAYOUT: [AttrEntry; 3] = [
    AttrEntry::Loader {
        kind: AttrKind::Float,
        count: 4,
    },
    AttrEntry::Loader {
        kind: AttrKind::Float,
        count: 4,
    },
    AttrEntry::Loader {
        kind: AttrKind::Float,
        count: 2,
    },
];

/// How converted indices are sourced
enum ConvertedIndices {
    /// Use the caller's indices (or sequential order) as-is
    Direct,
    /// Use the device's scratch index buffer
    Scratch,
}

impl<G: GxHardware> Device<G> {
    /// Map an engine topology onto the rasterizer. Unsupported topologies
    /// are rewritten into triangle lists in the scratch buffer; `None`
    /// means there is nothing to draw.
    fn convert_primitive(
        &mut self,
        prim_type: PrimitiveType,
        indices: Option<&[u16]>,
        num: usize,
    ) -> Option<(Primitive, ConvertedIndices, usize)> {
        let index_of = |i: usize| indices.map_or(i as u16, |ind| ind[i]);

        match prim_type {
            PrimitiveType::TriList => Some((Primitive::Triangles, ConvertedIndices::Direct, num)),
            PrimitiveType::TriStrip => {
                Some((Primitive::TriangleStrip, ConvertedIndices::Direct, num))
            }
            PrimitiveType::TriFan => Some((Primitive::TriangleFan, ConvertedIndices::Direct, num)),
            PrimitiveType::PolyLine => {
                self.tmp_index.clear();
                let mut i = 0;
                while i + 1 < num && self.tmp_index.len() + 3 <= TMP_INDEX_CAPACITY {
                    let a = index_of(i);
                    let b = index_of(i + 1);
                    self.tmp_index.extend_from_slice(&[a, b, a]);
                    i += 1;
                }
                let n = self.tmp_index.len();
                Some((Primitive::Triangles, ConvertedIndices::Scratch, n))
            }
            PrimitiveType::LineList => {
                self.tmp_index.clear();
                let mut i = 0;
                while i + 1 < num && self.tmp_index.len() + 3 <= TMP_INDEX_CAPACITY {
                    let a = index_of(i);
                    let b = index_of(i + 1);
                    self.tmp_index.extend_from_slice(&[a, b, a]);
                    i += 2;
                }
                let n = self.tmp_index.len();
                Some((Primitive::Triangles, ConvertedIndices::Scratch, n))
            }
            PrimitiveType::PointList => {
                self.tmp_index.clear();
                let mut i = 0;
                while i < num && self.tmp_index.len() + 3 <= TMP_INDEX_CAPACITY {
                    let a = index_of(i);
                    self.tmp_index.extend_from_slice(&[a, a, a]);
                    i += 1;
                }
                let n = self.tmp_index.len();
                Some((Primitive::Triangles, ConvertedIndices::Scratch, n))
            }
            PrimitiveType::None => None,
        }
    }

    /// Upload the screen-to-clip transform, honoring the rotated
    /// framebuffer of the current camera.
    fn im2d_set_xform(&mut self) {
        let (w, h, tilt) = match &self.current_camera {
            Some(cam) => {
                let fb = self.rasters.get(cam.frame_buffer);
                let sub = cam.sub_rect;
                let (w, h) = sub.map_or((fb.width, fb.height), |r| (r.w, r.h));
                (w as f32, h as f32, fb.tilt)
            }
            None => (
                self.config.window_width as f32,
                self.config.window_height as f32,
                true,
            ),
        };

        self.gx.set_uniform_vec4(
            UniformReg::Xform2d,
            Vec4::new(2.0 / w, -2.0 / h, -1.0, 1.0),
        );
        if !tilt {
            self.gx
                .set_uniform_vec4(UniformReg::Flip2d, Vec4::new(1.0, 0.0, 0.0, 1.0));
        } else {
            self.gx
                .set_uniform_vec4(UniformReg::Flip2d, Vec4::new(0.0, 1.0, -1.0, 0.0));
        }
    }

    pub fn im2d_render_line(&mut self, verts: &[Im2DVertex], v1: usize, v2: usize) {
        let tri = [verts[v1], verts[v2], verts[v1]];
        self.im2d_render_primitive(PrimitiveType::TriList, &tri);
    }

    pub fn im2d_render_triangle(&mut self, verts: &[Im2DVertex], v1: usize, v2: usize, v3: usize) {
        let tri = [verts[v1], verts[v2], verts[v3]];
        self.im2d_render_primitive(PrimitiveType::TriList, &tri);
    }

    pub fn im2d_render_primitive(&mut self, prim_type: PrimitiveType, verts: &[Im2DVertex]) {
        self.im2d_render_indexed_primitive(prim_type, verts, None);
    }

    pub fn im2d_render_indexed_primitive(
        &mut self,
        prim_type: PrimitiveType,
        verts: &[Im2DVertex],
        indices: Option<&[u16]>,
    ) {
        let num = indices.map_or(verts.len(), |ind| ind.len());
        let Some((prim, source, count)) = self.convert_primitive(prim_type, indices, num) else {
            return;
        };

        self.use_program(ShaderProgram::Im2d);
        self.flush_cache();
        self.im2d_set_xform();
        self.gx.set_attr_layout(&IMM_LAYOUT);

        self.gx.imm_begin(prim);
        for i in 0..count {
            let vi = match source {
                ConvertedIndices::Direct => indices.map_or(i, |ind| ind[i] as usize),
                ConvertedIndices::Scratch => self.tmp_index[i] as usize,
            };
            let v = verts[vi];
            self.gx.imm_send_attrib(Vec4::new(v.x, v.y, v.z, v.w));
            self.gx.imm_send_attrib(Vec4::new(
                v.r as f32 / 255.0,
                v.g as f32 / 255.0,
                v.b as f32 / 255.0,
                v.a as f32 / 255.0,
            ));
            self.gx.imm_send_attrib(Vec4::new(v.u, v.v, 0.0, 0.0));
        }
        self.gx.imm_end();
    }

    /// Full-screen quad used by the present/blit path. The V range leans
    /// into the power-of-two gap above the image.
    pub(crate) fn im2d_render_blit(&mut self) {
        let v0 = 16.0 / 256.0;
        let v1 = 1.0 + v0;

        let vtx = [
            [0.0, v0, -1.0, 1.0, 0.0, 1.0],
            [1.0, v0, -1.0, 1.0, 0.0, 0.0],
            [1.0, v1, -1.0, 1.0, 1.0, 0.0],
            [0.0, v1, -1.0, 1.0, 1.0, 1.0],
        ];
        let ind: [u16; 6] = [0, 1, 2, 0, 2, 3];

        self.use_program(ShaderProgram::Im2d);
        self.flush_cache();

        self.gx
            .set_uniform_vec4(UniformReg::Xform2d, Vec4::new(2.0, -2.0, -1.0, 1.0));
        self.gx
            .set_uniform_vec4(UniformReg::Flip2d, Vec4::new(1.0, 0.0, 0.0, 1.0));
        self.gx.set_attr_layout(&IMM_LAYOUT);

        self.gx.imm_begin(Primitive::Triangles);
        for &vi in &ind {
            let v = vtx[vi as usize];
            self.gx.imm_send_attrib(Vec4::new(v[0], v[1], v[2], v[3]));
            self.gx.imm_send_attrib(Vec4::new(1.0, 1.0, 1.0, 1.0));
            self.gx.imm_send_attrib(Vec4::new(v[4], v[5], 0.0, 0.0));
        }
        self.gx.imm_end();
    }

    /// Latch vertices and the world transform for the im3d calls that
    /// follow.
    pub fn im3d_transform(&mut self, verts: &[Im3DVertex], world: Option<&Mat4>, flags: u32) {
        let world = world.copied().unwrap_or(Mat4::IDENTITY);
        self.uniforms.set_world(&world);

        if flags & IM3D_VERTEX_UV == 0 {
            self.set_render_state(RenderState::TextureRaster, 0);
        }

        self.im3d_verts.clear();
        self.im3d_verts.extend_from_slice(verts);
    }

    pub fn im3d_render_indexed_primitive(
        &mut self,
        prim_type: PrimitiveType,
        indices: Option<&[u16]>,
    ) {
        let num = indices.map_or(self.im3d_verts.len(), |ind| ind.len());
        let Some((prim, source, count)) = self.convert_primitive(prim_type, indices, num) else {
            return;
        };

        self.use_program(ShaderProgram::Im3d);
        self.flush_cache();
        self.gx.set_attr_layout(&IMM_LAYOUT);

        self.gx.imm_begin(prim);
        for i in 0..count {
            let vi = match source {
                ConvertedIndices::Direct => indices.map_or(i, |ind| ind[i] as usize),
                ConvertedIndices::Scratch => self.tmp_index[i] as usize,
            };
            let v = self.im3d_verts[vi];
            self.gx
                .imm_send_attrib(Vec4::new(v.position.x, v.position.y, v.position.z, 1.0));
            self.gx.imm_send_attrib(Vec4::new(
                v.r as f32 / 255.0,
                v.g as f32 / 255.0,
                v.b as f32 / 255.0,
                v.a as f32 / 255.0,
            ));
            self.gx.imm_send_attrib(Vec4::new(v.u, v.v, 0.0, 0.0));
        }
        self.gx.imm_end();
    }

    pub fn im3d_render_primitive(&mut self, prim_type: PrimitiveType) {
        self.im3d_render_indexed_primitive(prim_type, None);
    }

    pub fn im3d_end(&mut self) {
        self.im3d_verts.clear();
    }
}
