//! Draw submission and the retained render paths.
//!
//! `draw_inst` is where the compositing-quirk emulation lives: an older
//! target's rasterizer let fragments that failed the alpha test write
//! color but not depth. When the emulation flag is on and blending is
//! enabled, one draw becomes two - fragments passing the reference with
//! depth writes, then the complementary set with depth writes off. This is
//! a deliberate reproduction of that hardware's semantics, not a
//! workaround.

use glam::{Mat4, Vec4};
use kiln_common::{
    EnvMapEffect, Geometry, GeometryFlags, GeometryId, Hierarchy, Material, MaterialEffect, Skin,
    Texture, WorldLights,
};

use crate::device::Device;
use crate::instance::PipelineKind;
use crate::render_state::{
    ALPHA_ALWAYS, ALPHA_GREATER_EQUAL, ALPHA_LESS, BLEND_ONE, BLEND_SRC_ALPHA, RenderState,
};
use crate::skin::{MAX_BONES, compute_bone_matrices};
use crate::hw::{GxHardware, ShaderProgram, UniformReg};

/// Normal-to-texcoord basis for the environment map pass: maps the
/// reflected normal's XY into [0,1] texture space with Y flipped.
fn normal_to_texcoord() -> Mat4 {
    Mat4::from_cols(
        Vec4::new(0.5, 0.0, 0.0, 0.0),
        Vec4::new(0.0, -0.5, 0.0, 0.0),
        Vec4::new(0.0, 0.0, 1.0, 0.0),
        Vec4::new(0.5, 0.5, 0.0, 1.0),
    )
}

impl<G: GxHardware> Device<G> {
    /// Bind an engine texture to a stage: raster plus its sampling state.
    pub fn set_texture(&mut self, stage: usize, tex: Option<&Texture>) {
        match tex {
            None => {
                self.state
                    .set_raster_stage(&mut self.gx, &self.rasters, stage, None);
            }
            Some(t) => {
                let id = if t.raster.is_valid() {
                    Some(t.raster)
                } else {
                    None
                };
                self.state
                    .set_raster_stage(&mut self.gx, &self.rasters, stage, id);
                self.state.set_raster_params(
                    &mut self.gx,
                    &mut self.rasters,
                    stage,
                    Some(t.filter as u32),
                    Some(t.address_u as u32),
                    Some(t.address_v as u32),
                );
            }
        }
    }

    /// Commit everything buffered: scene uniforms, object uniforms, then
    /// fixed-function state, each gated by its own dirty flag.
    pub fn flush_cache(&mut self) {
        self.uniforms.flush_scene(&mut self.gx);
        self.uniforms.flush_object(&mut self.gx);
        self.state.flush(&mut self.gx);
        if self.state.state_dirty {
            // fog range changes land here; the fog path is accepted but
            // inert, so consuming the flag is all there is to do
            self.state.state_dirty = false;
        }
    }

    pub(crate) fn use_program(&mut self, program: ShaderProgram) {
        if self.current_program != Some(program) {
            self.gx.bind_program(program);
            self.current_program = Some(program);
        }
    }

    fn draw_inst_simple(&mut self, geo_id: GeometryId, mesh: usize) {
        self.flush_cache();
        let inst = &self.instances[&geo_id].inst[mesh];
        let (prim, indices, count) = (
            self.instances[&geo_id].prim,
            inst.index_buffer,
            inst.num_index as usize,
        );
        self.gx.draw_elements(prim, indices, count);
    }

    /// Two-pass emulation of the old compositing quirk (failed alpha test
    /// writes color but not depth).
    fn draw_inst_gs_emu(&mut self, geo_id: GeometryId, mesh: usize) {
        let has_alpha = self.state.get_alpha_blend();
        if !has_alpha {
            self.draw_inst_simple(geo_id, mesh);
            return;
        }

        let zwrite = self.get_render_state(RenderState::ZWriteEnable);
        let alpha_func = self.get_render_state(RenderState::AlphaTestFunc);
        if zwrite != 0 {
            let alpha_ref = self.get_render_state(RenderState::AlphaTestRef);
            let gs_alpha_ref = self.get_render_state(RenderState::GsAlphaTestRef);

            self.set_render_state(RenderState::AlphaTestFunc, ALPHA_GREATER_EQUAL);
            self.set_render_state(RenderState::AlphaTestRef, gs_alpha_ref);
            self.draw_inst_simple(geo_id, mesh);

            self.set_render_state(RenderState::AlphaTestFunc, ALPHA_LESS);
            self.set_render_state(RenderState::ZWriteEnable, 0);
            self.draw_inst_simple(geo_id, mesh);

            self.set_render_state(RenderState::ZWriteEnable, 1);
            self.set_render_state(RenderState::AlphaTestFunc, alpha_func);
            self.set_render_state(RenderState::AlphaTestRef, alpha_ref);
        } else {
            self.set_render_state(RenderState::AlphaTestFunc, ALPHA_ALWAYS);
            self.draw_inst_simple(geo_id, mesh);
            self.set_render_state(RenderState::AlphaTestFunc, alpha_func);
        }
    }

    fn draw_inst(&mut self, geo_id: GeometryId, mesh: usize) {
        if self.get_render_state(RenderState::GsAlphaTest) != 0 {
            self.draw_inst_gs_emu(geo_id, mesh);
        } else {
            self.draw_inst_simple(geo_id, mesh);
        }
    }

    /// Load the object lighting uniforms for one atomic's draw.
    ///
    /// Geometry without normals cannot be lit by anything directional, so
    /// those lights are dropped; ambient survives either way.
    pub fn lighting_cb(&mut self, geo_flags: GeometryFlags, lights: &WorldLights) -> i32 {
        if geo_flags.contains(GeometryFlags::LIGHT) {
            if !geo_flags.contains(GeometryFlags::NORMALS) {
                let reduced = WorldLights {
                    ambient: lights.ambient,
                    directionals: Vec::new(),
                    locals: Vec::new(),
                };
                self.uniforms.set_lights(&reduced)
            } else {
                self.uniforms.set_lights(lights)
            }
        } else {
            self.uniforms.set_lights(&WorldLights::none())
        }
    }

    /// Default retained render path for one atomic.
    pub fn render_atomic(
        &mut self,
        geo: &mut Geometry,
        world: &Mat4,
        lights: &WorldLights,
        materials: &[Material],
    ) {
        self.instance_geometry(geo, PipelineKind::Default);
        self.uniforms.set_world(world);
        self.lighting_cb(geo.flags, lights);
        self.set_attrib_pointers(geo.id);
        self.use_program(ShaderProgram::Default);

        let n = self.instances[&geo.id].inst.len();
        for mesh in 0..n {
            let (material, vertex_alpha) = {
                let inst = &self.instances[&geo.id].inst[mesh];
                (inst.material, inst.vertex_alpha)
            };
            let mat = &materials[material.0 as usize];
            self.uniforms
                .set_material_for(&mut self.gx, geo.flags, mat.color, &mat.surface_props);
            self.set_texture(0, mat.texture.as_ref());
            let alpha = vertex_alpha || mat.color.a != 0xFF;
            self.set_render_state(RenderState::VertexAlpha, alpha as u32);
            self.draw_inst(geo.id, mesh);
        }
    }

    /// Retained render path honoring per-material effects.
    pub fn render_atomic_matfx(
        &mut self,
        geo: &mut Geometry,
        world: &Mat4,
        lights: &WorldLights,
        materials: &[Material],
    ) {
        self.instance_geometry(geo, PipelineKind::Default);
        self.uniforms.set_world(world);
        self.lighting_cb(geo.flags, lights);
        self.set_attrib_pointers(geo.id);

        let n = self.instances[&geo.id].inst.len();
        for mesh in 0..n {
            let material = self.instances[&geo.id].inst[mesh].material;
            let mat = &materials[material.0 as usize];
            match &mat.effect {
                MaterialEffect::EnvMap(env) => {
                    self.matfx_env_render(geo.flags, geo.id, mesh, mat, env);
                }
                MaterialEffect::None => {
                    self.matfx_default_render(geo.flags, geo.id, mesh, mat);
                }
            }
        }
    }

    fn matfx_default_render(
        &mut self,
        geo_flags: GeometryFlags,
        geo_id: GeometryId,
        mesh: usize,
        mat: &Material,
    ) {
        self.use_program(ShaderProgram::Default);
        self.uniforms
            .set_material_for(&mut self.gx, geo_flags, mat.color, &mat.surface_props);
        self.set_texture(0, mat.texture.as_ref());
        let vertex_alpha = self.instances[&geo_id].inst[mesh].vertex_alpha;
        let alpha = vertex_alpha || mat.color.a != 0xFF;
        self.set_render_state(RenderState::VertexAlpha, alpha as u32);
        self.draw_inst(geo_id, mesh);
    }

    fn matfx_env_render(
        &mut self,
        geo_flags: GeometryFlags,
        geo_id: GeometryId,
        mesh: usize,
        mat: &Material,
        env: &EnvMapEffect,
    ) {
        if env.texture.is_none() || env.coefficient == 0.0 {
            self.matfx_default_render(geo_flags, geo_id, mesh, mat);
            return;
        }

        self.use_program(ShaderProgram::EnvMap);
        self.set_texture(0, mat.texture.as_ref());
        self.set_texture(1, env.texture.as_ref());
        self.upload_env_matrix(env.frame.as_ref());
        self.uniforms
            .set_material_for(&mut self.gx, geo_flags, mat.color, &mat.surface_props);

        // additive source blend for the reflection pass
        self.set_render_state(RenderState::VertexAlpha, 1);
        self.set_render_state(RenderState::SrcBlend, BLEND_ONE);
        self.draw_inst(geo_id, mesh);
        self.set_render_state(RenderState::SrcBlend, BLEND_SRC_ALPHA);
    }

    /// Upload the environment texture matrix: the inverted orienting frame
    /// (translation dropped) composed with the normal-to-texcoord basis.
    fn upload_env_matrix(&mut self, frame: Option<&Mat4>) {
        let ltm = frame
            .copied()
            .or_else(|| self.current_camera.as_ref().map(|c| c.frame.ltm))
            .unwrap_or(Mat4::IDENTITY);
        let mut inv = ltm.inverse();
        inv.w_axis = Vec4::new(0.0, 0.0, 0.0, 1.0);
        let env = normal_to_texcoord() * inv;
        self.gx.set_uniform_mat4(UniformReg::TexMatrix, &env);
    }

    /// Skinned render path: recompute bone matrices, rewrite the vertex
    /// buffer, then draw. The emulated-quirk path never applies here.
    pub fn render_skinned_atomic(
        &mut self,
        geo: &mut Geometry,
        world: &Mat4,
        skin: &Skin,
        hierarchy: Option<&Hierarchy>,
        lights: &WorldLights,
        materials: &[Material],
    ) {
        self.instance_geometry(geo, PipelineKind::Skin);

        let mut bone_mats = [Mat4::IDENTITY; MAX_BONES];
        compute_bone_matrices(skin, hierarchy, world, &mut bone_mats);
        self.transform_skinned_geometry(geo, skin, &bone_mats);

        self.uniforms.set_world(world);
        self.lighting_cb(geo.flags, lights);
        self.set_attrib_pointers(geo.id);
        self.use_program(ShaderProgram::Default);

        let n = self.instances[&geo.id].inst.len();
        for mesh in 0..n {
            let (material, vertex_alpha) = {
                let inst = &self.instances[&geo.id].inst[mesh];
                (inst.material, inst.vertex_alpha)
            };
            let mat = &materials[material.0 as usize];
            self.uniforms
                .set_material_for(&mut self.gx, geo.flags, mat.color, &mat.surface_props);
            self.set_texture(0, mat.texture.as_ref());
            let alpha = vertex_alpha || mat.color.a != 0xFF;
            self.set_render_state(RenderState::VertexAlpha, alpha as u32);
            self.draw_inst_simple(geo.id, mesh);
        }

        // the GPU may still be reading the buffer this path rewrites every
        // draw; wait before the next rewrite can touch it
        let buffer = self.instances[&geo.id]
            .vertex_buffer
            .expect("instance without vertex buffer");
        self.gx.flush_data_cache(buffer);
        self.gx.frame_split();
    }
}
