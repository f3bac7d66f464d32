//! Scene-, object- and material-level uniform state.
//!
//! Scene (projection/view) and object (world matrix, ambient, lights)
//! uniforms are buffered and committed by the device flush, each gated by
//! its own dirty flag. Material uniforms are cheap and uploaded directly at
//! `set_material`, guarded by change detection.

use glam::{Mat4, Vec4};
use kiln_common::{GeometryFlags, Rgba, Rgbaf, SurfaceProperties, WorldLights};

use crate::hw::{GxHardware, UniformReg};

/// Uniform slots available for lights
pub const MAX_LIGHTS: usize = 8;

// Light kind bits reported back to the pipeline (they select the vertex
// shader variant)
pub const LIGHT_DIRECT: i32 = 1;
pub const LIGHT_POINT: i32 = 2;
pub const LIGHT_SPOT: i32 = 4;
pub const LIGHT_AMBIENT: i32 = 8;

struct UniformScene {
    proj: Mat4,
    view: Mat4,
}

struct UniformObject {
    world: Mat4,
    amb_light: Rgbaf,
    n_lights: usize,
    /// x = light kind (0 terminates, 1 directional; 2/3 reserved for the
    /// point/spot extension), y = radius, z = -cos(angle), w = hard spot
    light_params: [Vec4; MAX_LIGHTS],
    light_position: [Vec4; MAX_LIGHTS],
    light_direction: [Vec4; MAX_LIGHTS],
    light_color: [Vec4; MAX_LIGHTS],
}

struct MaterialState {
    mat_color: Rgba,
    surf_props: SurfaceProperties,
    extra_surf_prop: f32,
}

/// All buffered uniform state plus the dirty flags gating its commit.
pub struct Uniforms {
    scene: UniformScene,
    object: UniformObject,
    material: MaterialState,
    pub scene_dirty: bool,
    pub object_dirty: bool,
}

impl Uniforms {
    pub fn new() -> Self {
        Self {
            scene: UniformScene {
                proj: Mat4::IDENTITY,
                view: Mat4::IDENTITY,
            },
            object: UniformObject {
                world: Mat4::IDENTITY,
                amb_light: Rgbaf::new(0.0, 0.0, 0.0, 0.0),
                n_lights: 0,
                light_params: [Vec4::ZERO; MAX_LIGHTS],
                light_position: [Vec4::ZERO; MAX_LIGHTS],
                light_direction: [Vec4::ZERO; MAX_LIGHTS],
                light_color: [Vec4::ZERO; MAX_LIGHTS],
            },
            material: MaterialState {
                mat_color: Rgba::new(0, 0, 0, 0),
                surf_props: SurfaceProperties {
                    ambient: -1.0,
                    specular: -1.0,
                    diffuse: -1.0,
                },
                extra_surf_prop: -1.0,
            },
            scene_dirty: true,
            object_dirty: true,
        }
    }

    /// Drop cached light state (render-state reset path)
    pub fn reset_lights(&mut self) {
        self.object.light_params = [Vec4::ZERO; MAX_LIGHTS];
        self.object.n_lights = 0;
        self.object_dirty = true;
    }

    pub fn set_projection(&mut self, proj: Mat4) {
        self.scene.proj = proj;
        self.scene_dirty = true;
    }

    pub fn set_view(&mut self, view: Mat4) {
        self.scene.view = view;
        self.scene_dirty = true;
    }

    pub fn set_world(&mut self, world: &Mat4) {
        self.object.world = *world;
        self.object_dirty = true;
    }

    /// Load the object light uniforms from an enumerated light set.
    ///
    /// Only directional lights are consumed; point/spot lights stay in
    /// `lights.locals` untouched (the uniform layout keeps room for them).
    /// Returns the light kind bits for shader selection.
    pub fn set_lights(&mut self, lights: &WorldLights) -> i32 {
        let mut bits = 0;

        self.object.amb_light = lights.ambient.unwrap_or(Rgbaf::new(0.0, 0.0, 0.0, 0.0));
        if lights.ambient.is_some() {
            bits |= LIGHT_AMBIENT;
        }

        let mut n = 0;
        for light in lights.directionals.iter() {
            if n >= MAX_LIGHTS {
                break;
            }
            self.object.light_params[n] = Vec4::new(1.0, 0.0, 0.0, 0.0);
            self.object.light_color[n] = Vec4::from_array(light.color.to_array());
            self.object.light_direction[n] = light.direction.extend(0.0);
            bits |= LIGHT_DIRECT;
            n += 1;
        }

        if n < MAX_LIGHTS {
            // terminator entry
            self.object.light_params[n] = Vec4::ZERO;
        }
        self.object.n_lights = n;
        self.object_dirty = true;
        bits
    }

    /// Upload material color and surface properties, skipping whatever the
    /// hardware already holds.
    pub fn set_material(
        &mut self,
        gx: &mut dyn GxHardware,
        color: Rgba,
        surf_props: &SurfaceProperties,
        extra_surf_prop: f32,
    ) {
        if self.material.mat_color != color {
            let c = Rgbaf::from(color);
            gx.set_uniform_vec4(UniformReg::MatColor, Vec4::from_array(c.to_array()));
            self.material.mat_color = color;
        }

        if self.material.surf_props != *surf_props
            || self.material.extra_surf_prop != extra_surf_prop
        {
            gx.set_uniform_vec4(
                UniformReg::SurfProps,
                Vec4::new(
                    surf_props.ambient,
                    surf_props.specular,
                    surf_props.diffuse,
                    extra_surf_prop,
                ),
            );
            self.material.surf_props = *surf_props;
            self.material.extra_surf_prop = extra_surf_prop;
        }
    }

    /// Material upload honoring the geometry's modulate flag: without it
    /// the material color is substituted with white.
    pub fn set_material_for(
        &mut self,
        gx: &mut dyn GxHardware,
        flags: GeometryFlags,
        color: Rgba,
        surf_props: &SurfaceProperties,
    ) {
        if flags.contains(GeometryFlags::MODULATE_MATERIAL_COLOR) {
            self.set_material(gx, color, surf_props, 0.0);
        } else {
            self.set_material(gx, Rgba::WHITE, surf_props, 0.0);
        }
    }

    /// Commit scene-level uniforms if dirty.
    pub fn flush_scene(&mut self, gx: &mut dyn GxHardware) {
        if self.scene_dirty {
            gx.set_uniform_mat4(UniformReg::Proj, &self.scene.proj);
            gx.set_uniform_mat4(UniformReg::View, &self.scene.view);
            self.scene_dirty = false;
        }
    }

    /// Commit object-level uniforms if dirty.
    pub fn flush_object(&mut self, gx: &mut dyn GxHardware) {
        if self.object_dirty {
            gx.set_uniform_mat4(UniformReg::World, &self.object.world);
            gx.set_uniform_vec4(
                UniformReg::AmbLight,
                Vec4::from_array(self.object.amb_light.to_array()),
            );

            let n = self.object.n_lights;
            let n_params = MAX_LIGHTS.min(n + 1);
            gx.set_uniform_vec4_array(
                UniformReg::LightParams,
                &self.object.light_params[..n_params],
            );
            gx.set_uniform_vec4_array(
                UniformReg::LightPosition,
                &self.object.light_position[..n],
            );
            gx.set_uniform_vec4_array(
                UniformReg::LightDirection,
                &self.object.light_direction[..n],
            );
            gx.set_uniform_vec4_array(UniformReg::LightColor, &self.object.light_color[..n]);
            self.object_dirty = false;
        }
    }
}

impl Default for Uniforms {
    fn default() -> Self {
        Self::new()
    }
}
