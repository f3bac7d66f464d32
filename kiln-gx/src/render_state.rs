//! Render-state cache.
//!
//! Two layers of caching stand between the engine's `set_state` calls and
//! the hardware:
//!
//! - the **logical cache** holds every engine-level state value and is what
//!   `get_state` reads back; writes that do not change a logical value stop
//!   here
//! - the **staged state** is the native state machine's image of those
//!   values; at `flush` it is diffed per compound (cull, alpha test, depth,
//!   blend, stencil) against the last **committed** snapshot and only
//!   changed compounds are emitted
//!
//! The mapping tables in this module are a hardware contract and double as
//! compatibility fixtures for engine-level semantics (the legacy alpha-test
//! enumeration, the emulated compositing quirk of an older target). Do not
//! reorder them.

use kiln_common::{RasterId, TextureAddress, TextureFilter};

use crate::hw::{
    BlendEquation, BlendFactor, CompareFunc, CullMode, GxHardware, StencilOp, TexFilter, TexMem,
    TexWrap, WriteMask,
};
use crate::raster::RasterTable;

/// Number of texture stages the fragment pipeline exposes
pub const MAX_TEXTURE_STAGES: usize = 3;

/// Engine-level render states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    TextureRaster,
    TextureAddress,
    TextureAddressU,
    TextureAddressV,
    TextureFilter,
    VertexAlpha,
    SrcBlend,
    DestBlend,
    ZTestEnable,
    ZWriteEnable,
    FogEnable,
    FogColor,
    CullMode,
    StencilEnable,
    StencilFail,
    StencilZFail,
    StencilPass,
    StencilFunction,
    StencilFunctionRef,
    StencilFunctionMask,
    StencilFunctionWriteMask,
    AlphaTestFunc,
    AlphaTestRef,
    GsAlphaTest,
    GsAlphaTestRef,
}

// Engine-level state values (the generic core's vocabulary)

pub const ALPHA_ALWAYS: u32 = 0;
pub const ALPHA_GREATER_EQUAL: u32 = 1;
pub const ALPHA_LESS: u32 = 2;

pub const BLEND_ZERO: u32 = 1;
pub const BLEND_ONE: u32 = 2;
pub const BLEND_SRC_COLOR: u32 = 3;
pub const BLEND_INV_SRC_COLOR: u32 = 4;
pub const BLEND_SRC_ALPHA: u32 = 5;
pub const BLEND_INV_SRC_ALPHA: u32 = 6;
pub const BLEND_DEST_ALPHA: u32 = 7;
pub const BLEND_INV_DEST_ALPHA: u32 = 8;
pub const BLEND_DEST_COLOR: u32 = 9;
pub const BLEND_INV_DEST_COLOR: u32 = 10;
pub const BLEND_SRC_ALPHA_SAT: u32 = 11;

pub const CULL_NONE: u32 = 1;
pub const CULL_BACK: u32 = 2;
pub const CULL_FRONT: u32 = 3;

pub const STENCIL_KEEP: u32 = 1;
pub const STENCIL_ZERO: u32 = 2;
pub const STENCIL_REPLACE: u32 = 3;
pub const STENCIL_INCR_SAT: u32 = 4;
pub const STENCIL_DECR_SAT: u32 = 5;
pub const STENCIL_INVERT: u32 = 6;
pub const STENCIL_INCR: u32 = 7;
pub const STENCIL_DECR: u32 = 8;

pub const STENCIL_FUNC_NEVER: u32 = 1;
pub const STENCIL_FUNC_LESS: u32 = 2;
pub const STENCIL_FUNC_EQUAL: u32 = 3;
pub const STENCIL_FUNC_LESS_EQUAL: u32 = 4;
pub const STENCIL_FUNC_GREATER: u32 = 5;
pub const STENCIL_FUNC_NOT_EQUAL: u32 = 6;
pub const STENCIL_FUNC_GREATER_EQUAL: u32 = 7;
pub const STENCIL_FUNC_ALWAYS: u32 = 8;

/// Legacy 3-way alpha-test enumeration to native comparison functions.
/// An unsupported legacy value disables the test by substituting
/// always-pass.
const ALPHA_TEST_MAP: [CompareFunc; 3] = [
    CompareFunc::Always, // ALPHA_ALWAYS
    CompareFunc::Gequal, // ALPHA_GREATER_EQUAL
    CompareFunc::Lequal, // ALPHA_LESS
];

fn map_alpha_test(func: u32) -> CompareFunc {
    ALPHA_TEST_MAP
        .get(func as usize)
        .copied()
        .unwrap_or(CompareFunc::Always)
}

/// Engine blend modes to native blend factors; index 0 is invalid
const BLEND_MAP: [BlendFactor; 12] = [
    BlendFactor::Zero, // actually invalid
    BlendFactor::Zero,
    BlendFactor::One,
    BlendFactor::SrcColor,
    BlendFactor::OneMinusSrcColor,
    BlendFactor::SrcAlpha,
    BlendFactor::OneMinusSrcAlpha,
    BlendFactor::DstAlpha,
    BlendFactor::OneMinusDstAlpha,
    BlendFactor::DstColor,
    BlendFactor::OneMinusDstColor,
    BlendFactor::SrcAlphaSaturate,
];

/// Engine stencil operations to native ones; index 0 is invalid
const STENCIL_OP_MAP: [StencilOp; 9] = [
    StencilOp::Keep, // actually invalid
    StencilOp::Keep,
    StencilOp::Zero,
    StencilOp::Replace,
    StencilOp::Increment,
    StencilOp::Decrement,
    StencilOp::Invert,
    StencilOp::IncrementWrap,
    StencilOp::DecrementWrap,
];

/// Engine stencil functions to native comparisons; index 0 is invalid
const STENCIL_FUNC_MAP: [CompareFunc; 9] = [
    CompareFunc::Never, // actually invalid
    CompareFunc::Never,
    CompareFunc::Less,
    CompareFunc::Equal,
    CompareFunc::Lequal,
    CompareFunc::Greater,
    CompareFunc::NotEqual,
    CompareFunc::Gequal,
    CompareFunc::Always,
];

/// Engine texture filters to the two the hardware knows
const FILTER_CONV_MAP: [TexFilter; 7] = [
    TexFilter::Nearest, // was 0
    TexFilter::Nearest,
    TexFilter::Linear,
    TexFilter::Nearest,
    TexFilter::Linear,
    TexFilter::Nearest,
    TexFilter::Linear,
];

/// Engine addressing modes to native wrap modes
const ADDRESS_CONV_MAP: [TexWrap; 5] = [
    TexWrap::ClampToEdge, // was 0
    TexWrap::Repeat,
    TexWrap::MirroredRepeat,
    TexWrap::ClampToEdge,
    TexWrap::ClampToBorder,
];

/// The native state machine's image of the logical cache. Compared
/// field-by-field per compound at flush, never as a whole struct.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StagedState {
    alpha_func: CompareFunc,
    alpha_ref: u32,
    blend_enable: bool,
    src_blend: BlendFactor,
    dst_blend: BlendFactor,
    depth_test: bool,
    depth_func: CompareFunc,
    depth_mask: WriteMask,
    cull_enable: bool,
    cull_face: CullMode,
    stencil_enable: bool,
    stencil_func: CompareFunc,
    stencil_ref: u32,
    stencil_mask: u32,
    stencil_write_mask: u32,
    stencil_pass: StencilOp,
    stencil_fail: StencilOp,
    stencil_zfail: StencilOp,
    // accepted but never emitted; the fog path is deliberately inert
    fog_mode: u32,
    fog_color: u32,
}

impl Default for StagedState {
    fn default() -> Self {
        Self {
            alpha_func: CompareFunc::Gequal,
            alpha_ref: 10,
            blend_enable: false,
            src_blend: BlendFactor::SrcAlpha,
            dst_blend: BlendFactor::OneMinusSrcAlpha,
            depth_test: false,
            depth_func: CompareFunc::Gequal,
            depth_mask: WriteMask::ALL,
            cull_enable: false,
            cull_face: CullMode::BackCcw,
            stencil_enable: false,
            stencil_func: CompareFunc::Always,
            stencil_ref: 0,
            stencil_mask: 0xFFFF_FFFF,
            stencil_write_mask: 0xFFFF_FFFF,
            stencil_pass: StencilOp::Keep,
            stencil_fail: StencilOp::Keep,
            stencil_zfail: StencilOp::Keep,
            fog_mode: 0,
            fog_color: 0,
        }
    }
}

/// The render-state cache.
pub struct StateCache {
    // logical engine-level state
    vertex_alpha: bool,
    texture_alpha: bool,
    alpha_test_enable: bool,
    alpha_func: u32,
    alpha_ref: u32,
    blend_enable: bool,
    src_blend: u32,
    dst_blend: u32,
    z_test: bool,
    z_write: bool,
    cull_mode: u32,
    stencil_enable: u32,
    stencil_fail: u32,
    stencil_zfail: u32,
    stencil_pass: u32,
    stencil_func: u32,
    stencil_ref: u32,
    stencil_mask: u32,
    stencil_write_mask: u32,
    fog_enable: u32,
    fog_color: u32,
    pub(crate) fog_start: f32,
    pub(crate) fog_end: f32,
    // emulation of the old compositing quirk: failed alpha test still
    // writes color but not depth
    gs_alpha: bool,
    gs_alpha_ref: u32,
    tex_stage: [Option<RasterId>; MAX_TEXTURE_STAGES],

    cur: StagedState,
    committed: Option<StagedState>,
    /// Set when fog range or another deferred state changed; consumed by
    /// the device's flush
    pub(crate) state_dirty: bool,

    white_tex: TexMem,
}

impl StateCache {
    pub fn new(white_tex: TexMem) -> Self {
        Self {
            vertex_alpha: false,
            texture_alpha: false,
            alpha_test_enable: false,
            alpha_func: ALPHA_GREATER_EQUAL,
            alpha_ref: 10,
            blend_enable: false,
            src_blend: BLEND_SRC_ALPHA,
            dst_blend: BLEND_INV_SRC_ALPHA,
            z_test: false,
            z_write: true,
            cull_mode: CULL_NONE,
            stencil_enable: 0,
            stencil_fail: STENCIL_KEEP,
            stencil_zfail: STENCIL_KEEP,
            stencil_pass: STENCIL_KEEP,
            stencil_func: STENCIL_FUNC_ALWAYS,
            stencil_ref: 0,
            stencil_mask: 0xFFFF_FFFF,
            stencil_write_mask: 0xFFFF_FFFF,
            fog_enable: 0,
            fog_color: 0,
            fog_start: 0.0,
            fog_end: 0.0,
            gs_alpha: false,
            gs_alpha_ref: 128,
            tex_stage: [None; MAX_TEXTURE_STAGES],
            cur: StagedState::default(),
            committed: None,
            state_dirty: true,
            white_tex,
        }
    }

    /// Restore the power-on defaults and poison the committed snapshot so
    /// the next flush re-emits every compound.
    pub fn reset(&mut self, gx: &mut dyn GxHardware) {
        let white = self.white_tex;
        *self = StateCache::new(white);
        // every stage starts on the white fallback
        for stage in 0..MAX_TEXTURE_STAGES {
            gx.tex_bind(stage, white);
        }
    }

    pub fn set_alpha_blend(&mut self, enable: bool) {
        if self.blend_enable != enable {
            self.blend_enable = enable;
            self.cur.blend_enable = enable;
        }
    }

    pub fn get_alpha_blend(&self) -> bool {
        self.blend_enable
    }

    fn set_depth_test(&mut self, enable: bool) {
        if self.z_test != enable {
            self.z_test = enable;
            if self.z_write && !enable {
                // still want writes: keep the test on but always passing
                self.cur.depth_test = true;
                self.cur.depth_func = CompareFunc::Always;
            } else {
                self.cur.depth_test = self.z_test;
                self.cur.depth_func = CompareFunc::Gequal;
            }
        }
    }

    fn set_depth_write(&mut self, enable: bool) {
        if self.z_write != enable {
            self.z_write = enable;
            if enable && !self.z_test {
                // have to switch the test on so writing can work
                self.cur.depth_test = true;
                self.cur.depth_func = CompareFunc::Always;
            }
            self.cur.depth_mask = if enable {
                WriteMask::ALL
            } else {
                WriteMask::COLOR
            };
        }
    }

    fn set_alpha_test(&mut self, enable: bool) {
        if self.alpha_test_enable != enable {
            self.alpha_test_enable = enable;
            let shader_func = if enable { self.alpha_func } else { ALPHA_ALWAYS };
            if self.alpha_func != shader_func {
                self.alpha_func = shader_func;
                self.cur.alpha_func = map_alpha_test(shader_func);
            }
        }
    }

    fn set_alpha_test_function(&mut self, function: u32) {
        if self.alpha_func != function {
            self.alpha_func = function;
            let shader_func = if self.alpha_test_enable {
                self.alpha_func
            } else {
                ALPHA_ALWAYS
            };
            self.cur.alpha_func = map_alpha_test(shader_func);
        }
    }

    fn set_vertex_alpha(&mut self, enable: bool) {
        if self.vertex_alpha != enable {
            if !self.texture_alpha {
                self.set_alpha_blend(enable);
                self.set_alpha_test(enable);
            }
            self.vertex_alpha = enable;
        }
    }

    fn set_texture_alpha(&mut self, alpha: bool) {
        if self.texture_alpha != alpha {
            self.texture_alpha = alpha;
            if !self.vertex_alpha {
                self.set_alpha_blend(alpha);
                self.set_alpha_test(alpha);
            }
        }
    }

    fn update_raster_params(gx: &mut dyn GxHardware, rasters: &RasterTable, id: RasterId) {
        let raster = rasters.get(id);
        let Some(tex) = &raster.tex else { return };
        let filter = FILTER_CONV_MAP[raster.filter_mode as usize];
        let wrap_s = ADDRESS_CONV_MAP[raster.address_u as usize];
        let wrap_t = ADDRESS_CONV_MAP[raster.address_v as usize];
        gx.tex_filter(tex.mem, filter);
        gx.tex_wrap(tex.mem, wrap_s, wrap_t);
    }

    /// Update the cached sampling state of the raster bound to `stage` and
    /// push it to the hardware texture. `None` keeps a component.
    pub fn set_raster_params(
        &mut self,
        gx: &mut dyn GxHardware,
        rasters: &mut RasterTable,
        stage: usize,
        filter: Option<u32>,
        address_u: Option<u32>,
        address_v: Option<u32>,
    ) {
        let Some(id) = self.tex_stage[stage] else {
            return;
        };
        {
            let raster = rasters.get_mut(id);
            if let Some(f) = filter {
                raster.filter_mode = TextureFilter::from_u32(f);
            }
            if let Some(u) = address_u {
                raster.address_u = TextureAddress::from_u32(u);
            }
            if let Some(v) = address_v {
                raster.address_v = TextureAddress::from_u32(v);
            }
        }
        Self::update_raster_params(gx, rasters, id);
    }

    /// Bind a raster to a texture stage. Stage 0's alpha flag feeds the
    /// combined blend/test enable.
    pub fn set_raster_stage(
        &mut self,
        gx: &mut dyn GxHardware,
        rasters: &RasterTable,
        stage: usize,
        raster: Option<RasterId>,
    ) {
        let mut alpha = false;
        if raster != self.tex_stage[stage] {
            self.tex_stage[stage] = raster;
            match raster {
                None => gx.tex_bind(stage, self.white_tex),
                Some(id) => {
                    let ras = rasters.get(id);
                    alpha = ras.has_alpha;
                    let mem = ras.tex.as_ref().map_or(self.white_tex, |t| t.mem);
                    gx.tex_bind(stage, mem);
                }
            }
        } else if let Some(id) = raster {
            alpha = rasters.get(id).has_alpha;
        }

        if stage == 0 {
            self.set_texture_alpha(alpha);
        }
    }

    pub fn texture_stage(&self, stage: usize) -> Option<RasterId> {
        self.tex_stage[stage]
    }

    /// Engine-level state write. Values equal to the logical cache are
    /// swallowed here; everything else is staged for the next flush.
    pub fn set(
        &mut self,
        gx: &mut dyn GxHardware,
        rasters: &mut RasterTable,
        state: RenderState,
        value: u32,
    ) {
        match state {
            RenderState::TextureRaster => {
                let id = if value == 0 { None } else { Some(RasterId(value)) };
                self.set_raster_stage(gx, rasters, 0, id);
            }
            RenderState::TextureAddress => {
                self.set_raster_params(gx, rasters, 0, None, Some(value), Some(value));
            }
            RenderState::TextureAddressU => {
                self.set_raster_params(gx, rasters, 0, None, Some(value), None);
            }
            RenderState::TextureAddressV => {
                self.set_raster_params(gx, rasters, 0, None, None, Some(value));
            }
            RenderState::TextureFilter => {
                self.set_raster_params(gx, rasters, 0, Some(value), None, None);
            }
            RenderState::VertexAlpha => self.set_vertex_alpha(value != 0),
            RenderState::SrcBlend => {
                if self.src_blend != value {
                    self.src_blend = value;
                    self.cur.src_blend = BLEND_MAP[value as usize];
                }
            }
            RenderState::DestBlend => {
                if self.dst_blend != value {
                    self.dst_blend = value;
                    self.cur.dst_blend = BLEND_MAP[value as usize];
                }
            }
            RenderState::ZTestEnable => self.set_depth_test(value != 0),
            RenderState::ZWriteEnable => self.set_depth_write(value != 0),
            RenderState::FogEnable => {
                if self.fog_enable != value {
                    self.fog_enable = value;
                    self.cur.fog_mode = value;
                }
            }
            RenderState::FogColor => {
                if self.fog_color != value {
                    self.fog_color = value;
                    self.cur.fog_color = value;
                }
            }
            RenderState::CullMode => {
                if self.cull_mode != value {
                    self.cull_mode = value;
                    if self.cull_mode == CULL_NONE {
                        self.cur.cull_enable = false;
                    } else {
                        self.cur.cull_enable = true;
                        self.cur.cull_face = if self.cull_mode == CULL_BACK {
                            CullMode::BackCcw
                        } else {
                            CullMode::FrontCcw
                        };
                    }
                }
            }
            RenderState::StencilEnable => {
                if self.stencil_enable != value {
                    self.stencil_enable = value;
                    self.cur.stencil_enable = value != 0;
                }
            }
            RenderState::StencilFail => {
                if self.stencil_fail != value {
                    self.stencil_fail = value;
                    self.cur.stencil_fail = STENCIL_OP_MAP[value as usize];
                }
            }
            RenderState::StencilZFail => {
                if self.stencil_zfail != value {
                    self.stencil_zfail = value;
                    self.cur.stencil_zfail = STENCIL_OP_MAP[value as usize];
                }
            }
            RenderState::StencilPass => {
                if self.stencil_pass != value {
                    self.stencil_pass = value;
                    self.cur.stencil_pass = STENCIL_OP_MAP[value as usize];
                }
            }
            RenderState::StencilFunction => {
                if self.stencil_func != value {
                    self.stencil_func = value;
                    self.cur.stencil_func = STENCIL_FUNC_MAP[value as usize];
                }
            }
            RenderState::StencilFunctionRef => {
                if self.stencil_ref != value {
                    self.stencil_ref = value;
                    self.cur.stencil_ref = value;
                }
            }
            RenderState::StencilFunctionMask => {
                if self.stencil_mask != value {
                    self.stencil_mask = value;
                    self.cur.stencil_mask = value;
                }
            }
            RenderState::StencilFunctionWriteMask => {
                if self.stencil_write_mask != value {
                    self.stencil_write_mask = value;
                    self.cur.stencil_write_mask = value;
                }
            }
            RenderState::AlphaTestFunc => self.set_alpha_test_function(value),
            RenderState::AlphaTestRef => {
                self.alpha_ref = value;
                self.cur.alpha_ref = value;
            }
            RenderState::GsAlphaTest => self.gs_alpha = value != 0,
            RenderState::GsAlphaTestRef => self.gs_alpha_ref = value,
        }
    }

    /// Engine-level state read. No side effects.
    pub fn get(&self, rasters: &RasterTable, state: RenderState) -> u32 {
        match state {
            RenderState::TextureRaster => self.tex_stage[0].map_or(0, |id| id.0),
            RenderState::TextureAddress => match self.tex_stage[0] {
                Some(id) => {
                    let r = rasters.get(id);
                    if r.address_u == r.address_v {
                        r.address_u as u32
                    } else {
                        0 // invalid
                    }
                }
                None => 0,
            },
            RenderState::TextureAddressU => self.tex_stage[0]
                .map_or(0, |id| rasters.get(id).address_u as u32),
            RenderState::TextureAddressV => self.tex_stage[0]
                .map_or(0, |id| rasters.get(id).address_v as u32),
            RenderState::TextureFilter => self.tex_stage[0]
                .map_or(0, |id| rasters.get(id).filter_mode as u32),
            RenderState::VertexAlpha => self.vertex_alpha as u32,
            RenderState::SrcBlend => self.src_blend,
            RenderState::DestBlend => self.dst_blend,
            RenderState::ZTestEnable => self.z_test as u32,
            RenderState::ZWriteEnable => self.z_write as u32,
            RenderState::FogEnable => self.fog_enable,
            RenderState::FogColor => self.fog_color,
            RenderState::CullMode => self.cull_mode,
            RenderState::StencilEnable => self.stencil_enable,
            RenderState::StencilFail => self.stencil_fail,
            RenderState::StencilZFail => self.stencil_zfail,
            RenderState::StencilPass => self.stencil_pass,
            RenderState::StencilFunction => self.stencil_func,
            RenderState::StencilFunctionRef => self.stencil_ref,
            RenderState::StencilFunctionMask => self.stencil_mask,
            RenderState::StencilFunctionWriteMask => self.stencil_write_mask,
            RenderState::AlphaTestFunc => self.alpha_func,
            RenderState::AlphaTestRef => self.alpha_ref,
            RenderState::GsAlphaTest => self.gs_alpha as u32,
            RenderState::GsAlphaTestRef => self.gs_alpha_ref,
        }
    }

    /// Emit every compound whose staged value differs from the committed
    /// snapshot, then commit.
    pub fn flush(&mut self, gx: &mut dyn GxHardware) {
        let cur = self.cur;
        let old = self.committed;

        if old.is_none_or(|o| o.cull_enable != cur.cull_enable || o.cull_face != cur.cull_face) {
            gx.cull_face(if cur.cull_enable {
                cur.cull_face
            } else {
                CullMode::None
            });
        }

        if old.is_none_or(|o| o.alpha_func != cur.alpha_func || o.alpha_ref != cur.alpha_ref) {
            gx.alpha_test(true, cur.alpha_func, cur.alpha_ref);
        }

        if old.is_none_or(|o| {
            o.depth_test != cur.depth_test
                || o.depth_func != cur.depth_func
                || o.depth_mask != cur.depth_mask
        }) {
            gx.depth_test(cur.depth_test, cur.depth_func, cur.depth_mask);
        }

        if old.is_none_or(|o| {
            o.blend_enable != cur.blend_enable
                || o.src_blend != cur.src_blend
                || o.dst_blend != cur.dst_blend
        }) {
            if !cur.blend_enable {
                gx.alpha_blend(
                    BlendEquation::Add,
                    BlendEquation::Add,
                    BlendFactor::One,
                    BlendFactor::Zero,
                    BlendFactor::One,
                    BlendFactor::Zero,
                );
            } else {
                gx.alpha_blend(
                    BlendEquation::Add,
                    BlendEquation::Add,
                    cur.src_blend,
                    cur.dst_blend,
                    cur.src_blend,
                    cur.dst_blend,
                );
            }
        }

        if old.is_none_or(|o| {
            o.stencil_enable != cur.stencil_enable
                || o.stencil_func != cur.stencil_func
                || o.stencil_ref != cur.stencil_ref
                || o.stencil_mask != cur.stencil_mask
                || o.stencil_write_mask != cur.stencil_write_mask
        }) {
            gx.stencil_test(
                cur.stencil_enable,
                cur.stencil_func,
                cur.stencil_ref,
                cur.stencil_mask,
                cur.stencil_write_mask,
            );
        }

        if old.is_none_or(|o| {
            o.stencil_pass != cur.stencil_pass
                || o.stencil_fail != cur.stencil_fail
                || o.stencil_zfail != cur.stencil_zfail
        }) {
            gx.stencil_op(cur.stencil_fail, cur.stencil_zfail, cur.stencil_pass);
        }

        // fog is deliberately never emitted; the staged values only exist
        // so they stay queryable

        self.committed = Some(cur);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::GxHardware;
    use crate::hw::sim::SimGx;
    use crate::raster::RasterTable;

    fn setup() -> (SimGx, RasterTable, StateCache) {
        let mut gx = SimGx::new();
        let white = gx.linear_alloc(8 * 8 * 4).unwrap();
        let rasters = RasterTable::new();
        let mut cache = StateCache::new(white);
        cache.reset(&mut gx);
        cache.flush(&mut gx);
        gx.state_log.clear();
        (gx, rasters, cache)
    }

    #[test]
    fn test_first_flush_emits_every_compound() {
        let mut gx = SimGx::new();
        let white = gx.linear_alloc(8 * 8 * 4).unwrap();
        let mut cache = StateCache::new(white);
        cache.reset(&mut gx);
        cache.flush(&mut gx);
        // cull, alpha, depth, blend, stencil test, stencil op
        assert_eq!(gx.state_command_count(), 6);
    }

    #[test]
    fn test_reset_rebinds_the_white_fallback() {
        let mut gx = SimGx::new();
        let white = gx.linear_alloc(8 * 8 * 4).unwrap();
        let mut cache = StateCache::new(white);
        cache.reset(&mut gx);
        for stage in 0..MAX_TEXTURE_STAGES {
            assert_eq!(gx.bound_texture(stage), Some(white));
        }
    }

    #[test]
    fn test_redundant_set_emits_nothing() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::CullMode, CULL_NONE);
        cache.set(&mut gx, &mut rasters, RenderState::SrcBlend, BLEND_SRC_ALPHA);
        cache.set(&mut gx, &mut rasters, RenderState::ZWriteEnable, 1);
        cache.flush(&mut gx);
        assert_eq!(gx.state_command_count(), 0);
    }

    #[test]
    fn test_one_command_per_changed_compound() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::CullMode, CULL_BACK);
        cache.flush(&mut gx);
        assert_eq!(gx.state_command_count(), 1);
        assert_eq!(
            gx.state_log[0],
            crate::hw::sim::HwCommand::CullFace(CullMode::BackCcw)
        );

        // repeating the same value stays silent
        cache.set(&mut gx, &mut rasters, RenderState::CullMode, CULL_BACK);
        cache.flush(&mut gx);
        assert_eq!(gx.state_command_count(), 1);
    }

    #[test]
    fn test_cull_front_and_none() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::CullMode, CULL_FRONT);
        cache.flush(&mut gx);
        assert_eq!(
            gx.state_log.last().unwrap(),
            &crate::hw::sim::HwCommand::CullFace(CullMode::FrontCcw)
        );
        cache.set(&mut gx, &mut rasters, RenderState::CullMode, CULL_NONE);
        cache.flush(&mut gx);
        assert_eq!(
            gx.state_log.last().unwrap(),
            &crate::hw::sim::HwCommand::CullFace(CullMode::None)
        );
    }

    #[test]
    fn test_depth_write_forces_always_pass_when_test_off() {
        let (mut gx, mut rasters, mut cache) = setup();
        // defaults: write on, test off. Toggling write off and on again
        // while the test stays off must force an always-pass test.
        cache.set(&mut gx, &mut rasters, RenderState::ZWriteEnable, 0);
        cache.set(&mut gx, &mut rasters, RenderState::ZWriteEnable, 1);
        cache.flush(&mut gx);
        let last = gx.state_log.last().unwrap();
        match last {
            crate::hw::sim::HwCommand::DepthTest { enable, func, mask } => {
                assert!(*enable);
                assert_eq!(*func, CompareFunc::Always);
                assert!(mask.contains(WriteMask::DEPTH));
            }
            other => panic!("expected depth command, got {:?}", other),
        }
    }

    #[test]
    fn test_depth_test_disable_keeps_writes_working() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::ZTestEnable, 1);
        cache.set(&mut gx, &mut rasters, RenderState::ZTestEnable, 0);
        cache.flush(&mut gx);
        // write is still enabled, so the test stays on with always-pass
        match gx.state_log.last().unwrap() {
            crate::hw::sim::HwCommand::DepthTest { enable, func, .. } => {
                assert!(*enable);
                assert_eq!(*func, CompareFunc::Always);
            }
            other => panic!("expected depth command, got {:?}", other),
        }
    }

    #[test]
    fn test_depth_test_enable_restores_comparison() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::ZTestEnable, 1);
        cache.flush(&mut gx);
        match gx.state_log.last().unwrap() {
            crate::hw::sim::HwCommand::DepthTest { enable, func, .. } => {
                assert!(*enable);
                assert_eq!(*func, CompareFunc::Gequal);
            }
            other => panic!("expected depth command, got {:?}", other),
        }
    }

    #[test]
    fn test_vertex_alpha_enables_blend_and_test() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::VertexAlpha, 1);
        cache.flush(&mut gx);
        assert!(cache.get_alpha_blend());
        assert!(
            gx.state_log
                .iter()
                .any(|c| matches!(c, crate::hw::sim::HwCommand::Blend { .. }))
        );
    }

    #[test]
    fn test_alpha_sources_or_combine() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::VertexAlpha, 1);
        cache.flush(&mut gx);
        let count = gx.state_command_count();

        // texture alpha turning on while vertex alpha is already on must
        // not re-emit blend state
        cache.set_texture_alpha(true);
        cache.flush(&mut gx);
        assert_eq!(gx.state_command_count(), count);
        assert!(cache.get_alpha_blend());

        // dropping vertex alpha while texture alpha holds keeps blending
        cache.set(&mut gx, &mut rasters, RenderState::VertexAlpha, 0);
        cache.flush(&mut gx);
        assert_eq!(gx.state_command_count(), count);
        assert!(cache.get_alpha_blend());

        // dropping the last source disables blending and parks the alpha
        // test on always-pass (one blend command, one alpha command)
        cache.set_texture_alpha(false);
        cache.flush(&mut gx);
        assert!(!cache.get_alpha_blend());
        assert_eq!(gx.state_command_count(), count + 2);
        assert!(gx.state_log.iter().any(|c| matches!(
            c,
            crate::hw::sim::HwCommand::AlphaTest {
                func: CompareFunc::Always,
                ..
            }
        )));
    }

    #[test]
    fn test_legacy_alpha_test_mapping() {
        let (mut gx, mut rasters, mut cache) = setup();
        // enable the test so the function flows through
        cache.set(&mut gx, &mut rasters, RenderState::VertexAlpha, 1);
        cache.set(&mut gx, &mut rasters, RenderState::AlphaTestFunc, ALPHA_LESS);
        cache.flush(&mut gx);
        assert!(gx.state_log.iter().any(|c| matches!(
            c,
            crate::hw::sim::HwCommand::AlphaTest {
                func: CompareFunc::Lequal,
                ..
            }
        )));
    }

    #[test]
    fn test_unsupported_legacy_alpha_mode_becomes_always() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::VertexAlpha, 1);
        cache.set(&mut gx, &mut rasters, RenderState::AlphaTestFunc, 7);
        cache.flush(&mut gx);
        assert!(gx.state_log.iter().any(|c| matches!(
            c,
            crate::hw::sim::HwCommand::AlphaTest {
                func: CompareFunc::Always,
                ..
            }
        )));
    }

    #[test]
    fn test_get_returns_logical_values() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::GsAlphaTestRef, 64);
        assert_eq!(cache.get(&rasters, RenderState::GsAlphaTestRef), 64);
        assert_eq!(cache.get(&rasters, RenderState::GsAlphaTest), 0);
        assert_eq!(cache.get(&rasters, RenderState::CullMode), CULL_NONE);
        assert_eq!(cache.get(&rasters, RenderState::AlphaTestRef), 10);
    }

    #[test]
    fn test_fog_is_stored_but_never_emitted() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::FogEnable, 1);
        cache.set(&mut gx, &mut rasters, RenderState::FogColor, 0x8040_2010);
        cache.flush(&mut gx);
        assert_eq!(cache.get(&rasters, RenderState::FogEnable), 1);
        assert_eq!(cache.get(&rasters, RenderState::FogColor), 0x8040_2010);
        assert_eq!(gx.state_command_count(), 0);
    }

    #[test]
    fn test_stencil_compounds() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::StencilEnable, 1);
        cache.set(
            &mut gx,
            &mut rasters,
            RenderState::StencilFunction,
            STENCIL_FUNC_EQUAL,
        );
        cache.set(&mut gx, &mut rasters, RenderState::StencilFunctionRef, 5);
        cache.set(&mut gx, &mut rasters, RenderState::StencilPass, STENCIL_REPLACE);
        cache.flush(&mut gx);
        // one test compound + one op compound
        assert_eq!(gx.state_command_count(), 2);
        assert!(gx.state_log.iter().any(|c| matches!(
            c,
            crate::hw::sim::HwCommand::StencilTest {
                enable: true,
                func: CompareFunc::Equal,
                reference: 5,
            }
        )));
        assert!(gx.state_log.iter().any(|c| matches!(
            c,
            crate::hw::sim::HwCommand::StencilOp {
                pass: StencilOp::Replace,
                ..
            }
        )));
    }

    #[test]
    fn test_blend_factor_mapping() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::VertexAlpha, 1);
        cache.set(&mut gx, &mut rasters, RenderState::SrcBlend, BLEND_ONE);
        cache.set(&mut gx, &mut rasters, RenderState::DestBlend, BLEND_INV_DEST_COLOR);
        cache.flush(&mut gx);
        assert!(gx.state_log.iter().any(|c| matches!(
            c,
            crate::hw::sim::HwCommand::Blend {
                src: BlendFactor::One,
                dst: BlendFactor::OneMinusDstColor,
            }
        )));
    }

    #[test]
    fn test_disabled_blend_emits_passthrough_factors() {
        let (mut gx, mut rasters, mut cache) = setup();
        cache.set(&mut gx, &mut rasters, RenderState::VertexAlpha, 1);
        cache.flush(&mut gx);
        cache.set(&mut gx, &mut rasters, RenderState::VertexAlpha, 0);
        cache.flush(&mut gx);
        assert_eq!(
            gx.state_log.last().unwrap(),
            &crate::hw::sim::HwCommand::Blend {
                src: BlendFactor::One,
                dst: BlendFactor::Zero,
            }
        );
    }
}
