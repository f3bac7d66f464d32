//! Software-simulated hardware.
//!
//! `SimGx` satisfies `GxHardware` with plain memory and a command log. It is
//! what unit tests drive: the log makes "how many state commands were
//! actually emitted" and "what state was live at each draw" observable, and
//! the configurable heap sizes make memory pressure reproducible.

use glam::{Mat4, Vec4};
use hashbrown::HashMap;

use super::{
    AttrEntry, BlendEquation, BlendFactor, ClearMask, CompareFunc, CullMode, GxHardware,
    Primitive, ShaderProgram, StencilOp, TexFilter, TexMem, TexWrap, UniformReg, WriteMask,
};
use crate::codec::swizzle::cpu_swizzle;

/// Default linear heap size. Real hardware gives the application a heap in
/// this ballpark; tests shrink it to force eviction.
pub const DEFAULT_LINEAR_CAPACITY: usize = 64 << 20;

/// Default display-memory size for render targets and depth buffers
pub const DEFAULT_VRAM_CAPACITY: usize = 6 << 20;

/// One fixed-function state command as it went to the (simulated) hardware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HwCommand {
    CullFace(CullMode),
    AlphaTest {
        enable: bool,
        func: CompareFunc,
        reference: u32,
    },
    DepthTest {
        enable: bool,
        func: CompareFunc,
        mask: WriteMask,
    },
    Blend {
        src: BlendFactor,
        dst: BlendFactor,
    },
    StencilTest {
        enable: bool,
        func: CompareFunc,
        reference: u32,
    },
    StencilOp {
        fail: StencilOp,
        zfail: StencilOp,
        pass: StencilOp,
    },
}

/// Snapshot of the state live at one draw submission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawRecord {
    pub prim: Primitive,
    pub count: usize,
    pub immediate: bool,
    pub depth_write: bool,
    pub alpha_func: CompareFunc,
    pub alpha_ref: u32,
}

struct Block {
    data: Vec<u8>,
    vram: bool,
}

/// The simulated device.
pub struct SimGx {
    linear_capacity: usize,
    linear_used: usize,
    vram_capacity: usize,
    vram_used: usize,
    blocks: HashMap<u32, Block>,
    next_block: u32,

    /// Every fixed-function state command, in emission order
    pub state_log: Vec<HwCommand>,
    /// Every draw submission, in order
    pub draws: Vec<DrawRecord>,
    /// Uniform registers written, in order
    pub uniform_log: Vec<UniformReg>,
    pub presents: u32,
    pub frames_begun: u32,
    pub frames_ended: u32,
    pub frame_splits: u32,

    bound_program: Option<ShaderProgram>,
    bound_textures: [Option<TexMem>; 3],
    uniforms: HashMap<UniformReg, Vec<Vec4>>,
    tex_params: HashMap<u32, (TexFilter, TexWrap, TexWrap)>,
    attr_layout: Vec<AttrEntry>,
    bound_vbo: Option<(TexMem, usize)>,
    viewport: (i32, i32, i32, i32),

    depth_write: bool,
    alpha_func: CompareFunc,
    alpha_ref: u32,
    imm_prim: Option<Primitive>,
    imm_attribs: usize,
}

impl SimGx {
    pub fn new() -> Self {
        Self::with_memory(DEFAULT_LINEAR_CAPACITY, DEFAULT_VRAM_CAPACITY)
    }

    /// A device with explicit heap sizes, for memory-pressure tests.
    pub fn with_memory(linear_capacity: usize, vram_capacity: usize) -> Self {
        Self {
            linear_capacity,
            linear_used: 0,
            vram_capacity,
            vram_used: 0,
            blocks: HashMap::new(),
            next_block: 1,
            state_log: Vec::new(),
            draws: Vec::new(),
            uniform_log: Vec::new(),
            presents: 0,
            frames_begun: 0,
            frames_ended: 0,
            frame_splits: 0,
            bound_program: None,
            bound_textures: [None; 3],
            uniforms: HashMap::new(),
            tex_params: HashMap::new(),
            attr_layout: Vec::new(),
            bound_vbo: None,
            viewport: (0, 0, 0, 0),
            depth_write: true,
            alpha_func: CompareFunc::Always,
            alpha_ref: 0,
            imm_prim: None,
            imm_attribs: 0,
        }
    }

    /// Number of fixed-function state commands emitted so far
    pub fn state_command_count(&self) -> usize {
        self.state_log.len()
    }

    pub fn linear_used(&self) -> usize {
        self.linear_used
    }

    pub fn bound_texture(&self, stage: usize) -> Option<TexMem> {
        self.bound_textures[stage]
    }

    pub fn bound_program(&self) -> Option<ShaderProgram> {
        self.bound_program
    }

    pub fn uniform(&self, reg: UniformReg) -> Option<&[Vec4]> {
        self.uniforms.get(&reg).map(|v| v.as_slice())
    }

    pub fn viewport(&self) -> (i32, i32, i32, i32) {
        self.viewport
    }

    fn alloc(&mut self, size: usize, vram: bool) -> Option<TexMem> {
        let (used, capacity) = if vram {
            (&mut self.vram_used, self.vram_capacity)
        } else {
            (&mut self.linear_used, self.linear_capacity)
        };
        if *used + size > capacity {
            return None;
        }
        *used += size;
        let id = self.next_block;
        self.next_block += 1;
        self.blocks.insert(
            id,
            Block {
                data: vec![0; size],
                vram,
            },
        );
        Some(TexMem(id))
    }
}

impl Default for SimGx {
    fn default() -> Self {
        Self::new()
    }
}

impl GxHardware for SimGx {
    fn cull_face(&mut self, mode: CullMode) {
        self.state_log.push(HwCommand::CullFace(mode));
    }

    fn alpha_test(&mut self, enable: bool, func: CompareFunc, reference: u32) {
        self.alpha_func = func;
        self.alpha_ref = reference;
        self.state_log.push(HwCommand::AlphaTest {
            enable,
            func,
            reference,
        });
    }

    fn depth_test(&mut self, enable: bool, func: CompareFunc, mask: WriteMask) {
        self.depth_write = mask.contains(WriteMask::DEPTH);
        self.state_log.push(HwCommand::DepthTest { enable, func, mask });
    }

    fn alpha_blend(
        &mut self,
        _color_eq: BlendEquation,
        _alpha_eq: BlendEquation,
        src: BlendFactor,
        dst: BlendFactor,
        _src_alpha: BlendFactor,
        _dst_alpha: BlendFactor,
    ) {
        self.state_log.push(HwCommand::Blend { src, dst });
    }

    fn stencil_test(
        &mut self,
        enable: bool,
        func: CompareFunc,
        reference: u32,
        _read_mask: u32,
        _write_mask: u32,
    ) {
        self.state_log.push(HwCommand::StencilTest {
            enable,
            func,
            reference,
        });
    }

    fn stencil_op(&mut self, fail: StencilOp, zfail: StencilOp, pass: StencilOp) {
        self.state_log.push(HwCommand::StencilOp { fail, zfail, pass });
    }

    fn bind_program(&mut self, program: ShaderProgram) {
        self.bound_program = Some(program);
    }

    fn set_uniform_mat4(&mut self, reg: UniformReg, value: &Mat4) {
        let cols = [
            value.x_axis,
            value.y_axis,
            value.z_axis,
            value.w_axis,
        ];
        self.uniforms.insert(reg, cols.to_vec());
        self.uniform_log.push(reg);
    }

    fn set_uniform_vec4(&mut self, reg: UniformReg, value: Vec4) {
        self.uniforms.insert(reg, vec![value]);
        self.uniform_log.push(reg);
    }

    fn set_uniform_vec4_array(&mut self, reg: UniformReg, values: &[Vec4]) {
        self.uniforms.insert(reg, values.to_vec());
        self.uniform_log.push(reg);
    }

    fn tex_bind(&mut self, stage: usize, tex: TexMem) {
        self.bound_textures[stage] = Some(tex);
    }

    fn tex_filter(&mut self, tex: TexMem, filter: TexFilter) {
        let entry = self
            .tex_params
            .entry(tex.0)
            .or_insert((TexFilter::Nearest, TexWrap::Repeat, TexWrap::Repeat));
        entry.0 = filter;
    }

    fn tex_wrap(&mut self, tex: TexMem, wrap_s: TexWrap, wrap_t: TexWrap) {
        let entry = self
            .tex_params
            .entry(tex.0)
            .or_insert((TexFilter::Nearest, TexWrap::Repeat, TexWrap::Repeat));
        entry.1 = wrap_s;
        entry.2 = wrap_t;
    }

    fn linear_free(&self) -> usize {
        self.linear_capacity - self.linear_used
    }

    fn linear_alloc(&mut self, size: usize) -> Option<TexMem> {
        self.alloc(size, false)
    }

    fn vram_alloc(&mut self, size: usize) -> Option<TexMem> {
        self.alloc(size, true)
    }

    fn release(&mut self, mem: TexMem) {
        let block = self
            .blocks
            .remove(&mem.0)
            .expect("releasing unknown memory block");
        if block.vram {
            self.vram_used -= block.data.len();
        } else {
            self.linear_used -= block.data.len();
        }
    }

    fn mem(&self, mem: TexMem) -> &[u8] {
        &self.blocks[&mem.0].data
    }

    fn mem_mut(&mut self, mem: TexMem) -> &mut [u8] {
        &mut self.blocks.get_mut(&mem.0).expect("unknown memory block").data
    }

    fn flush_data_cache(&mut self, _mem: TexMem) {}

    fn bind_framebuffer(
        &mut self,
        _color: TexMem,
        _depth: Option<TexMem>,
        _width: u32,
        _height: u32,
    ) {
    }

    fn set_viewport(&mut self, x: i32, y: i32, w: i32, h: i32) {
        self.viewport = (x, y, w, h);
    }

    fn clear_framebuffer(
        &mut self,
        color: TexMem,
        depth: Option<TexMem>,
        mask: ClearMask,
        color_value: u32,
        _depth_value: u32,
    ) {
        if mask.contains(ClearMask::COLOR) {
            let bytes = color_value.to_le_bytes();
            let data = self.mem_mut(color);
            for px in data.chunks_exact_mut(4) {
                px.copy_from_slice(&bytes);
            }
        }
        if mask.contains(ClearMask::DEPTH)
            && let Some(z) = depth
        {
            self.mem_mut(z).fill(0);
        }
    }

    fn frame_begin(&mut self) {
        self.frames_begun += 1;
    }

    fn frame_end(&mut self) {
        self.frames_ended += 1;
    }

    fn frame_split(&mut self) {
        self.frame_splits += 1;
    }

    fn present(
        &mut self,
        _color: TexMem,
        _fb_width: u32,
        _fb_height: u32,
        _out_width: u32,
        _out_height: u32,
    ) {
        self.presents += 1;
    }

    fn sync_display_transfer_in(
        &mut self,
        src: &[u8],
        dst: TexMem,
        dst_off: usize,
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
    ) {
        let size = width as usize * height as usize * bytes_per_pixel;
        let mut tiled = vec![0u8; size];
        cpu_swizzle(
            &src[..size],
            &mut tiled,
            width as usize,
            height as usize,
            bytes_per_pixel,
            false,
        );
        self.mem_mut(dst)[dst_off..dst_off + size].copy_from_slice(&tiled);
    }

    fn sync_display_transfer_out(
        &mut self,
        src: TexMem,
        src_off: usize,
        dst: &mut [u8],
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
    ) {
        let size = width as usize * height as usize * bytes_per_pixel;
        let tiled = self.mem(src)[src_off..src_off + size].to_vec();
        cpu_swizzle(
            &tiled,
            &mut dst[..size],
            width as usize,
            height as usize,
            bytes_per_pixel,
            true,
        );
    }

    fn set_attr_layout(&mut self, attrs: &[AttrEntry]) {
        self.attr_layout = attrs.to_vec();
    }

    fn set_fixed_attrib(&mut self, _reg: usize, _value: Vec4) {}

    fn bind_vertex_buffer(&mut self, buffer: TexMem, stride: usize) {
        self.bound_vbo = Some((buffer, stride));
    }

    fn draw_elements(&mut self, prim: Primitive, _indices: TexMem, count: usize) {
        self.draws.push(DrawRecord {
            prim,
            count,
            immediate: false,
            depth_write: self.depth_write,
            alpha_func: self.alpha_func,
            alpha_ref: self.alpha_ref,
        });
    }

    fn imm_begin(&mut self, prim: Primitive) {
        assert!(self.imm_prim.is_none(), "nested immediate draw");
        self.imm_prim = Some(prim);
        self.imm_attribs = 0;
    }

    fn imm_send_attrib(&mut self, _value: Vec4) {
        self.imm_attribs += 1;
    }

    fn imm_end(&mut self) {
        let prim = self.imm_prim.take().expect("imm_end without imm_begin");
        self.draws.push(DrawRecord {
            prim,
            count: self.imm_attribs,
            immediate: true,
            depth_write: self.depth_write,
            alpha_func: self.alpha_func,
            alpha_ref: self.alpha_ref,
        });
    }
}
