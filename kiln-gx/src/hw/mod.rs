//! Hardware interface of the target GPU.
//!
//! The target is a single fixed piece of hardware, so there is exactly one
//! real implementation; the interface exists so the software-simulated
//! `SimGx` can stand in for it in tests. Enumerations here are the native
//! state machine's vocabulary, and the mapping tables in `render_state` are
//! a hardware contract against them.

pub mod sim;

use bitflags::bitflags;
use glam::{Mat4, Vec4};

/// Handle to a block of GPU-visible memory (linear texture heap or display
/// memory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TexMem(pub u32);

/// Native texel formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
    Rgba8 = 0x0,
    Rgb8 = 0x1,
    Rgba5551 = 0x2,
    Rgb565 = 0x3,
    Rgba4 = 0x4,
    La8 = 0x5,
    Hilo8 = 0x6,
    L8 = 0x7,
    A8 = 0x8,
    La4 = 0x9,
    L4 = 0xA,
    A4 = 0xB,
    Etc1 = 0xC,
    Etc1A4 = 0xD,
}

impl PixelFormat {
    /// Storage cost in bits per texel.
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgba8 => 32,
            PixelFormat::Rgb8 => 24,
            PixelFormat::Rgba5551
            | PixelFormat::Rgb565
            | PixelFormat::Rgba4
            | PixelFormat::La8
            | PixelFormat::Hilo8 => 16,
            PixelFormat::L8 | PixelFormat::A8 | PixelFormat::La4 | PixelFormat::Etc1A4 => 8,
            PixelFormat::L4 | PixelFormat::A4 | PixelFormat::Etc1 => 4,
        }
    }

    /// Transfer-engine format for this texel format, if the transfer engine
    /// can tile it at all.
    pub fn transfer_format(self) -> Option<TransferFormat> {
        match self {
            PixelFormat::Rgba8 => Some(TransferFormat::Rgba8),
            PixelFormat::Rgb8 => Some(TransferFormat::Rgb8),
            PixelFormat::Rgba5551 => Some(TransferFormat::Rgb5a1),
            PixelFormat::Rgb565 => Some(TransferFormat::Rgb565),
            PixelFormat::Rgba4 => Some(TransferFormat::Rgba4),
            _ => None,
        }
    }

    /// Matching color-buffer format when this format can back a render
    /// target.
    pub fn color_buffer_format(self) -> Option<ColorBufFormat> {
        match self {
            PixelFormat::Rgba8 => Some(ColorBufFormat::Rgba8),
            PixelFormat::Rgb8 => Some(ColorBufFormat::Rgb8),
            PixelFormat::Rgba5551 => Some(ColorBufFormat::Rgba5551),
            PixelFormat::Rgb565 => Some(ColorBufFormat::Rgb565),
            PixelFormat::Rgba4 => Some(ColorBufFormat::Rgba4),
            _ => None,
        }
    }
}

/// Transfer-engine pixel formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Rgba8,
    Rgb8,
    Rgb565,
    Rgb5a1,
    Rgba4,
}

/// Renderable color buffer formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorBufFormat {
    Rgba8,
    Rgb8,
    Rgba5551,
    Rgb565,
    Rgba4,
}

/// The single depth/stencil buffer format this backend uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthBufFormat {
    Depth24Stencil8,
}

impl DepthBufFormat {
    pub fn bytes_per_pixel(self) -> usize {
        4
    }
}

/// Native comparison functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunc {
    Never,
    Always,
    Equal,
    NotEqual,
    Less,
    Lequal,
    Greater,
    Gequal,
}

/// Native blend equations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendEquation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Native blend factors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    SrcAlphaSaturate,
}

/// Native stencil operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StencilOp {
    Keep,
    Zero,
    Replace,
    Increment,
    Decrement,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

/// Native cull modes (winding is fixed counter-clockwise)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    BackCcw,
    FrontCcw,
}

bitflags! {
    /// Framebuffer channel write mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WriteMask: u32 {
        const RED = 0x1;
        const GREEN = 0x2;
        const BLUE = 0x4;
        const ALPHA = 0x8;
        const DEPTH = 0x10;
        const COLOR = Self::RED.bits() | Self::GREEN.bits()
                    | Self::BLUE.bits() | Self::ALPHA.bits();
        const ALL = Self::COLOR.bits() | Self::DEPTH.bits();
    }
}

bitflags! {
    /// Framebuffer clear mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClearMask: u32 {
        const COLOR = 0x1;
        const DEPTH = 0x2;
    }
}

/// Primitive topologies the rasterizer accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Triangles,
    TriangleStrip,
    TriangleFan,
}

/// Native texture filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexFilter {
    Nearest,
    Linear,
}

/// Native texture addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TexWrap {
    ClampToEdge,
    ClampToBorder,
    Repeat,
    MirroredRepeat,
}

/// The handful of vertex shader programs the backend uses. Program loading
/// itself lives outside this subsystem; these name the loaded entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderProgram {
    Default,
    Im2d,
    Im3d,
    EnvMap,
}

/// Vertex shader uniform registers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UniformReg {
    Proj,
    View,
    World,
    AmbLight,
    LightParams,
    LightPosition,
    LightDirection,
    LightColor,
    MatColor,
    SurfProps,
    TexMatrix,
    Xform2d,
    Flip2d,
}

/// Vertex attribute component types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Float,
    Byte,
    UnsignedByte,
}

/// One attribute register's configuration: fed from the vertex buffer or
/// pinned to the fixed default value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrEntry {
    Loader { kind: AttrKind, count: u8 },
    Fixed,
}

/// The capability interface of the target GPU.
///
/// One render thread, synchronous semantics: every call takes effect in
/// submission order, and the transfer-engine entry points block until the
/// transfer completed.
pub trait GxHardware {
    // Fixed-function state
    fn cull_face(&mut self, mode: CullMode);
    fn alpha_test(&mut self, enable: bool, func: CompareFunc, reference: u32);
    fn depth_test(&mut self, enable: bool, func: CompareFunc, mask: WriteMask);
    #[allow(clippy::too_many_arguments)]
    fn alpha_blend(
        &mut self,
        color_eq: BlendEquation,
        alpha_eq: BlendEquation,
        src: BlendFactor,
        dst: BlendFactor,
        src_alpha: BlendFactor,
        dst_alpha: BlendFactor,
    );
    fn stencil_test(
        &mut self,
        enable: bool,
        func: CompareFunc,
        reference: u32,
        read_mask: u32,
        write_mask: u32,
    );
    fn stencil_op(&mut self, fail: StencilOp, zfail: StencilOp, pass: StencilOp);

    // Shader programs and uniforms
    fn bind_program(&mut self, program: ShaderProgram);
    fn set_uniform_mat4(&mut self, reg: UniformReg, value: &Mat4);
    fn set_uniform_vec4(&mut self, reg: UniformReg, value: Vec4);
    fn set_uniform_vec4_array(&mut self, reg: UniformReg, values: &[Vec4]);

    // Texture units
    fn tex_bind(&mut self, stage: usize, tex: TexMem);
    fn tex_filter(&mut self, tex: TexMem, filter: TexFilter);
    fn tex_wrap(&mut self, tex: TexMem, wrap_s: TexWrap, wrap_t: TexWrap);

    // Memory. `linear_*` is the CPU-visible texture heap the eviction pool
    // manages; `vram_alloc` is the small display-memory heap used for
    // render targets and depth buffers.
    fn linear_free(&self) -> usize;
    fn linear_alloc(&mut self, size: usize) -> Option<TexMem>;
    fn vram_alloc(&mut self, size: usize) -> Option<TexMem>;
    fn release(&mut self, mem: TexMem);
    fn mem(&self, mem: TexMem) -> &[u8];
    fn mem_mut(&mut self, mem: TexMem) -> &mut [u8];
    fn flush_data_cache(&mut self, mem: TexMem);

    // Framebuffer
    fn bind_framebuffer(&mut self, color: TexMem, depth: Option<TexMem>, width: u32, height: u32);
    fn set_viewport(&mut self, x: i32, y: i32, w: i32, h: i32);
    fn clear_framebuffer(
        &mut self,
        color: TexMem,
        depth: Option<TexMem>,
        mask: ClearMask,
        color_value: u32,
        depth_value: u32,
    );

    // Frame control
    fn frame_begin(&mut self);
    fn frame_end(&mut self);
    /// Split the command buffer and wait for everything submitted so far;
    /// required before the CPU reuses memory the GPU may still read.
    fn frame_split(&mut self);
    fn present(
        &mut self,
        color: TexMem,
        fb_width: u32,
        fb_height: u32,
        out_width: u32,
        out_height: u32,
    );

    /// Tile a linear CPU buffer into texture memory through the transfer
    /// engine. Blocks until the transfer completed and `src` is reusable.
    fn sync_display_transfer_in(
        &mut self,
        src: &[u8],
        dst: TexMem,
        dst_off: usize,
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
    );

    /// Untile texture memory into a linear CPU buffer through the transfer
    /// engine. Blocks until `dst` holds the result.
    fn sync_display_transfer_out(
        &mut self,
        src: TexMem,
        src_off: usize,
        dst: &mut [u8],
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
    );

    // Vertex input
    fn set_attr_layout(&mut self, attrs: &[AttrEntry]);
    fn set_fixed_attrib(&mut self, reg: usize, value: Vec4);
    fn bind_vertex_buffer(&mut self, buffer: TexMem, stride: usize);
    fn draw_elements(&mut self, prim: Primitive, indices: TexMem, count: usize);
    fn imm_begin(&mut self, prim: Primitive);
    fn imm_send_attrib(&mut self, value: Vec4);
    fn imm_end(&mut self);
}
