//! The device context.
//!
//! Everything the backend mutates lives here - the render-state cache, the
//! uniform blocks, the raster handle table, the texture memory pool with
//! its scratch buffer, and the per-geometry instance cache. There are no
//! process-wide singletons: a `Device` is constructed at `open`, threaded
//! through every entry point, and torn down at drop. Tests run several
//! contexts side by side.

use glam::Vec4;
use kiln_common::Camera;

use crate::hw::{GxHardware, ShaderProgram, TexMem};
use crate::immed::Im3DVertex;
use crate::instance::{ATTRIB_COLOR, InstanceTable, MAX_ATTRIBS};
use crate::raster::RasterTable;
use crate::render_state::{RenderState, StateCache};
use crate::texture_memory::{MemoryBudget, TextureMemory};
use crate::uniforms::Uniforms;

/// Bounded scratch space for immediate-mode primitive conversion
pub(crate) const TMP_INDEX_CAPACITY: usize = 1024;

/// Configuration fixed at open time.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub window_width: i32,
    pub window_height: i32,
    pub window_title: String,
    /// Create plain textures block-compressed. On by default: the linear
    /// heap is far too small for the usual content set otherwise.
    pub force_compression: bool,
    /// Give every texture a mip chain even when content didn't ask
    pub force_mipmaps: bool,
    pub budget: MemoryBudget,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            window_width: 400,
            window_height: 240,
            window_title: String::from("kiln"),
            force_compression: true,
            force_mipmaps: false,
            budget: MemoryBudget::default(),
        }
    }
}

/// Presentation and mode state mirrored from the shell.
#[derive(Debug, Default)]
pub struct DeviceGlobals {
    pub present_off_x: i32,
    pub present_off_y: i32,
    pub present_width: i32,
    pub present_height: i32,
    pub current_display: u32,
    pub current_mode: u32,
    pub num_samples: u32,
}

/// Enumerated device-control requests from the engine core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequest {
    GetNumSubsystems,
    GetCurrentSubsystem,
    SetSubsystem(u32),
    GetSubsystemInfo(u32),
    GetNumVideoModes,
    GetCurrentVideoMode,
    SetVideoMode(u32),
    GetVideoModeInfo(u32),
    GetMaxMultisamplingLevels,
    GetMultisamplingLevels,
    SetMultisamplingLevels(u32),
}

/// A video mode as reported to the engine core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoMode {
    pub width: i32,
    pub height: i32,
    pub depth: i32,
    pub flags: u32,
}

/// Responses to device-control requests. Requests the target cannot honor
/// answer `Unsupported`; they never crash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceResponse {
    Count(u32),
    Index(u32),
    Name(String),
    Mode(VideoMode),
    Ok,
    Unsupported,
}

/// The backend device context.
pub struct Device<G: GxHardware> {
    pub(crate) gx: G,
    pub(crate) config: DeviceConfig,
    pub(crate) state: StateCache,
    pub(crate) uniforms: Uniforms,
    pub(crate) rasters: RasterTable,
    pub(crate) texmem: TextureMemory,
    pub(crate) instances: InstanceTable,
    pub(crate) globals: DeviceGlobals,
    pub(crate) current_program: Option<ShaderProgram>,
    pub(crate) current_camera: Option<Camera>,
    pub(crate) white_tex: TexMem,
    pub(crate) tmp_index: Vec<u16>,
    pub(crate) im3d_verts: Vec<Im3DVertex>,
    /// Near/far device Z of this target's depth range
    pub z_near: f32,
    pub z_far: f32,
}

impl<G: GxHardware> Device<G> {
    /// Open the backend: allocate the white fallback texture and the
    /// scratch buffer, reset all cached state. Hardware initialization
    /// failure has no recovery path.
    pub fn open(mut gx: G, config: DeviceConfig) -> Self {
        let white_tex = gx
            .linear_alloc(8 * 8 * 4)
            .expect("hardware init failed: no memory for the white texture");
        gx.mem_mut(white_tex).fill(0xFF);

        let texmem = TextureMemory::new(config.budget);
        let globals = DeviceGlobals {
            present_width: config.window_width,
            present_height: config.window_height,
            ..DeviceGlobals::default()
        };

        let mut dev = Self {
            gx,
            state: StateCache::new(white_tex),
            uniforms: Uniforms::new(),
            rasters: RasterTable::new(),
            texmem,
            instances: InstanceTable::new(),
            globals,
            current_program: None,
            current_camera: None,
            white_tex,
            tmp_index: Vec::with_capacity(TMP_INDEX_CAPACITY),
            im3d_verts: Vec::new(),
            z_near: -1.0,
            z_far: 0.0,
            config,
        };

        dev.set_attribs_fixed();
        dev.reset_render_state();
        tracing::debug!(
            "device open: {}x{} \"{}\"",
            dev.config.window_width,
            dev.config.window_height,
            dev.config.window_title
        );
        dev
    }

    /// Restore power-on render state and drop cached light state.
    pub fn reset_render_state(&mut self) {
        self.state.reset(&mut self.gx);
        self.uniforms.reset_lights();
    }

    /// Seed every attribute register's fixed fallback value. Color
    /// defaults to opaque, everything else to zero.
    fn set_attribs_fixed(&mut self) {
        for reg in 0..MAX_ATTRIBS {
            if reg == ATTRIB_COLOR {
                self.gx.set_fixed_attrib(reg, Vec4::new(0.0, 0.0, 0.0, 255.0));
            } else {
                self.gx.set_fixed_attrib(reg, Vec4::ZERO);
            }
        }
    }

    /// Engine-facing render-state write.
    pub fn set_render_state(&mut self, state: RenderState, value: u32) {
        self.state
            .set(&mut self.gx, &mut self.rasters, state, value);
    }

    /// Engine-facing render-state read. No side effects.
    pub fn get_render_state(&self, state: RenderState) -> u32 {
        self.state.get(&self.rasters, state)
    }

    /// The hardware behind this device (the simulated device in tests).
    pub fn hardware(&self) -> &G {
        &self.gx
    }

    /// Look up a raster resource.
    pub fn raster(&self, id: kiln_common::RasterId) -> &crate::raster::Raster {
        self.rasters.get(id)
    }

    /// Look up a geometry's instance data, if any.
    pub fn instance_header(
        &self,
        geo: kiln_common::GeometryId,
    ) -> Option<&crate::instance::InstanceDataHeader> {
        self.instances.get(&geo)
    }

    /// The enumerated device-control entry point.
    pub fn device_system(&mut self, req: DeviceRequest) -> DeviceResponse {
        match req {
            DeviceRequest::GetNumSubsystems => DeviceResponse::Count(2),
            DeviceRequest::GetCurrentSubsystem => {
                DeviceResponse::Index(self.globals.current_display)
            }
            DeviceRequest::SetSubsystem(n) => {
                if n >= 2 {
                    DeviceResponse::Unsupported
                } else {
                    self.globals.current_display = n;
                    DeviceResponse::Ok
                }
            }
            DeviceRequest::GetSubsystemInfo(n) => match n {
                0 => DeviceResponse::Name(String::from("top")),
                1 => DeviceResponse::Name(String::from("bot")),
                _ => DeviceResponse::Unsupported,
            },
            DeviceRequest::GetNumVideoModes => DeviceResponse::Count(1),
            DeviceRequest::GetCurrentVideoMode => DeviceResponse::Index(0),
            DeviceRequest::SetVideoMode(n) => {
                self.globals.current_mode = n;
                DeviceResponse::Ok
            }
            DeviceRequest::GetVideoModeInfo(_) => DeviceResponse::Mode(VideoMode {
                width: 400,
                height: 240,
                depth: 32,
                flags: 0,
            }),
            DeviceRequest::GetMaxMultisamplingLevels => DeviceResponse::Count(1),
            DeviceRequest::GetMultisamplingLevels => {
                if self.globals.num_samples == 0 {
                    DeviceResponse::Count(1)
                } else {
                    DeviceResponse::Count(self.globals.num_samples)
                }
            }
            DeviceRequest::SetMultisamplingLevels(n) => {
                self.globals.num_samples = n;
                DeviceResponse::Ok
            }
        }
    }
}
