//! GUI draw-list consumer.
//!
//! Thin adapter between an immediate-mode GUI library's draw lists
//! (screen-space quads, per-vertex position/color/UV, per-command texture,
//! no scissor) and the im2d path. Render state is saved, forced to the
//! standard GUI configuration, and restored afterwards.

use kiln_common::PrimitiveType;

use crate::device::Device;
use crate::hw::GxHardware;
use crate::immed::Im2DVertex;
use crate::render_state::{BLEND_INV_SRC_ALPHA, BLEND_SRC_ALPHA, CULL_NONE, RenderState};

/// One GUI vertex as produced by the GUI library
#[derive(Debug, Clone, Copy)]
pub struct GuiVertex {
    pub pos: [f32; 2],
    pub uv: [f32; 2],
    /// Packed RGBA, red in the low byte
    pub color: u32,
}

/// One draw command: a run of indices under one texture binding
#[derive(Debug, Clone, Copy)]
pub struct GuiDrawCmd {
    /// Raster handle of the texture to sample, 0 for untextured
    pub texture: u32,
    pub elem_count: u32,
}

/// One draw list: vertices, indices and the commands slicing them
#[derive(Debug, Default)]
pub struct GuiDrawList {
    pub vtx: Vec<GuiVertex>,
    pub idx: Vec<u16>,
    pub cmds: Vec<GuiDrawCmd>,
}

/// A frame's worth of GUI draw lists
#[derive(Debug, Default)]
pub struct GuiDrawData {
    pub lists: Vec<GuiDrawList>,
    pub display_width: f32,
    pub display_height: f32,
}

/// Render states the adapter touches and must restore
const SAVED_STATES: [RenderState; 8] = [
    RenderState::VertexAlpha,
    RenderState::SrcBlend,
    RenderState::DestBlend,
    RenderState::ZTestEnable,
    RenderState::TextureRaster,
    RenderState::TextureAddressU,
    RenderState::TextureAddressV,
    RenderState::TextureFilter,
];

impl<G: GxHardware> Device<G> {
    /// Render one frame of GUI draw lists.
    pub fn render_gui_draw_lists(&mut self, data: &GuiDrawData) {
        // minimized
        if data.display_width <= 0.0 || data.display_height <= 0.0 {
            return;
        }

        let mut saved = [0u32; SAVED_STATES.len()];
        for (i, state) in SAVED_STATES.iter().enumerate() {
            saved[i] = self.get_render_state(*state);
        }
        let saved_cull = self.get_render_state(RenderState::CullMode);

        self.set_render_state(RenderState::VertexAlpha, 1);
        self.set_render_state(RenderState::SrcBlend, BLEND_SRC_ALPHA);
        self.set_render_state(RenderState::DestBlend, BLEND_INV_SRC_ALPHA);
        self.set_render_state(RenderState::ZTestEnable, 0);
        self.set_render_state(RenderState::CullMode, CULL_NONE);

        let screen_z = self.z_near;
        let camera_z = self.current_camera.as_ref().map_or(1.0, |c| c.near_plane);

        for list in &data.lists {
            let verts: Vec<Im2DVertex> = list
                .vtx
                .iter()
                .map(|v| Im2DVertex {
                    x: v.pos[0],
                    y: v.pos[1],
                    z: screen_z,
                    w: camera_z,
                    r: (v.color & 0xFF) as u8,
                    g: (v.color >> 8 & 0xFF) as u8,
                    b: (v.color >> 16 & 0xFF) as u8,
                    a: (v.color >> 24 & 0xFF) as u8,
                    u: v.uv[0],
                    v: v.uv[1],
                })
                .collect();

            let mut idx_offset = 0usize;
            for cmd in &list.cmds {
                self.set_render_state(RenderState::TextureRaster, cmd.texture);
                let range = &list.idx[idx_offset..idx_offset + cmd.elem_count as usize];
                self.im2d_render_indexed_primitive(PrimitiveType::TriList, &verts, Some(range));
                idx_offset += cmd.elem_count as usize;
            }
        }

        for (i, state) in SAVED_STATES.iter().enumerate() {
            self.set_render_state(*state, saved[i]);
        }
        self.set_render_state(RenderState::CullMode, saved_cull);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceConfig;
    use crate::hw::sim::SimGx;

    fn open_device() -> Device<SimGx> {
        Device::open(SimGx::new(), DeviceConfig::default())
    }

    fn one_quad_list(texture: u32) -> GuiDrawData {
        GuiDrawData {
            lists: vec![GuiDrawList {
                vtx: (0..4)
                    .map(|i| GuiVertex {
                        pos: [(i % 2) as f32 * 10.0, (i / 2) as f32 * 10.0],
                        uv: [0.0, 0.0],
                        color: 0xFF00_FF00,
                    })
                    .collect(),
                idx: vec![0, 1, 2, 0, 2, 3],
                cmds: vec![GuiDrawCmd {
                    texture,
                    elem_count: 6,
                }],
            }],
            display_width: 400.0,
            display_height: 240.0,
        }
    }

    #[test]
    fn test_gui_draws_each_command() {
        let mut dev = open_device();
        let mut data = one_quad_list(0);
        data.lists[0].idx.extend_from_slice(&[1, 2, 3]);
        data.lists[0].cmds.push(GuiDrawCmd {
            texture: 0,
            elem_count: 3,
        });
        dev.render_gui_draw_lists(&data);
        assert_eq!(dev.gx.draws.len(), 2);
    }

    #[test]
    fn test_gui_restores_render_state(){
        let mut dev = open_device();
        dev.set_render_state(RenderState::ZTestEnable, 1);
        dev.set_render_state(RenderState::CullMode, crate::render_state::CULL_BACK);

        dev.render_gui_draw_lists(&one_quad_list(0));

        assert_eq!(dev.get_render_state(RenderState::ZTestEnable), 1);
        assert_eq!(
            dev.get_render_state(RenderState::CullMode),
            crate::render_state::CULL_BACK
        );
        assert_eq!(dev.get_render_state(RenderState::VertexAlpha), 0);
    }

    #[test]
    fn test_gui_skips_minimized_display() {
        let mut dev = open_device();
        let mut data = one_quad_list(0);
        data.display_width = 0.0;
        dev.render_gui_draw_lists(&data);
        assert!(dev.gx.draws.is_empty());
    }
}
