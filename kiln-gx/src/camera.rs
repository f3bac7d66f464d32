//! Camera and framebuffer setup.
//!
//! The native framebuffer is physically rotated ("tilt"): its rows run
//! along the short axis of the screen, so view-space X/Y swap in the
//! projection and the viewport rectangle. Render-to-texture targets are
//! unrotated. Framebuffer rasters are power-of-two; the gap between the
//! raster size and the camera's output lands as a viewport offset.

use glam::{Mat4, Vec4};
use kiln_common::{Camera, ClearFlags, Projection, RasterId, Rect, Rgba};

use crate::device::Device;
use crate::hw::{ClearMask, GxHardware, TexMem};
use crate::raster::RasterType;
use crate::render_state::{BLEND_ONE, BLEND_ZERO, RenderState};

impl<G: GxHardware> Device<G> {
    /// Attach the camera's depth buffer to its framebuffer and keep the
    /// mutual raster pairing current.
    fn prepare_frame_buffer(&mut self, cam: &Camera) -> (TexMem, Option<TexMem>, u32, u32) {
        let fb_id = cam.frame_buffer;
        let zbuf_mem = cam
            .z_buffer
            .map(|z| self.rasters.get(z).zbuf.expect("depth raster without memory"));

        {
            let fb = self.rasters.get_mut(fb_id);
            assert!(
                matches!(fb.ty, RasterType::Camera | RasterType::CameraTexture),
                "rendering into a non-camera raster"
            );
            let fbo = fb.fbo.as_mut().expect("camera raster without framebuffer");
            fbo.depth = zbuf_mem;
        }

        match cam.z_buffer {
            Some(z) => {
                if self.rasters.get(fb_id).fbo_mate != Some(z) {
                    self.rasters.get_mut(fb_id).fbo_mate = Some(z);
                    self.rasters.get_mut(z).fbo_mate = Some(fb_id);
                }
            }
            None => {
                self.rasters.get_mut(fb_id).fbo_mate = None;
            }
        }

        let fb = self.rasters.get(fb_id);
        let fbo = fb.fbo.as_ref().unwrap();
        (fb.tex.as_ref().unwrap().mem, fbo.depth, fbo.width, fbo.height)
    }

    pub fn camera_tilt(&self, cam: &Camera) -> bool {
        self.rasters.get(cam.frame_buffer).tilt
    }

    /// Viewport rectangle of a camera on its (power-of-two, possibly
    /// rotated) framebuffer raster. Also records the presentation window.
    pub fn camera_view_port(&mut self, cam: &Camera, tilt: bool) -> Rect {
        let fb = self.rasters.get(cam.frame_buffer);
        let gap_w = fb.tex.as_ref().unwrap().height as i32 - fb.width;

        let sub = cam
            .sub_rect
            .unwrap_or(Rect::new(0, 0, fb.width, fb.height));
        let (x, y, w, h) = (sub.x, sub.y, sub.w, sub.h);

        self.globals.present_off_x = x;
        self.globals.present_off_y = y;
        self.globals.present_width = w;
        self.globals.present_height = h;

        if !tilt {
            Rect::new(x + gap_w, y, w, h)
        } else {
            Rect::new(y, x + gap_w, h, w)
        }
    }

    fn camera_render_on(&mut self, cam: &Camera) {
        let (color, depth, w, h) = self.prepare_frame_buffer(cam);
        let tilt = self.camera_tilt(cam);
        let vp = self.camera_view_port(cam, tilt);
        self.gx.bind_framebuffer(color, depth, w, h);
        self.gx.set_viewport(vp.x, vp.y, vp.w, vp.h);
        self.current_camera = Some(cam.clone());
    }

    fn update_fog(&mut self, cam: &Camera) {
        if self.state.fog_start != cam.fog_plane {
            self.state.fog_start = cam.fog_plane;
            self.state.state_dirty = true;
        }
        if self.state.fog_end != cam.far_plane {
            self.state.fog_end = cam.far_plane;
            self.state.state_dirty = true;
        }
    }

    /// Begin rendering through a camera: derive view and projection,
    /// refresh the fog range, bind the render target.
    pub fn begin_update(&mut self, cam: &Camera) {
        self.gx.frame_begin();

        // looking down positive Z; flip X for a left-handed view space
        let inv = cam.frame.ltm.inverse();
        let view = Mat4::from_diagonal(Vec4::new(-1.0, 1.0, 1.0, 1.0)) * inv;

        let far = cam.far_plane;
        let near = cam.near_plane;
        let invwx = 1.0 / cam.view_window.x;
        let invwy = 1.0 / cam.view_window.y;
        let invz = -1.0 / (far - near);

        // rows[i][j] is row i, column j. The rasterizer scans the rotated
        // framebuffer, so X and Y swap roles.
        let mut rows = [[0.0f32; 4]; 4];
        rows[1][0] = -invwx;
        rows[0][1] = invwy;
        rows[0][2] = cam.view_offset.x * invwx;
        rows[1][2] = cam.view_offset.y * invwy;
        rows[0][3] = -rows[0][2];
        rows[1][3] = -rows[1][2];

        match cam.projection {
            Projection::Perspective => {
                rows[2][3] = far * near / (near - far);
                rows[3][2] = 1.0;
                rows[2][2] = -near / (near - far);
            }
            Projection::Parallel => {
                rows[0][3] = -(far + near) * invz;
                rows[1][3] = 0.0;
                rows[2][3] = 2.0 * invz;
                rows[3][3] = 1.0;
            }
        }

        let proj = Mat4::from_cols(
            Vec4::new(rows[0][0], rows[1][0], rows[2][0], rows[3][0]),
            Vec4::new(rows[0][1], rows[1][1], rows[2][1], rows[3][1]),
            Vec4::new(rows[0][2], rows[1][2], rows[2][2], rows[3][2]),
            Vec4::new(rows[0][3], rows[1][3], rows[2][3], rows[3][3]),
        );

        self.uniforms.set_view(view);
        self.uniforms.set_projection(proj);
        self.update_fog(cam);
        self.camera_render_on(cam);
    }

    pub fn end_update(&mut self, _cam: &Camera) {
        self.gx.frame_end();
    }

    /// Clear a camera's buffers. Stencil shares the depth buffer on this
    /// target, so a stencil clear aliases the depth clear.
    pub fn clear_camera(&mut self, cam: &Camera, color: Rgba, mode: ClearFlags) {
        let (color_mem, depth, _, _) = self.prepare_frame_buffer(cam);
        let coli = ((color.r as u32) << 24)
            | ((color.g as u32) << 16)
            | ((color.b as u32) << 8)
            | color.a as u32;

        let mut mask = ClearMask::empty();
        if mode.contains(ClearFlags::IMAGE) {
            mask |= ClearMask::COLOR;
        }
        if mode.contains(ClearFlags::Z) {
            mask |= ClearMask::DEPTH;
        }
        if mode.contains(ClearFlags::STENCIL) {
            mask |= ClearMask::DEPTH;
        }
        self.gx.clear_framebuffer(color_mem, depth, mask, coli, 0);
    }

    /// Present a camera raster to the screen through the transfer engine.
    /// Blocks until the transfer completed.
    pub fn show_raster(&mut self, raster: RasterId) {
        let r = self.rasters.get(raster);
        let fbo = r.fbo.as_ref().expect("presenting a raster without framebuffer");
        if !r.tilt {
            panic!("presenting an unrotated framebuffer is not supported");
        }
        let color = r.tex.as_ref().unwrap().mem;
        let (fb_w, fb_h) = (fbo.width, fbo.height);
        let (out_w, out_h) = (r.height as u32, r.width as u32);
        self.gx.present(color, fb_w, fb_h, out_w, out_h);
    }

    fn raster_blit(&mut self, src: RasterId, dst: RasterId) {
        let (w, h) = {
            let d = self.rasters.get(dst);
            (d.width, d.height)
        };
        self.gx.set_viewport(0, 0, w, h);

        self.set_render_state(RenderState::TextureFilter, 0);
        self.set_render_state(RenderState::FogEnable, 0);
        self.set_render_state(RenderState::ZTestEnable, 0);
        self.set_render_state(RenderState::ZWriteEnable, 0);
        self.set_render_state(RenderState::TextureRaster, src.0);
        self.set_render_state(RenderState::VertexAlpha, 0);
        self.set_render_state(RenderState::SrcBlend, BLEND_ONE);
        self.set_render_state(RenderState::DestBlend, BLEND_ZERO);

        self.im2d_render_blit();

        if let Some(cam) = self.current_camera.clone() {
            self.camera_render_on(&cam);
        }
    }

    /// Fast path for copying a finished camera image into a camera
    /// texture. Every other source/target combination reports false.
    pub fn raster_render_fast(&mut self, src: RasterId, _x: i32, _y: i32) -> bool {
        let Some(dst) = self.current_camera.as_ref().map(|c| c.frame_buffer) else {
            return false;
        };
        let dst_ty = self.rasters.get(dst).ty;
        let src_ty = self.rasters.get(src).ty;

        if dst_ty == RasterType::CameraTexture && src_ty == RasterType::Camera {
            self.gx.frame_split();
            let (color, depth, w, h) = {
                let d = self.rasters.get(dst);
                let fbo = d.fbo.as_ref().unwrap();
                (d.tex.as_ref().unwrap().mem, fbo.depth, fbo.width, fbo.height)
            };
            self.gx.bind_framebuffer(color, depth, w, h);
            self.raster_blit(src, dst);
            return true;
        }
        false
    }
}
