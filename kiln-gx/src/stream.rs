//! Native texture container I/O.
//!
//! The on-disk form is the hardware form: the payload is the raw (tiled or
//! block-compressed) allocation, written little-endian with a fixed-order
//! header. Writing and reading back reproduces the header fields and the
//! payload byte for byte.
//!
//! Layout:
//! platform id (u32), filter/addressing (u32), name (32 bytes),
//! mask name (32 bytes), raster format (u32), width/height/depth (i32),
//! level count (i32), flags (i32, bit 0 = has-alpha, bit 1 = compressed),
//! payload size (u32), payload.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use kiln_common::Texture;

use crate::device::Device;
use crate::error::GxError;
use crate::hw::GxHardware;
use crate::raster::{RasterDesc, RasterFormat, RasterType};

/// Platform identifier of this target's native textures
pub const PLATFORM_GX: u32 = 12;

const NAME_LEN: usize = 32;

const FLAG_HAS_ALPHA: i32 = 1;
const FLAG_COMPRESSED: i32 = 2;

fn write_name<W: Write>(w: &mut W, name: &str) -> std::io::Result<()> {
    let mut buf = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    w.write_all(&buf)
}

fn read_name<R: Read>(r: &mut R) -> std::io::Result<String> {
    let mut buf = [0u8; NAME_LEN];
    r.read_exact(&mut buf)?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
}

impl<G: GxHardware> Device<G> {
    /// Serialize a texture in native form.
    pub fn write_native_texture<W: Write>(
        &mut self,
        tex: &Texture,
        w: &mut W,
    ) -> Result<(), GxError> {
        let raster = self.rasters.get(tex.raster);
        let hw_tex = raster.tex.as_ref().expect("writing a raster without data");

        w.write_u32::<LittleEndian>(PLATFORM_GX)?;
        w.write_u32::<LittleEndian>(tex.filter_addressing())?;
        write_name(w, &tex.name)?;
        write_name(w, &tex.mask)?;

        w.write_u32::<LittleEndian>(raster.format.0)?;
        w.write_i32::<LittleEndian>(raster.width)?;
        w.write_i32::<LittleEndian>(raster.height)?;
        w.write_i32::<LittleEndian>(raster.depth)?;
        w.write_i32::<LittleEndian>(raster.num_levels as i32)?;

        let mut flags = 0;
        if raster.has_alpha {
            flags |= FLAG_HAS_ALPHA;
        }
        if raster.is_compressed {
            flags |= FLAG_COMPRESSED;
        }
        w.write_i32::<LittleEndian>(flags)?;

        let size = raster.total_size;
        w.write_u32::<LittleEndian>(size)?;
        let mem = hw_tex.mem;
        w.write_all(&self.gx.mem(mem)[..size as usize])?;
        Ok(())
    }

    /// Read a texture in native form, creating its raster.
    ///
    /// A foreign platform id reports back; a payload that does not match
    /// the raster's computed size is corrupt content and fatal.
    pub fn read_native_texture<R: Read>(&mut self, r: &mut R) -> Result<Texture, GxError> {
        let platform = r.read_u32::<LittleEndian>()?;
        if platform != PLATFORM_GX {
            return Err(GxError::WrongPlatform(platform));
        }

        let filter_addressing = r.read_u32::<LittleEndian>()?;
        let name = read_name(r)?;
        let mask = read_name(r)?;

        let format = RasterFormat(r.read_u32::<LittleEndian>()?);
        let width = r.read_i32::<LittleEndian>()?;
        let height = r.read_i32::<LittleEndian>()?;
        let depth = r.read_i32::<LittleEndian>()?;
        let num_levels = r.read_i32::<LittleEndian>()?;
        let flags = r.read_i32::<LittleEndian>()?;

        let raster_id = if flags & FLAG_COMPRESSED != 0 {
            let mut desc = RasterDesc::new(width, height, depth, format, RasterType::Texture);
            desc.dont_allocate = true;
            let id = self.raster_create(desc)?;
            self.allocate_etc(id)?;
            let raster = self.rasters.get_mut(id);
            raster.original_stride = raster.stride;
            id
        } else {
            self.raster_create(RasterDesc::new(
                width,
                height,
                depth,
                format,
                RasterType::Texture,
            ))?
        };

        {
            let raster = self.rasters.get(raster_id);
            if flags & FLAG_HAS_ALPHA != 0 && !raster.has_alpha {
                panic!("texture chunk claims alpha but the raster format has none");
            }
            assert_eq!(
                raster.num_levels as i32, num_levels,
                "texture chunk level count does not match the raster"
            );
        }

        let size = r.read_u32::<LittleEndian>()?;
        let (mem, total) = {
            let raster = self.rasters.get(raster_id);
            let hw_tex = raster.tex.as_ref().expect("raster without allocation");
            (hw_tex.mem, raster.total_size)
        };
        if size != total {
            panic!(
                "texture chunk size mismatch: on-disk {:#x}, calculated {:#x}",
                size, total
            );
        }
        r.read_exact(&mut self.gx.mem_mut(mem)[..size as usize])?;

        let mut tex = Texture::new(&name);
        tex.mask = mask;
        tex.set_filter_addressing(filter_addressing);
        tex.raster = raster_id;
        Ok(tex)
    }
}
