//! Texture memory management: linear-heap budgeting, the size-ordered
//! eviction pool, and mip-level shrinking.
//!
//! The linear heap is small and has no virtual memory behind it. Every
//! mipmapped texture is registered in the eviction pool; whenever free
//! space runs low, the pool gives up the *largest mip level* of the
//! *smallest resident texture*. That trade-off keeps big textures fully
//! detailed at the cost of detail in small ones - it can look inconsistent
//! up close, and that is the intended policy, not an accident.
//!
//! A texture whose last reducible level is gone leaves the pool for good;
//! it stays allocated at minimum size and is never auto-evicted again.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use kiln_common::RasterId;

use crate::hw::{GxHardware, PixelFormat, TexMem};
use crate::raster::{HwTex, RasterTable};

/// Free-space mark under which one victim is shrunk ahead of an allocation
pub const DEFAULT_HIGH_WATER: usize = 16 << 20;

/// Free-space mark the allocator shrinks repeatedly to stay above
pub const DEFAULT_LOW_WATER: usize = 8 << 20;

/// Watermark configuration; tests shrink these together with the simulated
/// heap to force eviction.
#[derive(Debug, Clone, Copy)]
pub struct MemoryBudget {
    pub high_water: usize,
    pub low_water: usize,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            high_water: DEFAULT_HIGH_WATER,
            low_water: DEFAULT_LOW_WATER,
        }
    }
}

/// Deepest mip level for a base size, keeping every level at least 8x8
pub fn calc_max_level(width: u32, height: u32) -> u8 {
    let min = width.min(height);
    assert!(min >= 8, "texture dimensions below the 8x8 hardware floor");
    (min.ilog2() - 3) as u8
}

/// Byte size of mip level `level` given the level-0 size
pub fn calc_level_size(base_size: u32, level: u8) -> u32 {
    base_size >> (2 * level as u32)
}

/// Byte size of the whole chain down to `max_level` (geometric series,
/// each level a quarter of the previous)
pub fn calc_total_size(base_size: u32, max_level: u8) -> u32 {
    (base_size - calc_level_size(base_size, max_level + 1)) * 4 / 3
}

/// Level-0 byte size for a texture
pub fn calc_base_size(width: u32, height: u32, format: PixelFormat) -> u32 {
    width * height * format.bits_per_pixel() / 8
}

/// The staging buffer is sized for the largest possible texture including
/// its full mip chain.
pub fn scratch_size() -> usize {
    let base = calc_base_size(1024, 1024, PixelFormat::Rgba8);
    calc_total_size(base, calc_max_level(1024, 1024)) as usize
}

/// The eviction candidate set: every GPU-resident texture that still has a
/// mip level to give up, ordered by level-0 byte size ascending with stable
/// insertion-order ties.
#[derive(Default)]
pub struct TexturePool {
    by_size: BTreeMap<(u32, u64), RasterId>,
    index: HashMap<RasterId, (u32, u64)>,
    next_seq: u64,
}

impl TexturePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_size.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_size.is_empty()
    }

    pub fn contains(&self, id: RasterId) -> bool {
        self.index.contains_key(&id)
    }

    /// Register a texture with its current level-0 byte size.
    pub fn insert(&mut self, id: RasterId, size: u32) {
        debug_assert!(!self.contains(id), "raster already pooled");
        let key = (size, self.next_seq);
        self.next_seq += 1;
        self.by_size.insert(key, id);
        self.index.insert(id, key);
    }

    /// Drop a texture from the candidate set (explicit free, or shrunk to
    /// the floor). Returns whether it was pooled.
    pub fn remove(&mut self, id: RasterId) -> bool {
        match self.index.remove(&id) {
            Some(key) => {
                self.by_size.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Take the smallest texture (oldest first among equal sizes).
    pub fn pop_min(&mut self) -> Option<RasterId> {
        let (&key, &id) = self.by_size.iter().next()?;
        self.by_size.remove(&key);
        self.index.remove(&id);
        Some(id)
    }
}

/// Texture memory state owned by the device: the pool, the watermarks and
/// the single scratch staging buffer.
///
/// The scratch buffer is reused across unrelated operations (mip copies
/// during eviction, transfer-engine staging); its contents must always be
/// consumed before the next operation overwrites them.
pub struct TextureMemory {
    pub pool: TexturePool,
    pub budget: MemoryBudget,
    pub scratch: Vec<u8>,
}

impl TextureMemory {
    pub fn new(budget: MemoryBudget) -> Self {
        Self {
            pool: TexturePool::new(),
            budget,
            scratch: vec![0; scratch_size()],
        }
    }
}

/// Shrink the pool's smallest texture by one mip level.
///
/// The retained smaller levels are copied out through the scratch buffer,
/// the old allocation is freed, and a tighter one takes its place. Returns
/// the level-0 byte size that was given up, or 0 when the pool is empty.
pub fn shrink_some_texture(
    gx: &mut dyn GxHardware,
    rasters: &mut RasterTable,
    texmem: &mut TextureMemory,
) -> usize {
    let Some(id) = texmem.pool.pop_min() else {
        return 0;
    };

    let (mem, old_base, new_base, new_total, new_max) = {
        let raster = rasters.get(id);
        let tex = raster.tex.as_ref().expect("pooled raster without texture");
        assert!(tex.max_level > 0);

        let new_max = tex.max_level - 1;
        let new_base = calc_base_size(
            tex.width as u32 / 2,
            tex.height as u32 / 2,
            tex.format,
        );
        let new_total = calc_total_size(new_base, new_max);
        (tex.mem, tex.size, new_base, new_total, new_max)
    };

    // the chain below level 0 starts right after the level-0 image
    let src_off = old_base as usize;
    texmem.scratch[..new_total as usize]
        .copy_from_slice(&gx.mem(mem)[src_off..src_off + new_total as usize]);
    gx.release(mem);
    let new_mem = gx
        .linear_alloc(new_total as usize)
        .expect("texture heap exhausted while shrinking");
    gx.mem_mut(new_mem)[..new_total as usize]
        .copy_from_slice(&texmem.scratch[..new_total as usize]);

    let raster = rasters.get_mut(id);
    let tex = raster.tex.as_mut().expect("pooled raster without texture");
    tex.mem = new_mem;
    tex.size = new_base;
    tex.width /= 2;
    tex.height /= 2;
    tex.max_level = new_max;
    raster.total_size = new_total;
    raster.num_levels = new_max + 1;

    tracing::debug!(
        "shrunk texture {}: now {}x{} ({} levels, {} bytes)",
        id.0,
        tex.width,
        tex.height,
        new_max + 1,
        new_total
    );

    if new_max > 0 {
        texmem.pool.insert(id, new_base);
    }

    old_base as usize
}

/// Allocate hardware texture memory for a raster, evicting as needed.
///
/// Fails fatally once the eviction pool is exhausted; a huge allocation
/// that cannot be satisfied at all is an upstream content bug.
pub fn tex_alloc(
    gx: &mut dyn GxHardware,
    rasters: &mut RasterTable,
    texmem: &mut TextureMemory,
    id: RasterId,
    width: u32,
    height: u32,
    format: PixelFormat,
    mipmap: bool,
) {
    let max_level = if mipmap {
        calc_max_level(width, height)
    } else {
        0
    };

    // stay ahead of fragmentation: one preemptive shrink below the high
    // mark, then keep shrinking until the low mark holds
    if gx.linear_free() < texmem.budget.high_water {
        shrink_some_texture(gx, rasters, texmem);
    }
    while gx.linear_free() < texmem.budget.low_water {
        if shrink_some_texture(gx, rasters, texmem) == 0 {
            break;
        }
    }

    let base = calc_base_size(width, height, format);
    let total = calc_total_size(base, max_level);

    let mem = loop {
        if let Some(mem) = gx.linear_alloc(total as usize) {
            break mem;
        }
        if shrink_some_texture(gx, rasters, texmem) == 0 {
            panic!(
                "texture heap exhausted: {} bytes for {}x{} after full eviction sweep",
                total, width, height
            );
        }
    };

    let raster = rasters.get_mut(id);
    raster.tex = Some(HwTex {
        mem,
        size: base,
        width: width as u16,
        height: height as u16,
        format,
        max_level,
    });
    raster.total_size = total;
    raster.num_levels = max_level + 1;
    raster.on_vram = false;

    if max_level > 0 {
        texmem.pool.insert(id, base);
    }

    tracing::debug!(
        "allocated texture {}: {}x{} {:?}, {} levels, {} bytes ({} free)",
        id.0,
        width,
        height,
        format,
        max_level + 1,
        total,
        gx.linear_free()
    );
}

/// Release a raster's texture memory and deregister it from the pool.
pub fn tex_free(
    gx: &mut dyn GxHardware,
    texmem: &mut TextureMemory,
    rasters: &mut RasterTable,
    id: RasterId,
) {
    let raster = rasters.get_mut(id);
    let Some(tex) = raster.tex.take() else {
        return;
    };
    if !raster.on_vram {
        texmem.pool.remove(id);
    }
    gx.release(tex.mem);
}

/// Allocate non-texture linear memory (vertex/index buffers share the
/// heap), shrinking pooled textures until a comfortable margin exists.
pub fn safe_linear_alloc(
    gx: &mut dyn GxHardware,
    rasters: &mut RasterTable,
    texmem: &mut TextureMemory,
    size: usize,
) -> TexMem {
    while gx.linear_free() < size * 2 {
        if shrink_some_texture(gx, rasters, texmem) == 0 {
            break;
        }
    }

    match gx.linear_alloc(size) {
        Some(mem) => mem,
        None => panic!("linear heap exhausted: {} bytes", size),
    }
}
