//! ETC1 / ETC1+A4 tile compression.
//!
//! Compresses one 8x8 tile of 32-bit RGBA pixels into four 4x4 compressed
//! sub-blocks. Output layout is what the texture units decode:
//!
//! - sub-blocks are emitted in row-major 4-pixel steps over the tile, with
//!   tile rows read bottom-up
//! - when the raster has alpha, a 64-bit 4bpp alpha block precedes each
//!   64-bit color block; the alpha nibble for pixel (x, y) lands in byte
//!   `2x + y/2`, high nibble when y is odd (the alpha lane swaps the X/Y
//!   axis ordering)
//! - the color block is emitted byte-reversed relative to the encoder's
//!   big-endian output
//!
//! The encoder favors speed over quality: per-sub-block mean base colors,
//! differential mode when the bases fit, exhaustive search only over the
//! eight modifier tables.

/// ETC1 modifier tables; per table the positive magnitudes {a, b}, the four
/// per-pixel codes select {+a, +b, -a, -b}.
const MODIFIER_TABLES: [[i32; 2]; 8] = [
    [2, 8],
    [5, 17],
    [9, 29],
    [13, 42],
    [18, 60],
    [24, 80],
    [33, 106],
    [47, 183],
];

#[derive(Clone, Copy)]
struct Px {
    r: i32,
    g: i32,
    b: i32,
}

#[inline]
fn clamp8(v: i32) -> i32 {
    v.clamp(0, 255)
}

#[inline]
fn extend5(v: i32) -> i32 {
    (v << 3) | (v >> 2)
}

#[inline]
fn extend4(v: i32) -> i32 {
    (v << 4) | v
}

/// Pixel indices of one 2x4 or 4x2 sub-block half, in ETC1 pixel-index
/// order (index = x * 4 + y)
fn half_pixels(flip: bool, which: usize) -> [usize; 8] {
    let mut out = [0usize; 8];
    let mut n = 0;
    for x in 0..4 {
        for y in 0..4 {
            let in_half = if flip {
                (y >= 2) == (which == 1)
            } else {
                (x >= 2) == (which == 1)
            };
            if in_half {
                out[n] = x * 4 + y;
                n += 1;
            }
        }
    }
    debug_assert_eq!(n, 8);
    out
}

fn average(block: &[Px; 16], idx: &[usize; 8]) -> Px {
    let (mut r, mut g, mut b) = (0, 0, 0);
    for &i in idx {
        r += block[i].r;
        g += block[i].g;
        b += block[i].b;
    }
    Px {
        r: (r + 4) / 8,
        g: (g + 4) / 8,
        b: (b + 4) / 8,
    }
}

/// Pick the modifier table and per-pixel codes minimizing squared error for
/// one half, against its reconstructed base color.
fn fit_half(block: &[Px; 16], idx: &[usize; 8], base: Px) -> (u32, [u8; 8], u64) {
    let mut best_table = 0u32;
    let mut best_codes = [0u8; 8];
    let mut best_err = u64::MAX;
    for (t, mags) in MODIFIER_TABLES.iter().enumerate() {
        let mods = [mags[0], mags[1], -mags[0], -mags[1]];
        let mut codes = [0u8; 8];
        let mut err = 0u64;
        for (n, &i) in idx.iter().enumerate() {
            let px = block[i];
            let mut pe = u64::MAX;
            for (c, &m) in mods.iter().enumerate() {
                let dr = clamp8(base.r + m) - px.r;
                let dg = clamp8(base.g + m) - px.g;
                let db = clamp8(base.b + m) - px.b;
                let e = (dr * dr + dg * dg + db * db) as u64;
                if e < pe {
                    pe = e;
                    codes[n] = c as u8;
                }
            }
            err += pe;
        }
        if err < best_err {
            best_err = err;
            best_table = t as u32;
            best_codes = codes;
        }
    }
    (best_table, best_codes, best_err)
}

fn encode_with_flip(block: &[Px; 16], flip: bool) -> (u64, u64) {
    let idx0 = half_pixels(flip, 0);
    let idx1 = half_pixels(flip, 1);
    let avg0 = average(block, &idx0);
    let avg1 = average(block, &idx1);

    // differential 555+333 when the quantized bases are close enough,
    // individual 444 otherwise
    let q0 = Px {
        r: avg0.r >> 3,
        g: avg0.g >> 3,
        b: avg0.b >> 3,
    };
    let q1 = Px {
        r: avg1.r >> 3,
        g: avg1.g >> 3,
        b: avg1.b >> 3,
    };
    let (dr, dg, db) = (q1.r - q0.r, q1.g - q0.g, q1.b - q0.b);
    let diff_ok = (-4..=3).contains(&dr) && (-4..=3).contains(&dg) && (-4..=3).contains(&db);

    let (mut word, base0, base1) = if diff_ok {
        let base0 = Px {
            r: extend5(q0.r),
            g: extend5(q0.g),
            b: extend5(q0.b),
        };
        let base1 = Px {
            r: extend5(q0.r + dr),
            g: extend5(q0.g + dg),
            b: extend5(q0.b + db),
        };
        let mut w = 0u64;
        w |= (q0.r as u64) << 59;
        w |= ((dr & 7) as u64) << 56;
        w |= (q0.g as u64) << 51;
        w |= ((dg & 7) as u64) << 48;
        w |= (q0.b as u64) << 43;
        w |= ((db & 7) as u64) << 40;
        w |= 1 << 33; // diff bit
        (w, base0, base1)
    } else {
        let i0 = Px {
            r: avg0.r >> 4,
            g: avg0.g >> 4,
            b: avg0.b >> 4,
        };
        let i1 = Px {
            r: avg1.r >> 4,
            g: avg1.g >> 4,
            b: avg1.b >> 4,
        };
        let base0 = Px {
            r: extend4(i0.r),
            g: extend4(i0.g),
            b: extend4(i0.b),
        };
        let base1 = Px {
            r: extend4(i1.r),
            g: extend4(i1.g),
            b: extend4(i1.b),
        };
        let mut w = 0u64;
        w |= (i0.r as u64) << 60;
        w |= (i1.r as u64) << 56;
        w |= (i0.g as u64) << 52;
        w |= (i1.g as u64) << 48;
        w |= (i0.b as u64) << 44;
        w |= (i1.b as u64) << 40;
        (w, base0, base1)
    };

    let (t0, codes0, err0) = fit_half(block, &idx0, base0);
    let (t1, codes1, err1) = fit_half(block, &idx1, base1);
    word |= (t0 as u64) << 37;
    word |= (t1 as u64) << 34;
    if flip {
        word |= 1 << 32;
    }

    for (codes, idx) in [(codes0, idx0), (codes1, idx1)] {
        for (n, &i) in idx.iter().enumerate() {
            let code = codes[n] as u64;
            word |= (code >> 1) << (16 + i); // msb lane
            word |= (code & 1) << i; // lsb lane
        }
    }

    (word, err0 + err1)
}

/// Encode one 4x4 block of RGB pixels (ETC1 pixel order) into the 64-bit
/// big-endian color block.
fn pack_etc1_block(block: &[Px; 16]) -> u64 {
    let (w0, e0) = encode_with_flip(block, false);
    let (w1, e1) = encode_with_flip(block, true);
    if e0 <= e1 { w0 } else { w1 }
}

/// Compress one 8x8 tile into four compressed 4x4 sub-blocks appended to
/// `dst`. `tile` starts at the tile's first (top) pixel row; rows are read
/// bottom-up. Input must be 32-bit RGBA.
pub fn etc1_compress_tile(tile: &[u8], stride: usize, has_alpha: bool, dst: &mut Vec<u8>) {
    for j in (0..8).step_by(4) {
        for i in (0..8).step_by(4) {
            let mut block = [Px { r: 0, g: 0, b: 0 }; 16];
            let mut out_alpha = [0u8; 8];

            for y in 0..4 {
                for x in 0..4 {
                    let off = (7 - (j + y)) * stride + (i + x) * 4;
                    let px = &tile[off..off + 4];
                    block[x * 4 + y] = Px {
                        r: px[0] as i32,
                        g: px[1] as i32,
                        b: px[2] as i32,
                    };

                    if has_alpha {
                        let a4 = (16 * px[3] as u32 / 256) as u8;
                        // 4bpp alpha lane; X/Y axes are swapped
                        if y & 1 != 0 {
                            out_alpha[2 * x + y / 2] |= a4 << 4;
                        } else {
                            out_alpha[2 * x + y / 2] |= a4;
                        }
                    }
                }
            }

            let color = pack_etc1_block(&block);

            // alpha block precedes the color block
            if has_alpha {
                dst.extend_from_slice(&out_alpha);
            }

            // the encoder's native output is big-endian; the hardware wants
            // the bytes reversed
            dst.extend_from_slice(&color.to_le_bytes());
        }
    }
}

/// Compressed byte size of a `width` x `height` level
pub fn etc1_level_size(width: usize, height: usize, has_alpha: bool) -> usize {
    width * height * if has_alpha { 8 } else { 4 } / 8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_tile(rgba: [u8; 4]) -> Vec<u8> {
        let mut tile = Vec::with_capacity(8 * 8 * 4);
        for _ in 0..64 {
            tile.extend_from_slice(&rgba);
        }
        tile
    }

    /// Minimal ETC1 decoder used to validate encoder output
    fn decode_block(bytes: &[u8]) -> [[u8; 3]; 16] {
        let word = u64::from_le_bytes(bytes.try_into().unwrap());
        let diff = word & (1 << 33) != 0;
        let flip = word & (1 << 32) != 0;
        let (base0, base1) = if diff {
            let r = ((word >> 59) & 0x1F) as i32;
            let dr = (((word >> 56) & 7) as i32) << 29 >> 29;
            let g = ((word >> 51) & 0x1F) as i32;
            let dg = (((word >> 48) & 7) as i32) << 29 >> 29;
            let b = ((word >> 43) & 0x1F) as i32;
            let db = (((word >> 40) & 7) as i32) << 29 >> 29;
            (
                [extend5(r), extend5(g), extend5(b)],
                [extend5(r + dr), extend5(g + dg), extend5(b + db)],
            )
        } else {
            let r0 = ((word >> 60) & 0xF) as i32;
            let r1 = ((word >> 56) & 0xF) as i32;
            let g0 = ((word >> 52) & 0xF) as i32;
            let g1 = ((word >> 48) & 0xF) as i32;
            let b0 = ((word >> 44) & 0xF) as i32;
            let b1 = ((word >> 40) & 0xF) as i32;
            (
                [extend4(r0), extend4(g0), extend4(b0)],
                [extend4(r1), extend4(g1), extend4(b1)],
            )
        };
        let t0 = ((word >> 37) & 7) as usize;
        let t1 = ((word >> 34) & 7) as usize;
        let mut out = [[0u8; 3]; 16];
        for i in 0..16 {
            let (x, y) = (i / 4, i % 4);
            let second = if flip { y >= 2 } else { x >= 2 };
            let (base, t) = if second { (base1, t1) } else { (base0, t0) };
            let mags = MODIFIER_TABLES[t];
            let mods = [mags[0], mags[1], -mags[0], -mags[1]];
            let code = (((word >> (16 + i)) & 1) << 1 | ((word >> i) & 1)) as usize;
            for c in 0..3 {
                out[i][c] = clamp8(base[c] + mods[code]) as u8;
            }
        }
        out
    }

    #[test]
    fn test_output_sizes() {
        let tile = solid_tile([40, 80, 120, 255]);
        let mut opaque = Vec::new();
        etc1_compress_tile(&tile, 8 * 4, false, &mut opaque);
        assert_eq!(opaque.len(), 32);

        let mut alpha = Vec::new();
        etc1_compress_tile(&tile, 8 * 4, true, &mut alpha);
        assert_eq!(alpha.len(), 64);
    }

    #[test]
    fn test_level_size() {
        assert_eq!(etc1_level_size(64, 64, false), 64 * 64 / 2);
        assert_eq!(etc1_level_size(64, 64, true), 64 * 64);
    }

    #[test]
    fn test_solid_color_reconstructs_closely() {
        let tile = solid_tile([200, 100, 50, 255]);
        let mut out = Vec::new();
        etc1_compress_tile(&tile, 8 * 4, false, &mut out);
        for block in out.chunks_exact(8) {
            for px in decode_block(block) {
                assert!((px[0] as i32 - 200).abs() <= 8, "r {}", px[0]);
                assert!((px[1] as i32 - 100).abs() <= 8, "g {}", px[1]);
                assert!((px[2] as i32 - 50).abs() <= 8, "b {}", px[2]);
            }
        }
    }

    #[test]
    fn test_alpha_block_precedes_color() {
        // fully transparent pixels: alpha nibbles all zero, color blocks
        // still present
        let tile = solid_tile([10, 20, 30, 0]);
        let mut out = Vec::new();
        etc1_compress_tile(&tile, 8 * 4, true, &mut out);
        for sub in out.chunks_exact(16) {
            assert_eq!(&sub[0..8], &[0u8; 8]);
            assert_ne!(&sub[8..16], &[0u8; 8]);
        }
    }

    #[test]
    fn test_alpha_nibble_placement() {
        // opaque tile except one pixel; find its nibble in the alpha block.
        // Tile rows are read bottom-up, so memory row 7 is sub-block row 0
        // of the first (j=0) sub-block pair.
        let mut tile = solid_tile([0, 0, 0, 255]);
        // pixel at tile memory row 7, column 1 -> sub-block (i=0, j=0),
        // x=1, y=0 -> alpha byte 2*1 + 0 = 2, low nibble
        tile[(7 * 8 + 1) * 4 + 3] = 0;
        let mut out = Vec::new();
        etc1_compress_tile(&tile, 8 * 4, true, &mut out);
        let alpha = &out[0..8];
        assert_eq!(alpha[2] & 0x0F, 0);
        assert_eq!(alpha[2] & 0xF0, 0xF0);
        for (i, &b) in alpha.iter().enumerate() {
            if i != 2 {
                assert_eq!(b, 0xFF);
            }
        }
    }

    #[test]
    fn test_alpha_nibble_odd_row_high() {
        let mut tile = solid_tile([0, 0, 0, 255]);
        // pixel at sub-block x=3, y=1 of the first sub-block: memory row
        // 7 - 1 = 6, column 3 -> byte 2*3 + 0 = 6, high nibble
        tile[(6 * 8 + 3) * 4 + 3] = 0;
        let mut out = Vec::new();
        etc1_compress_tile(&tile, 8 * 4, true, &mut out);
        let alpha = &out[0..8];
        assert_eq!(alpha[6] & 0xF0, 0);
        assert_eq!(alpha[6] & 0x0F, 0x0F);
    }

    #[test]
    fn test_two_tone_split_uses_both_bases() {
        // left half dark, right half bright; whichever flip the encoder
        // picks, decoded pixels must track their side
        let mut tile = Vec::new();
        for _y in 0..8 {
            for x in 0..8 {
                if x < 4 {
                    tile.extend_from_slice(&[10, 10, 10, 255]);
                } else {
                    tile.extend_from_slice(&[240, 240, 240, 255]);
                }
            }
        }
        let mut out = Vec::new();
        etc1_compress_tile(&tile, 8 * 4, false, &mut out);
        // first sub-block covers tile columns 0..4: uniformly dark
        let px = decode_block(&out[0..8]);
        for p in px {
            assert!(p[0] < 60, "dark sub-block decoded bright: {}", p[0]);
        }
    }

    #[test]
    fn test_deterministic() {
        let tile: Vec<u8> = (0..8 * 8 * 4).map(|i| (i * 13 + 5) as u8).collect();
        let mut a = Vec::new();
        let mut b = Vec::new();
        etc1_compress_tile(&tile, 8 * 4, true, &mut a);
        etc1_compress_tile(&tile, 8 * 4, true, &mut b);
        assert_eq!(a, b);
    }
}
