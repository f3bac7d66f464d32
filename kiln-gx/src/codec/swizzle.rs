//! Linear <-> tiled texture address remapping.
//!
//! The GPU reads textures in fixed 8x8-pixel tiles whose interior follows a
//! Z-order-like pattern. Rather than computing the bit-interleaved address
//! per pixel, each tile is loaded into a 64-entry cache, permuted through a
//! fixed table of 4-cycles plus four pair swaps, and written out linearly.
//! The table is a hardware contract; do not touch it.
//!
//! Rows are addressed bottom-up (`height - 1 - y`): the hardware stores
//! textures vertically flipped relative to the engine's row-major images.

/// Swizzle 4-cycle table. Each entry rotates four cache slots; the cycles
/// and the pair swaps below together realize the tile's native ordering.
const SWIZZLE_TABLE: [[usize; 4]; 12] = [
    [2, 8, 16, 4],
    [3, 9, 17, 5],
    [6, 10, 24, 20],
    [7, 11, 25, 21],
    [14, 26, 28, 22],
    [15, 27, 29, 23],
    [34, 40, 48, 36],
    [35, 41, 49, 37],
    [38, 42, 56, 52],
    [39, 43, 57, 53],
    [46, 58, 60, 54],
    [47, 59, 61, 55],
];

/// Cache slots exchanged pairwise after the 4-cycles
const SWIZZLE_SWAPS: [[usize; 2]; 4] = [[12, 18], [13, 19], [44, 50], [45, 51]];

/// One texel, up to 4 bytes wide
type Texel = [u8; 4];

fn permute(cache: &mut [Texel; 64], reverse: bool) {
    if !reverse {
        for entry in &SWIZZLE_TABLE {
            let tmp = cache[entry[0]];
            cache[entry[0]] = cache[entry[1]];
            cache[entry[1]] = cache[entry[2]];
            cache[entry[2]] = cache[entry[3]];
            cache[entry[3]] = tmp;
        }
    } else {
        for entry in &SWIZZLE_TABLE {
            let tmp = cache[entry[3]];
            cache[entry[3]] = cache[entry[2]];
            cache[entry[2]] = cache[entry[1]];
            cache[entry[1]] = cache[entry[0]];
            cache[entry[0]] = tmp;
        }
    }
    for pair in &SWIZZLE_SWAPS {
        cache.swap(pair[0], pair[1]);
    }
}

/// Linear byte offset of cache slot `k` for the tile at (`x`, `y`)
#[inline]
fn linear_offset(x: usize, y: usize, k: usize, bpp: usize, stride: usize, height: usize) -> usize {
    (x + (k & 7)) * bpp + (height - 1 - y - (k >> 3)) * stride
}

/// Transform a linear row-major pixel buffer into the GPU's tiled order
/// (`reverse = false`) or back out of it (`reverse = true`).
///
/// `width` and `height` must be multiples of 8; `bpp` is the byte size of
/// one texel, at most 4.
pub fn cpu_swizzle(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    bpp: usize,
    reverse: bool,
) {
    assert!(width % 8 == 0 && height % 8 == 0);
    assert!(bpp >= 1 && bpp <= 4);
    let stride = width * bpp;
    let mut cache: [Texel; 64] = [[0; 4]; 64];
    let mut cursor = 0usize;

    for j in (0..height).step_by(8) {
        for i in (0..width).step_by(8) {
            if !reverse {
                for (k, slot) in cache.iter_mut().enumerate() {
                    let off = linear_offset(i, j, k, bpp, stride, height);
                    slot[..bpp].copy_from_slice(&src[off..off + bpp]);
                }
                permute(&mut cache, false);
                for slot in &cache {
                    dst[cursor..cursor + bpp].copy_from_slice(&slot[..bpp]);
                    cursor += bpp;
                }
            } else {
                // The inverse reads the tile stream linearly, undoes the
                // permutation and scatters back to row-major addresses.
                for slot in cache.iter_mut() {
                    slot[..bpp].copy_from_slice(&src[cursor..cursor + bpp]);
                    cursor += bpp;
                }
                permute(&mut cache, true);
                for (k, slot) in cache.iter().enumerate() {
                    let off = linear_offset(i, j, k, bpp, stride, height);
                    dst[off..off + bpp].copy_from_slice(&slot[..bpp]);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    fn roundtrip(width: usize, height: usize, bpp: usize) {
        let src = pattern(width * height * bpp);
        let mut tiled = vec![0u8; src.len()];
        let mut back = vec![0u8; src.len()];
        cpu_swizzle(&src, &mut tiled, width, height, bpp, false);
        cpu_swizzle(&tiled, &mut back, width, height, bpp, true);
        assert_eq!(back, src, "{}x{} bpp {}", width, height, bpp);
    }

    #[test]
    fn test_roundtrip_all_bpp() {
        for bpp in 1..=4 {
            roundtrip(8, 8, bpp);
            roundtrip(32, 16, bpp);
            roundtrip(16, 64, bpp);
        }
    }

    #[test]
    fn test_swizzle_actually_permutes() {
        let src = pattern(8 * 8 * 4);
        let mut tiled = vec![0u8; src.len()];
        cpu_swizzle(&src, &mut tiled, 8, 8, 4, false);
        assert_ne!(tiled, src);
    }

    #[test]
    fn test_swizzle_is_deterministic() {
        let src = pattern(16 * 8 * 2);
        let mut a = vec![0u8; src.len()];
        let mut b = vec![0u8; src.len()];
        cpu_swizzle(&src, &mut a, 16, 8, 2, false);
        cpu_swizzle(&src, &mut b, 16, 8, 2, false);
        assert_eq!(a, b);
    }

    #[test]
    fn test_table_slots_are_disjoint_from_swaps() {
        // the 4-cycles and the pair swaps must touch disjoint slots for the
        // permutation to be its own documented inverse
        for entry in &SWIZZLE_TABLE {
            for pair in &SWIZZLE_SWAPS {
                for s in entry {
                    assert!(!pair.contains(s));
                }
            }
        }
    }

    #[test]
    fn test_single_tile_preserves_multiset() {
        let src: Vec<u8> = (0..64).collect();
        let mut tiled = vec![0u8; 64];
        cpu_swizzle(&src, &mut tiled, 8, 8, 1, false);
        let mut sorted = tiled.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, src);
    }
}
