//! CPU-side texel codecs: tiled-address swizzling and ETC1 block
//! compression.
//!
//! Both are hardware contracts. The swizzle table is the GPU's native tile
//! addressing and must be reproduced bit-exact; the ETC1 output layout
//! (alpha nibble placement, block ordering, byte order) is what the texture
//! units decode.

pub mod etc1;
pub mod swizzle;
