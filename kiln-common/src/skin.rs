//! Skins and animation hierarchies as read by backends.

use bitflags::bitflags;
use glam::Mat4;

/// Per-vertex skinning data plus the bind-pose inverses.
///
/// Weights and bone indices are stored four per vertex; unused influences
/// carry weight 0.
#[derive(Debug, Clone)]
pub struct Skin {
    pub num_bones: usize,
    /// Four weights per vertex
    pub weights: Vec<[f32; 4]>,
    /// Four bone indices per vertex
    pub indices: Vec<[u8; 4]>,
    /// One inverse bind matrix per bone
    pub inverse_matrices: Vec<Mat4>,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HierarchyFlags: u32 {
        /// Node matrices are parent-relative (already composed with the
        /// inverse of the owning atomic); otherwise they are world-space
        const LOCAL_SPACE_MATRICES = 0x1;
    }
}

/// An animation hierarchy reduced to what skinning needs: one matrix per
/// node, in the space the flags say.
#[derive(Debug, Clone)]
pub struct Hierarchy {
    pub flags: HierarchyFlags,
    pub matrices: Vec<Mat4>,
}

impl Hierarchy {
    pub fn num_nodes(&self) -> usize {
        self.matrices.len()
    }
}
