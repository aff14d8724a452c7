//! DPB types and configuration structures.

use arrayvec::ArrayVec;

use super::entry::DpbEntry;
use super::{MAX_DPB_SIZE, MAX_MMCO_OPS, MAX_REF_LIST_MODS, MAX_REF_LIST_SIZE};
use crate::encoder::EncodeConfig;

/// Copy of the DPB at one point in encode order.
pub type DpbSnapshot = ArrayVec<DpbEntry, MAX_DPB_SIZE>;

/// Reference list as indices into a DPB snapshot.
pub type RefList = ArrayVec<u8, MAX_REF_LIST_SIZE>;

/// Modification ops for one list.
pub type RefListMods = ArrayVec<RefListMod, MAX_REF_LIST_MODS>;

/// Configuration for DPB management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpbConfig {
    /// Maximum number of reference frames.
    pub capacity: usize,
    /// MaxFrameNum.
    pub max_frame_num: u32,
    /// Long-term slots per temporal layer.
    pub long_term_per_layer: u32,
    /// Number of temporal layers.
    pub temporal_layers: u32,
    /// Active references for P pictures.
    pub num_ref_active_p: usize,
    /// Active List0 references for B pictures.
    pub num_ref_active_bl0: usize,
    /// Active List1 references for B pictures.
    pub num_ref_active_bl1: usize,
}

impl Default for DpbConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            max_frame_num: 256,
            long_term_per_layer: 0,
            temporal_layers: 1,
            num_ref_active_p: 1,
            num_ref_active_bl0: 1,
            num_ref_active_bl1: 1,
        }
    }
}

impl DpbConfig {
    /// Derive DPB limits from a session configuration.
    pub fn from_config(config: &EncodeConfig) -> Self {
        Self {
            capacity: config.dpb_capacity().max(1) as usize,
            max_frame_num: config.max_frame_num(),
            long_term_per_layer: config.long_term_per_layer,
            temporal_layers: config.temporal_layers.max(1),
            num_ref_active_p: config.num_ref_active_p as usize,
            num_ref_active_bl0: config.num_ref_active_bl0 as usize,
            num_ref_active_bl1: config.num_ref_active_bl1 as usize,
        }
    }

    /// Total long-term slots.
    pub fn long_term_capacity(&self) -> u32 {
        self.long_term_per_layer * self.temporal_layers
    }
}

/// H.264 Memory Management Control Operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcoOperation {
    /// Mark short-term picture as unused for reference (1).
    UnmarkShortTerm {
        /// difference_of_pic_nums_minus1.
        difference_of_pic_nums_minus1: u32,
    },
    /// Mark long-term picture as unused for reference (2).
    UnmarkLongTerm {
        /// long_term_pic_num.
        long_term_pic_num: u32,
    },
    /// Assign long-term frame index to short-term reference (3).
    MarkLongTerm {
        /// difference_of_pic_nums_minus1.
        difference_of_pic_nums_minus1: u32,
        /// long_term_frame_idx.
        long_term_frame_idx: u32,
    },
    /// Set max long-term frame index (4).
    SetMaxLongTermIndex {
        /// max_long_term_frame_idx_plus1.
        max_long_term_frame_idx_plus1: u32,
    },
    /// Mark all reference pictures as unused (5).
    UnmarkAll,
    /// Mark current picture as long-term (6).
    MarkCurrentAsLongTerm {
        /// long_term_frame_idx.
        long_term_frame_idx: u32,
    },
}

impl MmcoOperation {
    /// memory_management_control_operation value.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::UnmarkShortTerm { .. } => 1,
            Self::UnmarkLongTerm { .. } => 2,
            Self::MarkLongTerm { .. } => 3,
            Self::SetMaxLongTermIndex { .. } => 4,
            Self::UnmarkAll => 5,
            Self::MarkCurrentAsLongTerm { .. } => 6,
        }
    }
}

/// dec_ref_pic_marking() content for one picture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecRefPicMarking {
    /// IDR only: mark the IDR as long-term with index 0.
    pub long_term_reference_flag: bool,
    /// adaptive_ref_pic_marking_mode_flag.
    pub adaptive: bool,
    /// MMCO ops in bitstream order.
    pub ops: ArrayVec<MmcoOperation, MAX_MMCO_OPS>,
}

/// H.264 reference picture list modification entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefListMod {
    /// Modification operation (0 = subtract, 1 = add, 2 = long-term).
    pub modification_of_pic_nums_idc: u8,
    /// abs_diff_pic_num_minus1 or long_term_pic_num.
    pub value: u32,
}

/// Reference lists of one picture and the ops that derive them from the default lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefLists {
    /// List0 (indices into the DPB snapshot).
    pub list0: RefList,
    /// List1 (B pictures only).
    pub list1: RefList,
    /// Modification ops for List0.
    pub mods0: RefListMods,
    /// Modification ops for List1.
    pub mods1: RefListMods,
}

/// Per-frame reference control supplied with the input.
///
/// All pictures are identified by display order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefListControl {
    /// References to place first, in this order.
    pub preferred: ArrayVec<u32, MAX_DPB_SIZE>,
    /// References that must not be used and are dropped from the DPB.
    pub rejected: ArrayVec<u32, MAX_DPB_SIZE>,
    /// Short-term references to turn into long-term references.
    pub long_term: ArrayVec<u32, MAX_DPB_SIZE>,
    /// Keep this picture as a long-term reference.
    pub mark_current_long_term: bool,
}

impl RefListControl {
    /// Whether the control requests anything.
    pub fn is_empty(&self) -> bool {
        self.preferred.is_empty()
            && self.rejected.is_empty()
            && self.long_term.is_empty()
            && !self.mark_current_long_term
    }

    /// Upper bound on the MMCOs a picture with this control can emit,
    /// including one sliding-window eviction.
    pub fn max_mmco_ops(&self) -> usize {
        let long_term = !self.long_term.is_empty() || self.mark_current_long_term;
        self.rejected.len()
            + self.long_term.len()
            + usize::from(long_term)
            + usize::from(self.mark_current_long_term)
            + 1
    }
}
