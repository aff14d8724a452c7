//! DPB entry structures for individual pictures in the buffer.

use crate::encoder::task::{FieldPair, Task};

/// Reference marking state for a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MarkingState {
    /// Unused for reference.
    #[default]
    Unused,
    /// Used for short-term reference.
    ShortTerm,
    /// Used for long-term reference.
    LongTerm,
}

impl MarkingState {
    /// Returns true if this entry is used for reference.
    pub fn is_reference(&self) -> bool {
        !matches!(self, Self::Unused)
    }

    /// Returns true if this is a short-term reference.
    pub fn is_short_term(&self) -> bool {
        matches!(self, Self::ShortTerm)
    }

    /// Returns true if this is a long-term reference.
    pub fn is_long_term(&self) -> bool {
        matches!(self, Self::LongTerm)
    }
}

/// A single reference frame in the Decoded Picture Buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpbEntry {
    /// Reference marking.
    pub marking: MarkingState,
    /// Display order of the picture.
    pub display_order: u32,
    /// Picture order count per field.
    pub poc: FieldPair<i32>,
    /// Frame number (H.264 frame_num syntax element).
    pub frame_num: u32,
    /// FrameNumWrap relative to the picture being coded.
    pub frame_num_wrap: i32,
    /// Long-term frame index.
    pub long_term_idx: Option<u8>,
    /// Temporal layer ID.
    pub temporal_id: u8,
    /// Reconstruction surface holding the picture.
    pub recon: Option<u8>,
    /// Kept in the DPB as long as possible.
    pub key_reference: bool,
    /// Picture belongs to the temporal base layer.
    pub ref_base: bool,
}

impl DpbEntry {
    /// Create a short-term entry for a just-encoded picture.
    pub fn from_task(task: &Task) -> Self {
        Self {
            marking: MarkingState::ShortTerm,
            display_order: task.display_order,
            poc: task.poc,
            frame_num: task.frame_num,
            frame_num_wrap: task.frame_num as i32,
            long_term_idx: None,
            temporal_id: task.temporal_id,
            recon: task.recon,
            key_reference: task.key_reference,
            ref_base: task.temporal_id == 0,
        }
    }

    /// Picture order count of the frame.
    pub fn frame_poc(&self) -> i32 {
        self.poc.top.min(self.poc.bottom)
    }

    /// PicNum (frame coding: FrameNumWrap).
    pub fn pic_num(&self) -> i32 {
        self.frame_num_wrap
    }

    /// LongTermPicNum (frame coding: LongTermFrameIdx).
    pub fn long_term_pic_num(&self) -> i32 {
        self.long_term_idx.map_or(-1, i32::from)
    }

    /// Check if this entry is a reference picture.
    pub fn is_reference(&self) -> bool {
        self.marking.is_reference()
    }

    /// Check if this entry is a short-term reference.
    pub fn is_short_term(&self) -> bool {
        self.marking.is_short_term()
    }

    /// Check if this entry is a long-term reference.
    pub fn is_long_term(&self) -> bool {
        self.marking.is_long_term()
    }

    /// Mark as unused for reference.
    pub fn mark_unused(&mut self) {
        self.marking = MarkingState::Unused;
        self.long_term_idx = None;
    }

    /// Mark as short-term reference.
    pub fn mark_short_term(&mut self) {
        self.marking = MarkingState::ShortTerm;
        self.long_term_idx = None;
    }

    /// Mark as long-term reference.
    pub fn mark_long_term(&mut self, long_term_idx: u8) {
        self.marking = MarkingState::LongTerm;
        self.long_term_idx = Some(long_term_idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_from_task() {
        let mut task = Task::new(0);
        task.display_order = 9;
        task.frame_num = 3;
        task.poc = FieldPair::new(18, 19);
        task.recon = Some(2);
        let entry = DpbEntry::from_task(&task);

        assert!(entry.is_short_term());
        assert_eq!(entry.frame_poc(), 18);
        assert_eq!(entry.pic_num(), 3);
        assert_eq!(entry.recon, Some(2));
        assert!(entry.ref_base);
    }

    #[test]
    fn test_marking_state() {
        let mut entry = DpbEntry::from_task(&Task::new(0));

        assert!(entry.is_short_term());
        assert!(entry.is_reference());
        assert!(!entry.is_long_term());

        entry.mark_long_term(1);
        assert!(entry.is_long_term());
        assert!(entry.is_reference());
        assert!(!entry.is_short_term());
        assert_eq!(entry.long_term_pic_num(), 1);

        entry.mark_unused();
        assert!(!entry.is_reference());
        assert_eq!(entry.long_term_idx, None);
    }
}
