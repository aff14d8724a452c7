//! H.264/AVC DPB manager.
//!
//! The manager owns the encoder-side model of the decoder's reference buffer.
//! For every picture in encode order it:
//! - Assigns frame_num and POC
//! - Derives PicNum for every reference (8.2.4.1)
//! - Builds List0/List1 and the modification ops reaching the requested lists
//! - Chooses sliding-window or adaptive (MMCO) marking
//! - Applies the marking and inserts the picture (8.2.5)

use std::cmp::Reverse;

use arrayvec::ArrayVec;
use tracing::debug;

use super::entry::DpbEntry;
use super::reference_lists::H264ReferenceListBuilder;
use super::types::{DecRefPicMarking, DpbConfig, DpbSnapshot, MmcoOperation, RefList, RefLists};
use super::MAX_DPB_SIZE;
use crate::encoder::gop::GopFrameType;
use crate::encoder::task::Task;

/// Picture order count of one field.
///
/// `2 * ((display_order - idr_display_order) mod 2^31)`, plus one for the field
/// coded second.
pub fn picture_order_count(
    display_order: u32,
    idr_display_order: u32,
    parity: usize,
    first_field: usize,
) -> i32 {
    let frame_order = display_order.wrapping_sub(idr_display_order) & 0x7fff_ffff;
    (frame_order as i32).wrapping_mul(2) + i32::from(parity != first_field)
}

/// Effect of one picture on the DPB.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DpbChange {
    /// Reconstruction surfaces of pictures that left the DPB.
    pub evicted: ArrayVec<u8, MAX_DPB_SIZE>,
    /// Reconstruction surface of the inserted picture.
    pub inserted: Option<u8>,
    /// Long-term index given to the inserted picture.
    pub long_term_idx: Option<u8>,
}

/// H.264 DPB manager.
#[derive(Debug)]
pub struct DpbManager {
    config: DpbConfig,
    entries: DpbSnapshot,
    /// frame_num of the next picture.
    frame_num: u32,
    idr_display_order: u32,
    max_long_term_frame_idx_plus1: u32,
    encode_count: u32,
}

impl DpbManager {
    /// Create an empty DPB.
    pub fn new(config: DpbConfig) -> Self {
        let config = DpbConfig {
            capacity: config.capacity.clamp(1, MAX_DPB_SIZE),
            max_frame_num: config.max_frame_num.max(16),
            ..config
        };
        Self {
            config,
            entries: DpbSnapshot::new(),
            frame_num: 0,
            idr_display_order: 0,
            max_long_term_frame_idx_plus1: 0,
            encode_count: 0,
        }
    }

    /// Drop every reference and restart the sequence state.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.frame_num = 0;
        self.idr_display_order = 0;
        self.max_long_term_frame_idx_plus1 = 0;
        self.encode_count = 0;
    }

    /// Current references.
    pub fn entries(&self) -> &[DpbEntry] {
        &self.entries
    }

    /// Maximum number of reference frames.
    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Configuration in use.
    pub fn config(&self) -> &DpbConfig {
        &self.config
    }

    /// frame_num the next picture will get.
    pub fn frame_num(&self) -> u32 {
        self.frame_num
    }

    /// Display order of the last IDR.
    pub fn idr_display_order(&self) -> u32 {
        self.idr_display_order
    }

    /// Number of pictures configured since the last reset.
    pub fn encode_count(&self) -> u32 {
        self.encode_count
    }

    /// Prepare a task for submission and update the DPB with its marking.
    ///
    /// Fills frame_num, POC, the DPB snapshots, reference lists and marking.
    /// Must be called once per task, in encode order.
    pub fn configure_task(&mut self, task: &mut Task) -> DpbChange {
        if task.is_idr() {
            self.frame_num = 0;
            self.idr_display_order = task.display_order;
        }

        task.frame_num = self.frame_num;
        let first_field = task.first_field();
        for parity in 0..2 {
            task.poc.set(
                parity,
                picture_order_count(
                    task.display_order,
                    task.idr_display_order,
                    parity,
                    first_field,
                ),
            );
        }

        self.refresh_pic_nums(task.frame_num);
        task.dpb_before = self.entries.clone();
        task.ref_lists = self.build_ref_lists(task);
        task.marking = self.mark_references(task);

        let change = self.update_dpb(task, self.config.capacity);
        task.long_term_idx = change.long_term_idx;
        task.dpb_after = self.entries.clone();
        task.configured = true;
        self.encode_count += 1;

        debug!(
            "DPB configured display_order={} frame_num={} poc={:?} refs={} evicted={:?}",
            task.display_order,
            task.frame_num,
            task.poc,
            self.entries.len(),
            change.evicted
        );

        change
    }

    /// Derive FrameNumWrap of every reference relative to `frame_num` (8-27).
    pub fn refresh_pic_nums(&mut self, frame_num: u32) {
        let max_frame_num = self.config.max_frame_num as i32;
        for entry in &mut self.entries {
            entry.frame_num_wrap = if entry.frame_num > frame_num {
                entry.frame_num as i32 - max_frame_num
            } else {
                entry.frame_num as i32
            };
        }
    }

    /// Build the reference lists of a picture against the current DPB.
    ///
    /// Lists hold indices into the current entries, which become the task's
    /// `dpb_before` snapshot.
    pub fn build_ref_lists(&self, task: &Task) -> RefLists {
        let mut lists = RefLists::default();
        let curr_pic_num = task.frame_num as i32;

        match task.first_type() {
            GopFrameType::Idr | GopFrameType::I => {}
            GopFrameType::P => {
                let default = H264ReferenceListBuilder::init_ref_list_p_frame(&self.entries);
                lists.list0 = self.requested_list(task, &default, self.config.num_ref_active_p);
                lists.mods0 = H264ReferenceListBuilder::create_modifications(
                    &self.entries,
                    &default,
                    &lists.list0,
                    curr_pic_num,
                );
            }
            GopFrameType::B => {
                let current_poc = task.poc.top.min(task.poc.bottom);
                let (default0, default1) =
                    H264ReferenceListBuilder::init_ref_lists_b_frame(&self.entries, current_poc);
                lists.list0 =
                    self.requested_list(task, &default0, self.config.num_ref_active_bl0);
                lists.list1 =
                    self.requested_list(task, &default1, self.config.num_ref_active_bl1);
                lists.mods0 = H264ReferenceListBuilder::create_modifications(
                    &self.entries,
                    &default0,
                    &lists.list0,
                    curr_pic_num,
                );
                lists.mods1 = H264ReferenceListBuilder::create_modifications(
                    &self.entries,
                    &default1,
                    &lists.list1,
                    curr_pic_num,
                );
            }
        }

        lists
    }

    /// Default list filtered by the caller's control and the temporal layer,
    /// preferred references first, truncated to the active count.
    fn requested_list(&self, task: &Task, default: &[u8], num_active: usize) -> RefList {
        let control = &task.ref_control;
        let mut list: RefList = default
            .iter()
            .copied()
            .filter(|&i| {
                let entry = &self.entries[i as usize];
                !control.rejected.contains(&entry.display_order)
                    && entry.temporal_id <= task.temporal_id
            })
            .collect();

        let mut front = 0;
        for &wanted in &control.preferred {
            let Some(pos) = list
                .iter()
                .position(|&i| self.entries[i as usize].display_order == wanted)
            else {
                continue;
            };
            if pos >= front {
                let idx = list.remove(pos);
                list.insert(front, idx);
                front += 1;
            }
        }

        list.truncate(num_active.max(1));
        if list.is_empty() {
            // Everything was rejected; keep the closest reference of a usable layer.
            if let Some(&first) = default
                .iter()
                .find(|&&i| self.entries[i as usize].temporal_id <= task.temporal_id)
            {
                list.push(first);
            }
        }
        list
    }

    /// Choose the dec_ref_pic_marking for a picture about to be encoded.
    ///
    /// Sliding window is used when it evicts the same picture the priority
    /// order would; otherwise explicit MMCOs are emitted. Eviction priority is
    /// non-key short-term references from the highest temporal layer down, by
    /// ascending FrameNumWrap within a layer, then key short-term references,
    /// then long-term references.
    pub fn mark_references(&self, task: &Task) -> DecRefPicMarking {
        let mut marking = DecRefPicMarking::default();
        if !task.is_reference() {
            return marking;
        }

        let control = &task.ref_control;
        let per_layer = self.config.long_term_per_layer;

        if task.is_idr() {
            marking.long_term_reference_flag = control.mark_current_long_term && per_layer > 0;
            return marking;
        }

        let curr_pic_num = task.frame_num as i32;
        let mut working = self.entries.clone();
        let mut max_plus1 = self.max_long_term_frame_idx_plus1;
        let mut ops: ArrayVec<MmcoOperation, { super::MAX_MMCO_OPS }> = ArrayVec::new();

        for &rejected in &control.rejected {
            let Some(entry) = working
                .iter_mut()
                .find(|e| e.is_reference() && e.display_order == rejected)
            else {
                continue;
            };
            let op = Self::unmark_op(entry, curr_pic_num);
            entry.mark_unused();
            if ops.try_push(op).is_err() {
                break;
            }
        }

        for &promoted in &control.long_term {
            let Some(pos) = working
                .iter()
                .position(|e| e.is_short_term() && e.display_order == promoted)
            else {
                continue;
            };
            let Some(idx) = self.long_term_slot(&working, working[pos].temporal_id) else {
                continue;
            };
            // MMCO 4 and MMCO 3 go in together or not at all.
            let raise = idx >= max_plus1;
            if ops.remaining_capacity() < 1 + usize::from(raise) {
                break;
            }
            if raise {
                max_plus1 = self.config.long_term_capacity();
                ops.push(MmcoOperation::SetMaxLongTermIndex {
                    max_long_term_frame_idx_plus1: max_plus1,
                });
            }
            let difference = (curr_pic_num - working[pos].pic_num() - 1) as u32;
            ops.push(MmcoOperation::MarkLongTerm {
                difference_of_pic_nums_minus1: difference,
                long_term_frame_idx: idx,
            });
            for entry in working.iter_mut() {
                if entry.long_term_idx == Some(idx as u8) {
                    entry.mark_unused();
                }
            }
            working[pos].mark_long_term(idx as u8);
        }

        if control.mark_current_long_term && per_layer > 0 {
            if let Some(idx) = self.long_term_slot(&working, task.temporal_id) {
                let raise = idx >= max_plus1;
                if ops.remaining_capacity() >= 1 + usize::from(raise) {
                    if raise {
                        max_plus1 = self.config.long_term_capacity();
                        ops.push(MmcoOperation::SetMaxLongTermIndex {
                            max_long_term_frame_idx_plus1: max_plus1,
                        });
                    }
                    for entry in working.iter_mut() {
                        if entry.long_term_idx == Some(idx as u8) {
                            entry.mark_unused();
                        }
                    }
                    ops.push(MmcoOperation::MarkCurrentAsLongTerm {
                        long_term_frame_idx: idx,
                    });
                }
            }
        }

        let references = working.iter().filter(|e| e.is_reference()).count();
        let excess = (references + 1).saturating_sub(self.config.capacity);
        if excess > 0 {
            let sliding = Self::sliding_window_victim(&working);
            let priority = Self::priority_victim(&working);
            if ops.is_empty() && excess == 1 && sliding.is_some() && sliding == priority {
                debug!(
                    "Sliding window evicts display_order={}",
                    working[sliding.unwrap_or_default()].display_order
                );
            } else {
                for _ in 0..excess {
                    let Some(victim) = Self::priority_victim(&working) else {
                        break;
                    };
                    let op = Self::unmark_op(&working[victim], curr_pic_num);
                    working[victim].mark_unused();
                    if ops.try_push(op).is_err() {
                        break;
                    }
                }
            }
        }

        marking.adaptive = !ops.is_empty();
        marking.ops = ops;
        if marking.adaptive {
            debug!(
                "MMCO for display_order={} frame_num={}: {:?}",
                task.display_order, task.frame_num, marking.ops
            );
        }
        marking
    }

    fn unmark_op(entry: &DpbEntry, curr_pic_num: i32) -> MmcoOperation {
        if entry.is_long_term() {
            MmcoOperation::UnmarkLongTerm {
                long_term_pic_num: entry.long_term_pic_num() as u32,
            }
        } else {
            MmcoOperation::UnmarkShortTerm {
                difference_of_pic_nums_minus1: (curr_pic_num - entry.pic_num() - 1) as u32,
            }
        }
    }

    /// Long-term index for a picture of temporal layer `temporal_id`.
    ///
    /// Each layer owns `long_term_per_layer` consecutive indices. A free index
    /// is preferred; otherwise the oldest long-term picture of the layer is
    /// replaced.
    fn long_term_slot(&self, entries: &[DpbEntry], temporal_id: u8) -> Option<u32> {
        let per_layer = self.config.long_term_per_layer;
        if per_layer == 0 {
            return None;
        }
        let layer = u32::from(temporal_id).min(self.config.temporal_layers.max(1) - 1);
        let range = layer * per_layer..(layer + 1) * per_layer;

        let used = |idx: u32| {
            entries
                .iter()
                .any(|e| e.is_long_term() && e.long_term_idx == Some(idx as u8))
        };
        if let Some(free) = range.clone().find(|&idx| !used(idx)) {
            return Some(free);
        }
        entries
            .iter()
            .filter(|e| {
                e.is_long_term()
                    && e.long_term_idx
                        .is_some_and(|idx| range.contains(&u32::from(idx)))
            })
            .min_by_key(|e| e.display_order)
            .and_then(|e| e.long_term_idx)
            .map(u32::from)
    }

    /// Short-term reference with the smallest FrameNumWrap (8.2.5.3).
    fn sliding_window_victim(entries: &[DpbEntry]) -> Option<usize> {
        entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_short_term())
            .min_by_key(|(_, e)| e.frame_num_wrap)
            .map(|(i, _)| i)
    }

    fn priority_victim(entries: &[DpbEntry]) -> Option<usize> {
        let short_term = entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_short_term())
            .min_by_key(|(_, e)| (e.key_reference, Reverse(e.temporal_id), e.frame_num_wrap))
            .map(|(i, _)| i);
        short_term.or_else(|| {
            entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_long_term())
                .min_by_key(|(_, e)| (Reverse(e.temporal_id), e.display_order))
                .map(|(i, _)| i)
        })
    }

    /// Apply a picture's marking and insert it (8.2.5).
    ///
    /// Afterwards at most `capacity` references remain.
    pub fn update_dpb(&mut self, task: &Task, capacity: usize) -> DpbChange {
        let mut change = DpbChange::default();
        let capacity = capacity.clamp(1, MAX_DPB_SIZE);
        let mut current_frame_num = task.frame_num;
        let mut current_long_term = None;

        self.refresh_pic_nums(task.frame_num);

        if task.is_idr() {
            for entry in &mut self.entries {
                entry.mark_unused();
            }
            if task.marking.long_term_reference_flag {
                self.max_long_term_frame_idx_plus1 = 1;
                current_long_term = Some(0);
            } else {
                self.max_long_term_frame_idx_plus1 = 0;
            }
        } else if task.is_reference() {
            if task.marking.adaptive {
                let (reset, long_term) = self.execute_mmco(&task.marking.ops, task.frame_num as i32);
                current_long_term = long_term;
                if reset {
                    current_frame_num = 0;
                }
            } else {
                self.sliding_window(capacity);
            }
        }

        if task.is_reference() {
            // Guard against markings that leave no room for the current picture.
            while self.entries.iter().filter(|e| e.is_reference()).count() >= capacity {
                let Some(victim) = Self::priority_victim(&self.entries) else {
                    break;
                };
                debug!(
                    "DPB over capacity, dropping display_order={}",
                    self.entries[victim].display_order
                );
                self.entries[victim].mark_unused();
            }
        }

        for entry in self.entries.iter().filter(|e| !e.is_reference()) {
            if let Some(recon) = entry.recon {
                change.evicted.push(recon);
            }
        }
        self.entries.retain(|e| e.is_reference());

        if task.is_reference() {
            let mut entry = DpbEntry::from_task(task);
            entry.frame_num = current_frame_num;
            entry.frame_num_wrap = current_frame_num as i32;
            if let Some(idx) = current_long_term {
                entry.mark_long_term(idx);
            }
            self.entries.push(entry);
            change.inserted = entry.recon;
            change.long_term_idx = current_long_term;
            self.frame_num = (current_frame_num + 1) % self.config.max_frame_num;
        }

        debug_assert!(self.entries.len() <= capacity);
        change
    }

    /// Sliding window marking: drop the oldest short-term reference when the
    /// buffer is full.
    fn sliding_window(&mut self, capacity: usize) {
        let references = self.entries.iter().filter(|e| e.is_reference()).count();
        if references >= capacity {
            if let Some(victim) = Self::sliding_window_victim(&self.entries) {
                self.entries[victim].mark_unused();
            }
        }
    }

    /// Execute Memory Management Control Operations (8.2.5.4).
    ///
    /// Returns whether an MMCO 5 was executed and the long-term index given to
    /// the current picture.
    fn execute_mmco(&mut self, operations: &[MmcoOperation], curr_pic_num: i32) -> (bool, Option<u8>) {
        let mut reset = false;
        let mut current_long_term = None;

        for op in operations {
            match *op {
                MmcoOperation::UnmarkShortTerm {
                    difference_of_pic_nums_minus1,
                } => {
                    // (8-39) picNumX
                    let pic_num_x = curr_pic_num - (difference_of_pic_nums_minus1 as i32 + 1);
                    for entry in &mut self.entries {
                        if entry.is_short_term() && entry.pic_num() == pic_num_x {
                            entry.mark_unused();
                        }
                    }
                }

                MmcoOperation::UnmarkLongTerm { long_term_pic_num } => {
                    for entry in &mut self.entries {
                        if entry.is_long_term() && entry.long_term_pic_num() == long_term_pic_num as i32 {
                            entry.mark_unused();
                        }
                    }
                }

                MmcoOperation::MarkLongTerm {
                    difference_of_pic_nums_minus1,
                    long_term_frame_idx,
                } => {
                    let pic_num_x = curr_pic_num - (difference_of_pic_nums_minus1 as i32 + 1);

                    // Any picture already holding the index loses it.
                    for entry in &mut self.entries {
                        if entry.is_long_term() && entry.long_term_idx == Some(long_term_frame_idx as u8) {
                            entry.mark_unused();
                        }
                    }
                    for entry in &mut self.entries {
                        if entry.is_short_term() && entry.pic_num() == pic_num_x {
                            entry.mark_long_term(long_term_frame_idx as u8);
                        }
                    }
                }

                MmcoOperation::SetMaxLongTermIndex {
                    max_long_term_frame_idx_plus1,
                } => {
                    self.max_long_term_frame_idx_plus1 = max_long_term_frame_idx_plus1;
                    for entry in &mut self.entries {
                        if entry.is_long_term()
                            && entry
                                .long_term_idx
                                .is_some_and(|idx| u32::from(idx) >= max_long_term_frame_idx_plus1)
                        {
                            entry.mark_unused();
                        }
                    }
                }

                MmcoOperation::UnmarkAll => {
                    for entry in &mut self.entries {
                        entry.mark_unused();
                    }
                    self.max_long_term_frame_idx_plus1 = 0;
                    reset = true;
                }

                MmcoOperation::MarkCurrentAsLongTerm { long_term_frame_idx } => {
                    for entry in &mut self.entries {
                        if entry.is_long_term() && entry.long_term_idx == Some(long_term_frame_idx as u8) {
                            entry.mark_unused();
                        }
                    }
                    current_long_term = Some(long_term_frame_idx as u8);
                }
            }
        }

        (reset, current_long_term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::task::FieldPair;

    fn task(display_order: u32, frame_type: GopFrameType, reference: bool) -> Task {
        let mut task = Task::new(display_order as usize);
        task.display_order = display_order;
        task.frame_type = FieldPair::splat(frame_type);
        task.reference = FieldPair::splat(reference);
        task.recon = Some(display_order as u8);
        task
    }

    fn manager(capacity: usize) -> DpbManager {
        DpbManager::new(DpbConfig {
            capacity,
            num_ref_active_p: 4,
            num_ref_active_bl0: 4,
            num_ref_active_bl1: 4,
            ..Default::default()
        })
    }

    fn display_orders(dpb: &[DpbEntry], list: &[u8]) -> Vec<u32> {
        list.iter().map(|&i| dpb[i as usize].display_order).collect()
    }

    fn assert_long_term_distinct(dpb: &DpbManager) {
        let mut seen = Vec::new();
        for entry in dpb.entries().iter().filter(|e| e.is_long_term()) {
            let idx = entry.long_term_idx.unwrap();
            assert!(!seen.contains(&idx), "duplicate long-term index {idx}");
            seen.push(idx);
        }
    }

    #[test]
    fn test_picture_order_count() {
        assert_eq!(picture_order_count(10, 4, 0, 0), 12);
        assert_eq!(picture_order_count(10, 4, 1, 0), 13);
        // Bottom field first: the bottom field carries the even POC.
        assert_eq!(picture_order_count(10, 4, 1, 1), 12);
        assert_eq!(picture_order_count(10, 4, 0, 1), 13);
        assert_eq!(picture_order_count(5, u32::MAX, 0, 0), 12);
    }

    #[test]
    fn test_capacity_two_evicts_oldest() {
        let mut dpb = manager(2);
        let mut evicted = Vec::new();
        for (i, ty) in [GopFrameType::Idr, GopFrameType::P, GopFrameType::P]
            .into_iter()
            .enumerate()
        {
            let mut t = task(i as u32, ty, true);
            let change = dpb.configure_task(&mut t);
            assert!(!t.marking.adaptive);
            evicted.extend(change.evicted);
        }

        let remaining: Vec<u32> = dpb.entries().iter().map(|e| e.display_order).collect();
        assert_eq!(remaining, vec![1, 2]);
        assert_eq!(evicted, vec![0]);
    }

    #[test]
    fn test_key_reference_survives_eviction() {
        let mut dpb = manager(2);
        let mut idr = task(0, GopFrameType::Idr, true);
        idr.key_reference = true;
        dpb.configure_task(&mut idr);
        dpb.configure_task(&mut task(1, GopFrameType::P, true));

        let mut p2 = task(2, GopFrameType::P, true);
        let change = dpb.configure_task(&mut p2);

        assert!(p2.marking.adaptive);
        assert_eq!(
            p2.marking.ops.as_slice(),
            &[MmcoOperation::UnmarkShortTerm {
                difference_of_pic_nums_minus1: 0
            }]
        );
        assert_eq!(change.evicted.as_slice(), &[1]);
        let remaining: Vec<u32> = dpb.entries().iter().map(|e| e.display_order).collect();
        assert_eq!(remaining, vec![0, 2]);
    }

    #[test]
    fn test_idr_long_term_flag_and_replacement() {
        let mut dpb = DpbManager::new(DpbConfig {
            capacity: 3,
            long_term_per_layer: 1,
            ..Default::default()
        });
        let mut idr = task(0, GopFrameType::Idr, true);
        idr.ref_control.mark_current_long_term = true;
        dpb.configure_task(&mut idr);
        assert!(idr.marking.long_term_reference_flag);
        assert_eq!(idr.long_term_idx, Some(0));

        let mut p1 = task(1, GopFrameType::P, true);
        p1.ref_control.mark_current_long_term = true;
        dpb.configure_task(&mut p1);
        assert_eq!(
            p1.marking.ops.as_slice(),
            &[MmcoOperation::MarkCurrentAsLongTerm {
                long_term_frame_idx: 0
            }]
        );

        assert_eq!(dpb.entries().len(), 1);
        assert_eq!(dpb.entries()[0].display_order, 1);
        assert_eq!(dpb.entries()[0].long_term_idx, Some(0));
    }

    #[test]
    fn test_long_term_indices_per_layer() {
        let mut dpb = DpbManager::new(DpbConfig {
            capacity: 4,
            long_term_per_layer: 2,
            ..Default::default()
        });
        let mut idr = task(0, GopFrameType::Idr, true);
        idr.ref_control.mark_current_long_term = true;
        dpb.configure_task(&mut idr);

        let mut p1 = task(1, GopFrameType::P, true);
        p1.ref_control.mark_current_long_term = true;
        dpb.configure_task(&mut p1);
        assert_eq!(
            p1.marking.ops.as_slice(),
            &[
                MmcoOperation::SetMaxLongTermIndex {
                    max_long_term_frame_idx_plus1: 2
                },
                MmcoOperation::MarkCurrentAsLongTerm {
                    long_term_frame_idx: 1
                },
            ]
        );
        assert_long_term_distinct(&dpb);

        // Both indices in use: the oldest long-term picture is replaced.
        let mut p2 = task(2, GopFrameType::P, true);
        p2.ref_control.mark_current_long_term = true;
        dpb.configure_task(&mut p2);
        assert_eq!(p2.long_term_idx, Some(0));
        assert_long_term_distinct(&dpb);
        let long_term: Vec<u32> = dpb
            .entries()
            .iter()
            .filter(|e| e.is_long_term())
            .map(|e| e.display_order)
            .collect();
        assert_eq!(long_term, vec![1, 2]);
    }

    #[test]
    fn test_promote_and_reject() {
        let mut dpb = DpbManager::new(DpbConfig {
            capacity: 3,
            long_term_per_layer: 1,
            num_ref_active_p: 3,
            ..Default::default()
        });
        dpb.configure_task(&mut task(0, GopFrameType::Idr, true));
        dpb.configure_task(&mut task(1, GopFrameType::P, true));

        let mut p2 = task(2, GopFrameType::P, true);
        p2.ref_control.long_term.push(1);
        dpb.configure_task(&mut p2);
        assert_eq!(
            p2.marking.ops.as_slice(),
            &[
                MmcoOperation::SetMaxLongTermIndex {
                    max_long_term_frame_idx_plus1: 1
                },
                MmcoOperation::MarkLongTerm {
                    difference_of_pic_nums_minus1: 0,
                    long_term_frame_idx: 0
                },
            ]
        );

        // Short-term by descending PicNum, then long-term.
        let mut p3 = task(3, GopFrameType::P, true);
        dpb.configure_task(&mut p3);
        assert_eq!(
            display_orders(&p3.dpb_before, &p3.ref_lists.list0),
            vec![2, 0, 1]
        );

        // A rejected reference is neither used nor kept.
        let mut p4 = task(4, GopFrameType::P, true);
        p4.ref_control.rejected.push(3);
        dpb.configure_task(&mut p4);
        assert!(!display_orders(&p4.dpb_before, &p4.ref_lists.list0).contains(&3));
        assert!(p4.marking.ops.contains(&MmcoOperation::UnmarkShortTerm {
            difference_of_pic_nums_minus1: 0
        }));
        assert!(dpb.entries().iter().all(|e| e.display_order != 3));
    }

    #[test]
    fn test_preferred_reference_reorders_list() {
        let mut dpb = manager(4);
        dpb.configure_task(&mut task(0, GopFrameType::Idr, true));
        dpb.configure_task(&mut task(1, GopFrameType::P, true));
        dpb.configure_task(&mut task(2, GopFrameType::P, true));

        let mut p3 = task(3, GopFrameType::P, true);
        p3.ref_control.preferred.push(0);
        dpb.configure_task(&mut p3);

        let list0 = &p3.ref_lists.list0;
        assert_eq!(display_orders(&p3.dpb_before, list0), vec![0, 2, 1]);
        let default = H264ReferenceListBuilder::init_ref_list_p_frame(&p3.dpb_before);
        let rebuilt = H264ReferenceListBuilder::apply_modifications(
            &p3.dpb_before,
            &default,
            &p3.ref_lists.mods0,
            p3.frame_num as i32,
            dpb.config().max_frame_num as i32,
            list0.len(),
        )
        .unwrap();
        assert_eq!(&rebuilt, list0);
    }

    #[test]
    fn test_b_frame_lists_and_frame_num() {
        let mut dpb = manager(4);
        dpb.configure_task(&mut task(0, GopFrameType::Idr, true));
        dpb.configure_task(&mut task(4, GopFrameType::P, true));

        let mut b = task(2, GopFrameType::B, false);
        let change = dpb.configure_task(&mut b);

        assert_eq!(b.frame_num, 2);
        assert_eq!(b.poc.top, 4);
        assert_eq!(display_orders(&b.dpb_before, &b.ref_lists.list0)[0], 0);
        assert_eq!(display_orders(&b.dpb_before, &b.ref_lists.list1)[0], 4);
        assert!(change.evicted.is_empty());
        assert!(change.inserted.is_none());
        assert_eq!(dpb.entries().len(), 2);
        assert_eq!(dpb.frame_num(), 2);
    }

    #[test]
    fn test_temporal_layer_filtering() {
        let mut dpb = manager(4);
        dpb.configure_task(&mut task(0, GopFrameType::Idr, true));
        let mut p1 = task(1, GopFrameType::P, true);
        p1.temporal_id = 1;
        dpb.configure_task(&mut p1);

        let p2 = {
            let mut t = task(2, GopFrameType::P, true);
            dpb.configure_task(&mut t);
            t
        };
        assert_eq!(display_orders(&p2.dpb_before, &p2.ref_lists.list0), vec![0]);
    }

    #[test]
    fn test_base_layer_keeps_base_references() {
        let mut dpb = manager(2);
        let layer = |o: u32| match o % 4 {
            0 => 0,
            2 => 1,
            _ => 2,
        };
        for o in 0..24u32 {
            let ty = if o == 0 { GopFrameType::Idr } else { GopFrameType::P };
            let mut t = task(o, ty, layer(o) < 2);
            t.temporal_id = layer(o);
            let change = dpb.configure_task(&mut t);
            if o == 0 {
                continue;
            }

            assert!(!t.ref_lists.list0.is_empty(), "frame {o} has no reference");
            for &i in &t.ref_lists.list0 {
                let reference = &t.dpb_before[i as usize];
                assert!(
                    reference.temporal_id <= t.temporal_id,
                    "frame {o} (layer {}) references {} (layer {})",
                    t.temporal_id,
                    reference.display_order,
                    reference.temporal_id
                );
            }
            if o % 4 == 0 {
                // The window would drop the older base picture; the layer-1
                // picture goes instead.
                assert!(t.marking.adaptive);
                assert_eq!(change.evicted.as_slice(), &[(o - 2) as u8]);
            }
        }
    }

    #[test]
    fn test_rejected_fallback_stays_in_layer() {
        let mut dpb = manager(4);
        dpb.configure_task(&mut task(0, GopFrameType::Idr, true));
        let mut p1 = task(1, GopFrameType::P, true);
        p1.temporal_id = 1;
        dpb.configure_task(&mut p1);

        let mut p2 = task(2, GopFrameType::P, true);
        p2.ref_control.rejected.push(0);
        dpb.configure_task(&mut p2);
        let refs = display_orders(&p2.dpb_before, &p2.ref_lists.list0);
        assert_eq!(refs, vec![0]);
    }

    #[test]
    fn test_frame_num_wraps() {
        let mut dpb = DpbManager::new(DpbConfig {
            capacity: 2,
            max_frame_num: 16,
            ..Default::default()
        });
        for i in 0..40u32 {
            let ty = if i == 0 {
                GopFrameType::Idr
            } else {
                GopFrameType::P
            };
            let mut t = task(i, ty, true);
            dpb.configure_task(&mut t);
            assert_eq!(t.frame_num, i % 16);
            if i > 0 {
                assert_eq!(display_orders(&t.dpb_before, &t.ref_lists.list0)[0], i - 1);
                assert!(t.ref_lists.mods0.is_empty());
            }
        }
    }

    #[test]
    fn test_capacity_and_long_term_invariants() {
        for capacity in 1..=4 {
            for per_layer in 0..=1u32 {
                if per_layer as usize >= capacity {
                    continue;
                }
                let mut dpb = DpbManager::new(DpbConfig {
                    capacity,
                    long_term_per_layer: per_layer,
                    ..Default::default()
                });
                for i in 0..24u32 {
                    let ty = match i {
                        0 | 12 => GopFrameType::Idr,
                        _ => GopFrameType::P,
                    };
                    let mut t = task(i, ty, i % 3 != 2);
                    t.key_reference = i % 4 == 0;
                    t.ref_control.mark_current_long_term = i % 5 == 0;
                    dpb.configure_task(&mut t);

                    let references = dpb.entries().iter().filter(|e| e.is_reference()).count();
                    assert!(references <= capacity, "capacity {capacity} frame {i}");
                    assert_long_term_distinct(&dpb);
                }
            }
        }
    }
}
