//! Reference picture list construction and modification.
//!
//! Lists hold indices into a DPB snapshot whose PicNums have already been
//! derived for the current picture.

use arrayvec::ArrayVec;

use super::entry::DpbEntry;
use super::types::{RefList, RefListMod, RefListMods};
use super::MAX_REF_LIST_SIZE;

/// Working list during modification; one slot longer than a list (8.2.4.3).
type WorkingList = ArrayVec<u8, { MAX_REF_LIST_SIZE + 1 }>;

/// Reference list builder for H.264.
pub struct H264ReferenceListBuilder;

impl H264ReferenceListBuilder {
    /// Initialize reference picture list for P-frames (L0 only).
    ///
    /// For P-frames, L0 is initialized with short-term references sorted by
    /// descending PicNum, followed by long-term references sorted by ascending
    /// LongTermPicNum.
    pub fn init_ref_list_p_frame(dpb: &[DpbEntry]) -> RefList {
        let mut short_term: RefList = Self::indices(dpb, DpbEntry::is_short_term);
        let mut long_term: RefList = Self::indices(dpb, DpbEntry::is_long_term);

        short_term.sort_by(|&a, &b| dpb[b as usize].pic_num().cmp(&dpb[a as usize].pic_num()));
        long_term.sort_by_key(|&i| dpb[i as usize].long_term_pic_num());

        short_term.into_iter().chain(long_term).collect()
    }

    /// Initialize reference picture lists for B-frames (L0 and L1).
    ///
    /// For B-frames:
    /// - L0: Short-term refs with POC < current sorted by descending POC,
    ///   then POC > current sorted by ascending POC, then long-term refs.
    /// - L1: Short-term refs with POC > current sorted by ascending POC,
    ///   then POC < current sorted by descending POC, then long-term refs.
    pub fn init_ref_lists_b_frame(dpb: &[DpbEntry], current_poc: i32) -> (RefList, RefList) {
        let mut before: RefList =
            Self::indices(dpb, |e| e.is_short_term() && e.frame_poc() < current_poc);
        let mut after: RefList =
            Self::indices(dpb, |e| e.is_short_term() && e.frame_poc() > current_poc);
        let mut long_term: RefList = Self::indices(dpb, DpbEntry::is_long_term);

        // Closest to current first.
        before.sort_by(|&a, &b| dpb[b as usize].frame_poc().cmp(&dpb[a as usize].frame_poc()));
        after.sort_by_key(|&i| dpb[i as usize].frame_poc());
        long_term.sort_by_key(|&i| dpb[i as usize].long_term_pic_num());

        let list0: RefList = before
            .iter()
            .chain(after.iter())
            .chain(long_term.iter())
            .copied()
            .collect();
        let mut list1: RefList = after
            .iter()
            .chain(before.iter())
            .chain(long_term.iter())
            .copied()
            .collect();

        // H.264 8.2.4.2.3: if L1 has more than one entry and equals L0, swap its first two.
        if list1.len() > 1 && list0 == list1 {
            list1.swap(0, 1);
        }

        (list0, list1)
    }

    fn indices(dpb: &[DpbEntry], keep: impl Fn(&DpbEntry) -> bool) -> RefList {
        dpb.iter()
            .enumerate()
            .filter(|(_, e)| keep(e))
            .map(|(i, _)| i as u8)
            .collect()
    }

    /// Create modification ops turning `default` into `requested`.
    ///
    /// Each op places one requested picture at the next index and removes its
    /// later duplicate; generation stops as soon as the working list starts
    /// with the requested list.
    pub fn create_modifications(
        dpb: &[DpbEntry],
        default: &[u8],
        requested: &[u8],
        curr_pic_num: i32,
    ) -> RefListMods {
        let mut mods = RefListMods::new();
        let mut working: WorkingList = default.iter().copied().collect();
        let mut pred = curr_pic_num;

        for (ref_idx, &wanted) in requested.iter().enumerate() {
            if working.starts_with(requested) {
                break;
            }
            let entry = &dpb[wanted as usize];
            let op = if entry.is_long_term() {
                RefListMod {
                    modification_of_pic_nums_idc: 2,
                    value: entry.long_term_pic_num() as u32,
                }
            } else {
                let diff = entry.pic_num() - pred;
                pred = entry.pic_num();
                if diff < 0 {
                    RefListMod {
                        modification_of_pic_nums_idc: 0,
                        value: (-diff - 1) as u32,
                    }
                } else {
                    RefListMod {
                        modification_of_pic_nums_idc: 1,
                        value: (diff - 1) as u32,
                    }
                }
            };
            if mods.try_push(op).is_err() {
                break;
            }
            Self::place(&mut working, ref_idx, wanted);
        }

        mods
    }

    /// Apply modification ops to a default list (H.264 8.2.4.3).
    ///
    /// Returns `None` when an op names a picture that is not in the DPB.
    pub fn apply_modifications(
        dpb: &[DpbEntry],
        default: &[u8],
        mods: &[RefListMod],
        curr_pic_num: i32,
        max_pic_num: i32,
        num_active: usize,
    ) -> Option<RefList> {
        let mut list: WorkingList = default.iter().copied().collect();
        let mut pred = curr_pic_num;

        for (ref_idx, m) in mods.iter().enumerate() {
            let target = match m.modification_of_pic_nums_idc {
                idc @ (0 | 1) => {
                    let abs_diff = m.value as i32 + 1;
                    // (8-34), (8-35)
                    let no_wrap = if idc == 0 {
                        let v = pred - abs_diff;
                        if v < 0 {
                            v + max_pic_num
                        } else {
                            v
                        }
                    } else {
                        let v = pred + abs_diff;
                        if v >= max_pic_num {
                            v - max_pic_num
                        } else {
                            v
                        }
                    };
                    pred = no_wrap;
                    // (8-36)
                    let pic_num = if no_wrap > curr_pic_num {
                        no_wrap - max_pic_num
                    } else {
                        no_wrap
                    };
                    dpb.iter()
                        .position(|e| e.is_short_term() && e.pic_num() == pic_num)?
                }
                2 => dpb
                    .iter()
                    .position(|e| e.is_long_term() && e.long_term_pic_num() == m.value as i32)?,
                _ => return None,
            };
            if ref_idx > list.len() || (list.is_full() && !list.contains(&(target as u8))) {
                return None;
            }
            Self::place(&mut list, ref_idx, target as u8);
        }

        list.truncate(num_active);
        Some(list.into_iter().collect())
    }

    /// Insert `wanted` at `ref_idx` and remove its later occurrence.
    fn place(list: &mut WorkingList, ref_idx: usize, wanted: u8) {
        if let Some(pos) = list.iter().skip(ref_idx).position(|&i| i == wanted) {
            list.remove(ref_idx + pos);
        }
        list.insert(ref_idx.min(list.len()), wanted);
    }
}
