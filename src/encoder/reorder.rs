//! Encode-order selection.
//!
//! Frames arrive in display order but must be encoded in an order where every
//! picture is encoded after the pictures it references. For example, with one
//! B-frame between P-frames:
//! - Display order: I(0), B(1), P(2), B(3), P(4), ...
//! - Encode order:  I(0), P(2), B(1), P(4), B(3), ...
//!
//! The engine picks one task at a time from the reordering queue. Structural
//! dependencies come from the GOP layout stamped on each task.

use tracing::debug;

use super::gop::GopFrameType;
use super::task::{TaskId, TaskPool};

/// Flags that change eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReorderFlags {
    /// Follow the canonical GOP encode order and never change frame types.
    pub gop_strict: bool,
    /// End of stream: no more input will arrive.
    pub flush: bool,
    /// Close the current GOP at detected scene changes.
    pub close_gop_for_scene_change: bool,
}

/// Encode-order selection state.
#[derive(Debug, Default)]
pub struct ReorderEngine {
    next_encode_order: u32,
    /// Scene cut whose open mini-GOPs have not been closed yet.
    pending_cut: Option<u32>,
    /// The pending cut is an IDR requested by the caller.
    forced_cut: bool,
}

impl ReorderEngine {
    /// Create an engine starting at encode order 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart encode order numbering.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Encode order the next selected task gets.
    pub fn next_encode_order(&self) -> u32 {
        self.next_encode_order
    }

    /// Report a scene change at `display_order`.
    ///
    /// B frames before the cut that reference a picture at or after it are
    /// re-bound on the next selection.
    pub fn signal_scene_change(&mut self, display_order: u32) {
        self.pending_cut = Some(
            self.pending_cut
                .map_or(display_order, |cut| cut.min(display_order)),
        );
    }

    /// Report a caller-requested IDR at `display_order`.
    ///
    /// Unlike a detected scene change, straddling mini-GOPs are closed even in
    /// strict mode, otherwise the IDR could never be selected.
    pub fn force_cut(&mut self, display_order: u32) {
        self.signal_scene_change(display_order);
        self.forced_cut = true;
    }

    /// Pick the next task to encode and assign its encode order.
    ///
    /// `pending` is the reordering queue, `upstream` holds tasks still in the
    /// analysis stages and `arrived` is the number of frames accepted so far.
    /// Returns `None` when nothing is eligible right now; the caller tells
    /// "not yet" from "never" by the size of `pending`.
    pub fn select_next_to_encode(
        &mut self,
        pool: &mut TaskPool,
        pending: &[TaskId],
        upstream: &[TaskId],
        arrived: u32,
        flags: ReorderFlags,
    ) -> Option<TaskId> {
        // A task sent back for a retry keeps its place in encode order.
        if let Some(id) = Self::retried(pool, pending) {
            return Some(id);
        }

        if let Some(cut) = self.pending_cut.take() {
            let forced = std::mem::take(&mut self.forced_cut);
            if forced || (flags.close_gop_for_scene_change && !flags.gop_strict) {
                Self::close_scene_cut(pool, pending, upstream, cut);
            }
        }

        for _ in 0..=pending.len() {
            if let Some(id) = Self::pick(pool, pending, upstream, arrived, flags) {
                let task = pool.get_mut(id);
                task.encode_order = Some(self.next_encode_order);
                self.next_encode_order += 1;
                debug!(
                    "Selected display_order={} type={:?} as encode_order={}",
                    task.display_order,
                    task.first_type(),
                    self.next_encode_order - 1
                );
                return Some(id);
            }

            let drained = flags.flush && !flags.gop_strict && upstream.is_empty();
            if !drained || !Self::close_mini_gop(pool, pending, pending) {
                break;
            }
        }

        None
    }

    /// Whether a selection would return a task now, without changing anything.
    pub fn has_eligible(
        &self,
        pool: &TaskPool,
        pending: &[TaskId],
        upstream: &[TaskId],
        arrived: u32,
        flags: ReorderFlags,
    ) -> bool {
        if pending.is_empty() {
            return false;
        }
        Self::retried(pool, pending).is_some()
            || self.pending_cut.is_some()
            || (flags.flush && !flags.gop_strict && upstream.is_empty())
            || Self::pick(pool, pending, upstream, arrived, flags).is_some()
    }

    fn retried(pool: &TaskPool, pending: &[TaskId]) -> Option<TaskId> {
        pending
            .iter()
            .copied()
            .filter(|&id| pool.get(id).is_selected())
            .min_by_key(|&id| pool.get(id).encode_order)
    }

    fn pick(
        pool: &TaskPool,
        pending: &[TaskId],
        upstream: &[TaskId],
        arrived: u32,
        flags: ReorderFlags,
    ) -> Option<TaskId> {
        let eligible = |id: TaskId| Self::is_eligible(pool, id, pending, upstream, arrived, flags);

        if flags.gop_strict {
            let next = pending
                .iter()
                .chain(upstream)
                .copied()
                .min_by_key(|&id| pool.get(id).canonical_key())?;
            // The next task in canonical order may still be in analysis.
            if upstream.contains(&next) || !eligible(next) {
                return None;
            }
            return Some(next);
        }

        pending
            .iter()
            .copied()
            .filter(|&id| eligible(id))
            .min_by_key(|&id| pool.get(id).display_order)
    }

    fn is_eligible(
        pool: &TaskPool,
        id: TaskId,
        pending: &[TaskId],
        upstream: &[TaskId],
        arrived: u32,
        flags: ReorderFlags,
    ) -> bool {
        let task = pool.get(id);
        let in_flight = |display_order: u32| {
            pending
                .iter()
                .chain(upstream)
                .any(|&other| other != id && pool.get(other).display_order == display_order)
        };
        let satisfied = |dep: Option<u32>| match dep {
            None => true,
            // Never arrives; only a strict flush may encode without it.
            Some(d) if d >= arrived => flags.gop_strict && flags.flush,
            Some(d) => !in_flight(d),
        };

        match task.first_type() {
            GopFrameType::Idr => !pending
                .iter()
                .chain(upstream)
                .any(|&other| pool.get(other).display_order < task.display_order),
            GopFrameType::I => true,
            GopFrameType::P => satisfied(task.deps.forward),
            GopFrameType::B => satisfied(task.deps.forward) && satisfied(task.deps.backward),
        }
    }

    /// Turn the last B frame among `candidates` into a P frame and re-bind the
    /// B frames that referenced beyond it. Returns false if there is no B frame.
    fn close_mini_gop(pool: &mut TaskPool, candidates: &[TaskId], rebind: &[TaskId]) -> bool {
        let Some(last) = candidates
            .iter()
            .copied()
            .filter(|&id| pool.get(id).first_type().is_b())
            .max_by_key(|&id| pool.get(id).display_order)
        else {
            return false;
        };

        let closing = pool.get(last).display_order;
        pool.get_mut(last).convert_to_p();
        debug!("Closing mini-GOP at display_order={} with a P frame", closing);

        for &id in rebind {
            let task = pool.get_mut(id);
            if id != last && task.first_type().is_b() {
                if task.deps.backward > Some(closing) {
                    task.deps.backward = Some(closing);
                }
                if task.deps.next_anchor > Some(closing) {
                    task.deps.next_anchor = Some(closing);
                }
            }
        }
        true
    }

    /// Close mini-GOPs that straddle a scene cut.
    fn close_scene_cut(pool: &mut TaskPool, pending: &[TaskId], upstream: &[TaskId], cut: u32) {
        let all: Vec<TaskId> = pending.iter().chain(upstream).copied().collect();
        let straddling: Vec<TaskId> = all
            .iter()
            .copied()
            .filter(|&id| {
                let task = pool.get(id);
                task.first_type().is_b()
                    && task.display_order < cut
                    && task.deps.backward.is_some_and(|b| b >= cut)
            })
            .collect();
        if Self::close_mini_gop(pool, &straddling, &all) {
            debug!("Scene cut at display_order={} closed open mini-GOP", cut);
        }
    }
}
