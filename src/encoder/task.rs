//! Task entity and the fixed-capacity pools a session allocates up front.
//!
//! A task is one input picture (a frame or a field pair). It is taken from the
//! free pool on arrival, mutated in place while it moves through the stage
//! queues, and returned once its output has been consumed.

use super::backend::{AnalysisResult, EncodeOutcome, SubmissionHandle};
use super::dpb::{DecRefPicMarking, DpbSnapshot, RefListControl, RefLists};
use super::gop::{BiFrameLocation, GopFrame, GopFrameType, StructuralDeps};
use super::rate_control::QpControl;
use super::PicStruct;
use crate::error::TaskFailure;

/// Index of a task in the session's task pool.
pub type TaskId = usize;

/// A value per field of a picture (top, bottom).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldPair<T> {
    /// Top field (or the whole frame).
    pub top: T,
    /// Bottom field.
    pub bottom: T,
}

impl<T: Copy> FieldPair<T> {
    /// Create a pair from per-field values.
    pub fn new(top: T, bottom: T) -> Self {
        Self { top, bottom }
    }

    /// Create a pair with the same value for both fields.
    pub fn splat(value: T) -> Self {
        Self {
            top: value,
            bottom: value,
        }
    }

    /// Value for parity 0 (top) or 1 (bottom).
    pub fn get(&self, parity: usize) -> T {
        if parity == 0 {
            self.top
        } else {
            self.bottom
        }
    }

    /// Set the value for a parity.
    pub fn set(&mut self, parity: usize, value: T) {
        if parity == 0 {
            self.top = value;
        } else {
            self.bottom = value;
        }
    }
}

/// Lifecycle state of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// In the free pool.
    #[default]
    Free,
    /// Moving through the pipeline.
    Active,
    /// In the finished queue, waiting to be consumed.
    Finished,
}

/// Result recorded by the poll path for a started stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageCompletion {
    /// An analysis stage finished.
    Analysis(AnalysisResult),
    /// Hardware encode finished.
    Encoded(EncodeOutcome),
    /// The stage reported an error.
    Error {
        /// Whether a retry may succeed.
        recoverable: bool,
    },
    /// The stage exceeded the configured timeout.
    Hang,
}

/// One encodable picture.
#[derive(Debug, Clone)]
pub struct Task {
    /// Pool index.
    pub id: TaskId,
    /// Lifecycle state.
    pub state: TaskState,
    /// Caller's raw surface handle.
    pub surface: u64,
    /// Caller's timestamp.
    pub timestamp: u64,
    /// Display (arrival) order.
    pub display_order: u32,
    /// Encode order, assigned by the reorder engine.
    pub encode_order: Option<u32>,
    /// Display order of the IDR opening this period.
    pub idr_display_order: u32,
    /// Picture structure.
    pub pic_struct: PicStruct,
    /// Frame type per field.
    pub frame_type: FieldPair<GopFrameType>,
    /// Reference flag per field.
    pub reference: FieldPair<bool>,
    /// Picture order count per field.
    pub poc: FieldPair<i32>,
    /// frame_num syntax element.
    pub frame_num: u32,
    /// Mini-GOP placement.
    pub location: BiFrameLocation,
    /// Structural dependencies (display orders).
    pub deps: StructuralDeps,
    /// Temporal layer.
    pub temporal_id: u8,
    /// Protected from eviction ahead of other references.
    pub key_reference: bool,
    /// Long-term frame index assigned to this picture.
    pub long_term_idx: Option<u8>,
    /// Caller's reference list control.
    pub ref_control: RefListControl,
    /// Caller asked for an IDR at this picture.
    pub force_idr: bool,
    /// Scene change detected at this picture.
    pub scene_change: bool,
    /// Lookahead complexity estimate.
    pub complexity: Option<u32>,
    /// Temporal-filter output surface.
    pub filtered_surface: Option<u64>,
    /// Quantization controls from rate control.
    pub qp: QpControl,
    /// DPB as seen by this picture at submission.
    pub dpb_before: DpbSnapshot,
    /// DPB after this picture's marking has been applied.
    pub dpb_after: DpbSnapshot,
    /// Reference lists and modification ops (indices into `dpb_before`).
    pub ref_lists: RefLists,
    /// Reference marking applied after this picture.
    pub marking: DecRefPicMarking,
    /// DPB state and lists have been prepared for this picture.
    pub configured: bool,
    /// Reconstruction surface index.
    pub recon: Option<u8>,
    /// Handle of the current hardware submission.
    pub handle: Option<SubmissionHandle>,
    /// Time the current stage was started.
    pub stage_start: u64,
    /// Recoverable errors seen in the current stage.
    pub retries: u32,
    /// Recode attempts.
    pub recodes: u32,
    /// Completion recorded by the poll path.
    pub completion: Option<StageCompletion>,
    /// Encoded size in bytes.
    pub encoded_size: Option<u32>,
    /// Terminal failure.
    pub failure: Option<TaskFailure>,
    /// Rate control gave up on this picture.
    pub brc_panic: bool,
}

impl Task {
    /// Create an empty task for a pool slot.
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Free,
            surface: 0,
            timestamp: 0,
            display_order: 0,
            encode_order: None,
            idr_display_order: 0,
            pic_struct: PicStruct::Progressive,
            frame_type: FieldPair::splat(GopFrameType::P),
            reference: FieldPair::splat(false),
            poc: FieldPair::splat(0),
            frame_num: 0,
            location: BiFrameLocation::default(),
            deps: StructuralDeps::default(),
            temporal_id: 0,
            key_reference: false,
            long_term_idx: None,
            ref_control: RefListControl::default(),
            force_idr: false,
            scene_change: false,
            complexity: None,
            filtered_surface: None,
            qp: QpControl::default(),
            dpb_before: DpbSnapshot::new(),
            dpb_after: DpbSnapshot::new(),
            ref_lists: RefLists::default(),
            marking: DecRefPicMarking::default(),
            configured: false,
            recon: None,
            handle: None,
            stage_start: 0,
            retries: 0,
            recodes: 0,
            completion: None,
            encoded_size: None,
            failure: None,
            brc_panic: false,
        }
    }

    /// Return the slot to its free state.
    pub fn reset(&mut self) {
        *self = Self::new(self.id);
    }

    /// Parity of the field coded first.
    pub fn first_field(&self) -> usize {
        self.pic_struct.first_field()
    }

    /// Type of the field coded first.
    pub fn first_type(&self) -> GopFrameType {
        self.frame_type.get(self.first_field())
    }

    /// Whether any field is used as a reference.
    pub fn is_reference(&self) -> bool {
        self.reference.top || self.reference.bottom
    }

    /// Whether the picture starts a new IDR period.
    pub fn is_idr(&self) -> bool {
        self.first_type().is_idr()
    }

    /// Whether the picture has passed encode-order selection.
    pub fn is_selected(&self) -> bool {
        self.encode_order.is_some()
    }

    /// Apply a GOP layout to this task.
    pub fn stamp(&mut self, frame: &GopFrame) {
        self.idr_display_order = frame.idr_display_order;
        self.frame_type = frame.frame_type;
        self.reference = FieldPair::splat(frame.reference);
        self.location = frame.location;
        self.deps = frame.deps;
        self.key_reference = frame.key_reference;
        self.temporal_id = frame.temporal_id;
    }

    /// Turn a B frame into a referenced P frame closing its mini-GOP.
    pub fn convert_to_p(&mut self) {
        let first = self.first_field();
        self.frame_type.set(first, GopFrameType::P);
        self.frame_type.set(1 - first, GopFrameType::P);
        self.reference = FieldPair::splat(true);
        self.location.level = 0;
        self.location.reference = true;
        self.deps.forward = self.deps.previous_anchor.or(self.deps.forward);
        self.deps.backward = None;
        self.deps.next_anchor = None;
    }

    /// Key used to order tasks in canonical (strict GOP) encode order.
    ///
    /// Anchors precede the B frames of the mini-GOP they close; B frames follow
    /// their pyramid rank. B frames are keyed by the anchor closing their
    /// mini-GOP, not by their nearest backward reference.
    pub fn canonical_key(&self) -> (u32, u32) {
        if self.first_type().is_b() {
            let closing = self
                .deps
                .next_anchor
                .or(self.deps.backward)
                .unwrap_or(self.display_order);
            (closing, 1 + self.location.encoding_rank)
        } else {
            (self.display_order, 0)
        }
    }

    /// Record a terminal failure.
    pub fn fail(&mut self, reason: TaskFailure) {
        self.failure = Some(reason);
    }
}

/// Fixed arena of tasks; a task id is its index.
#[derive(Debug)]
pub struct TaskPool {
    tasks: Vec<Task>,
}

impl TaskPool {
    /// Allocate `size` tasks.
    pub fn new(size: usize) -> Self {
        Self {
            tasks: (0..size).map(Task::new).collect(),
        }
    }

    /// Number of task slots.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the pool has no slots.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Borrow a task.
    pub fn get(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    /// Mutably borrow a task.
    pub fn get_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id]
    }

    /// Iterate over all slots.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Find the active task with a display order.
    pub fn find_by_display_order(&self, display_order: u32) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| t.state != TaskState::Free && t.display_order == display_order)
    }
}

/// Reference-counted pool of reconstruction surfaces.
///
/// A surface stays busy while its picture is in the DPB or its task is unfinished.
#[derive(Debug)]
pub struct ReconPool {
    refs: Vec<u8>,
}

impl ReconPool {
    /// Create a pool of `size` surfaces.
    pub fn new(size: usize) -> Self {
        Self {
            refs: vec![0; size],
        }
    }

    /// Take a free surface.
    pub fn acquire(&mut self) -> Option<u8> {
        let idx = self.refs.iter().position(|&r| r == 0)?;
        self.refs[idx] = 1;
        Some(idx as u8)
    }

    /// Add a holder to a busy surface.
    pub fn retain(&mut self, idx: u8) {
        if let Some(r) = self.refs.get_mut(idx as usize) {
            *r += 1;
        }
    }

    /// Drop a holder.
    pub fn release(&mut self, idx: u8) {
        if let Some(r) = self.refs.get_mut(idx as usize) {
            debug_assert!(*r > 0, "recon surface {idx} released while free");
            *r = r.saturating_sub(1);
        }
    }

    /// Number of free surfaces.
    pub fn available(&self) -> usize {
        self.refs.iter().filter(|&&r| r == 0).count()
    }

    /// Drop every holder.
    pub fn clear(&mut self) {
        self.refs.fill(0);
    }
}
