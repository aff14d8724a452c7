//! Contracts of the asynchronous collaborators driven by the session.
//!
//! Every collaborator follows the same start/finish pattern: `submit` starts
//! work for one task and returns immediately, `query` is polled until the work
//! is done. Nothing here blocks.

use arrayvec::ArrayVec;

use super::dpb::{DecRefPicMarking, RefListMods, MAX_REF_LIST_SIZE};
use super::gop::GopFrameType;
use super::rate_control::QpControl;
use super::task::{FieldPair, Task, TaskId};
use crate::error::Result;

/// Opaque handle of a hardware submission.
pub type SubmissionHandle = u64;

/// Result of polling a started stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageQuery<T> {
    /// Still running.
    Pending,
    /// Finished.
    Done(T),
    /// Failed.
    Error {
        /// Whether resubmitting may succeed.
        recoverable: bool,
    },
}

/// Outcome of one hardware encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EncodeOutcome {
    /// Size of the coded picture in bytes.
    pub encoded_size: u32,
    /// The bitstream or slice buffer overflowed.
    pub overflow: bool,
}

/// Result of an analysis stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisResult {
    /// Scene-change detection verdict.
    SceneChange(bool),
    /// Temporal filter output surface.
    Filtered {
        /// Filtered surface handle.
        surface: u64,
    },
    /// Lookahead complexity estimate.
    Complexity(u32),
}

/// Work item for an analysis stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisRequest {
    /// Task being analysed.
    pub task_id: TaskId,
    /// Display order of the picture.
    pub display_order: u32,
    /// Input surface (filtered surface when available).
    pub surface: u64,
}

impl AnalysisRequest {
    /// Build a request for a task.
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            display_order: task.display_order,
            surface: task.filtered_surface.unwrap_or(task.surface),
        }
    }
}

/// A reference as seen by the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceSlot {
    /// Display order of the reference picture.
    pub display_order: u32,
    /// Reconstruction surface holding it.
    pub recon: Option<u8>,
    /// Long-term index, if long-term.
    pub long_term_idx: Option<u8>,
}

/// Everything the hardware needs to encode one picture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeSubmission {
    /// Task being encoded.
    pub task_id: TaskId,
    /// Display order.
    pub display_order: u32,
    /// Encode order.
    pub encode_order: u32,
    /// Frame type per field.
    pub frame_type: FieldPair<GopFrameType>,
    /// Picture order count per field.
    pub poc: FieldPair<i32>,
    /// frame_num.
    pub frame_num: u32,
    /// Whether the picture is a reference.
    pub reference: bool,
    /// Quantization controls.
    pub qp: QpControl,
    /// Input surface (filtered surface when available).
    pub surface: u64,
    /// Reconstruction surface.
    pub recon: Option<u8>,
    /// Resolved List0.
    pub list0: ArrayVec<ReferenceSlot, MAX_REF_LIST_SIZE>,
    /// Resolved List1.
    pub list1: ArrayVec<ReferenceSlot, MAX_REF_LIST_SIZE>,
    /// List0 modification ops.
    pub mods0: RefListMods,
    /// List1 modification ops.
    pub mods1: RefListMods,
    /// Reference marking.
    pub marking: DecRefPicMarking,
    /// Recode attempt number.
    pub recode: u32,
}

impl EncodeSubmission {
    /// Build a submission from a configured task.
    pub fn for_task(task: &Task) -> Self {
        let resolve = |list: &[u8]| {
            list.iter()
                .filter_map(|&i| task.dpb_before.get(i as usize))
                .map(|e| ReferenceSlot {
                    display_order: e.display_order,
                    recon: e.recon,
                    long_term_idx: e.long_term_idx,
                })
                .collect()
        };

        Self {
            task_id: task.id,
            display_order: task.display_order,
            encode_order: task.encode_order.unwrap_or_default(),
            frame_type: task.frame_type,
            poc: task.poc,
            frame_num: task.frame_num,
            reference: task.is_reference(),
            qp: task.qp,
            surface: task.filtered_surface.unwrap_or(task.surface),
            recon: task.recon,
            list0: resolve(&task.ref_lists.list0),
            list1: resolve(&task.ref_lists.list1),
            mods0: task.ref_lists.mods0.clone(),
            mods1: task.ref_lists.mods1.clone(),
            marking: task.marking.clone(),
            recode: task.recodes,
        }
    }
}

/// Hardware encode stage.
pub trait EncodeBackend: Send {
    /// Start encoding a picture.
    fn submit(&mut self, submission: &EncodeSubmission) -> Result<SubmissionHandle>;

    /// Poll a submission.
    ///
    /// Several threads may poll the same handle. Once a submission has
    /// completed, every later query must return the same verdict.
    fn query(&mut self, handle: SubmissionHandle) -> StageQuery<EncodeOutcome>;
}

/// Scene-change detection, temporal filtering or lookahead.
pub trait AnalysisStage: Send {
    /// Start analysing a picture.
    fn submit(&mut self, request: &AnalysisRequest) -> Result<()>;

    /// Poll the analysis of a task.
    ///
    /// Must keep returning the same verdict after completion, until the task
    /// is submitted again.
    fn query(&mut self, task_id: TaskId) -> StageQuery<AnalysisResult>;
}

/// Collaborators of one session. Optional stages run only when both the
/// configuration enables them and an implementation is supplied.
pub struct Collaborators {
    /// Hardware encoder.
    pub encoder: Box<dyn EncodeBackend>,
    /// Scene-change detector.
    pub scene_change: Option<Box<dyn AnalysisStage>>,
    /// Temporal filter.
    pub temporal_filter: Option<Box<dyn AnalysisStage>>,
    /// Lookahead analysis.
    pub lookahead: Option<Box<dyn AnalysisStage>>,
}

impl Collaborators {
    /// Collaborators with only a hardware encoder.
    pub fn new(encoder: Box<dyn EncodeBackend>) -> Self {
        Self {
            encoder,
            scene_change: None,
            temporal_filter: None,
            lookahead: None,
        }
    }

    /// Add a scene-change detector.
    #[must_use]
    pub fn with_scene_change(mut self, stage: Box<dyn AnalysisStage>) -> Self {
        self.scene_change = Some(stage);
        self
    }

    /// Add a temporal filter.
    #[must_use]
    pub fn with_temporal_filter(mut self, stage: Box<dyn AnalysisStage>) -> Self {
        self.temporal_filter = Some(stage);
        self
    }

    /// Add a lookahead stage.
    #[must_use]
    pub fn with_lookahead(mut self, stage: Box<dyn AnalysisStage>) -> Self {
        self.lookahead = Some(stage);
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("scene_change", &self.scene_change.is_some())
            .field("temporal_filter", &self.temporal_filter.is_some())
            .field("lookahead", &self.lookahead.is_some())
            .finish_non_exhaustive()
    }
}
