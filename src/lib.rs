//! Control plane for hardware-accelerated H.264 encoding.
//!
//! The crate decides when each asynchronous stage (scene-change detection,
//! temporal filtering, lookahead analysis and hardware encode) runs for every
//! input picture, in which order pictures are encoded, and which previously
//! encoded pictures each new picture may reference.
//!
//! Pixel processing, bitstream packing and rate-control algorithms are
//! provided by collaborators through the traits in [`encoder::backend`] and
//! [`encoder::rate_control`].

pub mod encoder;
pub mod error;

pub use encoder::backend::{
    AnalysisRequest, AnalysisResult, AnalysisStage, Collaborators, EncodeBackend, EncodeOutcome,
    EncodeSubmission, ReferenceSlot, StageQuery, SubmissionHandle,
};
pub use encoder::dpb::{
    DecRefPicMarking, DpbEntry, DpbManager, MmcoOperation, RefListControl, RefListMod,
};
pub use encoder::gop::{BiFrameLocation, FrameTypeGenerator, GopFrameType};
pub use encoder::pipeline::{PipelineScheduler, Stage, StageMask, StagePlan};
pub use encoder::rate_control::{BrcStatus, FrameParams, QpControl, RateControl};
pub use encoder::session::{EncodeSession, EncodedFrame, FrameInput};
pub use encoder::task::{FieldPair, TaskId};
pub use encoder::{EncodeConfig, PicStruct, RateControlFactory, RateControlMethod};
pub use error::{EncodeError, Result, TaskFailure};
