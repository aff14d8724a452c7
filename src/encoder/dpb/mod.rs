//! Decoded Picture Buffer (DPB) management for H.264 encoding.
//!
//! This module provides:
//! - Sliding-window and adaptive (MMCO) reference marking with key-reference protection
//! - Long-term references with per-temporal-layer index ranges
//! - Default reference list construction for P and B pictures
//! - Reference list modification ops and their verification
//!
//! Reference lists and DPB snapshots refer to pictures by index into the
//! snapshot taken at submission, so an in-flight task can still recall what it
//! referenced after the DPB has moved on.

mod entry;
mod h264;
mod reference_lists;
mod types;

pub use entry::{DpbEntry, MarkingState};
pub use h264::{picture_order_count, DpbChange, DpbManager};
pub use reference_lists::H264ReferenceListBuilder;
pub use types::*;

/// Maximum DPB size (16 frames for H.264).
pub const MAX_DPB_SIZE: usize = 16;

/// Maximum number of reference pictures in a list.
pub const MAX_REF_LIST_SIZE: usize = 16;

/// Maximum number of modification ops per list.
pub const MAX_REF_LIST_MODS: usize = 33;

/// Maximum number of MMCO ops per picture.
pub const MAX_MMCO_OPS: usize = 32;
