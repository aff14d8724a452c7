//! Encoder control plane: configuration and the scheduling components.
//!
//! This module provides:
//! - Session configuration (`EncodeConfig`) and its validation.
//! - GOP structure and B-pyramid placement (`gop` module).
//! - Encode-order selection (`reorder` module).
//! - Reference picture management (`dpb` module).
//! - Stage scheduling (`pipeline`), task queues (`queue`) and the session driver (`session`).

pub mod backend;
pub mod dpb;
pub mod gop;
pub mod pipeline;
pub mod queue;
pub mod rate_control;
pub mod reorder;
pub mod session;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::Arc;

use crate::error::{EncodeError, Result};
use rate_control::RateControl;

// Default encoder configuration constants.

/// Default GOP size (distance between I frames).
pub const DEFAULT_GOP_PIC_SIZE: u32 = 30;

/// Default distance between anchor frames (1 means no B frames).
pub const DEFAULT_GOP_REF_DIST: u32 = 1;

/// Default number of tasks that may be in flight per stage.
pub const DEFAULT_ASYNC_DEPTH: u32 = 4;

/// Default H.264 level (4.1).
pub const DEFAULT_LEVEL_IDC: u8 = 41;

/// Default log2 of MaxFrameNum.
pub const DEFAULT_LOG2_MAX_FRAME_NUM: u32 = 8;

/// Default stage timeout in session time units.
pub const DEFAULT_STAGE_TIMEOUT: u64 = 2000;

/// Default number of retries for a recoverable stage error.
pub const DEFAULT_MAX_STAGE_RETRIES: u32 = 2;

/// Default number of recode attempts on overflow.
pub const DEFAULT_MAX_RECODES: u32 = 2;

/// Default QP for constant-QP rate control.
pub const DEFAULT_QP: u8 = 26;

/// Maximum distance between anchor frames.
pub const MAX_GOP_REF_DIST: u32 = 16;

/// Maximum supported B-pyramid depth.
pub const MAX_B_PYRAMID_DEPTH: u32 = 4;

/// Maximum number of temporal layers.
pub const MAX_TEMPORAL_LAYERS: u32 = 4;

/// Picture structure of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PicStruct {
    /// Progressive frames.
    #[default]
    Progressive,
    /// Interlaced, top field coded first.
    TopFieldFirst,
    /// Interlaced, bottom field coded first.
    BottomFieldFirst,
}

impl PicStruct {
    /// Whether pictures are coded as field pairs.
    pub fn is_field(&self) -> bool {
        !matches!(self, Self::Progressive)
    }

    /// Parity (0 = top, 1 = bottom) of the field coded first.
    pub fn first_field(&self) -> usize {
        match self {
            Self::BottomFieldFirst => 1,
            _ => 0,
        }
    }
}

/// Factory for an externally provided rate controller.
#[derive(Clone)]
pub struct RateControlFactory(Arc<dyn Fn() -> Box<dyn RateControl> + Send + Sync>);

impl RateControlFactory {
    /// Wrap a constructor for an external rate controller.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn RateControl> + Send + Sync + 'static,
    {
        Self(Arc::new(factory))
    }

    /// Create a new controller instance.
    pub fn create(&self) -> Box<dyn RateControl> {
        (self.0)()
    }
}

impl fmt::Debug for RateControlFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RateControlFactory")
    }
}

/// Rate-control method, fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub enum RateControlMethod {
    /// Constant QP per frame type.
    Cqp {
        /// QP for intra frames.
        qp_i: u8,
        /// QP for P frames.
        qp_p: u8,
        /// QP for B frames (pyramid level is added on top).
        qp_b: u8,
        /// Largest acceptable frame in bytes, 0 for no limit.
        max_frame_size: u32,
    },
    /// Bitrate target over a lookahead complexity window.
    LookaheadWindow {
        /// Target bitrate in kilobits per second.
        target_kbps: u32,
        /// Frame rate used to derive the per-frame budget.
        frame_rate: u32,
    },
    /// Constant quality scaled by lookahead complexity.
    LookaheadCrf {
        /// Quality factor (QP-like scale).
        quality: u8,
    },
    /// Externally provided controller.
    External(RateControlFactory),
}

impl Default for RateControlMethod {
    fn default() -> Self {
        Self::Cqp {
            qp_i: DEFAULT_QP,
            qp_p: DEFAULT_QP + 2,
            qp_b: DEFAULT_QP + 4,
            max_frame_size: 0,
        }
    }
}

impl RateControlMethod {
    /// Whether this method consumes lookahead analysis results.
    pub fn uses_lookahead(&self) -> bool {
        matches!(self, Self::LookaheadWindow { .. } | Self::LookaheadCrf { .. })
    }
}

/// Encode session configuration.
#[derive(Debug, Clone)]
#[must_use]
pub struct EncodeConfig {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// H.264 level_idc (e.g. 41 for level 4.1).
    pub level_idc: u8,
    /// Progressive or field-pair coding.
    pub pic_struct: PicStruct,
    /// Distance between I frames (0 = infinite GOP).
    pub gop_pic_size: u32,
    /// Distance between anchor frames (1 = no B frames).
    pub gop_ref_dist: u32,
    /// Distance between IDR frames (0 = only the first frame).
    pub idr_distance: u32,
    /// Close every GOP (no B frame references the next I frame).
    pub closed_gop: bool,
    /// Forbid any deviation from the configured GOP pattern.
    pub strict_gop: bool,
    /// Number of B-pyramid levels (0 or 1 disables the pyramid).
    pub b_pyramid_depth: u32,
    /// Anchors at multiples of this distance are key references (0 = intra only).
    pub ref_base_distance: u32,
    /// Explicit reference frame count (0 = derive from level).
    pub num_ref_frames: u32,
    /// Active references for P frames.
    pub num_ref_active_p: u32,
    /// Active List0 references for B frames.
    pub num_ref_active_bl0: u32,
    /// Active List1 references for B frames.
    pub num_ref_active_bl1: u32,
    /// log2(MaxFrameNum), 4..=16.
    pub log2_max_frame_num: u32,
    /// Number of temporal layers (P-only streams).
    pub temporal_layers: u32,
    /// Long-term reference slots per temporal layer.
    pub long_term_per_layer: u32,
    /// Tasks allowed in flight per stage.
    pub async_depth: u32,
    /// Frames analysed ahead of encode (0 = no lookahead stage).
    pub lookahead_depth: u32,
    /// Run the scene-change detection stage.
    pub scene_change_detection: bool,
    /// Run the temporal filter stage.
    pub temporal_filter: bool,
    /// Start a new IDR period at detected scene changes.
    pub close_gop_for_scene_change: bool,
    /// Low-delay mode (no reordering).
    pub low_delay: bool,
    /// Time after which a started stage is considered hung.
    pub stage_timeout: u64,
    /// Retries for a recoverable stage error.
    pub max_stage_retries: u32,
    /// Recode attempts for one frame.
    pub max_recodes: u32,
    /// Rate-control method.
    pub rate_control: RateControlMethod,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self::h264(1920, 1080)
    }
}

impl EncodeConfig {
    /// Create a new configuration with default settings.
    pub fn h264(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            level_idc: DEFAULT_LEVEL_IDC,
            pic_struct: PicStruct::Progressive,
            gop_pic_size: DEFAULT_GOP_PIC_SIZE,
            gop_ref_dist: DEFAULT_GOP_REF_DIST,
            idr_distance: 0,
            closed_gop: false,
            strict_gop: false,
            b_pyramid_depth: 0,
            ref_base_distance: 0,
            num_ref_frames: 0,
            num_ref_active_p: 1,
            num_ref_active_bl0: 1,
            num_ref_active_bl1: 1,
            log2_max_frame_num: DEFAULT_LOG2_MAX_FRAME_NUM,
            temporal_layers: 1,
            long_term_per_layer: 0,
            async_depth: DEFAULT_ASYNC_DEPTH,
            lookahead_depth: 0,
            scene_change_detection: false,
            temporal_filter: false,
            close_gop_for_scene_change: false,
            low_delay: false,
            stage_timeout: DEFAULT_STAGE_TIMEOUT,
            max_stage_retries: DEFAULT_MAX_STAGE_RETRIES,
            max_recodes: DEFAULT_MAX_RECODES,
            rate_control: RateControlMethod::default(),
        }
    }

    /// Set the GOP size and anchor distance.
    pub fn with_gop(mut self, gop_pic_size: u32, gop_ref_dist: u32) -> Self {
        self.gop_pic_size = gop_pic_size;
        self.gop_ref_dist = gop_ref_dist;
        self
    }

    /// Set the IDR distance.
    pub fn with_idr_distance(mut self, distance: u32) -> Self {
        self.idr_distance = distance;
        self
    }

    /// Set the B-pyramid depth.
    pub fn with_b_pyramid(mut self, depth: u32) -> Self {
        self.b_pyramid_depth = depth;
        self
    }

    /// Set closed/strict GOP flags.
    pub fn with_gop_flags(mut self, closed: bool, strict: bool) -> Self {
        self.closed_gop = closed;
        self.strict_gop = strict;
        self
    }

    /// Set the key-reference distance.
    pub fn with_ref_base_distance(mut self, distance: u32) -> Self {
        self.ref_base_distance = distance;
        self
    }

    /// Set the explicit reference frame count.
    pub fn with_num_ref_frames(mut self, count: u32) -> Self {
        self.num_ref_frames = count;
        self
    }

    /// Set active reference counts (P, B List0, B List1).
    pub fn with_active_refs(mut self, p: u32, bl0: u32, bl1: u32) -> Self {
        self.num_ref_active_p = p;
        self.num_ref_active_bl0 = bl0;
        self.num_ref_active_bl1 = bl1;
        self
    }

    /// Set temporal layer count and long-term slots per layer.
    pub fn with_layers(mut self, temporal_layers: u32, long_term_per_layer: u32) -> Self {
        self.temporal_layers = temporal_layers;
        self.long_term_per_layer = long_term_per_layer;
        self
    }

    /// Set the pipeline depth and lookahead depth.
    pub fn with_async_depth(mut self, async_depth: u32, lookahead_depth: u32) -> Self {
        self.async_depth = async_depth;
        self.lookahead_depth = lookahead_depth;
        self
    }

    /// Enable or disable the optional analysis stages.
    pub fn with_analysis(mut self, scene_change: bool, temporal_filter: bool) -> Self {
        self.scene_change_detection = scene_change;
        self.temporal_filter = temporal_filter;
        self
    }

    /// Start a new IDR period at scene changes.
    pub fn with_close_gop_for_scene_change(mut self, enable: bool) -> Self {
        self.close_gop_for_scene_change = enable;
        self
    }

    /// Set low-delay mode.
    pub fn with_low_delay(mut self, enable: bool) -> Self {
        self.low_delay = enable;
        self
    }

    /// Set the picture structure.
    pub fn with_pic_struct(mut self, pic_struct: PicStruct) -> Self {
        self.pic_struct = pic_struct;
        self
    }

    /// Set the stage timeout and retry limits.
    pub fn with_limits(mut self, stage_timeout: u64, max_stage_retries: u32, max_recodes: u32) -> Self {
        self.stage_timeout = stage_timeout;
        self.max_stage_retries = max_stage_retries;
        self.max_recodes = max_recodes;
        self
    }

    /// Set log2(MaxFrameNum).
    pub fn with_log2_max_frame_num(mut self, log2: u32) -> Self {
        self.log2_max_frame_num = log2;
        self
    }

    /// Set the rate-control method.
    pub fn with_rate_control(mut self, method: RateControlMethod) -> Self {
        self.rate_control = method;
        self
    }

    /// Whether the GOP pattern contains B frames.
    pub fn has_b_frames(&self) -> bool {
        self.gop_ref_dist > 1
    }

    /// Whether the lookahead stage runs.
    pub fn lookahead_enabled(&self) -> bool {
        self.lookahead_depth > 0
    }

    /// MaxFrameNum.
    pub fn max_frame_num(&self) -> u32 {
        1 << self.log2_max_frame_num
    }

    /// Number of reference frames the DPB may hold.
    pub fn dpb_capacity(&self) -> u32 {
        let level_limit = max_dpb_frames(self.level_idc, self.width, self.height).unwrap_or(1);
        if self.num_ref_frames > 0 {
            self.num_ref_frames.min(level_limit)
        } else {
            level_limit
        }
    }

    /// Total long-term slots across all temporal layers.
    pub fn long_term_capacity(&self) -> u32 {
        self.long_term_per_layer * self.temporal_layers
    }

    /// Number of tasks allocated for the session.
    pub fn task_pool_size(&self) -> usize {
        (self.async_depth + self.lookahead_depth + self.gop_ref_dist + 1) as usize
    }

    /// Check the configuration for unsupported combinations.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(EncodeError::InvalidConfig(msg));

        if self.width == 0 || self.height == 0 {
            return invalid(format!("frame size {}x{} is empty", self.width, self.height));
        }
        let Some(level_frames) = max_dpb_frames(self.level_idc, self.width, self.height) else {
            return invalid(format!("unknown level_idc {}", self.level_idc));
        };
        if level_frames == 0 {
            return invalid(format!(
                "level {} cannot hold a {}x{} reference frame",
                self.level_idc, self.width, self.height
            ));
        }
        if self.async_depth == 0 {
            return invalid("async_depth must be at least 1".to_string());
        }
        if self.gop_ref_dist == 0 || self.gop_ref_dist > MAX_GOP_REF_DIST {
            return invalid(format!(
                "gop_ref_dist {} outside 1..={}",
                self.gop_ref_dist, MAX_GOP_REF_DIST
            ));
        }
        if self.gop_pic_size > 0 && self.gop_ref_dist > self.gop_pic_size {
            return invalid(format!(
                "gop_ref_dist {} exceeds gop_pic_size {}",
                self.gop_ref_dist, self.gop_pic_size
            ));
        }
        if self.gop_pic_size > 0
            && self.idr_distance > 0
            && self.idr_distance % self.gop_pic_size != 0
        {
            return invalid(format!(
                "idr_distance {} is not a multiple of gop_pic_size {}",
                self.idr_distance, self.gop_pic_size
            ));
        }
        if self.b_pyramid_depth > MAX_B_PYRAMID_DEPTH {
            return invalid(format!(
                "b_pyramid_depth {} exceeds {}",
                self.b_pyramid_depth, MAX_B_PYRAMID_DEPTH
            ));
        }
        if self.low_delay && self.has_b_frames() {
            return invalid("low_delay is incompatible with B frames".to_string());
        }
        if !(4..=16).contains(&self.log2_max_frame_num) {
            return invalid(format!(
                "log2_max_frame_num {} outside 4..=16",
                self.log2_max_frame_num
            ));
        }
        if self.temporal_layers == 0 || self.temporal_layers > MAX_TEMPORAL_LAYERS {
            return invalid(format!(
                "temporal_layers {} outside 1..={}",
                self.temporal_layers, MAX_TEMPORAL_LAYERS
            ));
        }
        if self.temporal_layers > 1 && self.has_b_frames() {
            return invalid("temporal layers require a P-only GOP".to_string());
        }
        if self.temporal_layers > 1 && self.dpb_capacity() < self.temporal_layers {
            return invalid(format!(
                "a DPB of {} cannot hold a reference for each of {} temporal layers",
                self.dpb_capacity(),
                self.temporal_layers
            ));
        }
        if self.long_term_capacity() >= self.dpb_capacity() {
            return invalid(format!(
                "{} long-term slots leave no short-term reference in a DPB of {}",
                self.long_term_capacity(),
                self.dpb_capacity()
            ));
        }
        if self.num_ref_active_p == 0 {
            return invalid("num_ref_active_p must be at least 1".to_string());
        }
        if self.has_b_frames() && (self.num_ref_active_bl0 == 0 || self.num_ref_active_bl1 == 0) {
            return invalid("B frames need at least one active reference per list".to_string());
        }
        if self.rate_control.uses_lookahead() && !self.lookahead_enabled() {
            return invalid("lookahead rate control requires lookahead_depth > 0".to_string());
        }
        Ok(())
    }
}

/// Maximum DPB frames for a level and frame size (H.264 Table A-1).
///
/// Returns `None` for unknown levels.
pub fn max_dpb_frames(level_idc: u8, width: u32, height: u32) -> Option<u32> {
    let max_dpb_mbs: u32 = match level_idc {
        9 | 10 => 396,
        11 => 900,
        12 | 13 | 20 => 2376,
        21 => 4752,
        22 | 30 => 8100,
        31 => 18000,
        32 => 20480,
        40 | 41 => 32768,
        42 => 34816,
        50 => 110400,
        51 | 52 => 184320,
        _ => return None,
    };
    let frame_mbs = width.div_ceil(16) * height.div_ceil(16);
    if frame_mbs == 0 {
        return Some(0);
    }
    Some((max_dpb_mbs / frame_mbs).min(dpb::MAX_DPB_SIZE as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EncodeConfig::h264(1920, 1080);
        assert!(config.validate().is_ok());
        assert_eq!(config.gop_pic_size, 30);
        assert_eq!(config.gop_ref_dist, 1);
        assert_eq!(config.dpb_capacity(), 4);
    }

    #[test]
    fn test_level_table() {
        assert_eq!(max_dpb_frames(41, 1920, 1080), Some(4));
        assert_eq!(max_dpb_frames(51, 1920, 1080), Some(16));
        assert_eq!(max_dpb_frames(30, 720, 576), Some(5));
        assert_eq!(max_dpb_frames(77, 1920, 1080), None);
    }

    #[test]
    fn test_num_ref_frames_caps_capacity() {
        let config = EncodeConfig::h264(1280, 720).with_num_ref_frames(2);
        assert_eq!(config.dpb_capacity(), 2);
    }

    #[test]
    fn test_rejects_zero_async_depth() {
        let config = EncodeConfig::h264(640, 480).with_async_depth(0, 0);
        assert!(matches!(config.validate(), Err(EncodeError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_misaligned_idr_distance() {
        let config = EncodeConfig::h264(640, 480).with_gop(30, 1).with_idr_distance(45);
        assert!(config.validate().is_err());

        let config = EncodeConfig::h264(640, 480).with_gop(30, 1).with_idr_distance(60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_low_delay_with_b_frames() {
        let config = EncodeConfig::h264(640, 480).with_gop(32, 4).with_low_delay(true);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_layers_with_b_frames() {
        let config = EncodeConfig::h264(640, 480).with_gop(32, 2).with_layers(2, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_dpb_smaller_than_layer_count() {
        let config = EncodeConfig::h264(640, 480)
            .with_gop(32, 1)
            .with_num_ref_frames(2)
            .with_layers(3, 0);
        assert!(config.validate().is_err());
        assert!(config.with_num_ref_frames(3).validate().is_ok());
    }

    #[test]
    fn test_rejects_long_term_budget_filling_dpb() {
        let config = EncodeConfig::h264(1920, 1080)
            .with_num_ref_frames(4)
            .with_layers(2, 2);
        assert!(config.validate().is_err());

        let config = EncodeConfig::h264(1920, 1080)
            .with_num_ref_frames(4)
            .with_layers(1, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_lookahead_rc_without_lookahead() {
        let config = EncodeConfig::h264(640, 480).with_rate_control(RateControlMethod::LookaheadCrf {
            quality: 23,
        });
        assert!(config.validate().is_err());

        let config = config.with_async_depth(4, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_log2_max_frame_num() {
        assert!(EncodeConfig::h264(640, 480)
            .with_log2_max_frame_num(3)
            .validate()
            .is_err());
        assert!(EncodeConfig::h264(640, 480)
            .with_log2_max_frame_num(17)
            .validate()
            .is_err());
    }

    #[test]
    fn test_builder_chaining() {
        let config = EncodeConfig::h264(1280, 720)
            .with_gop(32, 4)
            .with_idr_distance(64)
            .with_b_pyramid(2)
            .with_active_refs(2, 2, 1)
            .with_async_depth(3, 0)
            .with_gop_flags(true, false);

        assert_eq!(config.gop_pic_size, 32);
        assert_eq!(config.gop_ref_dist, 4);
        assert_eq!(config.idr_distance, 64);
        assert_eq!(config.b_pyramid_depth, 2);
        assert!(config.closed_gop);
        assert!(config.validate().is_ok());
        assert_eq!(config.task_pool_size(), 8);
    }
}
