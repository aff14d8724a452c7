//! Rate-control contract and the built-in controllers.
//!
//! The session holds exactly one controller, selected from
//! [`RateControlMethod`] when the session is created. It asks for QP before
//! every hardware submission and reports the coded size afterwards.

use std::collections::VecDeque;

use super::gop::GopFrameType;
use super::task::Task;
use super::{EncodeConfig, RateControlMethod};
use crate::error::{EncodeError, Result};

/// Largest H.264 QP.
pub const MAX_QP: u8 = 51;

/// Per-frame information handed to rate control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameParams {
    /// Display order.
    pub display_order: u32,
    /// Encode order.
    pub encode_order: u32,
    /// Type of the first field.
    pub frame_type: GopFrameType,
    /// B-pyramid level (0 for anchors).
    pub pyramid_level: u32,
    /// Picture is kept as a long-term reference.
    pub long_term: bool,
    /// Scene change detected at this picture.
    pub scene_change: bool,
    /// Recode attempt (0 for the first encode).
    pub num_recode: u32,
    /// Lookahead complexity, when available.
    pub complexity: Option<u32>,
}

impl FrameParams {
    /// Collect the parameters of a configured task.
    pub fn for_task(task: &Task) -> Self {
        Self {
            display_order: task.display_order,
            encode_order: task.encode_order.unwrap_or_default(),
            frame_type: task.first_type(),
            pyramid_level: if task.first_type().is_b() {
                task.location.level
            } else {
                0
            },
            long_term: task.long_term_idx.is_some() || task.marking.long_term_reference_flag,
            scene_change: task.scene_change,
            num_recode: task.recodes,
            complexity: task.complexity,
        }
    }
}

/// Quantization controls for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpControl {
    /// Frame QP.
    pub qp: u8,
    /// Largest acceptable coded size in bytes, 0 for no limit.
    pub max_frame_size: u32,
}

/// Verdict on a coded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrcStatus {
    /// Accept the frame.
    Ok,
    /// Recode with a higher QP.
    FrameTooBig,
    /// Recode with a lower QP.
    FrameTooSmall,
    /// No QP can satisfy the constraints; the frame is accepted as is.
    Panic,
}

impl BrcStatus {
    /// Whether the frame must be encoded again.
    pub fn needs_recode(&self) -> bool {
        matches!(self, Self::FrameTooBig | Self::FrameTooSmall)
    }
}

/// Rate-control capability.
pub trait RateControl: Send {
    /// Prepare for a session.
    fn init(&mut self, config: &EncodeConfig) -> Result<()>;

    /// QP and size limit for the next encode of a frame.
    fn get_qp(&mut self, params: &FrameParams) -> QpControl;

    /// Report the coded size of a frame.
    fn report(&mut self, params: &FrameParams, encoded_size: u32) -> BrcStatus;
}

/// Instantiate the controller for a method.
pub fn create_rate_control(method: &RateControlMethod) -> Box<dyn RateControl> {
    match method {
        RateControlMethod::Cqp {
            qp_i,
            qp_p,
            qp_b,
            max_frame_size,
        } => Box::new(CqpRateControl::new(*qp_i, *qp_p, *qp_b, *max_frame_size)),
        RateControlMethod::LookaheadWindow {
            target_kbps,
            frame_rate,
        } => Box::new(LookaheadWindowRateControl::new(*target_kbps, *frame_rate)),
        RateControlMethod::LookaheadCrf { quality } => {
            Box::new(LookaheadCrfRateControl::new(*quality))
        }
        RateControlMethod::External(factory) => factory.create(),
    }
}

fn clamp_qp(qp: i32) -> u8 {
    qp.clamp(0, i32::from(MAX_QP)) as u8
}

/// QP delta for a complexity relative to a reference complexity.
///
/// Doubling the complexity costs roughly six QP steps.
fn complexity_offset(complexity: u32, reference: u32) -> i32 {
    if complexity == 0 || reference == 0 {
        return 0;
    }
    let ratio = f64::from(complexity) / f64::from(reference);
    (ratio.log2() * 6.0).round() as i32
}

/// Constant QP per frame type.
#[derive(Debug)]
pub struct CqpRateControl {
    qp_i: u8,
    qp_p: u8,
    qp_b: u8,
    max_frame_size: u32,
}

impl CqpRateControl {
    /// Create a constant-QP controller.
    pub fn new(qp_i: u8, qp_p: u8, qp_b: u8, max_frame_size: u32) -> Self {
        Self {
            qp_i,
            qp_p,
            qp_b,
            max_frame_size,
        }
    }

    fn base_qp(&self, params: &FrameParams) -> i32 {
        match params.frame_type {
            GopFrameType::Idr | GopFrameType::I => i32::from(self.qp_i),
            GopFrameType::P => i32::from(self.qp_p),
            GopFrameType::B => i32::from(self.qp_b) + params.pyramid_level as i32,
        }
    }
}

impl RateControl for CqpRateControl {
    fn init(&mut self, _config: &EncodeConfig) -> Result<()> {
        if [self.qp_i, self.qp_p, self.qp_b].iter().any(|&qp| qp > MAX_QP) {
            return Err(EncodeError::InvalidConfig(format!(
                "QP must not exceed {}",
                MAX_QP
            )));
        }
        Ok(())
    }

    fn get_qp(&mut self, params: &FrameParams) -> QpControl {
        QpControl {
            qp: clamp_qp(self.base_qp(params) + 2 * params.num_recode as i32),
            max_frame_size: self.max_frame_size,
        }
    }

    fn report(&mut self, params: &FrameParams, encoded_size: u32) -> BrcStatus {
        if self.max_frame_size == 0 || encoded_size <= self.max_frame_size {
            return BrcStatus::Ok;
        }
        if self.get_qp(params).qp >= MAX_QP {
            BrcStatus::Panic
        } else {
            BrcStatus::FrameTooBig
        }
    }
}

/// Bitrate target over a sliding window of lookahead complexities.
#[derive(Debug)]
pub struct LookaheadWindowRateControl {
    target_kbps: u32,
    frame_rate: u32,
    window_len: usize,
    window: VecDeque<u32>,
    base_qp: i32,
}

impl LookaheadWindowRateControl {
    /// Create a windowed controller.
    pub fn new(target_kbps: u32, frame_rate: u32) -> Self {
        Self {
            target_kbps,
            frame_rate,
            window_len: 1,
            window: VecDeque::new(),
            base_qp: i32::from(super::DEFAULT_QP),
        }
    }

    /// Per-frame budget in bytes.
    pub fn frame_budget(&self) -> u32 {
        (u64::from(self.target_kbps) * 1000 / 8 / u64::from(self.frame_rate.max(1))) as u32
    }

    fn average_complexity(&self) -> u32 {
        if self.window.is_empty() {
            return 0;
        }
        (self.window.iter().map(|&c| u64::from(c)).sum::<u64>() / self.window.len() as u64) as u32
    }

    fn recode_qp(&self, params: &FrameParams) -> u8 {
        clamp_qp(self.base_qp + 2 * params.num_recode as i32)
    }
}

impl RateControl for LookaheadWindowRateControl {
    fn init(&mut self, config: &EncodeConfig) -> Result<()> {
        if self.target_kbps == 0 || self.frame_rate == 0 {
            return Err(EncodeError::InvalidConfig(
                "lookahead rate control needs a bitrate and frame rate".into(),
            ));
        }
        self.window_len = config.lookahead_depth.max(1) as usize;
        self.window.clear();
        Ok(())
    }

    fn get_qp(&mut self, params: &FrameParams) -> QpControl {
        let offset = match params.complexity {
            Some(complexity) => {
                let reference = self.average_complexity();
                self.window.push_back(complexity);
                if self.window.len() > self.window_len {
                    self.window.pop_front();
                }
                complexity_offset(complexity, reference)
            }
            None => 0,
        };
        let type_offset = match params.frame_type {
            GopFrameType::Idr | GopFrameType::I => -2,
            GopFrameType::P => 0,
            GopFrameType::B => 2 + params.pyramid_level as i32,
        };
        QpControl {
            qp: clamp_qp(self.base_qp + type_offset + offset + 2 * params.num_recode as i32),
            max_frame_size: self.frame_budget().saturating_mul(4),
        }
    }

    fn report(&mut self, params: &FrameParams, encoded_size: u32) -> BrcStatus {
        let budget = self.frame_budget().max(1);
        if encoded_size > budget.saturating_mul(2) {
            self.base_qp = (self.base_qp + 1).min(i32::from(MAX_QP));
        } else if encoded_size < budget / 2 {
            self.base_qp = (self.base_qp - 1).max(0);
        }

        if encoded_size > budget.saturating_mul(4) {
            if self.recode_qp(params) >= MAX_QP {
                BrcStatus::Panic
            } else {
                BrcStatus::FrameTooBig
            }
        } else {
            BrcStatus::Ok
        }
    }
}

/// Constant quality scaled by lookahead complexity.
#[derive(Debug)]
pub struct LookaheadCrfRateControl {
    quality: u8,
    reference_complexity: Option<u32>,
}

impl LookaheadCrfRateControl {
    /// Create a quality-targeting controller.
    pub fn new(quality: u8) -> Self {
        Self {
            quality,
            reference_complexity: None,
        }
    }
}

impl RateControl for LookaheadCrfRateControl {
    fn init(&mut self, _config: &EncodeConfig) -> Result<()> {
        if self.quality > MAX_QP {
            return Err(EncodeError::InvalidConfig(format!(
                "quality must not exceed {}",
                MAX_QP
            )));
        }
        self.reference_complexity = None;
        Ok(())
    }

    fn get_qp(&mut self, params: &FrameParams) -> QpControl {
        // The first measured frame sets the scale.
        let offset = match params.complexity {
            Some(complexity) => {
                let reference = *self.reference_complexity.get_or_insert(complexity);
                complexity_offset(complexity, reference) / 2
            }
            None => 0,
        };
        let type_offset = match params.frame_type {
            GopFrameType::Idr | GopFrameType::I => -1,
            GopFrameType::P => 0,
            GopFrameType::B => 1 + params.pyramid_level as i32,
        };
        QpControl {
            qp: clamp_qp(i32::from(self.quality) + type_offset + offset + params.num_recode as i32),
            max_frame_size: 0,
        }
    }

    fn report(&mut self, _params: &FrameParams, _encoded_size: u32) -> BrcStatus {
        BrcStatus::Ok
    }
}
