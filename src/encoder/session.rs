//! Encode session driver.
//!
//! The session owns the task queues, the collaborators and the rate
//! controller. It has no thread of its own: every call to [`EncodeSession::drive`]
//! polls for completions, snapshots the queue depths, asks the scheduler for a
//! plan and executes it. [`EncodeSession::poll`] may run concurrently from a
//! completion thread.
//!
//! Queue and DPB state live behind one lock. Collaborators are called with
//! that lock released.

use std::sync::atomic::{AtomicBool, Ordering};

use arrayvec::ArrayVec;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::backend::{
    AnalysisStage, Collaborators, EncodeBackend, EncodeSubmission, ReferenceSlot, StageQuery,
};
use super::dpb::{DecRefPicMarking, RefListControl, RefListMods, MAX_REF_LIST_SIZE};
use super::gop::GopFrameType;
use super::pipeline::{PipelineScheduler, Stage, StagePlan};
use super::queue::{EncodeWait, QueueState};
use super::rate_control::{create_rate_control, BrcStatus, RateControl};
use super::task::{FieldPair, StageCompletion, Task, TaskId};
use super::{EncodeConfig, PicStruct};
use crate::error::{EncodeError, Result, TaskFailure};

/// One input picture.
#[derive(Debug, Clone, Default)]
pub struct FrameInput {
    /// Caller's raw surface handle.
    pub surface: u64,
    /// Caller's timestamp, passed through to the output.
    pub timestamp: u64,
    /// Reference list control for this picture.
    pub ref_control: RefListControl,
    /// Start a new IDR period at this picture.
    pub force_idr: bool,
}

impl FrameInput {
    /// Create an input with no per-frame controls.
    pub fn new(surface: u64, timestamp: u64) -> Self {
        Self {
            surface,
            timestamp,
            ..Default::default()
        }
    }

    /// Set the reference list control.
    pub fn with_ref_control(mut self, control: RefListControl) -> Self {
        self.ref_control = control;
        self
    }

    /// Request an IDR at this picture.
    pub fn with_force_idr(mut self) -> Self {
        self.force_idr = true;
        self
    }
}

/// A finished picture, delivered in encode order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Display order.
    pub display_order: u32,
    /// Encode order; `None` if the picture failed before selection.
    pub encode_order: Option<u32>,
    /// Caller's timestamp.
    pub timestamp: u64,
    /// Picture structure.
    pub pic_struct: PicStruct,
    /// Frame type per field.
    pub frame_type: FieldPair<GopFrameType>,
    /// Whether the picture is a reference.
    pub reference: bool,
    /// Picture order count per field.
    pub poc: FieldPair<i32>,
    /// frame_num.
    pub frame_num: u32,
    /// QP of the final encode.
    pub qp: u8,
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
    /// Coded size in bytes.
    pub encoded_size: Option<u32>,
    /// Recode attempts.
    pub recodes: u32,
    /// Scene change detected at this picture.
    pub scene_change: bool,
    /// Rate control gave up on this picture.
    pub brc_panic: bool,
    /// Terminal failure; no bitstream was produced.
    pub failure: Option<TaskFailure>,
}

impl EncodedFrame {
    fn from_task(task: &Task) -> Self {
        let submission = EncodeSubmission::for_task(task);
        Self {
            display_order: task.display_order,
            encode_order: task.encode_order,
            timestamp: task.timestamp,
            pic_struct: task.pic_struct,
            frame_type: task.frame_type,
            reference: task.is_reference(),
            poc: task.poc,
            frame_num: task.frame_num,
            qp: task.qp.qp,
            list0: submission.list0,
            list1: submission.list1,
            mods0: submission.mods0,
            mods1: submission.mods1,
            marking: submission.marking,
            encoded_size: task.encoded_size,
            recodes: task.recodes,
            scene_change: task.scene_change,
            brc_panic: task.brc_panic,
            failure: task.failure,
        }
    }

    /// Whether the picture was encoded.
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    /// Type of the first field.
    pub fn first_type(&self) -> GopFrameType {
        self.frame_type.get(self.pic_struct.first_field())
    }
}

type AnalysisSlot = Option<Mutex<Box<dyn AnalysisStage>>>;

/// One independent encode session.
pub struct EncodeSession {
    config: EncodeConfig,
    scheduler: PipelineScheduler,
    state: Mutex<QueueState>,
    encoder: Mutex<Box<dyn EncodeBackend>>,
    scene_change: AnalysisSlot,
    temporal_filter: AnalysisSlot,
    lookahead: AnalysisSlot,
    rate_control: Mutex<Box<dyn RateControl>>,
    closed: AtomicBool,
}

impl EncodeSession {
    /// Create a session.
    ///
    /// Optional stages enabled in the configuration but missing a
    /// collaborator are disabled.
    pub fn new(config: EncodeConfig, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            encoder,
            scene_change,
            temporal_filter,
            lookahead,
        } = collaborators;
        let config = effective_config(
            config,
            scene_change.is_some(),
            temporal_filter.is_some(),
            lookahead.is_some(),
        )?;
        let rate_control = init_rate_control(&config)?;
        let scheduler = PipelineScheduler::new(&config);
        let state = QueueState::new(&config, &scheduler);

        info!(
            "Created H.264 encode session {}x{}: gop={} ref_dist={} pyramid={} async_depth={} lookahead={}",
            config.width,
            config.height,
            config.gop_pic_size,
            config.gop_ref_dist,
            config.b_pyramid_depth,
            config.async_depth,
            config.lookahead_depth
        );

        Ok(Self {
            config,
            scheduler,
            state: Mutex::new(state),
            encoder: Mutex::new(encoder),
            scene_change: scene_change.map(Mutex::new),
            temporal_filter: temporal_filter.map(Mutex::new),
            lookahead: lookahead.map(Mutex::new),
            rate_control: Mutex::new(rate_control),
            closed: AtomicBool::new(false),
        })
    }

    /// Configuration in effect.
    pub fn config(&self) -> &EncodeConfig {
        &self.config
    }

    /// Stage scheduler.
    pub fn scheduler(&self) -> &PipelineScheduler {
        &self.scheduler
    }

    /// Advance the pipeline, optionally submitting a new frame.
    ///
    /// Returns the plan that was executed. If the frame could not be
    /// accepted, [`EncodeError::DeviceBusy`] is returned after the rest of
    /// the plan has run; submit the frame again on a later call.
    pub fn drive(&self, input: Option<FrameInput>, now: u64) -> Result<StagePlan> {
        self.ensure_open()?;
        self.poll(now);

        let plan = {
            let state = self.state.lock();
            if input.is_some() && state.is_flushing() {
                return Err(EncodeError::InvalidInput(
                    "frame submitted after flush".to_string(),
                ));
            }
            self.scheduler
                .schedule(input.is_some(), &state.depths(), state.is_flushing())
        };

        let mut input = input;
        for stage in plan.mask.iter() {
            for _ in 0..plan.quota(stage) {
                if !self.run_stage(stage, &mut input, now)? {
                    break;
                }
            }
        }

        if input.is_some() {
            return Err(EncodeError::DeviceBusy);
        }
        Ok(plan)
    }

    /// Signal end of stream and advance the pipeline.
    ///
    /// Call repeatedly, consuming output, until [`is_idle`](Self::is_idle).
    pub fn flush(&self, now: u64) -> Result<StagePlan> {
        self.ensure_open()?;
        self.state.lock().set_flushing();
        self.drive(None, now)
    }

    /// Collect completions of started stages.
    ///
    /// A stage running longer than the configured timeout is recorded as hung.
    pub fn poll(&self, now: u64) {
        let outstanding = self.state.lock().outstanding();
        if outstanding.is_empty() {
            return;
        }

        let mut completions = Vec::new();
        for item in outstanding {
            let completion = match item.stage {
                Stage::WaitEncode => item.handle.and_then(|handle| {
                    completion_of(self.encoder.lock().query(handle), StageCompletion::Encoded)
                }),
                stage => self.analysis(stage).and_then(|collaborator| {
                    completion_of(
                        collaborator.lock().query(item.task_id),
                        StageCompletion::Analysis,
                    )
                }),
            };
            let hung = self.config.stage_timeout > 0
                && now.saturating_sub(item.stage_start) > self.config.stage_timeout;
            let completion = completion.or(hung.then_some(StageCompletion::Hang));
            if let Some(completion) = completion {
                completions.push((item.stage, item.task_id, item.handle, completion));
            }
        }

        let mut state = self.state.lock();
        for (stage, id, handle, completion) in completions {
            state.record_completion(stage, id, handle, completion);
        }
    }

    /// Take the next finished picture in encode order.
    pub fn take_output(&self) -> Option<EncodedFrame> {
        let task = self.state.lock().take_finished()?;
        Some(EncodedFrame::from_task(&task))
    }

    /// Pictures accepted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight()
    }

    /// Nothing in flight and all output consumed.
    pub fn is_idle(&self) -> bool {
        self.state.lock().is_idle()
    }

    /// Discard all in-flight pictures and restart with a new configuration.
    pub fn reset(&mut self, config: EncodeConfig) -> Result<()> {
        self.ensure_open()?;
        let config = effective_config(
            config,
            self.scene_change.is_some(),
            self.temporal_filter.is_some(),
            self.lookahead.is_some(),
        )?;
        let rate_control = init_rate_control(&config)?;
        let discarded = self.state.get_mut().in_flight();

        self.scheduler = PipelineScheduler::new(&config);
        *self.state.get_mut() = QueueState::new(&config, &self.scheduler);
        *self.rate_control.get_mut() = rate_control;
        self.config = config;
        info!("Session reset, {} in-flight pictures discarded", discarded);
        Ok(())
    }

    /// Close the session. Later calls fail with [`EncodeError::SessionClosed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock();
        let discarded = state.in_flight();
        state.reset();
        info!("Session closed, {} in-flight pictures discarded", discarded);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EncodeError::SessionClosed);
        }
        Ok(())
    }

    fn analysis(&self, stage: Stage) -> Option<&Mutex<Box<dyn AnalysisStage>>> {
        match stage {
            Stage::StartScd | Stage::WaitScd => self.scene_change.as_ref(),
            Stage::StartMctf | Stage::WaitMctf => self.temporal_filter.as_ref(),
            Stage::StartLookahead | Stage::WaitLookahead => self.lookahead.as_ref(),
            _ => None,
        }
    }

    /// Run one step of a stage. Returns false when the stage had nothing to do.
    fn run_stage(&self, stage: Stage, input: &mut Option<FrameInput>, now: u64) -> Result<bool> {
        match stage {
            Stage::AcceptFrame => {
                let Some(frame) = input.as_ref() else {
                    return Ok(false);
                };
                match self.state.lock().accept(frame) {
                    Ok(_) => {
                        *input = None;
                        Ok(true)
                    }
                    Err(EncodeError::DeviceBusy) => Ok(false),
                    Err(err) => Err(err),
                }
            }
            Stage::StartScd | Stage::StartMctf | Stage::StartLookahead => {
                Ok(self.start_analysis(stage, now))
            }
            Stage::WaitScd | Stage::WaitMctf | Stage::WaitLookahead => {
                Ok(self.state.lock().finish_analysis(stage))
            }
            Stage::StartEncode => Ok(self.start_encode(now)),
            Stage::WaitEncode => Ok(self.wait_encode(now)),
        }
    }

    fn start_analysis(&self, stage: Stage, now: u64) -> bool {
        let Some(collaborator) = self.analysis(stage) else {
            return false;
        };
        let Some(request) = self.state.lock().take_for_analysis(stage) else {
            return false;
        };

        let submitted = collaborator.lock().submit(&request);
        let mut state = self.state.lock();
        match submitted {
            Ok(()) => {
                debug!("{:?} display_order={}", stage, request.display_order);
                state.commit_start(stage, request.task_id, None, now);
            }
            Err(err) => {
                warn!(
                    "{:?} refused display_order={}: {}",
                    stage, request.display_order, err
                );
                state.submit_failed(stage, request.task_id);
            }
        }
        true
    }

    fn start_encode(&self, now: u64) -> bool {
        let Some((id, params)) = self.state.lock().take_for_encode() else {
            return false;
        };
        let qp = self.rate_control.lock().get_qp(&params);
        let submission = self.state.lock().prepare_submission(id, qp);
        self.submit_encode(id, &submission, now, false);
        true
    }

    fn submit_encode(&self, id: TaskId, submission: &EncodeSubmission, now: u64, recode: bool) {
        let submitted = self.encoder.lock().submit(submission);
        let mut state = self.state.lock();
        match submitted {
            Ok(handle) => {
                debug!(
                    "Submitted display_order={} encode_order={} frame_num={} qp={} refs={}/{}",
                    submission.display_order,
                    submission.encode_order,
                    submission.frame_num,
                    submission.qp.qp,
                    submission.list0.len(),
                    submission.list1.len()
                );
                if recode {
                    state.commit_recode(id, handle, now);
                } else {
                    state.commit_start(Stage::StartEncode, id, Some(handle), now);
                }
            }
            Err(err) => {
                warn!(
                    "Encoder refused display_order={}: {}",
                    submission.display_order, err
                );
                state.submit_failed(Stage::StartEncode, id);
            }
        }
    }

    fn wait_encode(&self, now: u64) -> bool {
        let wait = self.state.lock().take_encoded();
        let (id, outcome, params) = match wait {
            EncodeWait::Idle => return false,
            EncodeWait::Handled => return true,
            EncodeWait::Encoded {
                task_id,
                outcome,
                params,
            } => (task_id, outcome, params),
        };

        let status = if outcome.overflow {
            BrcStatus::FrameTooBig
        } else {
            self.rate_control.lock().report(&params, outcome.encoded_size)
        };
        let recode = self.state.lock().complete_encode(id, outcome, status);

        if let Some(params) = recode {
            let qp = self.rate_control.lock().get_qp(&params);
            let submission = self.state.lock().prepare_submission(id, qp);
            self.submit_encode(id, &submission, now, true);
        }
        true
    }
}

impl std::fmt::Debug for EncodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodeSession")
            .field("config", &self.config)
            .field("scheduler", &self.scheduler)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Validate a configuration and switch off stages nobody implements.
fn effective_config(
    mut config: EncodeConfig,
    scene_change: bool,
    temporal_filter: bool,
    lookahead: bool,
) -> Result<EncodeConfig> {
    config.validate()?;
    if config.scene_change_detection && !scene_change {
        warn!("Scene-change detection requested without a detector, stage disabled");
        config.scene_change_detection = false;
    }
    if config.temporal_filter && !temporal_filter {
        warn!("Temporal filtering requested without a filter, stage disabled");
        config.temporal_filter = false;
    }
    if config.lookahead_enabled() && !lookahead {
        if config.rate_control.uses_lookahead() {
            return Err(EncodeError::InvalidConfig(
                "lookahead rate control requires a lookahead stage".to_string(),
            ));
        }
        warn!("Lookahead requested without an analysis stage, stage disabled");
        config.lookahead_depth = 0;
    }
    Ok(config)
}

fn init_rate_control(config: &EncodeConfig) -> Result<Box<dyn RateControl>> {
    let mut rate_control = create_rate_control(&config.rate_control);
    rate_control.init(config)?;
    Ok(rate_control)
}

fn completion_of<T>(
    query: StageQuery<T>,
    done: impl FnOnce(T) -> StageCompletion,
) -> Option<StageCompletion> {
    match query {
        StageQuery::Pending => None,
        StageQuery::Done(result) => Some(done(result)),
        StageQuery::Error { recoverable } => Some(StageCompletion::Error { recoverable }),
    }
}
