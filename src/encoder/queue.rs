//! Stage queues and task transitions.
//!
//! Every active task sits in exactly one queue, or is in transit between a
//! start stage taking it and the collaborator accepting it. Queues are FIFO;
//! only the reordering queue is read out of order, by the reorder engine.
//!
//! All methods here are synchronous and cheap. The session calls them under
//! its state lock and talks to collaborators in between.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use super::backend::{AnalysisRequest, AnalysisResult, EncodeOutcome, EncodeSubmission, SubmissionHandle};
use super::dpb::{DpbConfig, DpbManager, MAX_MMCO_OPS};
use super::gop::{FrameTypeGenerator, GopParams};
use super::pipeline::{PipelineScheduler, QueueDepths, Stage, NUM_STAGES};
use super::rate_control::{BrcStatus, FrameParams, QpControl};
use super::reorder::{ReorderEngine, ReorderFlags};
use super::session::FrameInput;
use super::task::{ReconPool, StageCompletion, Task, TaskId, TaskPool, TaskState};
use super::EncodeConfig;
use crate::error::{EncodeError, Result, TaskFailure};

/// Number of queues.
pub const NUM_QUEUES: usize = 10;

/// Queues a task can sit in, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Unused tasks.
    Free,
    /// Accepted, waiting for scene-change detection.
    Incoming,
    /// Submitted to scene-change detection.
    ScdStarted,
    /// Waiting for the temporal filter.
    ScdFinished,
    /// Submitted to the temporal filter.
    MctfStarted,
    /// Waiting for lookahead analysis.
    MctfFinished,
    /// Submitted to lookahead analysis.
    LookaheadStarted,
    /// Waiting for encode-order selection.
    Reordering,
    /// Submitted to the hardware encoder.
    Encoding,
    /// Done, waiting to be consumed.
    Finished,
}

impl QueueKind {
    /// All queues in pipeline order.
    pub const ALL: [QueueKind; NUM_QUEUES] = [
        QueueKind::Free,
        QueueKind::Incoming,
        QueueKind::ScdStarted,
        QueueKind::ScdFinished,
        QueueKind::MctfStarted,
        QueueKind::MctfFinished,
        QueueKind::LookaheadStarted,
        QueueKind::Reordering,
        QueueKind::Encoding,
        QueueKind::Finished,
    ];

    /// Position in pipeline order.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Input and in-flight queue of a start or wait stage.
    pub fn for_stage(stage: Stage) -> Option<(QueueKind, QueueKind)> {
        match stage {
            Stage::AcceptFrame => None,
            Stage::StartScd | Stage::WaitScd => Some((Self::Incoming, Self::ScdStarted)),
            Stage::StartMctf | Stage::WaitMctf => Some((Self::ScdFinished, Self::MctfStarted)),
            Stage::StartLookahead | Stage::WaitLookahead => {
                Some((Self::MctfFinished, Self::LookaheadStarted))
            }
            Stage::StartEncode | Stage::WaitEncode => Some((Self::Reordering, Self::Encoding)),
        }
    }
}

/// Start and wait stage of each pipeline step, in order.
const STEPS: [(Stage, Stage); 4] = [
    (Stage::StartScd, Stage::WaitScd),
    (Stage::StartMctf, Stage::WaitMctf),
    (Stage::StartLookahead, Stage::WaitLookahead),
    (Stage::StartEncode, Stage::WaitEncode),
];

/// A started task the poll path has to query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outstanding {
    /// Wait stage that will collect the result.
    pub stage: Stage,
    /// Task.
    pub task_id: TaskId,
    /// Hardware handle, for encode.
    pub handle: Option<SubmissionHandle>,
    /// Time the stage was started.
    pub stage_start: u64,
}

/// What the encode wait step found at the head of the encoding queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeWait {
    /// The head has not completed.
    Idle,
    /// The head failed and was retried or finished.
    Handled,
    /// The head was encoded and needs a rate-control verdict.
    Encoded {
        /// Task.
        task_id: TaskId,
        /// Hardware outcome.
        outcome: EncodeOutcome,
        /// Parameters to report to rate control.
        params: FrameParams,
    },
}

/// Queues, task pool and the per-stream state they drive.
#[derive(Debug)]
pub struct QueueState {
    config: EncodeConfig,
    enabled: [bool; NUM_STAGES],
    pool: TaskPool,
    queues: [VecDeque<TaskId>; NUM_QUEUES],
    /// Tasks taken by a start stage and not yet committed.
    transit: Vec<(TaskId, Stage)>,
    gop: FrameTypeGenerator,
    reorder: ReorderEngine,
    dpb: DpbManager,
    recon: ReconPool,
    flushing: bool,
}

impl QueueState {
    /// Allocate the task pool and put every task in the free queue.
    pub fn new(config: &EncodeConfig, scheduler: &PipelineScheduler) -> Self {
        let pool_size = config.task_pool_size();
        let dpb = DpbManager::new(DpbConfig::from_config(config));
        // Every unconsumed task may hold a surface on top of the DPB.
        let recon = ReconPool::new(dpb.capacity() + pool_size + 1);

        let mut queues: [VecDeque<TaskId>; NUM_QUEUES] = Default::default();
        queues[QueueKind::Free.index()].extend(0..pool_size);

        let mut enabled = [false; NUM_STAGES];
        for stage in Stage::ALL {
            enabled[stage.index()] = scheduler.is_enabled(stage);
        }

        Self {
            config: config.clone(),
            enabled,
            pool: TaskPool::new(pool_size),
            queues,
            transit: Vec::new(),
            gop: FrameTypeGenerator::new(GopParams::from_config(config)),
            reorder: ReorderEngine::new(),
            dpb,
            recon,
            flushing: false,
        }
    }

    /// Return every task to the free queue and restart the stream.
    pub fn reset(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
        for id in 0..self.pool.len() {
            self.pool.get_mut(id).reset();
        }
        self.queues[QueueKind::Free.index()].extend(0..self.pool.len());
        self.transit.clear();
        self.gop.reset();
        self.reorder.reset();
        self.dpb.reset();
        self.recon.clear();
        self.flushing = false;
    }

    /// Task pool.
    pub fn pool(&self) -> &TaskPool {
        &self.pool
    }

    /// DPB manager.
    pub fn dpb(&self) -> &DpbManager {
        &self.dpb
    }

    /// Number of tasks in a queue.
    pub fn len(&self, kind: QueueKind) -> usize {
        self.queues[kind.index()].len()
    }

    /// Tasks of a queue, head first.
    pub fn queue(&self, kind: QueueKind) -> impl Iterator<Item = TaskId> + '_ {
        self.queues[kind.index()].iter().copied()
    }

    /// Whether end of stream has been signalled.
    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    /// Signal end of stream.
    pub fn set_flushing(&mut self) {
        if !self.flushing {
            debug!("Flushing after {} frames", self.gop.display_order());
        }
        self.flushing = true;
    }

    /// Tasks accepted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.pool.len() - self.len(QueueKind::Free) - self.len(QueueKind::Finished)
    }

    /// Nothing is in flight and every output has been consumed.
    pub fn is_idle(&self) -> bool {
        self.len(QueueKind::Free) == self.pool.len()
    }

    /// Snapshot of queue depths for the scheduler.
    pub fn depths(&self) -> QueueDepths {
        let mut depths = QueueDepths {
            free: self.len(QueueKind::Free) as u32,
            ..Default::default()
        };

        for (start, wait) in STEPS {
            let Some((input, started)) = QueueKind::for_stage(start) else {
                continue;
            };
            let ready = if start == Stage::StartEncode {
                let pending = self.pending();
                let upstream = self.upstream();
                let arrived = self.gop.display_order();
                if self.reorder.has_eligible(&self.pool, &pending, &upstream, arrived, self.flags()) {
                    pending.len()
                } else {
                    0
                }
            } else {
                self.len(input)
            };
            depths.set_input(start, ready as u32);
            depths.set_occupied(start, self.len(started) as u32);

            let completed = self.queues[started.index()]
                .iter()
                .take_while(|&&id| self.pool.get(id).completion.is_some())
                .count();
            depths.set_input(wait, completed as u32);
        }

        depths
    }

    /// Take a free task for a new picture and stamp its GOP layout.
    pub fn accept(&mut self, input: &FrameInput) -> Result<TaskId> {
        if self.flushing {
            return Err(EncodeError::InvalidInput(
                "frame submitted after flush".to_string(),
            ));
        }
        if input.ref_control.mark_current_long_term && self.config.long_term_per_layer == 0 {
            return Err(EncodeError::InvalidInput(
                "long-term marking requested without long-term slots".to_string(),
            ));
        }
        if input.ref_control.max_mmco_ops() > MAX_MMCO_OPS {
            return Err(EncodeError::InvalidInput(format!(
                "reference control needs up to {} MMCOs, at most {} fit",
                input.ref_control.max_mmco_ops(),
                MAX_MMCO_OPS
            )));
        }
        let id = self.pop(QueueKind::Free).ok_or(EncodeError::DeviceBusy)?;

        let display_order = self.gop.display_order();
        if input.force_idr && display_order > 0 {
            self.gop.request_idr();
            self.reorder.force_cut(display_order);
            info!("IDR requested at display_order={}", display_order);
        }
        let frame = self.gop.get_next_frame();

        let task = self.pool.get_mut(id);
        task.reset();
        task.state = TaskState::Active;
        task.surface = input.surface;
        task.timestamp = input.timestamp;
        task.display_order = display_order;
        task.pic_struct = self.config.pic_struct;
        task.ref_control = input.ref_control.clone();
        task.force_idr = input.force_idr;
        task.stamp(&frame);
        debug!(
            "Accepted display_order={} as {:?} (task {})",
            display_order,
            task.first_type(),
            id
        );

        let dest = self.downstream(Stage::AcceptFrame);
        self.push(dest, id);
        Ok(id)
    }

    /// Take the head of an analysis stage's input.
    pub fn take_for_analysis(&mut self, stage: Stage) -> Option<AnalysisRequest> {
        let (input, _) = QueueKind::for_stage(stage)?;
        let id = self.pop(input)?;
        self.transit.push((id, stage));
        Some(AnalysisRequest::for_task(self.pool.get(id)))
    }

    /// Select the next task to encode and prepare its DPB state.
    ///
    /// Returns the task with the parameters rate control needs for its QP.
    pub fn take_for_encode(&mut self) -> Option<(TaskId, FrameParams)> {
        let pending = self.pending();
        let upstream = self.upstream();
        let arrived = self.gop.display_order();
        let flags = self.flags();
        let id = self
            .reorder
            .select_next_to_encode(&mut self.pool, &pending, &upstream, arrived, flags)?;
        self.remove(QueueKind::Reordering, id);

        if !self.pool.get(id).configured {
            let Some(recon) = self.recon.acquire() else {
                warn!("No reconstruction surface for task {}", id);
                self.queues[QueueKind::Reordering.index()].push_front(id);
                return None;
            };
            let task = self.pool.get_mut(id);
            task.recon = Some(recon);
            let change = self.dpb.configure_task(task);
            if let Some(r) = change.inserted {
                self.recon.retain(r);
            }
            for r in change.evicted {
                self.recon.release(r);
            }
        }

        self.transit.push((id, Stage::StartEncode));
        Some((id, FrameParams::for_task(self.pool.get(id))))
    }

    /// Store the QP of a task in transit and build its hardware submission.
    pub fn prepare_submission(&mut self, id: TaskId, qp: QpControl) -> EncodeSubmission {
        let task = self.pool.get_mut(id);
        task.qp = qp;
        EncodeSubmission::for_task(task)
    }

    /// A collaborator accepted a task: move it to the stage's in-flight queue.
    pub fn commit_start(
        &mut self,
        stage: Stage,
        id: TaskId,
        handle: Option<SubmissionHandle>,
        now: u64,
    ) {
        let Some((_, started)) = QueueKind::for_stage(stage) else {
            return;
        };
        self.leave_transit(id);
        let task = self.pool.get_mut(id);
        task.handle = handle;
        task.stage_start = now;
        task.completion = None;
        self.push(started, id);
    }

    /// A collaborator refused a task.
    pub fn submit_failed(&mut self, stage: Stage, id: TaskId) {
        self.leave_transit(id);
        self.retry_or_fail(stage, id, TaskFailure::Submission(stage));
    }

    /// Started tasks without a recorded completion.
    pub fn outstanding(&self) -> Vec<Outstanding> {
        STEPS
            .iter()
            .filter_map(|&(start, wait)| Some((wait, QueueKind::for_stage(start)?.1)))
            .flat_map(|(wait, started)| {
                self.queue(started).filter_map(move |id| {
                    let task = self.pool.get(id);
                    task.completion.is_none().then_some(Outstanding {
                        stage: wait,
                        task_id: id,
                        handle: task.handle,
                        stage_start: task.stage_start,
                    })
                })
            })
            .collect()
    }

    /// Record a completion found by the poll path.
    ///
    /// Ignored if the task already left the stage or was resubmitted under
    /// another handle.
    pub fn record_completion(
        &mut self,
        stage: Stage,
        id: TaskId,
        handle: Option<SubmissionHandle>,
        completion: StageCompletion,
    ) {
        let Some((_, started)) = QueueKind::for_stage(stage) else {
            return;
        };
        if !self.queues[started.index()].contains(&id) {
            return;
        }
        let task = self.pool.get_mut(id);
        if task.handle != handle {
            return;
        }
        match (task.completion, completion) {
            (None, _) => {}
            // A result replaces an error or hang verdict not yet collected.
            (
                Some(StageCompletion::Error { .. } | StageCompletion::Hang),
                StageCompletion::Analysis(_) | StageCompletion::Encoded(_),
            ) => debug!(
                "Task {} (display_order={}) completed in {:?} after a failure verdict",
                id, task.display_order, stage
            ),
            _ => return,
        }
        match completion {
            StageCompletion::Hang => warn!(
                "Task {} (display_order={}) hung in {:?}",
                id, task.display_order, stage
            ),
            StageCompletion::Error { recoverable } => warn!(
                "Task {} (display_order={}) failed in {:?}, recoverable={}",
                id, task.display_order, stage, recoverable
            ),
            _ => {}
        }
        task.completion = Some(completion);
    }

    /// Collect the completed head of an analysis stage.
    ///
    /// Returns false if the head has not completed.
    pub fn finish_analysis(&mut self, stage: Stage) -> bool {
        let Some((_, started)) = QueueKind::for_stage(stage) else {
            return false;
        };
        let Some(&id) = self.queues[started.index()].front() else {
            return false;
        };
        let Some(completion) = self.pool.get(id).completion else {
            return false;
        };
        self.pop(started);

        match completion {
            StageCompletion::Analysis(result) => {
                let task = self.pool.get_mut(id);
                task.completion = None;
                task.retries = 0;
                let display_order = task.display_order;
                match result {
                    AnalysisResult::SceneChange(detected) => {
                        task.scene_change = detected;
                        if detected {
                            self.scene_change(display_order);
                        }
                    }
                    AnalysisResult::Filtered { surface } => task.filtered_surface = Some(surface),
                    AnalysisResult::Complexity(c) => task.complexity = Some(c),
                }
                let dest = self.downstream(stage);
                self.push(dest, id);
            }
            StageCompletion::Error { recoverable: true } => {
                self.retry_or_fail(stage, id, TaskFailure::Stage(stage))
            }
            StageCompletion::Error { recoverable: false } | StageCompletion::Encoded(_) => {
                self.fail(id, TaskFailure::Stage(stage))
            }
            StageCompletion::Hang => self.fail(id, TaskFailure::Hang(stage)),
        }
        true
    }

    /// Collect the completed head of the encoding queue.
    pub fn take_encoded(&mut self) -> EncodeWait {
        let Some(&id) = self.queues[QueueKind::Encoding.index()].front() else {
            return EncodeWait::Idle;
        };
        let Some(completion) = self.pool.get(id).completion else {
            return EncodeWait::Idle;
        };
        self.pop(QueueKind::Encoding);

        let stage = Stage::WaitEncode;
        match completion {
            StageCompletion::Encoded(outcome) => {
                self.transit.push((id, stage));
                let task = self.pool.get_mut(id);
                task.completion = None;
                return EncodeWait::Encoded {
                    task_id: id,
                    outcome,
                    params: FrameParams::for_task(task),
                };
            }
            StageCompletion::Error { recoverable: true } => {
                self.retry_or_fail(stage, id, TaskFailure::Stage(stage))
            }
            StageCompletion::Error { recoverable: false } | StageCompletion::Analysis(_) => {
                self.fail(id, TaskFailure::Stage(stage))
            }
            StageCompletion::Hang => self.fail(id, TaskFailure::Hang(stage)),
        }
        EncodeWait::Handled
    }

    /// Apply the rate-control verdict to an encoded task.
    ///
    /// Returns the parameters for a recode when one is needed; the task then
    /// stays in transit until the resubmission is committed.
    pub fn complete_encode(
        &mut self,
        id: TaskId,
        outcome: EncodeOutcome,
        status: BrcStatus,
    ) -> Option<FrameParams> {
        self.leave_transit(id);
        let max_recodes = self.config.max_recodes;
        let task = self.pool.get_mut(id);

        if status.needs_recode() {
            if task.recodes < max_recodes {
                task.recodes += 1;
                warn!(
                    "Recoding display_order={} ({:?}, {} bytes), attempt {}",
                    task.display_order, status, outcome.encoded_size, task.recodes
                );
                self.transit.push((id, Stage::StartEncode));
                return Some(FrameParams::for_task(self.pool.get(id)));
            }
            self.fail(id, TaskFailure::RecodeLimit);
            return None;
        }

        if status == BrcStatus::Panic {
            warn!(
                "Rate control panic at display_order={}, frame accepted",
                task.display_order
            );
            task.brc_panic = true;
        }
        task.encoded_size = Some(outcome.encoded_size);
        task.retries = 0;
        debug!(
            "Encoded display_order={} encode_order={:?} size={}",
            task.display_order, task.encode_order, outcome.encoded_size
        );
        self.finish(id);
        None
    }

    /// A recode was resubmitted: put the task back at the head of the encoding queue.
    pub fn commit_recode(&mut self, id: TaskId, handle: SubmissionHandle, now: u64) {
        self.leave_transit(id);
        let task = self.pool.get_mut(id);
        task.handle = Some(handle);
        task.stage_start = now;
        task.completion = None;
        self.queues[QueueKind::Encoding.index()].push_front(id);
    }

    /// Pop the next finished task in encode order and free its slot.
    ///
    /// Returns `None` while an earlier picture in encode order is still in flight.
    pub fn take_finished(&mut self) -> Option<Task> {
        let &id = self.queues[QueueKind::Finished.index()].front()?;
        if let Some(order) = self.pool.get(id).encode_order {
            let earlier = |other: TaskId| {
                self.pool
                    .get(other)
                    .encode_order
                    .is_some_and(|e| e < order)
            };
            let blocked = self.queue(QueueKind::Reordering).any(earlier)
                || self.queue(QueueKind::Encoding).any(earlier)
                || self.transit.iter().any(|&(t, _)| earlier(t));
            if blocked {
                return None;
            }
        }

        self.pop(QueueKind::Finished);
        let task = self.pool.get_mut(id);
        let out = task.clone();
        task.reset();
        if let Some(r) = out.recon {
            self.recon.release(r);
        }
        self.push(QueueKind::Free, id);
        Some(out)
    }

    fn flags(&self) -> ReorderFlags {
        ReorderFlags {
            gop_strict: self.config.strict_gop,
            flush: self.flushing,
            close_gop_for_scene_change: self.config.close_gop_for_scene_change,
        }
    }

    fn pending(&self) -> Vec<TaskId> {
        self.queue(QueueKind::Reordering).collect()
    }

    /// Tasks accepted but not yet in the reordering queue.
    fn upstream(&self) -> Vec<TaskId> {
        let queues = [
            QueueKind::Incoming,
            QueueKind::ScdStarted,
            QueueKind::ScdFinished,
            QueueKind::MctfStarted,
            QueueKind::MctfFinished,
            QueueKind::LookaheadStarted,
        ];
        queues
            .into_iter()
            .flat_map(|q| self.queue(q))
            .chain(
                self.transit
                    .iter()
                    .filter(|(_, stage)| stage.index() < Stage::StartEncode.index())
                    .map(|&(id, _)| id),
            )
            .collect()
    }

    /// Input queue of the first enabled step after `stage`.
    fn downstream(&self, stage: Stage) -> QueueKind {
        STEPS
            .iter()
            .find(|(start, _)| start.index() > stage.index() && self.enabled[start.index()])
            .and_then(|&(start, _)| QueueKind::for_stage(start))
            .map_or(QueueKind::Reordering, |(input, _)| input)
    }

    /// Close the GOP at a detected scene change.
    fn scene_change(&mut self, display_order: u32) {
        if !self.config.close_gop_for_scene_change || self.config.strict_gop {
            debug!("Scene change at display_order={}", display_order);
            return;
        }
        // A later picture already encoded would end up before the new IDR.
        let encoded_after = self.pool.iter().any(|t| {
            t.state == TaskState::Active && t.is_selected() && t.display_order > display_order
        });
        if encoded_after {
            debug!(
                "Scene change at display_order={} too late to close the GOP",
                display_order
            );
            return;
        }

        self.gop.restart_at(display_order);
        for id in 0..self.pool.len() {
            let task = self.pool.get(id);
            if task.state != TaskState::Active
                || task.is_selected()
                || task.display_order < display_order
            {
                continue;
            }
            if let Some(frame) = self.gop.frame_at(task.display_order) {
                self.pool.get_mut(id).stamp(&frame);
            }
        }
        self.reorder.signal_scene_change(display_order);
        info!("Scene change at display_order={}, new IDR period", display_order);
    }

    fn retry_or_fail(&mut self, stage: Stage, id: TaskId, failure: TaskFailure) {
        let max_retries = self.config.max_stage_retries;
        let task = self.pool.get_mut(id);
        task.completion = None;
        task.handle = None;
        if task.retries < max_retries {
            task.retries += 1;
            warn!(
                "Retrying display_order={} in {:?} ({}/{})",
                task.display_order, stage, task.retries, max_retries
            );
            if let Some((input, _)) = QueueKind::for_stage(stage) {
                self.queues[input.index()].push_front(id);
            }
            return;
        }
        self.fail(id, failure);
    }

    fn fail(&mut self, id: TaskId, failure: TaskFailure) {
        let task = self.pool.get_mut(id);
        warn!(
            "Frame display_order={} failed: {}",
            task.display_order, failure
        );
        task.fail(failure);
        task.completion = None;
        self.finish(id);
    }

    /// Move a task to the finished queue, keeping encode order.
    fn finish(&mut self, id: TaskId) {
        self.pool.get_mut(id).state = TaskState::Finished;
        let finished = &self.queues[QueueKind::Finished.index()];
        let pos = match self.pool.get(id).encode_order {
            Some(order) => finished
                .iter()
                .position(|&o| self.pool.get(o).encode_order.is_some_and(|e| e > order))
                .unwrap_or(finished.len()),
            None => finished.len(),
        };
        self.queues[QueueKind::Finished.index()].insert(pos, id);
    }

    fn leave_transit(&mut self, id: TaskId) {
        self.transit.retain(|&(t, _)| t != id);
    }

    fn pop(&mut self, kind: QueueKind) -> Option<TaskId> {
        self.queues[kind.index()].pop_front()
    }

    fn push(&mut self, kind: QueueKind, id: TaskId) {
        self.queues[kind.index()].push_back(id);
    }

    fn remove(&mut self, kind: QueueKind, id: TaskId) {
        self.queues[kind.index()].retain(|&t| t != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::dpb::RefListControl;
    use crate::encoder::gop::GopFrameType;

    fn new_state(config: &EncodeConfig) -> QueueState {
        QueueState::new(config, &PipelineScheduler::new(config))
    }

    fn frame(surface: u64) -> FrameInput {
        FrameInput::new(surface, surface * 10)
    }

    /// Run one task through encode with an Ok verdict.
    fn encode_next(state: &mut QueueState, now: u64) -> Option<TaskId> {
        let (id, _) = state.take_for_encode()?;
        let _ = state.prepare_submission(id, QpControl { qp: 30, max_frame_size: 0 });
        state.commit_start(Stage::StartEncode, id, Some(id as u64), now);
        let outcome = EncodeOutcome {
            encoded_size: 1000,
            overflow: false,
        };
        let handle = state.pool().get(id).handle;
        state.record_completion(Stage::WaitEncode, id, handle, StageCompletion::Encoded(outcome));
        match state.take_encoded() {
            EncodeWait::Encoded { task_id, outcome, .. } => {
                assert!(state.complete_encode(task_id, outcome, BrcStatus::Ok).is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        Some(id)
    }

    #[test]
    fn test_accept_routes_past_disabled_stages() {
        let config = EncodeConfig::h264(640, 480).with_gop(30, 1);
        let mut state = new_state(&config);
        let free = state.len(QueueKind::Free);

        let id = state.accept(&frame(1)).unwrap();
        assert_eq!(state.len(QueueKind::Reordering), 1);
        assert_eq!(state.len(QueueKind::Free), free - 1);
        assert_eq!(state.pool().get(id).first_type(), GopFrameType::Idr);

        let config = config.with_analysis(true, false);
        let mut state = new_state(&config);
        state.accept(&frame(1)).unwrap();
        assert_eq!(state.len(QueueKind::Incoming), 1);
    }

    #[test]
    fn test_accept_busy_when_pool_exhausted() {
        let config = EncodeConfig::h264(640, 480).with_gop(30, 1);
        let mut state = new_state(&config);
        for i in 0..config.task_pool_size() {
            state.accept(&frame(i as u64)).unwrap();
        }
        assert!(matches!(state.accept(&frame(99)), Err(EncodeError::DeviceBusy)));
    }

    #[test]
    fn test_accept_after_flush_rejected() {
        let mut state = new_state(&EncodeConfig::h264(640, 480));
        state.set_flushing();
        assert!(matches!(state.accept(&frame(1)), Err(EncodeError::InvalidInput(_))));
    }

    #[test]
    fn test_accept_rejects_oversized_ref_control() {
        let config = EncodeConfig::h264(1920, 1080).with_layers(1, 2);
        let mut state = new_state(&config);

        let mut control = RefListControl::default();
        for i in 0..16 {
            control.rejected.push(i);
            control.long_term.push(100 + i);
        }
        assert!(control.max_mmco_ops() > MAX_MMCO_OPS);
        let input = frame(1).with_ref_control(control.clone());
        assert!(matches!(state.accept(&input), Err(EncodeError::InvalidInput(_))));
        assert_eq!(state.len(QueueKind::Free), state.pool().len());

        control.rejected.truncate(8);
        control.long_term.truncate(8);
        control.mark_current_long_term = true;
        assert!(state.accept(&frame(2).with_ref_control(control)).is_ok());
    }

    #[test]
    fn test_encode_round_trip_frees_task() {
        let config = EncodeConfig::h264(640, 480).with_gop(30, 1);
        let mut state = new_state(&config);
        state.accept(&frame(1)).unwrap();
        assert_eq!(state.depths().input(Stage::StartEncode), 1);

        let id = encode_next(&mut state, 5).unwrap();
        assert_eq!(state.len(QueueKind::Finished), 1);
        assert_eq!(state.in_flight(), 0);

        let out = state.take_finished().unwrap();
        assert_eq!(out.id, id);
        assert_eq!(out.encode_order, Some(0));
        assert_eq!(out.encoded_size, Some(1000));
        assert_eq!(out.qp.qp, 30);
        assert!(state.is_idle());
        // The IDR stays in the DPB.
        assert_eq!(state.dpb().entries().len(), 1);
    }

    #[test]
    fn test_wait_snapshot_counts_completed_head_only() {
        let config = EncodeConfig::h264(640, 480).with_gop(30, 1);
        let mut state = new_state(&config);
        for i in 0..2 {
            state.accept(&frame(i)).unwrap();
        }
        let (a, _) = state.take_for_encode().unwrap();
        state.commit_start(Stage::StartEncode, a, Some(0), 0);
        let (b, _) = state.take_for_encode().unwrap();
        state.commit_start(Stage::StartEncode, b, Some(1), 0);
        assert_eq!(state.depths().occupied[Stage::StartEncode.index()], 2);

        // Second task done first: the head still blocks.
        let handle = state.pool().get(b).handle;
        state.record_completion(Stage::WaitEncode, b, handle, StageCompletion::Encoded(EncodeOutcome::default()));
        assert_eq!(state.depths().input(Stage::WaitEncode), 0);
        assert_eq!(state.take_encoded(), EncodeWait::Idle);

        let handle = state.pool().get(a).handle;
        state.record_completion(Stage::WaitEncode, a, handle, StageCompletion::Encoded(EncodeOutcome::default()));
        assert_eq!(state.depths().input(Stage::WaitEncode), 2);
        assert_eq!(state.outstanding().len(), 0);
    }

    #[test]
    fn test_recoverable_analysis_error_retries_then_fails() {
        let config = EncodeConfig::h264(640, 480)
            .with_analysis(true, false)
            .with_limits(2000, 1, 2);
        let mut state = new_state(&config);
        let id = state.accept(&frame(1)).unwrap();

        for attempt in 0..2 {
            let request = state.take_for_analysis(Stage::StartScd).unwrap();
            assert_eq!(request.task_id, id);
            state.commit_start(Stage::StartScd, id, None, 0);
            let handle = state.pool().get(id).handle;
            state.record_completion(Stage::WaitScd, id, handle, StageCompletion::Error { recoverable: true });
            assert!(state.finish_analysis(Stage::WaitScd));
            if attempt == 0 {
                assert_eq!(state.len(QueueKind::Incoming), 1);
            }
        }

        assert_eq!(state.len(QueueKind::Finished), 1);
        let out = state.take_finished().unwrap();
        assert_eq!(out.failure, Some(TaskFailure::Stage(Stage::WaitScd)));
    }

    #[test]
    fn test_hang_fails_task() {
        let config = EncodeConfig::h264(640, 480).with_analysis(true, false);
        let mut state = new_state(&config);
        let id = state.accept(&frame(1)).unwrap();
        state.take_for_analysis(Stage::StartScd).unwrap();
        state.commit_start(Stage::StartScd, id, None, 10);
        assert_eq!(state.outstanding()[0].stage_start, 10);

        let handle = state.pool().get(id).handle;
        state.record_completion(Stage::WaitScd, id, handle, StageCompletion::Hang);
        assert!(state.finish_analysis(Stage::WaitScd));
        let out = state.take_finished().unwrap();
        assert!(out.failure.is_some_and(|f| f.is_hang()));
    }

    #[test]
    fn test_late_result_replaces_uncollected_failure() {
        let config = EncodeConfig::h264(640, 480).with_analysis(true, false);
        let mut state = new_state(&config);
        let id = state.accept(&frame(1)).unwrap();
        state.take_for_analysis(Stage::StartScd).unwrap();
        state.commit_start(Stage::StartScd, id, None, 10);

        let handle = state.pool().get(id).handle;
        state.record_completion(Stage::WaitScd, id, handle, StageCompletion::Hang);
        let done = StageCompletion::Analysis(AnalysisResult::SceneChange(false));
        state.record_completion(Stage::WaitScd, id, handle, done);
        // Once a result is in, later failures are ignored.
        state.record_completion(Stage::WaitScd, id, handle, StageCompletion::Error { recoverable: false });
        assert_eq!(state.pool().get(id).completion, Some(done));

        assert!(state.finish_analysis(Stage::WaitScd));
        assert!(state.take_finished().is_none());
        assert_eq!(state.len(QueueKind::Reordering), 1);
    }

    #[test]
    fn test_scene_change_restamps_later_frames() {
        let config = EncodeConfig::h264(640, 480)
            .with_gop(0, 1)
            .with_analysis(true, false)
            .with_close_gop_for_scene_change(true);
        let mut state = new_state(&config);
        let ids: Vec<TaskId> = (0..3).map(|i| state.accept(&frame(i)).unwrap()).collect();

        for (i, &id) in ids.iter().enumerate() {
            state.take_for_analysis(Stage::StartScd).unwrap();
            state.commit_start(Stage::StartScd, id, None, 0);
            let detected = i == 1;
            state.record_completion(
                Stage::WaitScd,
                id,
                None,
                StageCompletion::Analysis(AnalysisResult::SceneChange(detected)),
            );
            assert!(state.finish_analysis(Stage::WaitScd));
        }

        assert!(state.pool().get(ids[1]).scene_change);
        assert_eq!(state.pool().get(ids[1]).first_type(), GopFrameType::Idr);
        assert_eq!(state.pool().get(ids[2]).idr_display_order, 1);

        let mut order = Vec::new();
        while let Some(id) = encode_next(&mut state, 0) {
            order.push(state.pool().get(id).display_order);
        }
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(state.dpb().idr_display_order(), 1);
    }

    #[test]
    fn test_recode_then_limit() {
        let config = EncodeConfig::h264(640, 480)
            .with_gop(30, 1)
            .with_limits(2000, 0, 1);
        let mut state = new_state(&config);
        state.accept(&frame(1)).unwrap();
        let (id, _) = state.take_for_encode().unwrap();
        state.commit_start(Stage::StartEncode, id, Some(1), 0);

        let outcome = EncodeOutcome {
            encoded_size: 9000,
            overflow: true,
        };
        let handle = state.pool().get(id).handle;
        state.record_completion(Stage::WaitEncode, id, handle, StageCompletion::Encoded(outcome));
        assert!(matches!(state.take_encoded(), EncodeWait::Encoded { .. }));
        let params = state.complete_encode(id, outcome, BrcStatus::FrameTooBig).unwrap();
        assert_eq!(params.num_recode, 1);
        // Still in flight while the recode is being submitted.
        assert!(state.take_finished().is_none());

        state.commit_recode(id, 2, 0);
        let handle = state.pool().get(id).handle;
        state.record_completion(Stage::WaitEncode, id, handle, StageCompletion::Encoded(outcome));
        assert!(matches!(state.take_encoded(), EncodeWait::Encoded { .. }));
        assert!(state.complete_encode(id, outcome, BrcStatus::FrameTooBig).is_none());

        let out = state.take_finished().unwrap();
        assert_eq!(out.failure, Some(TaskFailure::RecodeLimit));
        assert_eq!(out.encoded_size, None);
    }

    #[test]
    fn test_output_waits_for_earlier_encode_order() {
        let config = EncodeConfig::h264(640, 480).with_gop(30, 1).with_limits(2000, 1, 0);
        let mut state = new_state(&config);
        for i in 0..2 {
            state.accept(&frame(i)).unwrap();
        }
        let (a, _) = state.take_for_encode().unwrap();
        state.commit_start(Stage::StartEncode, a, Some(0), 0);
        let (b, _) = state.take_for_encode().unwrap();
        state.commit_start(Stage::StartEncode, b, Some(1), 0);

        // First picture fails recoverably and goes back for a retry.
        let handle = state.pool().get(a).handle;
        state.record_completion(Stage::WaitEncode, a, handle, StageCompletion::Error { recoverable: true });
        assert_eq!(state.take_encoded(), EncodeWait::Handled);
        let handle = state.pool().get(b).handle;
        state.record_completion(Stage::WaitEncode, b, handle, StageCompletion::Encoded(EncodeOutcome::default()));
        assert!(matches!(state.take_encoded(), EncodeWait::Encoded { .. }));
        assert!(state.complete_encode(b, EncodeOutcome::default(), BrcStatus::Ok).is_none());
        assert!(state.take_finished().is_none());

        // The retry keeps its encode order and is submitted without reconfiguring.
        let frame_num = state.pool().get(a).frame_num;
        assert_eq!(encode_next(&mut state, 0), Some(a));
        assert_eq!(state.pool().get(a).frame_num, frame_num);
        assert_eq!(state.take_finished().map(|t| t.id), Some(a));
        assert_eq!(state.take_finished().map(|t| t.id), Some(b));
    }

    #[test]
    fn test_reset_returns_all_tasks() {
        let config = EncodeConfig::h264(640, 480).with_gop(30, 1);
        let mut state = new_state(&config);
        state.accept(&frame(1)).unwrap();
        encode_next(&mut state, 0);
        state.accept(&frame(2)).unwrap();
        state.set_flushing();

        state.reset();
        assert!(state.is_idle());
        assert!(!state.is_flushing());
        assert!(state.dpb().entries().is_empty());
        let id = state.accept(&frame(3)).unwrap();
        assert_eq!(state.pool().get(id).display_order, 0);
    }
}
