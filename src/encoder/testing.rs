//! In-memory collaborators for tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use super::backend::{
    AnalysisRequest, AnalysisResult, AnalysisStage, EncodeBackend, EncodeOutcome,
    EncodeSubmission, StageQuery, SubmissionHandle,
};
use super::rate_control::{BrcStatus, FrameParams, QpControl, RateControl};
use super::task::TaskId;
use super::EncodeConfig;
use crate::error::{EncodeError, Result};

/// Submissions seen by a mock encoder, in submission order.
pub(crate) type SubmissionLog = Arc<Mutex<Vec<EncodeSubmission>>>;

struct Job {
    display_order: u32,
    polls: u32,
    result: Option<StageQuery<EncodeOutcome>>,
}

/// Hardware encoder that completes every picture after a number of polls.
pub(crate) struct MockEncoder {
    log: SubmissionLog,
    latency: u32,
    encoded_size: u32,
    next_handle: SubmissionHandle,
    jobs: HashMap<SubmissionHandle, Job>,
    hang: HashSet<u32>,
    refuse: HashSet<u32>,
    errors: HashMap<u32, (u32, bool)>,
    overflows: HashMap<u32, u32>,
}

impl MockEncoder {
    pub(crate) fn new() -> Self {
        Self {
            log: SubmissionLog::default(),
            latency: 0,
            encoded_size: 1000,
            next_handle: 1,
            jobs: HashMap::new(),
            hang: HashSet::new(),
            refuse: HashSet::new(),
            errors: HashMap::new(),
            overflows: HashMap::new(),
        }
    }

    /// Shared handle on the submission log.
    pub(crate) fn log(&self) -> SubmissionLog {
        self.log.clone()
    }

    /// Polls answered with pending before a picture completes.
    pub(crate) fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    /// Never complete a picture.
    pub(crate) fn with_hang(mut self, display_order: u32) -> Self {
        self.hang.insert(display_order);
        self
    }

    /// Refuse every submission of a picture.
    pub(crate) fn with_refusal(mut self, display_order: u32) -> Self {
        self.refuse.insert(display_order);
        self
    }

    /// Report `count` errors for a picture before completing it.
    pub(crate) fn with_errors(mut self, display_order: u32, count: u32, recoverable: bool) -> Self {
        self.errors.insert(display_order, (count, recoverable));
        self
    }

    /// Overflow the first `count` encodes of a picture.
    pub(crate) fn with_overflows(mut self, display_order: u32, count: u32) -> Self {
        self.overflows.insert(display_order, count);
        self
    }
}

impl EncodeBackend for MockEncoder {
    fn submit(&mut self, submission: &EncodeSubmission) -> Result<SubmissionHandle> {
        if self.refuse.contains(&submission.display_order) {
            return Err(EncodeError::Backend("queue full".to_string()));
        }
        self.log.lock().push(submission.clone());
        let handle = self.next_handle;
        self.next_handle += 1;
        self.jobs.insert(
            handle,
            Job {
                display_order: submission.display_order,
                polls: 0,
                result: None,
            },
        );
        Ok(handle)
    }

    fn query(&mut self, handle: SubmissionHandle) -> StageQuery<EncodeOutcome> {
        let Some(job) = self.jobs.get_mut(&handle) else {
            return StageQuery::Error { recoverable: false };
        };
        // Concurrent pollers see the same verdict.
        if let Some(result) = job.result {
            return result;
        }
        job.polls += 1;
        let display_order = job.display_order;
        if self.hang.contains(&display_order) || job.polls <= self.latency {
            return StageQuery::Pending;
        }

        let mut result = StageQuery::Done(EncodeOutcome {
            encoded_size: self.encoded_size,
            overflow: false,
        });
        if let Some((count, recoverable)) = self.errors.get_mut(&display_order) {
            if *count > 0 {
                *count -= 1;
                result = StageQuery::Error {
                    recoverable: *recoverable,
                };
            }
        }
        if let (StageQuery::Done(outcome), Some(count)) =
            (&mut result, self.overflows.get_mut(&display_order))
        {
            if *count > 0 {
                *count -= 1;
                outcome.overflow = true;
            }
        }
        job.result = Some(result);
        result
    }
}

/// What a mock analysis stage reports.
#[derive(Debug, Clone)]
pub(crate) enum MockKind {
    /// Scene changes at these display orders.
    SceneChange(HashSet<u32>),
    /// Filtered surface = input surface + offset.
    Filter(u64),
    /// Complexity = display order + base.
    Complexity(u32),
}

/// Analysis stage that answers on the first poll after submission and keeps
/// answering the same until the task is submitted again.
pub(crate) struct MockAnalysis {
    kind: MockKind,
    pending: HashMap<TaskId, AnalysisRequest>,
    requests: Arc<Mutex<Vec<u32>>>,
}

impl MockAnalysis {
    pub(crate) fn new(kind: MockKind) -> Self {
        Self {
            kind,
            pending: HashMap::new(),
            requests: Arc::default(),
        }
    }

    pub(crate) fn scene_changes(at: &[u32]) -> Self {
        Self::new(MockKind::SceneChange(at.iter().copied().collect()))
    }

    /// Display orders submitted so far.
    pub(crate) fn requests(&self) -> Arc<Mutex<Vec<u32>>> {
        self.requests.clone()
    }
}

impl AnalysisStage for MockAnalysis {
    fn submit(&mut self, request: &AnalysisRequest) -> Result<()> {
        self.requests.lock().push(request.display_order);
        self.pending.insert(request.task_id, *request);
        Ok(())
    }

    fn query(&mut self, task_id: TaskId) -> StageQuery<AnalysisResult> {
        let Some(request) = self.pending.get(&task_id).copied() else {
            return StageQuery::Pending;
        };
        StageQuery::Done(match &self.kind {
            MockKind::SceneChange(at) => AnalysisResult::SceneChange(at.contains(&request.display_order)),
            MockKind::Filter(offset) => AnalysisResult::Filtered {
                surface: request.surface + offset,
            },
            MockKind::Complexity(base) => AnalysisResult::Complexity(base + request.display_order),
        })
    }
}

/// Rate control that answers from a script.
pub(crate) struct ScriptedRateControl {
    qp: u8,
    verdicts: VecDeque<BrcStatus>,
    reports: Arc<Mutex<Vec<(FrameParams, u32)>>>,
}

impl ScriptedRateControl {
    pub(crate) fn new(qp: u8, verdicts: &[BrcStatus]) -> Self {
        Self {
            qp,
            verdicts: verdicts.iter().copied().collect(),
            reports: Arc::default(),
        }
    }

    pub(crate) fn reports(&self) -> Arc<Mutex<Vec<(FrameParams, u32)>>> {
        self.reports.clone()
    }
}

impl RateControl for ScriptedRateControl {
    fn init(&mut self, _config: &EncodeConfig) -> Result<()> {
        Ok(())
    }

    fn get_qp(&mut self, params: &FrameParams) -> QpControl {
        QpControl {
            qp: self.qp + params.num_recode as u8,
            max_frame_size: 0,
        }
    }

    fn report(&mut self, params: &FrameParams, encoded_size: u32) -> BrcStatus {
        self.reports.lock().push((*params, encoded_size));
        self.verdicts.pop_front().unwrap_or(BrcStatus::Ok)
    }
}
